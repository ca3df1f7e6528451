//! CLI for the remote commander.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod call;
mod job;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use rcmd::{CommanderMaster, Encoding, Transport};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rcmd", version, about = "Run callables on a remote commander agent")]
struct Cli {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

/// How to reach the agent.
#[derive(clap::Args)]
pub(crate) struct ConnectArgs {
    /// Command that starts an agent on its stdin/stdout, e.g.
    /// `ssh host rcmd-agent agent`.
    #[arg(long, global = true, env = "RCMD_AGENT", default_value = "rcmd-agent agent")]
    agent: String,

    /// Connect to an agent listening on a Unix socket; overrides `--agent`.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Use base64 frames (pair with `rcmd-agent agent_base64`).
    #[arg(long, global = true)]
    base64: bool,

    /// Seconds to wait for a command; 0 waits forever.
    #[arg(short, long, global = true, default_value_t = 60)]
    timeout: u64,
}

impl ConnectArgs {
    /// Starts or dials the agent and performs the handshake.
    pub(crate) fn connect(&self) -> Result<CommanderMaster> {
        let encoding = if self.base64 { Encoding::Base64 } else { Encoding::Raw };
        let transport = match &self.socket {
            Some(path) => Transport::unix(path, encoding)
                .with_context(|| format!("failed to connect to {}", path.display()))?,
            None => {
                let mut words = self.agent.split_whitespace();
                let program = words.next().context("empty agent command")?;
                Transport::spawn(program, words, encoding)
                    .with_context(|| format!("failed to start `{}`", self.agent))?
            }
        };
        Ok(transport.connect()?)
    }

    /// The per-command deadline.
    pub(crate) const fn timeout(&self) -> Option<Duration> {
        match self.timeout {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Call a function on the agent and wait for it.
    Call(call::CallArgs),

    /// Run a shell command on the agent and exit with its status.
    Shell(call::ShArgs),

    /// Start a function on the agent and follow its output.
    Spawn(call::CallArgs),

    /// Start a function that survives this connection; prints a job id.
    Nohup(call::CallArgs),

    /// List jobs started with `nohup`.
    #[command(visible_alias = "ls")]
    Jobs {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Reattach to a `nohup` job and wait for it.
    Attach(job::AttachArgs),

    /// Forget one or more saved jobs.
    Rm {
        /// Job ids.
        #[arg(required = true, num_args = 1..)]
        ids: Vec<u64>,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for results and listings.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch() {
        eprintln!("rcmd: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        let connect = &self.connect;
        match self.command {
            Command::Call(args) => call::call(connect, &args),
            Command::Shell(args) => call::sh(connect, &args),
            Command::Spawn(args) => call::spawn(connect, &args),
            Command::Nohup(args) => job::nohup(connect, &args),
            Command::Jobs { format } => job::list(format),
            Command::Attach(args) => job::attach(connect, &args),
            Command::Rm { ids } => job::rm(&ids),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "rcmd", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

/// Logs to stderr; `RCMD_LOG` overrides `-v`.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("RCMD_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
