//! rcmd-agent: serves a remote commander master over stdin/stdout.

#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("rcmd-agent only runs on Linux");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() {
    if let Err(e) = agent::run() {
        // stderr may already be the capture pipe; the master sees this as
        // a stderr chunk or, once the transport is gone, nobody does.
        eprintln!("rcmd-agent: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(target_os = "linux")]
mod agent {
    use anyhow::{Context, Result};
    use clap::{Parser, Subcommand};
    use rcmd_agent::{AgentConfig, Slave, logging};
    use rcmd_proto::Encoding;

    #[derive(Parser)]
    #[command(name = "rcmd-agent", version, about = "Remote commander slave agent")]
    struct Cli {
        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand)]
    enum Command {
        /// Serve on stdin/stdout with raw length-prefixed frames.
        Agent,
        /// Serve on stdin/stdout with base64 frames, for 7-bit channels.
        #[command(name = "agent_base64")]
        AgentBase64,
    }

    pub(crate) fn run() -> Result<()> {
        let cli = Cli::parse();
        let encoding = match cli.command {
            Command::Agent => Encoding::Raw,
            Command::AgentBase64 => Encoding::Base64,
        };
        let config = AgentConfig::from_env();
        logging::init(&config.log_filter);

        let mut slave = Slave::from_stdio(encoding, config).context("failed to take over stdio")?;
        slave.run().context("slave loop failed")
    }
}
