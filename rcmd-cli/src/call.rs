//! Foreground commands: call, shell, spawn.

use std::collections::BTreeMap;
use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use rcmd::{CmdMaster, CommanderMaster, Value};

use crate::{ConnectArgs, OutputFormat};

/// Arguments shared by `rcmd call`, `rcmd spawn` and `rcmd nohup`.
///
/// Usage: `rcmd call [OPTIONS] FUNCTION [ARG...]`
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct CallArgs {
    /// Run inside the agent process instead of a forked child.
    #[arg(long)]
    pub manage: bool,

    /// Keyword argument (repeatable).
    #[arg(short = 'k', long = "karg", value_name = "KEY=VALUE")]
    pub kargs: Vec<String>,

    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,

    /// Dotted function name, e.g. `shell` or `tools.hello`.
    #[arg(required = true)]
    pub function: String,

    /// Positional arguments; `1`, `2.5`, `True`, `None` and quoted strings
    /// are parsed, anything else is passed as a string.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl CallArgs {
    /// Parsed positional arguments.
    pub fn values(&self) -> Vec<Value> {
        self.args.iter().map(|a| Value::parse_literal(a)).collect()
    }

    /// Parsed keyword arguments.
    pub fn keywords(&self) -> Result<BTreeMap<String, Value>> {
        self.kargs
            .iter()
            .map(|kv| {
                let (k, v) = kv
                    .split_once('=')
                    .with_context(|| format!("invalid keyword argument `{kv}`, expected KEY=VALUE"))?;
                Ok((k.to_owned(), Value::parse_literal(v)))
            })
            .collect()
    }
}

/// Arguments for `rcmd shell`.
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct ShArgs {
    /// Command line passed to `/bin/sh -c`.
    #[arg(required = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub fn call(connect: &ConnectArgs, args: &CallArgs) -> Result<()> {
    let mut master = connect.connect()?;
    let builder = if args.manage {
        master.manage(&args.function)
    } else {
        master.call(&args.function)
    };
    let mut builder = builder.args(args.values()).timeout(connect.timeout());
    for (k, v) in args.keywords()? {
        builder = builder.karg(k, v);
    }
    let done = builder.send().map_err(report)?;
    finish(master, done, args.format)
}

pub fn sh(connect: &ConnectArgs, args: &ShArgs) -> Result<()> {
    let mut master = connect.connect()?;
    let mut done = master
        .call("shell")
        .arg(args.command.join(" "))
        .timeout(connect.timeout())
        .send()
        .map_err(report)?;
    write_output(&mut done)?;
    let code = done.into_value()?.as_int().unwrap_or(0);
    master.close()?;
    if code != 0 {
        std::process::exit(i32::try_from(code).unwrap_or(1));
    }
    Ok(())
}

pub fn spawn(connect: &ConnectArgs, args: &CallArgs) -> Result<()> {
    let mut master = connect.connect()?;
    let mut builder = master.spawn(&args.function).args(args.values());
    for (k, v) in args.keywords()? {
        builder = builder.karg(k, v);
    }
    let mut job = builder.send().map_err(report)?;
    eprintln!("started {}", job.peek_basecmd());
    write_output(&mut job)?;

    let done = master
        .wait_streaming(&job, connect.timeout(), |chunk, stderr| {
            if stderr {
                io::stderr().write_all(&chunk.msg)
            } else {
                let mut out = io::stdout();
                out.write_all(&chunk.msg)?;
                out.flush()
            }
        })
        .map_err(report)?;
    print_value(done, args.format)?;
    master.close()?;
    Ok(())
}

/// Prints a finished command and shuts the agent down.
fn finish(master: CommanderMaster, mut done: CmdMaster, format: OutputFormat) -> Result<()> {
    if matches!(format, OutputFormat::Table) {
        write_output(&mut done)?;
    }
    print_value(done, format)?;
    master.close()?;
    Ok(())
}

/// Copies collected stdout/stderr to ours.
pub fn write_output(cmd: &mut CmdMaster) -> Result<()> {
    io::stdout().write_all(cmd.stdout())?;
    io::stderr().write_all(cmd.stderr())?;
    io::stdout().flush()?;
    Ok(())
}

/// Prints the result of a finished command.
pub fn print_value(done: CmdMaster, format: OutputFormat) -> Result<()> {
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&done)?);
        if let Some(Err(tb)) = done.results() {
            bail!("{}: {}", tb.kind, tb.message);
        }
        return Ok(());
    }
    match done.into_value().map_err(report)? {
        Value::None => {}
        v => println!("{v}"),
    }
    Ok(())
}

/// Prints the traceback of a failed remote call.
pub fn report(e: rcmd::Error) -> anyhow::Error {
    match e {
        rcmd::Error::Remote { traceback, .. } => {
            eprintln!("{traceback}");
            anyhow::anyhow!("remote call failed")
        }
        e => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Wrap {
        #[command(flatten)]
        call: CallArgs,
    }

    #[test]
    fn parses_literals_and_keywords() {
        let w = Wrap::parse_from(["t", "-k", "name=\"x\"", "-k", "n=3", "tools.hello", "1", "-2.5", "word"]);
        assert_eq!(w.call.function, "tools.hello");
        assert_eq!(w.call.values(), [Value::Int(1), Value::Float(-2.5), Value::from("word")]);
        let kw = w.call.keywords().unwrap();
        assert_eq!(kw["name"], Value::from("x"));
        assert_eq!(kw["n"], Value::Int(3));
    }

    #[test]
    fn report_keeps_non_remote_errors() {
        let remote = rcmd::Error::Remote {
            kind: "ValueError".into(),
            message: "bad".into(),
            traceback: "Traceback ...".into(),
        };
        assert_eq!(report(remote).to_string(), "remote call failed");
        let timeout = report(rcmd::Error::Timeout("no response to command 3".into()));
        assert!(timeout.to_string().contains("no response to command 3"));
    }

    #[test]
    fn rejects_bad_keyword() {
        let w = Wrap::parse_from(["t", "-k", "novalue", "echo"]);
        assert!(w.call.keywords().is_err());
    }
}
