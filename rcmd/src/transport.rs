//! Byte-stream transports a master can be connected through.

use std::ffi::OsStr;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use rcmd_proto::{Encoding, InStream, OutStream};
use tracing::debug;

use crate::error::Result;
use crate::master::CommanderMaster;

/// A read stream and a write stream to a slave, plus the process behind
/// them when the transport started one.
#[derive(Debug)]
pub struct Transport {
    /// Messages from the slave.
    input: InStream,
    /// Messages to the slave.
    output: OutStream,
    /// Spawned slave process.
    child: Option<Child>,
}

impl Transport {
    /// Starts `program` and talks to it over its stdin and stdout.
    ///
    /// The program is typically the agent itself (`rcmd-agent agent`) or a
    /// remote shell that starts it (`ssh host rcmd-agent agent`).
    pub fn spawn<I, S>(program: impl AsRef<OsStr>, args: I, encoding: Encoding) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command.args(args);
        Self::spawn_command(command, encoding)
    }

    /// Starts a prepared command with piped stdin and stdout. Its stderr is
    /// inherited.
    pub fn spawn_command(mut command: Command, encoding: Encoding) -> io::Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = command.spawn()?;
        debug!("spawned slave pid {}", child.id());
        let stdin = child.stdin.take().ok_or_else(|| io::Error::other("child stdin not piped"))?;
        let stdout = child.stdout.take().ok_or_else(|| io::Error::other("child stdout not piped"))?;
        Ok(Self {
            input: InStream::new(OwnedFd::from(stdout), encoding),
            output: OutStream::new(OwnedFd::from(stdin), encoding),
            child: Some(child),
        })
    }

    /// Connects to a slave listening on a Unix socket.
    pub fn unix(path: &Path, encoding: Encoding) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        let write = stream.try_clone()?;
        Ok(Self::from_streams(
            InStream::new(OwnedFd::from(stream), encoding),
            OutStream::new(OwnedFd::from(write), encoding),
        ))
    }

    /// Uses an existing pair of streams.
    pub const fn from_streams(input: InStream, output: OutStream) -> Self {
        Self {
            input,
            output,
            child: None,
        }
    }

    /// Performs the handshake and returns a ready master.
    ///
    /// A spawned process is killed and reaped if the handshake fails.
    pub fn connect(self) -> Result<CommanderMaster> {
        let Self { input, output, child } = self;
        match CommanderMaster::new(input, output) {
            Ok(master) => Ok(master.with_process(child)),
            Err(e) => {
                if let Some(mut c) = child {
                    let _ = c.kill();
                    let _ = c.wait();
                }
                Err(e)
            }
        }
    }
}
