//! The slave side of the remote commander.
//!
//! A [`Slave`] owns the transport to the master, the table of running
//! commands and the name scope callables are resolved in. Its main loop is
//! single threaded: it polls the master transport, its own captured stdio
//! and the pipes of every running command, and reacts to whichever is
//! readable.

mod cmd;
mod scope;

use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use rcmd_proto::{
    BaseCmd, CmdId, Encoding, InStream, Messenger, Message, OutStream, Received, START, STARTED,
    StdStream, pipe, poll_readable,
};
use tracing::{debug, trace, warn};

pub use cmd::CmdSlave;
pub(crate) use cmd::{Ends, spawn_child};
pub use scope::{Args, CallError, CallResult, Callable, Namespace, Scope, Symbol};

use self::cmd::Channel;
use crate::config::AgentConfig;
use crate::sys;

/// Size of a single forwarded output chunk.
pub(crate) const CHUNK: usize = 16384;

/// Read ends of the pipes the slave's own stdout and stderr point at.
#[derive(Debug, Default)]
struct Capture {
    /// fd 1 of the slave.
    stdout: Option<InStream>,
    /// fd 2 of the slave.
    stderr: Option<InStream>,
}

/// Where a readable descriptor in the main loop comes from.
#[derive(Debug, Clone, Copy)]
enum Source {
    /// The transport.
    Master,
    /// The slave's own captured output.
    Own(Channel),
    /// A pipe of a running command.
    Cmd(CmdId, Channel),
}

/// Whether the main loop keeps going.
enum Flow {
    /// Keep polling.
    Continue,
    /// The master is gone.
    Closed,
}

/// Executes commands received from a master.
pub struct Slave {
    /// Transport to the master, `None` in forked children.
    messenger: Option<Messenger>,
    /// Output of the slave itself.
    capture: Capture,
    /// Commands that are still running, keyed by id.
    cmds: BTreeMap<CmdId, CmdSlave>,
    /// Names callables are resolved in.
    scope: Scope,
    /// Settings read at startup.
    config: AgentConfig,
    /// Directories `import_src` loads scripts from.
    search_path: Vec<PathBuf>,
    /// Set by the `exit` command.
    exit: bool,
}

impl std::fmt::Debug for Slave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slave")
            .field("attached", &self.messenger.is_some())
            .field("cmds", &self.cmds.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Slave {
    /// Creates a slave talking to the master through `messenger`.
    pub fn new(messenger: Messenger, config: AgentConfig) -> Self {
        let mut slave = Self::detached();
        slave.messenger = Some(messenger);
        slave.config = config;
        slave
    }

    /// A slave with no master, useful for invoking callables locally.
    pub fn detached() -> Self {
        let mut scope = Scope::default();
        crate::cmds::install_commands(&mut scope.commands);
        crate::cmds::install_module(&mut scope.module);
        Self {
            messenger: None,
            capture: Capture::default(),
            cmds: BTreeMap::new(),
            scope,
            config: AgentConfig::default(),
            search_path: Vec::new(),
            exit: false,
        }
    }

    /// Takes over the process stdio as the transport to the master.
    ///
    /// fd 0 and fd 1 are moved to private descriptors and become the
    /// transport. fd 0 is then pointed at `/dev/null`, fd 1 and fd 2 at
    /// capture pipes whose contents are forwarded to the master. A single
    /// `#` is written first so the master can flush terminal noise.
    pub fn from_stdio(encoding: Encoding, config: AgentConfig) -> io::Result<Self> {
        sys::flush_stdio();
        let input = sys::dup_cloexec(libc::STDIN_FILENO)?;
        let output = sys::dup_cloexec(libc::STDOUT_FILENO)?;
        sys::devnull(&[libc::STDIN_FILENO])?;

        let (out_r, out_w) = pipe()?;
        let (err_r, err_w) = pipe()?;
        sys::dup2(&out_w, libc::STDOUT_FILENO)?;
        sys::dup2(&err_w, libc::STDERR_FILENO)?;
        drop((out_w, err_w));

        let mut output = OutStream::new(output, encoding);
        output.write(b"#")?;

        let mut slave = Self::new(Messenger::new(InStream::new(input, encoding), output), config);
        slave.capture = Capture {
            stdout: Some(InStream::new(out_r, Encoding::Raw)),
            stderr: Some(InStream::new(err_r, Encoding::Raw)),
        };
        Ok(slave)
    }

    /// Registers a global callable under `name`.
    pub fn register(&mut self, name: &str, f: impl Callable + 'static) -> &mut Self {
        self.scope.globals.insert_fn(name, f);
        self
    }

    /// Name scope callables are resolved in.
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Mutable name scope.
    pub const fn scope_mut(&mut self) -> &mut Scope {
        &mut self.scope
    }

    /// Running commands.
    pub const fn cmds(&self) -> &BTreeMap<CmdId, CmdSlave> {
        &self.cmds
    }

    /// Mutable table of running commands.
    pub const fn cmds_mut(&mut self) -> &mut BTreeMap<CmdId, CmdSlave> {
        &mut self.cmds
    }

    /// Agent configuration.
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Directories searched by `import_src`.
    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Appends a directory to the script search path, once.
    pub fn add_search_path(&mut self, dir: &Path) {
        if !self.search_path.iter().any(|p| p == dir) {
            self.search_path.push(dir.to_path_buf());
        }
    }

    /// Asks the main loop to stop after the current command.
    pub const fn request_exit(&mut self) {
        self.exit = true;
    }

    /// Returns `true` once [`Slave::request_exit`] was called.
    pub const fn exit_requested(&self) -> bool {
        self.exit
    }

    /// Performs the handshake and serves commands until the master leaves
    /// or `exit` is called.
    pub fn run(&mut self) -> io::Result<()> {
        if self.handshake()? {
            self.cmd_loop()?;
        }
        Ok(())
    }

    /// Waits for the master's `start` and answers `Started`.
    ///
    /// Returns `false` if the master went away first.
    pub fn handshake(&mut self) -> io::Result<bool> {
        loop {
            match self.messenger_mut()?.read_msg(None) {
                Ok(Received::Msg(Message::Control(c))) if c == START => {
                    self.send(&Message::Control(STARTED.to_owned()))?;
                    return Ok(true);
                }
                Ok(Received::Closed) => return Ok(false),
                Ok(other) => trace!("ignoring {other:?} before handshake"),
                // The messenger already told the master and flushed.
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    /// Serves commands until the master closes the transport or `exit`
    /// is called.
    pub fn cmd_loop(&mut self) -> io::Result<()> {
        while !self.exit {
            let sources = self.sources();
            let fds: Vec<RawFd> = sources.iter().map(|&(fd, _)| fd).collect();
            for i in poll_readable(&fds, None)? {
                match self.service(sources[i].1)? {
                    Flow::Continue => {}
                    Flow::Closed => return Ok(()),
                }
                if self.exit {
                    break;
                }
            }
        }
        debug!("exit requested");
        Ok(())
    }

    /// Drops everything tied to the master.
    ///
    /// Called in forked children so they do not hold the transport, the
    /// capture pipes or the pipes of sibling commands open.
    pub(crate) fn detach(&mut self) {
        self.messenger = None;
        self.capture = Capture::default();
        self.cmds.clear();
    }

    /// The transport, or `NotConnected` in a detached slave.
    fn messenger_mut(&mut self) -> io::Result<&mut Messenger> {
        self.messenger
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "slave is detached"))
    }

    /// Writes one message to the master.
    fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.messenger_mut()?.write_msg(msg)
    }

    /// Every descriptor the main loop waits on.
    fn sources(&self) -> Vec<(RawFd, Source)> {
        let mut out = Vec::new();
        if let Some(m) = &self.messenger {
            out.push((m.input().as_raw_fd(), Source::Master));
        }
        if let Some(s) = &self.capture.stdout {
            out.push((s.as_raw_fd(), Source::Own(Channel::Stdout)));
        }
        if let Some(s) = &self.capture.stderr {
            out.push((s.as_raw_fd(), Source::Own(Channel::Stderr)));
        }
        for (&id, cmd) in &self.cmds {
            out.extend(cmd.channels().into_iter().map(|(fd, ch)| (fd, Source::Cmd(id, ch))));
        }
        out
    }

    /// Handles one readable source.
    fn service(&mut self, source: Source) -> io::Result<Flow> {
        match source {
            Source::Master => return self.service_master(),
            Source::Own(ch) => self.forward_own(ch)?,
            Source::Cmd(id, Channel::Results) => {
                if self.cmds.get_mut(&id).is_some_and(CmdSlave::work) {
                    self.finish_cmd(id)?;
                }
            }
            Source::Cmd(id, ch) => {
                let chunk = self.cmds.get_mut(&id).and_then(|c| c.read_output(ch));
                if let Some(msg) = chunk {
                    self.send(&msg)?;
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Reads and handles one message from the master.
    fn service_master(&mut self) -> io::Result<Flow> {
        let received = match self.messenger_mut()?.read_msg(None) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(Flow::Continue),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Flow::Closed),
            Err(e) => return Err(e),
        };
        match received {
            Received::Msg(Message::Cmd(basecmd)) => self.dispatch(basecmd)?,
            Received::Msg(Message::Control(c)) if c == START => {
                self.send(&Message::Control(STARTED.to_owned()))?;
            }
            Received::Msg(other) => {
                warn!("unexpected message from master: {other:?}");
                self.send(&Message::CommanderError(format!(
                    "unexpected message from master: {other:?}"
                )))?;
            }
            Received::Closed => {
                debug!("master closed the transport");
                return Ok(Flow::Closed);
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    /// Starts a command and acknowledges it.
    ///
    /// The record goes back to the master right away; it is already final
    /// for `manage` commands. Unfinished commands are tracked until their
    /// finish marker arrives.
    fn dispatch(&mut self, basecmd: BaseCmd) -> io::Result<()> {
        debug!(%basecmd, "dispatching");
        let mut cmd = CmdSlave::new(basecmd);
        if let Err(e) = cmd.start(self) {
            warn!(cmd = %cmd.basecmd(), "dispatch failed: {e}");
            return self.send(&Message::CommanderError(format!(
                "Traceback: {}\n{e}",
                cmd.basecmd()
            )));
        }
        self.send(&Message::Cmd(cmd.basecmd().clone()))?;
        if !cmd.is_finished() {
            self.cmds.insert(cmd.cmd_id(), cmd);
        }
        Ok(())
    }

    /// Flushes remaining output of a finished command, reports it and
    /// forgets it.
    fn finish_cmd(&mut self, id: CmdId) -> io::Result<()> {
        let Some(cmd) = self.cmds.get_mut(&id) else {
            return Ok(());
        };
        let chunks = cmd.drain_output();
        cmd.clean_tmp_dir();
        let basecmd = cmd.basecmd().clone();
        for chunk in &chunks {
            self.send(chunk)?;
        }
        debug!(%basecmd, "finished");
        self.send(&Message::Cmd(basecmd))?;
        if let Some(mut cmd) = self.cmds.remove(&id) {
            cmd.close_pipes();
        }
        Ok(())
    }

    /// Forwards output of the slave itself. Must not log: log lines land in
    /// the very pipe being read.
    fn forward_own(&mut self, ch: Channel) -> io::Result<()> {
        let slot = match ch {
            Channel::Stderr => &mut self.capture.stderr,
            _ => &mut self.capture.stdout,
        };
        let Some(stream) = slot.as_mut() else {
            return Ok(());
        };
        let data = stream.read(CHUNK, None)?.unwrap_or_default();
        if data.is_empty() {
            *slot = None;
            return Ok(());
        }
        let chunk = StdStream::new(data, None);
        self.send(&match ch {
            Channel::Stderr => Message::StdErr(chunk),
            _ => Message::StdOut(chunk),
        })
    }
}
