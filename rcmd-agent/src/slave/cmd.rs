//! Per-command state on the slave side.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use rcmd_proto::{
    BaseCmd, CmdFinish, CmdId, CmdTraceBack, Encoding, InStream, Message, Messenger, Mode,
    OutStream, Received, StdStream, pipe, poll_readable,
};
use tracing::{debug, warn};

use super::scope::{Args, CallError, CallResult, Callable};
use super::{CHUNK, Slave};
use crate::daemon::{self, Daemonized, Fifos};
use crate::sys::{self, Fork};

/// How long to wait for a fresh daemon to open its side of the FIFOs.
const DAEMON_WAIT: Duration = Duration::from_secs(10);

/// Pipe readable by the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    /// Result envelopes of a child.
    Results,
    Stdout,
    Stderr,
}

/// The five descriptors connecting a command to the slave.
///
/// On the slave side `results`, `stdout` and `stderr` are read and
/// `inputs`, `stdin` are written; the child side is the mirror image.
#[derive(Debug)]
pub(crate) struct Ends {
    pub(crate) results: OwnedFd,
    pub(crate) inputs: OwnedFd,
    pub(crate) stdin: OwnedFd,
    pub(crate) stdout: OwnedFd,
    pub(crate) stderr: OwnedFd,
}

/// A command being executed for the master.
#[derive(Debug)]
pub struct CmdSlave {
    basecmd: BaseCmd,
    mode: Mode,
    /// Forked child, unset for inline and daemonized commands.
    pid: Option<i32>,
    /// Result envelopes in, control messages out.
    control: Option<Messenger>,
    stdin: Option<File>,
    stdout: Option<InStream>,
    stderr: Option<InStream>,
    /// A finish marker was received, as opposed to a broken pipe.
    clean_exit: bool,
}

impl CmdSlave {
    /// Wraps a command record received from the master.
    pub fn new(basecmd: BaseCmd) -> Self {
        let mode = basecmd.mode();
        Self {
            basecmd,
            mode,
            pid: None,
            control: None,
            stdin: None,
            stdout: None,
            stderr: None,
            clean_exit: false,
        }
    }

    /// Command id.
    pub const fn cmd_id(&self) -> CmdId {
        self.basecmd.cmd_id
    }

    /// Current state of the command record.
    pub const fn basecmd(&self) -> &BaseCmd {
        &self.basecmd
    }

    /// Execution mode.
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Pid of the forked child, if any.
    pub const fn pid(&self) -> Option<i32> {
        self.pid
    }

    /// Returns `true` once results are final.
    pub const fn is_finished(&self) -> bool {
        self.basecmd.finished
    }

    /// Resolves the function and runs it according to the mode.
    ///
    /// `manage` commands complete before this returns. Other modes leave
    /// a child behind whose pipes are attached to `self`.
    pub fn start(&mut self, slave: &mut Slave) -> io::Result<()> {
        let path = self.basecmd.split_func().1.to_vec();
        let func = slave.scope().resolve(&path).map_err(io::Error::other)?;
        match self.mode {
            Mode::Manage => {
                self.run_inline(slave, func.as_ref());
                Ok(())
            }
            Mode::Nohup => self.daemonize(slave, &func),
            _ => self.create_process_cmd(slave, &func),
        }
    }

    fn run_inline(&mut self, slave: &mut Slave, func: &dyn Callable) {
        let outcome = invoke(slave, func, Args::from_cmd(&self.basecmd));
        sys::flush_stdio();
        self.basecmd.results = Some(outcome.map_err(|e| traceback(&self.basecmd, &e)));
        self.basecmd.finished = true;
    }

    fn create_process_cmd(&mut self, slave: &mut Slave, func: &Rc<dyn Callable>) -> io::Result<()> {
        let (pid, ends) = spawn_child(slave, func, &self.basecmd)?;
        debug!(cmd = %self.basecmd, pid, "forked");
        self.pid = Some(pid);
        self.attach(ends);
        Ok(())
    }

    /// Runs the command under a detached relay and talks to it through the
    /// FIFOs of a fresh rendezvous directory.
    fn daemonize(&mut self, slave: &mut Slave, func: &Rc<dyn Callable>) -> io::Result<()> {
        let root = daemon::scratch_dir(&slave.config().scratch_root)?;
        self.basecmd.cmd_hash = Some(root.display().to_string());
        match daemon::daemonize(&root)? {
            Daemonized::Child(fifos) => {
                slave.detach();
                let code = match daemon::relay(slave, func, &self.basecmd, &fifos) {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                sys::exit_now(code)
            }
            Daemonized::Parent(fifos) | Daemonized::Existing(fifos) => {
                debug!(cmd = %self.basecmd, root = %root.display(), "daemonized");
                self.attach(fifos.open_master_side(DAEMON_WAIT)?);
                Ok(())
            }
        }
    }

    /// Reattaches to the FIFOs of a daemonized command.
    ///
    /// Fails with `NotConnected` when no relay keeps them open within
    /// `wait`.
    pub fn recover_fds(&mut self, wait: Duration) -> io::Result<()> {
        let root = self.basecmd.cmd_hash.as_deref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no rendezvous directory", self.basecmd),
            )
        })?;
        let ends = Fifos::at(Path::new(root)).open_master_side(wait)?;
        self.attach(ends);
        Ok(())
    }

    fn attach(&mut self, ends: Ends) {
        self.control = Some(Messenger::new(
            InStream::new(ends.results, Encoding::Raw),
            OutStream::new(ends.inputs, Encoding::Raw),
        ));
        self.stdin = Some(File::from(ends.stdin));
        self.stdout = Some(InStream::new(ends.stdout, Encoding::Raw));
        self.stderr = Some(InStream::new(ends.stderr, Encoding::Raw));
    }

    /// Descriptors the main loop should poll for this command.
    pub(crate) fn channels(&self) -> Vec<(RawFd, Channel)> {
        let mut out = Vec::with_capacity(3);
        if let Some(c) = &self.control {
            out.push((c.input().as_raw_fd(), Channel::Results));
        }
        if let Some(s) = &self.stdout {
            out.push((s.as_raw_fd(), Channel::Stdout));
        }
        if let Some(s) = &self.stderr {
            out.push((s.as_raw_fd(), Channel::Stderr));
        }
        out
    }

    /// Handles one envelope from the child. Returns `true` once the
    /// command is finished.
    pub fn work(&mut self) -> bool {
        let Some(control) = self.control.as_mut() else {
            return true;
        };
        match control.read_msg(None) {
            Ok(Received::Msg(Message::Finish(fin))) => {
                // A daemonized task finishes before its relay has flushed.
                if self.mode == Mode::Nohup && !fin.parent {
                    return false;
                }
                if let Some(pid) = self.pid {
                    sys::reap(pid);
                }
                self.basecmd.finished = true;
                self.clean_exit = true;
                true
            }
            Ok(Received::Msg(Message::Results(v))) => {
                self.basecmd.results = Some(Ok(v));
                false
            }
            Ok(Received::Msg(Message::TraceBack(tb))) => {
                self.basecmd.results = Some(Err(tb));
                false
            }
            Ok(Received::Closed) => self.fail("ChildProcessError", "process exited without finishing"),
            Ok(_) => false,
            Err(e) => self.fail("MessengerError", e.to_string()),
        }
    }

    fn fail(&mut self, kind: &str, message: impl Into<String>) -> bool {
        warn!(cmd = %self.basecmd, "{kind}");
        if let Some(pid) = self.pid {
            sys::reap(pid);
        }
        if self.basecmd.results.is_none() {
            let err = CallError::new(kind, message);
            self.basecmd.results = Some(Err(traceback(&self.basecmd, &err)));
        }
        self.basecmd.finished = true;
        true
    }

    /// Reads one chunk of child output. The pipe is dropped on EOF.
    pub(crate) fn read_output(&mut self, ch: Channel) -> Option<Message> {
        let slot = match ch {
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
            Channel::Results => return None,
        };
        let data = match slot.as_mut()?.read(CHUNK, None) {
            Ok(Some(data)) => data,
            Ok(None) | Err(_) => Vec::new(),
        };
        if data.is_empty() {
            *slot = None;
            return None;
        }
        let chunk = StdStream::new(data, Some(self.basecmd.cmd_id));
        Some(match ch {
            Channel::Stderr => Message::StdErr(chunk),
            _ => Message::StdOut(chunk),
        })
    }

    /// Collects output that is already buffered, without blocking.
    pub(crate) fn drain_output(&mut self) -> Vec<Message> {
        let mut chunks = Vec::new();
        for ch in [Channel::Stdout, Channel::Stderr] {
            loop {
                let stream = match ch {
                    Channel::Stdout => self.stdout.as_ref(),
                    _ => self.stderr.as_ref(),
                };
                let Some(fd) = stream.map(AsRawFd::as_raw_fd) else {
                    break;
                };
                if !poll_readable(&[fd], Some(Duration::ZERO)).is_ok_and(|r| !r.is_empty()) {
                    break;
                }
                match self.read_output(ch) {
                    Some(msg) => chunks.push(msg),
                    None => break,
                }
            }
        }
        chunks
    }

    /// Writes to the child's stdin.
    pub fn send_stdin(&mut self, data: &[u8]) -> io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, format!("stdin of {} is closed", self.basecmd))
        })?;
        stdin.write_all(data)?;
        stdin.flush()
    }

    /// Removes the rendezvous directory of a finished daemonized command.
    pub(crate) fn clean_tmp_dir(&self) {
        if self.mode != Mode::Nohup || !self.clean_exit {
            return;
        }
        if let Some(root) = &self.basecmd.cmd_hash
            && let Err(e) = Fifos::at(Path::new(root)).remove()
        {
            debug!("could not remove {root}: {e}");
        }
    }

    /// Closes every pipe to the child.
    pub(crate) fn close_pipes(&mut self) {
        self.control = None;
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
    }
}

/// Forks a child running `func` with fresh pipes.
///
/// Returns the child's pid and the slave side of its pipes. The child
/// never returns from this function.
pub(crate) fn spawn_child(
    slave: &mut Slave,
    func: &Rc<dyn Callable>,
    basecmd: &BaseCmd,
) -> io::Result<(i32, Ends)> {
    let (results_r, results_w) = pipe()?;
    let (inputs_r, inputs_w) = pipe()?;
    let (stdin_r, stdin_w) = pipe()?;
    let (stdout_r, stdout_w) = pipe()?;
    let (stderr_r, stderr_w) = pipe()?;
    let parent = Ends {
        results: results_r,
        inputs: inputs_w,
        stdin: stdin_w,
        stdout: stdout_r,
        stderr: stderr_r,
    };
    let child = Ends {
        results: results_w,
        inputs: inputs_r,
        stdin: stdin_r,
        stdout: stdout_w,
        stderr: stderr_w,
    };
    match sys::fork()? {
        Fork::Child => {
            drop(parent);
            slave.detach();
            child_main(slave, func.as_ref(), basecmd, child)
        }
        Fork::Parent(pid) => Ok((pid, parent)),
    }
}

fn child_main(slave: &mut Slave, func: &dyn Callable, basecmd: &BaseCmd, ends: Ends) -> ! {
    let code = match run_child(slave, func, basecmd, ends) {
        Ok(code) => code,
        Err(e) => {
            let _ = writeln!(io::stderr(), "{basecmd}: {e}");
            2
        }
    };
    sys::exit_now(code)
}

/// Body of a forked child: rewire stdio, call, report, finish.
fn run_child(slave: &mut Slave, func: &dyn Callable, basecmd: &BaseCmd, ends: Ends) -> io::Result<i32> {
    let Ends {
        results,
        inputs,
        stdin,
        stdout,
        stderr,
    } = ends;
    sys::dup2(&stdin, libc::STDIN_FILENO)?;
    sys::dup2(&stdout, libc::STDOUT_FILENO)?;
    sys::dup2(&stderr, libc::STDERR_FILENO)?;
    drop((stdin, stdout, stderr));

    let mut control = Messenger::new(
        InStream::new(inputs, Encoding::Raw),
        OutStream::new(results, Encoding::Raw),
    );
    let outcome = invoke(slave, func, Args::from_cmd(basecmd));
    sys::flush_stdio();

    let code = match outcome {
        Ok(value) => {
            control.write_msg(&Message::Results(value))?;
            0
        }
        Err(e) => {
            let tb = traceback(basecmd, &e);
            let _ = writeln!(io::stderr(), "{}", tb.traceback);
            control.write_msg(&Message::TraceBack(tb))?;
            1
        }
    };
    control.write_msg(&Message::Finish(CmdFinish::new()))?;
    Ok(code)
}

/// Calls `func`, turning a panic into a `Panic` error.
fn invoke(slave: &mut Slave, func: &dyn Callable, args: Args) -> CallResult {
    panic::catch_unwind(AssertUnwindSafe(|| func.call(slave, args))).unwrap_or_else(|payload| {
        let text = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "callable panicked".to_owned());
        Err(CallError::new("Panic", text))
    })
}

/// Formats a failure of `basecmd` for the master.
pub(crate) fn traceback(basecmd: &BaseCmd, err: &CallError) -> CmdTraceBack {
    let text = format!(
        "Traceback (most recent call last):\n  slave process {}, {basecmd}\n    in {}\n{err}",
        std::process::id(),
        basecmd.name(),
    );
    CmdTraceBack::new(err.kind.clone(), err.message.clone(), text)
}
