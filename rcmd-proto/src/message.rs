//! Envelope types exchanged between master and slave.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Identifier of a command, unique within one side of the connection.
pub type CmdId = u64;

/// On-wire token selecting in-process execution on the slave.
pub const MANAGE: &str = "manage";
/// On-wire token selecting a forked child the master does not wait for.
pub const ASYNC: &str = "async";
/// On-wire token selecting a daemonized child that outlives the transport.
pub const NOHUP: &str = "nohup";

/// Handshake string sent by the master.
pub const START: &str = "start";
/// Handshake reply sent by the slave.
pub const STARTED: &str = "Started";

/// Process-wide command id counter. Each process keeps its own.
static NEXT_CMD_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next command id.
pub fn next_cmd_id() -> CmdId {
    NEXT_CMD_ID.fetch_add(1, Ordering::Relaxed)
}

/// Returns the id the next call to [`next_cmd_id`] will hand out.
pub fn peek_cmd_id() -> CmdId {
    NEXT_CMD_ID.load(Ordering::Relaxed)
}

/// Forces the counter so the next allocated id is `id`.
pub fn force_cmd_id(id: CmdId) {
    NEXT_CMD_ID.store(id, Ordering::Relaxed);
}

/// Moves the counter forward so the next allocated id is greater than `id`.
pub fn bump_cmd_id(id: CmdId) {
    NEXT_CMD_ID.fetch_max(id.saturating_add(1), Ordering::Relaxed);
}

/// Execution mode selected by the leading tokens of a function path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Mode {
    /// Forked child, the master blocks until it finishes.
    Sync,
    /// Run inside the slave process itself.
    Manage,
    /// Forked child, the master returns after the first reply.
    Async,
    /// Daemonized child reachable through named pipes.
    Nohup,
}

impl Mode {
    /// Splits a function path into its mode and the remaining name segments.
    ///
    /// Mode tokens are recognised only as a prefix in the fixed order
    /// `manage`, `async`, `nohup`. `manage` takes precedence, then `nohup`,
    /// then `async`.
    pub fn split(func: &[String]) -> (Self, &[String]) {
        let mut rest = func;
        let mut take = |token: &str| match rest.split_first() {
            Some((head, tail)) if head == token => {
                rest = tail;
                true
            }
            _ => false,
        };
        let manage = take(MANAGE);
        let is_async = take(ASYNC);
        let nohup = take(NOHUP);

        let mode = if manage {
            Self::Manage
        } else if nohup {
            Self::Nohup
        } else if is_async {
            Self::Async
        } else {
            Self::Sync
        };
        (mode, rest)
    }

    /// Leading token for this mode, if any.
    pub const fn token(self) -> Option<&'static str> {
        match self {
            Self::Sync => None,
            Self::Manage => Some(MANAGE),
            Self::Async => Some(ASYNC),
            Self::Nohup => Some(NOHUP),
        }
    }
}

/// The on-wire description of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BaseCmd {
    /// Command identifier.
    pub cmd_id: CmdId,
    /// Function path, optionally prefixed with mode tokens.
    pub func: Vec<String>,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kargs: BTreeMap<String, Value>,
    /// Result of the call, `Some(Err(_))` when the call raised.
    pub results: Option<Result<Value, CmdTraceBack>>,
    /// Set once `results` is final.
    pub finished: bool,
    /// The master does not block on this command.
    pub is_async: bool,
    /// Rendezvous directory of a daemonized command.
    pub cmd_hash: Option<String>,
}

impl BaseCmd {
    /// Creates a command with a freshly allocated id.
    pub fn new(func: Vec<String>, args: Vec<Value>, kargs: BTreeMap<String, Value>) -> Self {
        Self::with_id(next_cmd_id(), func, args, kargs)
    }

    /// Creates a command with an explicit id.
    pub fn with_id(
        cmd_id: CmdId,
        func: Vec<String>,
        args: Vec<Value>,
        kargs: BTreeMap<String, Value>,
    ) -> Self {
        let is_async = matches!(
            func.first().map(String::as_str),
            Some(ASYNC | NOHUP)
        );
        Self {
            cmd_id,
            func,
            args,
            kargs,
            results: None,
            finished: false,
            is_async,
            cmd_hash: None,
        }
    }

    /// Execution mode and name segments of [`BaseCmd::func`].
    pub fn split_func(&self) -> (Mode, &[String]) {
        Mode::split(&self.func)
    }

    /// Execution mode of this command.
    pub fn mode(&self) -> Mode {
        self.split_func().0
    }

    /// Dotted function name without mode tokens.
    pub fn name(&self) -> String {
        self.split_func().1.join(".")
    }

    /// Returns `true` once the slave reported the final result.
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Copies the mutable state reported by the peer.
    pub fn update(&mut self, other: &Self) {
        self.results.clone_from(&other.results);
        self.finished = other.finished;
        self.is_async = other.is_async;
    }

    /// Adopts the peer's rendezvous directory if it reported one.
    pub fn update_cmd_hash(&mut self, other: &Self) {
        if other.cmd_hash.is_some() {
            self.cmd_hash.clone_from(&other.cmd_hash);
        }
    }
}

impl fmt::Display for BaseCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd {} {}", self.cmd_id, self.func.join("."))
    }
}

/// A chunk of stdout or stderr bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct StdStream {
    /// The bytes.
    pub msg: Vec<u8>,
    /// Originating command, `None` when the slave itself wrote them.
    pub cmd_id: Option<CmdId>,
}

impl StdStream {
    /// Creates a chunk tagged with its originating command.
    pub const fn new(msg: Vec<u8>, cmd_id: Option<CmdId>) -> Self {
        Self { msg, cmd_id }
    }

    /// Returns `true` if the chunk belongs to a command.
    pub const fn is_cmd_msg(&self) -> bool {
        self.cmd_id.is_some()
    }
}

/// A failure raised by a callable on the slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CmdTraceBack {
    /// Error class, e.g. `OSError` or `CalledProcessError`.
    pub kind: String,
    /// Human readable message.
    pub message: String,
    /// Formatted trace naming the process and function path.
    pub traceback: String,
}

impl CmdTraceBack {
    /// Creates a traceback envelope.
    pub fn new(kind: impl Into<String>, message: impl Into<String>, traceback: String) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback,
        }
    }
}

impl fmt::Display for CmdTraceBack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.traceback)
    }
}

/// Last message of any forked execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CmdFinish {
    /// Pid of the process that finished.
    pub pid: u32,
    /// Sent by the relay parent of a daemonized command rather than the task.
    pub parent: bool,
}

impl CmdFinish {
    /// Finish marker for the calling process.
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            parent: false,
        }
    }

    /// Finish marker written by a relay on behalf of its task child.
    pub fn parent() -> Self {
        Self {
            pid: std::process::id(),
            parent: true,
        }
    }
}

impl Default for CmdFinish {
    fn default() -> Self {
        Self::new()
    }
}

/// Every object that travels through a [`Messenger`](crate::Messenger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Message {
    /// Handshake string.
    Control(String),
    /// Invocation record.
    Cmd(BaseCmd),
    /// Stdout chunk.
    StdOut(StdStream),
    /// Stderr chunk.
    StdErr(StdStream),
    /// Return value of a callable, sent by a child before its finish marker.
    Results(Value),
    /// Failure of a callable, sent by a child before its finish marker.
    TraceBack(CmdTraceBack),
    /// Finish marker.
    Finish(CmdFinish),
    /// Error in the slave main loop.
    CommanderError(String),
    /// Error in the messaging layer.
    MessengerError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &[&str]) -> Vec<String> {
        s.iter().map(|&x| x.to_owned()).collect()
    }

    #[test]
    fn mode_prefixes() {
        let f = path(&["manage", "register_cmd"]);
        assert_eq!(Mode::split(&f), (Mode::Manage, &f[1..]));

        let f = path(&["async", "shell"]);
        assert_eq!(Mode::split(&f).0, Mode::Async);

        let f = path(&["async", "nohup", "tools", "run"]);
        let (mode, rest) = Mode::split(&f);
        assert_eq!(mode, Mode::Nohup);
        assert_eq!(rest, &f[2..]);

        let f = path(&["shell"]);
        assert_eq!(Mode::split(&f).0, Mode::Sync);
    }

    #[test]
    fn mode_tokens_out_of_order_are_names() {
        let f = path(&["nohup", "async", "shell"]);
        let (mode, rest) = Mode::split(&f);
        assert_eq!(mode, Mode::Nohup);
        assert_eq!(rest, &f[1..]);
    }

    #[test]
    fn ids_are_unique_and_forceable() {
        let a = next_cmd_id();
        let b = next_cmd_id();
        assert!(b > a);

        bump_cmd_id(b + 100);
        assert!(next_cmd_id() > b + 100);
    }

    #[test]
    fn async_flag_follows_first_token() {
        let cmd = BaseCmd::new(path(&["nohup", "shell"]), vec![], BTreeMap::new());
        assert!(cmd.is_async);
        assert_eq!(cmd.name(), "shell");

        let cmd = BaseCmd::new(path(&["manage", "exit"]), vec![], BTreeMap::new());
        assert!(!cmd.is_async);
        assert_eq!(cmd.mode(), Mode::Manage);
    }

    #[test]
    fn update_keeps_identity() {
        let mut local = BaseCmd::new(path(&["nohup", "shell"]), vec![], BTreeMap::new());
        let mut remote = local.clone();
        remote.cmd_hash = Some("/tmp/cmd_abcd".into());
        remote.results = Some(Ok(Value::Int(0)));
        remote.finished = true;

        local.update(&remote);
        assert!(local.cmd_hash.is_none());
        local.update_cmd_hash(&remote);
        assert_eq!(local.cmd_hash.as_deref(), Some("/tmp/cmd_abcd"));
        assert!(local.is_finished());

        let empty = BaseCmd::with_id(local.cmd_id, local.func.clone(), vec![], BTreeMap::new());
        local.update_cmd_hash(&empty);
        assert!(local.cmd_hash.is_some());
    }

    #[test]
    fn std_stream_ownership() {
        assert!(StdStream::new(b"x".to_vec(), Some(3)).is_cmd_msg());
        assert!(!StdStream::new(b"x".to_vec(), None).is_cmd_msg());
    }
}
