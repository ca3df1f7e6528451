//! Master-side view of a command.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use rcmd_proto::{BaseCmd, CmdId, Value};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::master::CommanderMaster;

/// A command sent to a slave, with the output collected so far.
///
/// The handle is a plain value: [`CommanderMaster`] keeps its own copy
/// while the command runs and hands out snapshots. A handle can be
/// persisted with [`CmdMaster::save`] and attached to a new master with
/// [`CmdMaster::set_commander`] to pick up a `nohup` command after the
/// original connection is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdMaster {
    basecmd: BaseCmd,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// Updates of `basecmd` since it was last read.
    #[serde(skip)]
    results_cnt: u32,
    /// Stdout chunks since `stdout` was last read.
    #[serde(skip)]
    stdout_cnt: u32,
    /// Stderr chunks since `stderr` was last read.
    #[serde(skip)]
    stderr_cnt: u32,
}

impl CmdMaster {
    /// Creates a command with a fresh id.
    pub fn new(func: Vec<String>, args: Vec<Value>, kargs: BTreeMap<String, Value>) -> Self {
        Self {
            basecmd: BaseCmd::new(func, args, kargs),
            stdout: Vec::new(),
            stderr: Vec::new(),
            results_cnt: 0,
            stdout_cnt: 0,
            stderr_cnt: 0,
        }
    }

    /// Command id.
    pub const fn cmd_id(&self) -> CmdId {
        self.basecmd.cmd_id
    }

    /// Function path including mode tokens.
    pub fn func(&self) -> &[String] {
        &self.basecmd.func
    }

    /// Rendezvous directory of a `nohup` command on the slave host.
    pub fn cmd_hash(&self) -> Option<&str> {
        self.basecmd.cmd_hash.as_deref()
    }

    /// Returns `true` once the slave reported the final result.
    pub const fn is_finished(&self) -> bool {
        self.basecmd.finished
    }

    /// Returns `true` if the master does not block on this command.
    pub const fn is_async(&self) -> bool {
        self.basecmd.is_async
    }

    /// Result reported so far, `Some(Err(_))` if the callable failed.
    pub const fn results(&self) -> Option<&std::result::Result<Value, rcmd_proto::CmdTraceBack>> {
        self.basecmd.results.as_ref()
    }

    /// Consumes the handle and returns its result value.
    ///
    /// A failed callable becomes [`Error::Remote`]; a command without a
    /// result yields [`Value::None`].
    pub fn into_value(self) -> Result<Value> {
        match self.basecmd.results {
            Some(Ok(v)) => Ok(v),
            Some(Err(tb)) => Err(Error::Remote {
                kind: tb.kind,
                message: tb.message,
                traceback: tb.traceback,
            }),
            None => Ok(Value::None),
        }
    }

    /// The command record. Resets [`CmdMaster::results_cnt`].
    pub fn basecmd(&mut self) -> &BaseCmd {
        self.results_cnt = 0;
        &self.basecmd
    }

    /// The command record, without touching the counter.
    pub const fn peek_basecmd(&self) -> &BaseCmd {
        &self.basecmd
    }

    /// Collected stdout. Resets [`CmdMaster::stdout_cnt`].
    pub fn stdout(&mut self) -> &[u8] {
        self.stdout_cnt = 0;
        &self.stdout
    }

    /// Collected stderr. Resets [`CmdMaster::stderr_cnt`].
    pub fn stderr(&mut self) -> &[u8] {
        self.stderr_cnt = 0;
        &self.stderr
    }

    /// Record updates received since the record was last read.
    pub const fn results_cnt(&self) -> u32 {
        self.results_cnt
    }

    /// Stdout chunks received since stdout was last read.
    pub const fn stdout_cnt(&self) -> u32 {
        self.stdout_cnt
    }

    /// Stderr chunks received since stderr was last read.
    pub const fn stderr_cnt(&self) -> u32 {
        self.stderr_cnt
    }

    /// A copy carrying the current counters; ours restart from zero.
    pub(crate) fn snapshot(&mut self) -> Self {
        let copy = self.clone();
        self.results_cnt = 0;
        self.stdout_cnt = 0;
        self.stderr_cnt = 0;
        copy
    }

    /// Merges a record received from the slave.
    pub(crate) fn update_basecmd(&mut self, other: &BaseCmd) {
        self.basecmd.update(other);
        self.basecmd.update_cmd_hash(other);
        self.results_cnt += 1;
    }

    pub(crate) fn push_stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
        self.stdout_cnt += 1;
    }

    pub(crate) fn push_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
        self.stderr_cnt += 1;
    }

    /// Blocks until this command finishes. See [`CommanderMaster::wait`].
    pub fn wait(&self, commander: &mut CommanderMaster, timeout: Option<Duration>) -> Result<Self> {
        commander.wait(self, timeout)
    }

    /// Blocks until the slave next reports about this command.
    pub fn wait_response(
        &self,
        commander: &mut CommanderMaster,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        commander.wait_response(self.cmd_id(), timeout)
    }

    /// Writes `data` to the stdin of this command on the slave.
    pub fn send_stdin(&self, commander: &mut CommanderMaster, data: &[u8]) -> Result<()> {
        commander.send_stdin(self, data)
    }

    /// Attaches this command to `commander` and asks its slave to reopen
    /// the command's rendezvous FIFOs.
    pub fn set_commander(&self, commander: &mut CommanderMaster) -> Result<()> {
        commander.adopt(self)
    }

    /// Loads a handle from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Persists the handle to a JSON file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use rcmd_proto::CmdTraceBack;

    use super::*;

    fn cmd(func: &[&str]) -> CmdMaster {
        CmdMaster::new(
            func.iter().map(|s| (*s).to_owned()).collect(),
            vec![Value::Int(1)],
            BTreeMap::new(),
        )
    }

    #[test]
    fn counters_reset_on_read() {
        let mut c = cmd(&["async", "shell"]);
        assert!(c.is_async());
        c.push_stdout(b"a");
        c.push_stdout(b"b");
        c.push_stderr(b"e");
        assert_eq!(c.stdout_cnt(), 2);
        assert_eq!(c.stdout(), b"ab");
        assert_eq!(c.stdout_cnt(), 0);
        assert_eq!(c.stderr_cnt(), 1);
        assert_eq!(c.stderr(), b"e");
        assert_eq!(c.stderr_cnt(), 0);
        // Output is kept, only the counter resets.
        assert_eq!(c.stdout(), b"ab");
    }

    #[test]
    fn update_merges_results_and_hash() {
        let mut c = cmd(&["nohup", "shell"]);
        let mut remote = c.peek_basecmd().clone();
        remote.cmd_hash = Some("/tmp/cmd_ab12".into());
        remote.results = Some(Ok(Value::Int(0)));
        remote.finished = true;
        c.update_basecmd(&remote);
        assert_eq!(c.results_cnt(), 1);
        assert!(c.is_finished());
        assert_eq!(c.cmd_hash(), Some("/tmp/cmd_ab12"));

        // A later record without a hash keeps the known one.
        remote.cmd_hash = None;
        c.update_basecmd(&remote);
        assert_eq!(c.cmd_hash(), Some("/tmp/cmd_ab12"));
        assert_eq!(c.basecmd().cmd_id, remote.cmd_id);
        assert_eq!(c.results_cnt(), 0);
    }

    #[test]
    fn into_value_maps_tracebacks() {
        let mut c = cmd(&["x"]);
        let mut remote = c.peek_basecmd().clone();
        remote.results = Some(Err(CmdTraceBack::new("ValueError", "bad", "tb".into())));
        c.update_basecmd(&remote);
        match c.into_value() {
            Err(Error::Remote { kind, message, traceback }) => {
                assert_eq!((kind.as_str(), message.as_str(), traceback.as_str()), ("ValueError", "bad", "tb"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
        assert_eq!(cmd(&["x"]).into_value().unwrap(), Value::None);
    }

    #[test]
    fn state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.json");
        let mut c = cmd(&["nohup", "shell"]);
        c.push_stdout(b"partial");
        c.save(&path).unwrap();

        let loaded = CmdMaster::load(&path).unwrap();
        assert_eq!(loaded.cmd_id(), c.cmd_id());
        assert_eq!(loaded.func(), c.func());
        assert_eq!(loaded.stdout, b"partial");
        assert_eq!(loaded.stdout_cnt(), 0);

        fs::write(&path, "not json").unwrap();
        assert_eq!(CmdMaster::load(&path).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
