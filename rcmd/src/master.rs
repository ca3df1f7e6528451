//! Master controller: sends commands to a slave and collects replies.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use rcmd_proto::{
    BaseCmd, CmdId, InStream, Message, Messenger, Mode, OutStream, Received, START, STARTED,
    StdStream, Value, bump_cmd_id, peek_cmd_id,
};
use tracing::{debug, trace};

use crate::cmd::CmdMaster;
use crate::error::{Error, Result};

/// How long [`CommanderMaster::new`] waits for the slave to start.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default deadline of a command sent through [`CmdBuilder::send`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of slices a wait deadline is polled in.
const WAIT_STEPS: u32 = 10;

/// Drives one slave over a pair of byte streams.
///
/// Commands are built with [`CommanderMaster::call`],
/// [`CommanderMaster::manage`], [`CommanderMaster::spawn`] or
/// [`CommanderMaster::nohup`]:
///
/// ```no_run
/// use std::time::Duration;
///
/// use rcmd::{Encoding, Transport};
///
/// # fn main() -> rcmd::Result<()> {
/// let mut master = Transport::spawn("rcmd-agent", ["agent"], Encoding::Raw)?.connect()?;
/// let mut done = master.call("shell").arg("uname -a").send()?;
/// println!("{}", String::from_utf8_lossy(done.stdout()));
///
/// let job = master.spawn("sleep").arg(1).send()?;
/// master.wait(&job, Some(Duration::from_secs(5)))?;
/// master.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CommanderMaster {
    /// Transport to the slave.
    messenger: Messenger,
    /// Commands that have not finished, keyed by id.
    cmds: BTreeMap<CmdId, CmdMaster>,
    /// Process at the other end of the transport, if we started it.
    child: Option<Child>,
}

impl CommanderMaster {
    /// Connects to a slave and performs the handshake.
    ///
    /// Pending input (terminal noise, the slave's `#`) is flushed, `start`
    /// is sent, and `Started` must arrive within [`HANDSHAKE_TIMEOUT`].
    pub fn new(input: InStream, output: OutStream) -> Result<Self> {
        let mut messenger = Messenger::new(input, output);
        messenger.flush_stdin()?;
        messenger.write_msg(&Message::Control(START.to_owned()))?;
        match messenger.read_msg(Some(HANDSHAKE_TIMEOUT)) {
            Ok(Received::Msg(Message::Control(c))) if c == STARTED => {}
            Ok(other) => {
                debug!("handshake got {other:?}");
                return Err(Error::Commander("Remote commander not started.".into()));
            }
            Err(e) => {
                debug!("handshake failed: {e}");
                return Err(Error::Commander("Remote commander not started.".into()));
            }
        }
        debug!("slave started");
        Ok(Self {
            messenger,
            cmds: BTreeMap::new(),
            child: None,
        })
    }

    /// Ties the slave process to this master; [`CommanderMaster::disconnect`]
    /// reaps it.
    pub(crate) fn with_process(mut self, child: Option<Child>) -> Self {
        self.child = child;
        self
    }

    /// Builds a command run in a forked child; the call blocks until it
    /// finishes.
    pub fn call(&mut self, path: &str) -> CmdBuilder<'_> {
        CmdBuilder::new(self, Mode::Sync, path)
    }

    /// Builds a command run inside the slave process itself.
    pub fn manage(&mut self, path: &str) -> CmdBuilder<'_> {
        CmdBuilder::new(self, Mode::Manage, path)
    }

    /// Builds a command run in a forked child; the call returns after the
    /// slave acknowledged it.
    pub fn spawn(&mut self, path: &str) -> CmdBuilder<'_> {
        CmdBuilder::new(self, Mode::Async, path)
    }

    /// Builds a command that survives the loss of this master.
    pub fn nohup(&mut self, path: &str) -> CmdBuilder<'_> {
        CmdBuilder::new(self, Mode::Nohup, path)
    }

    /// Sends a command.
    ///
    /// Synchronous commands are waited for and returned finished. For
    /// `async` and `nohup` commands the first reply is awaited and a
    /// snapshot returned; the command stays registered until it finishes.
    /// A command the slave rejects with [`Error::Commander`] is
    /// deregistered.
    pub fn cmd(&mut self, cmd: CmdMaster, timeout: Option<Duration>) -> Result<CmdMaster> {
        let id = cmd.cmd_id();
        let is_async = cmd.is_async();
        self.messenger.write_msg(&Message::Cmd(cmd.peek_basecmd().clone()))?;
        self.cmds.insert(id, cmd.clone());
        let res = if is_async {
            self.wait_response(id, timeout)
        } else {
            self.wait(&cmd, timeout)
        };
        if matches!(res, Err(Error::Commander(_))) {
            self.cmds.remove(&id);
        }
        res
    }

    /// Blocks until `cmd` finishes, then deregisters and returns it.
    ///
    /// A command that is not registered is returned unchanged. Passing
    /// the deadline is [`Error::Timeout`]; the command stays registered.
    pub fn wait(&mut self, cmd: &CmdMaster, timeout: Option<Duration>) -> Result<CmdMaster> {
        self.wait_streaming(cmd, timeout, |_, _| Ok(()))
    }

    /// Like [`CommanderMaster::wait`], but hands each output chunk of `cmd`
    /// to `sink` as it arrives. The flag is `true` for stderr.
    pub fn wait_streaming<F>(
        &mut self,
        cmd: &CmdMaster,
        timeout: Option<Duration>,
        mut sink: F,
    ) -> Result<CmdMaster>
    where
        F: FnMut(&StdStream, bool) -> io::Result<()>,
    {
        let id = cmd.cmd_id();
        if !self.cmds.contains_key(&id) {
            return Ok(cmd.clone());
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let step = timeout.map(|t| t / WAIT_STEPS);
        loop {
            if let Some(done) = self.take_finished(id) {
                return Ok(done);
            }
            if let Some(d) = deadline
                && Instant::now() >= d
            {
                return Err(Error::Timeout(format!(
                    "{} did not finish within {:?}",
                    cmd.peek_basecmd(),
                    timeout.unwrap_or_default()
                )));
            }
            match self.listen_messenger(step)? {
                Some(Message::StdOut(chunk)) if chunk.cmd_id == Some(id) => sink(&chunk, false)?,
                Some(Message::StdErr(chunk)) if chunk.cmd_id == Some(id) => sink(&chunk, true)?,
                _ => {}
            }
        }
    }

    /// Blocks until the next message about command `id` arrives.
    ///
    /// Returns a snapshot of the registered command whose counters count
    /// the updates since the previous snapshot; the registered copy's
    /// counters are reset.
    pub fn wait_response(&mut self, id: CmdId, timeout: Option<Duration>) -> Result<CmdMaster> {
        if !self.cmds.contains_key(&id) {
            return Err(Error::Commander(format!("command {id} is not registered")));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let step = timeout.map(|t| t / WAIT_STEPS);
        loop {
            if let Some(d) = deadline
                && Instant::now() >= d
            {
                return Err(Error::Timeout(format!("no response to command {id}")));
            }
            let about = match self.listen_messenger(step)? {
                Some(Message::Cmd(reply)) => reply.cmd_id == id,
                Some(Message::StdOut(chunk) | Message::StdErr(chunk)) => chunk.cmd_id == Some(id),
                _ => false,
            };
            if about {
                return self
                    .cmds
                    .get_mut(&id)
                    .map(CmdMaster::snapshot)
                    .ok_or_else(|| Error::Commander(format!("command {id} is not registered")));
            }
        }
    }

    /// Reads one message from the slave and routes it.
    ///
    /// Command records are merged into the registered command; a record
    /// carrying a traceback deregisters the command and is returned as
    /// [`Error::Remote`]. Output chunks are appended to their command, or
    /// written to the local stdout/stderr when they belong to no command.
    /// `Ok(None)` means nothing arrived within `timeout`.
    pub fn listen_messenger(&mut self, timeout: Option<Duration>) -> Result<Option<Message>> {
        let msg = match self.messenger.read_msg(timeout) {
            Ok(Received::Msg(msg)) => msg,
            Ok(Received::Closed) => return Err(Error::Commander("Remote process died.".into())),
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(Error::Messenger(e.to_string()));
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::Commander("Remote process died.".into()));
            }
            Err(e) => return Err(e.into()),
        };
        trace!("received {msg:?}");
        match &msg {
            Message::Cmd(reply) => self.merge(reply)?,
            Message::StdOut(chunk) => self.route_output(chunk, false)?,
            Message::StdErr(chunk) => self.route_output(chunk, true)?,
            Message::CommanderError(text) => return Err(Error::Commander(text.clone())),
            Message::MessengerError(text) => return Err(Error::Messenger(text.clone())),
            other => debug!("ignoring {other:?}"),
        }
        Ok(Some(msg))
    }

    /// Writes `data` to the stdin of a running command.
    pub fn send_stdin(&mut self, cmd: &CmdMaster, data: &[u8]) -> Result<()> {
        self.manage("send_msg")
            .arg(Value::Bytes(data.to_vec()))
            .arg(cmd.cmd_id())
            .send()?;
        Ok(())
    }

    /// Registers a command started through another master and asks the
    /// slave to reattach to it. The id counter is moved past the command's
    /// id on both sides.
    pub fn adopt(&mut self, cmd: &CmdMaster) -> Result<()> {
        bump_cmd_id(cmd.cmd_id());
        self.cmds.entry(cmd.cmd_id()).or_insert_with(|| cmd.clone());
        let basecmd: BaseCmd = cmd.peek_basecmd().clone();
        self.manage("register_cmd").arg(basecmd).arg(peek_cmd_id()).send()?;
        Ok(())
    }

    /// The registered command `id`, as far as it has been received.
    pub fn get(&self, id: CmdId) -> Option<&CmdMaster> {
        self.cmds.get(&id)
    }

    /// Returns `true` if command `id` is registered.
    pub fn contains(&self, id: CmdId) -> bool {
        self.cmds.contains_key(&id)
    }

    /// Number of registered commands.
    pub fn pending(&self) -> usize {
        self.cmds.len()
    }

    /// Asks the slave to exit, then closes the transport.
    ///
    /// The request is best effort: a slave that is already gone is not an
    /// error. Returns the exit status of the slave process if this master
    /// started it.
    pub fn close(mut self) -> Result<Option<ExitStatus>> {
        if let Err(e) = self.manage("exit").timeout(Some(Duration::from_secs(5))).send() {
            debug!("exit request failed: {e}");
        }
        self.disconnect()
    }

    /// Closes the transport without asking the slave to exit. Running
    /// `nohup` commands can be picked up later through another master.
    pub fn disconnect(self) -> Result<Option<ExitStatus>> {
        let Self { messenger, child, .. } = self;
        drop(messenger);
        match child {
            Some(mut c) => Ok(Some(c.wait()?)),
            None => Ok(None),
        }
    }

    /// Removes and returns command `id` if it finished.
    fn take_finished(&mut self, id: CmdId) -> Option<CmdMaster> {
        if self.cmds.get(&id).is_some_and(CmdMaster::is_finished) {
            return self.cmds.remove(&id);
        }
        None
    }

    /// Applies a command record sent by the slave.
    fn merge(&mut self, reply: &BaseCmd) -> Result<()> {
        if let Some(Err(tb)) = &reply.results {
            if let Some(mut cmd) = self.cmds.remove(&reply.cmd_id) {
                cmd.update_basecmd(reply);
            }
            return Err(Error::Remote {
                kind: tb.kind.clone(),
                message: tb.message.clone(),
                traceback: tb.traceback.clone(),
            });
        }
        match self.cmds.get_mut(&reply.cmd_id) {
            Some(cmd) => cmd.update_basecmd(reply),
            None => debug!("record for unknown {reply}"),
        }
        Ok(())
    }

    /// Files an output chunk under its command.
    fn route_output(&mut self, chunk: &StdStream, stderr: bool) -> Result<()> {
        match chunk.cmd_id {
            Some(id) => match self.cmds.get_mut(&id) {
                Some(cmd) if stderr => cmd.push_stderr(&chunk.msg),
                Some(cmd) => cmd.push_stdout(&chunk.msg),
                None => debug!("dropping output of unknown command {id}"),
            },
            None if stderr => {
                let mut err = io::stderr();
                err.write_all(&chunk.msg)?;
                err.flush()?;
            }
            None => {
                let mut out = io::stdout();
                out.write_all(&chunk.msg)?;
                out.flush()?;
            }
        }
        Ok(())
    }
}

/// Collects the arguments of a command before it is sent.
#[derive(Debug)]
#[must_use = "a command is only sent by `send`"]
pub struct CmdBuilder<'a> {
    /// Master the command is sent through.
    master: &'a mut CommanderMaster,
    /// Mode token followed by the name segments.
    func: Vec<String>,
    /// Positional arguments.
    args: Vec<Value>,
    /// Keyword arguments.
    kargs: BTreeMap<String, Value>,
    /// Deadline passed to [`CommanderMaster::cmd`].
    timeout: Option<Duration>,
}

impl<'a> CmdBuilder<'a> {
    /// Starts a command at `path`, a dotted name such as `tools.hello`.
    fn new(master: &'a mut CommanderMaster, mode: Mode, path: &str) -> Self {
        let func = mode
            .token()
            .into_iter()
            .chain(path.split('.'))
            .map(str::to_owned)
            .collect();
        Self {
            master,
            func,
            args: Vec::new(),
            kargs: BTreeMap::new(),
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Appends a path segment, e.g. `call("tools").attr("hello")`.
    pub fn attr(mut self, name: &str) -> Self {
        self.func.push(name.to_owned());
        self
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several positional arguments.
    pub fn args<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Sets a keyword argument.
    pub fn karg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kargs.insert(name.into(), value.into());
        self
    }

    /// Overrides the deadline; `None` waits forever.
    pub const fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends the command. See [`CommanderMaster::cmd`].
    pub fn send(self) -> Result<CmdMaster> {
        let cmd = CmdMaster::new(self.func, self.args, self.kargs);
        self.master.cmd(cmd, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rcmd_proto::{CmdTraceBack, Encoding, pipe};

    use super::*;

    /// A master connected to a scripted slave running on another thread.
    fn scripted<F>(slave: F) -> (CommanderMaster, thread::JoinHandle<()>)
    where
        F: FnOnce(&mut Messenger) + Send + 'static,
    {
        let (r1, w1) = pipe().unwrap();
        let (r2, w2) = pipe().unwrap();
        let handle = thread::spawn(move || {
            let mut m = Messenger::new(InStream::new(r1, Encoding::Raw), OutStream::new(w2, Encoding::Raw));
            let Ok(Received::Msg(Message::Control(c))) = m.read_msg(None) else {
                panic!("expected start");
            };
            assert_eq!(c, START);
            m.write_msg(&Message::Control(STARTED.into())).unwrap();
            slave(&mut m);
        });
        let master =
            CommanderMaster::new(InStream::new(r2, Encoding::Raw), OutStream::new(w1, Encoding::Raw)).unwrap();
        (master, handle)
    }

    fn next_cmd(m: &mut Messenger) -> BaseCmd {
        match m.read_msg(None).unwrap() {
            Received::Msg(Message::Cmd(c)) => c,
            other => panic!("expected command, got {other:?}"),
        }
    }

    fn finished(mut c: BaseCmd, result: std::result::Result<Value, CmdTraceBack>) -> BaseCmd {
        c.results = Some(result);
        c.finished = true;
        c
    }

    #[test]
    fn sync_call_collects_output() {
        let (mut master, slave) = scripted(|m| {
            let c = next_cmd(m);
            assert_eq!(c.func, ["shell"]);
            assert_eq!(c.args, [Value::from("echo hi")]);
            m.write_msg(&Message::Cmd(c.clone())).unwrap();
            m.write_msg(&Message::StdOut(StdStream::new(b"hi\n".to_vec(), Some(c.cmd_id))))
                .unwrap();
            m.write_msg(&Message::StdOut(StdStream::new(b"x".to_vec(), Some(9999))))
                .unwrap();
            m.write_msg(&Message::Cmd(finished(c, Ok(Value::Int(0))))).unwrap();
        });
        let mut done = master.call("shell").arg("echo hi").send().unwrap();
        assert!(done.is_finished());
        assert_eq!(done.stdout(), b"hi\n");
        assert_eq!(done.into_value().unwrap(), Value::Int(0));
        assert_eq!(master.pending(), 0);
        slave.join().unwrap();
    }

    #[test]
    fn async_returns_after_ack() {
        let (mut master, slave) = scripted(|m| {
            let c = next_cmd(m);
            assert_eq!(c.func, ["async", "sleep"]);
            assert!(c.is_async);
            m.write_msg(&Message::Cmd(c.clone())).unwrap();
            m.write_msg(&Message::Cmd(finished(c, Ok(Value::None)))).unwrap();
        });
        let job = master.spawn("sleep").arg(1).send().unwrap();
        assert!(!job.is_finished());
        assert!(master.contains(job.cmd_id()));
        let done = master.wait(&job, Some(Duration::from_secs(5))).unwrap();
        assert!(done.is_finished());
        assert!(!master.contains(job.cmd_id()));
        // Waiting again returns the handle as is.
        assert!(!master.wait(&job, None).unwrap().is_finished());
        slave.join().unwrap();
    }

    #[test]
    fn remote_failure_deregisters() {
        let (mut master, slave) = scripted(|m| {
            let c = next_cmd(m);
            m.write_msg(&Message::Cmd(c.clone())).unwrap();
            let tb = CmdTraceBack::new("CalledProcessError", "function 'bang' failed", "Traceback ... bang".into());
            m.write_msg(&Message::Cmd(finished(c, Err(tb)))).unwrap();
        });
        match master.call("bang").send() {
            Err(Error::Remote { kind, traceback, .. }) => {
                assert_eq!(kind, "CalledProcessError");
                assert!(traceback.contains("bang"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
        assert_eq!(master.pending(), 0);
        slave.join().unwrap();
    }

    #[test]
    fn timeout_keeps_command_registered() {
        let (mut master, slave) = scripted(|m| {
            let c = next_cmd(m);
            m.write_msg(&Message::Cmd(c)).unwrap();
            // Never finishes; wait for the master to hang up.
            while !matches!(m.read_msg(None), Ok(Received::Closed) | Err(_)) {}
        });
        let err = master
            .call("sleep")
            .arg(10)
            .timeout(Some(Duration::from_millis(200)))
            .send()
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(master.pending(), 1);
        master.disconnect().unwrap();
        slave.join().unwrap();
    }

    #[test]
    fn slave_errors_surface() {
        let (mut master, slave) = scripted(|m| {
            let _ = next_cmd(m);
            m.write_msg(&Message::CommanderError("Traceback: NameError".into())).unwrap();
        });
        let err = master.call("nope").send().unwrap_err();
        assert!(matches!(err, Error::Commander(ref t) if t.contains("NameError")));
        assert_eq!(master.pending(), 0);
        slave.join().unwrap();
    }

    #[test]
    fn wait_response_needs_a_new_message() {
        let (mut master, slave) = scripted(|m| {
            let c = next_cmd(m);
            m.write_msg(&Message::Cmd(c.clone())).unwrap();
            m.write_msg(&Message::StdOut(StdStream::new(b"tick".to_vec(), Some(c.cmd_id))))
                .unwrap();
            while !matches!(m.read_msg(None), Ok(Received::Closed) | Err(_)) {}
        });
        let job = master.spawn("sleep").arg(10).send().unwrap();
        assert_eq!(job.results_cnt(), 1);
        let id = job.cmd_id();

        let update = master.wait_response(id, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(update.stdout_cnt(), 1);
        assert_eq!(update.results_cnt(), 0);

        // The slave has nothing more to say.
        let err = master.wait_response(id, Some(Duration::from_millis(300))).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        let err = master
            .wait_streaming(&job, Some(Duration::from_millis(300)), |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(master.contains(id));
        master.disconnect().unwrap();
        slave.join().unwrap();
    }

    #[test]
    fn wait_streaming_forwards_own_chunks() {
        let (mut master, slave) = scripted(|m| {
            let c = next_cmd(m);
            m.write_msg(&Message::Cmd(c.clone())).unwrap();
            m.write_msg(&Message::StdOut(StdStream::new(b"a".to_vec(), Some(c.cmd_id))))
                .unwrap();
            m.write_msg(&Message::StdErr(StdStream::new(b"b".to_vec(), Some(c.cmd_id))))
                .unwrap();
            m.write_msg(&Message::StdOut(StdStream::new(b"x".to_vec(), Some(9999))))
                .unwrap();
            m.write_msg(&Message::Cmd(finished(c, Ok(Value::Int(0))))).unwrap();
        });
        let job = master.spawn("shell").arg("echo a; echo b >&2").send().unwrap();
        let mut seen = Vec::new();
        let mut done = master
            .wait_streaming(&job, Some(Duration::from_secs(5)), |chunk, stderr| {
                seen.push((chunk.msg.clone(), stderr));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, [(b"a".to_vec(), false), (b"b".to_vec(), true)]);
        assert_eq!(done.stdout(), b"a");
        assert!(done.is_finished());
        assert_eq!(master.pending(), 0);
        slave.join().unwrap();
    }

    #[test]
    fn dead_slave_is_reported() {
        let (mut master, slave) = scripted(|m| {
            let _ = next_cmd(m);
        });
        let err = master.call("echo").send().unwrap_err();
        assert!(matches!(err, Error::Commander(ref t) if t == "Remote process died."));
        slave.join().unwrap();
    }

    #[test]
    fn handshake_requires_started() {
        let (r1, w1) = pipe().unwrap();
        let (r2, w2) = pipe().unwrap();
        let handle = thread::spawn(move || {
            let mut m = Messenger::new(InStream::new(r1, Encoding::Raw), OutStream::new(w2, Encoding::Raw));
            let _ = m.read_msg(None);
            m.write_msg(&Message::Control("nope".into())).unwrap();
        });
        let err = CommanderMaster::new(InStream::new(r2, Encoding::Raw), OutStream::new(w1, Encoding::Raw))
            .unwrap_err();
        assert!(matches!(err, Error::Commander(ref t) if t == "Remote commander not started."));
        handle.join().unwrap();
    }

    #[test]
    fn adopt_registers_and_asks_slave() {
        let (mut master, slave) = scripted(|m| {
            let c = next_cmd(m);
            assert_eq!(c.func, ["manage", "register_cmd"]);
            let adopted = c.args[0].as_cmd().unwrap().clone();
            assert_eq!(adopted.func, ["nohup", "shell"]);
            let next = c.args[1].as_int().unwrap();
            assert!(u64::try_from(next).unwrap() > adopted.cmd_id);
            m.write_msg(&Message::Cmd(finished(c, Ok(Value::None)))).unwrap();
        });
        let orphan = CmdMaster::new(vec!["nohup".into(), "shell".into()], vec![], BTreeMap::new());
        orphan.set_commander(&mut master).unwrap();
        assert!(master.contains(orphan.cmd_id()));
        slave.join().unwrap();
    }

    #[test]
    fn builder_paths() {
        let (mut master, slave) = scripted(|m| {
            let c = next_cmd(m);
            assert_eq!(c.func, ["nohup", "tools", "hello"]);
            assert_eq!(c.kargs.get("name"), Some(&Value::from("x")));
            assert_eq!(c.args, [Value::Int(1), Value::Int(2)]);
            m.write_msg(&Message::Cmd(c)).unwrap();
        });
        let cmd = master
            .nohup("tools")
            .attr("hello")
            .args([1, 2])
            .karg("name", "x")
            .send()
            .unwrap();
        assert!(cmd.is_async());
        slave.join().unwrap();
    }
}
