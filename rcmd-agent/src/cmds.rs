//! Commands every slave understands, and the default module functions.
//!
//! Shell functions stand in for code shipped at run time: `add_function`
//! and `import_src` accept POSIX `sh` function definitions and expose each
//! function as a callable that runs under `/bin/sh`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::rc::Rc;
use std::time::Duration;

use rcmd_proto::{CmdId, Value, force_cmd_id};
use tracing::debug;

use crate::slave::{Args, CallError, CallResult, Callable, CmdSlave, Namespace, Slave, Symbol};

/// How long `register_cmd` waits for the daemon's FIFOs.
const RECOVER_WAIT: Duration = Duration::from_secs(2);

/// Installs the slave commands into `ns`.
pub fn install_commands(ns: &mut Namespace) {
    ns.insert_fn("shell", shell);
    ns.insert_fn("interactive", interactive);
    ns.insert_fn("send_msg", send_msg);
    ns.insert_fn("register_cmd", register_cmd);
    ns.insert_fn("add_function", add_function);
    ns.insert_fn("copy_file", copy_file);
    ns.insert_fn("import_src", import_src);
    ns.insert_fn("exit", exit);
}

/// Installs the default module functions into `ns`.
pub fn install_module(ns: &mut Namespace) {
    ns.insert_fn("echo", echo);
    ns.insert_fn("sleep", sleep);
    ns.insert_fn("getpid", getpid);
}

/// `shell(cmd)`: runs `cmd` with `/bin/sh -c` and returns its exit code,
/// or minus the signal number if it was killed.
fn shell(_: &mut Slave, args: Args) -> CallResult {
    let cmd = args.str(0, "cmd")?;
    io::stdout().flush()?;
    let status = Command::new("/bin/sh").arg("-c").arg(cmd).status()?;
    Ok(Value::Int(exit_code(status)))
}

fn exit_code(status: ExitStatus) -> i64 {
    status
        .code()
        .map_or_else(|| -i64::from(status.signal().unwrap_or(0)), i64::from)
}

/// `interactive()`: a line REPL on stdin.
///
/// Each line is `name arg...` with literal arguments; the result or the
/// error is printed on stdout. `exit`, `quit` or EOF end the session.
/// Returns the number of lines evaluated.
fn interactive(slave: &mut Slave, _: Args) -> CallResult {
    let stdin = io::stdin();
    let mut out = io::stdout();
    let mut evaluated = 0_i64;
    for line in stdin.lock().lines() {
        let line = line?;
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            continue;
        };
        if matches!(name, "exit" | "quit") {
            break;
        }
        let path: Vec<String> = name.split('.').map(str::to_owned).collect();
        let args = Args::new(words.map(Value::parse_literal).collect(), BTreeMap::new());
        let reply = slave
            .scope()
            .resolve(&path)
            .and_then(|f| f.call(slave, args))
            .map_or_else(|e| e.to_string(), |v| v.to_string());
        writeln!(out, "{reply}")?;
        out.flush()?;
        evaluated += 1;
    }
    Ok(Value::Int(evaluated))
}

/// `send_msg(msg, cmd_id)`: writes `msg` to the stdin of a running command.
fn send_msg(slave: &mut Slave, args: Args) -> CallResult {
    let msg = args.bytes(0, "msg")?.to_vec();
    let id = cmd_id_arg(&args, 1)?;
    let cmd = slave
        .cmds_mut()
        .get_mut(&id)
        .ok_or_else(|| CallError::key_error(format!("no running command {id}")))?;
    cmd.send_stdin(&msg)?;
    Ok(Value::None)
}

/// `register_cmd(basecmd, cmd_id)`: adopts a daemonized command started by
/// an earlier slave and moves the id counter to `cmd_id`.
fn register_cmd(slave: &mut Slave, args: Args) -> CallResult {
    let basecmd = args.cmd(0, "basecmd")?.clone();
    let next = cmd_id_arg(&args, 1)?;
    let mut cmd = CmdSlave::new(basecmd);
    cmd.recover_fds(RECOVER_WAIT)?;
    force_cmd_id(next);
    debug!(cmd = %cmd.basecmd(), "reattached");
    slave.cmds_mut().insert(cmd.cmd_id(), cmd);
    Ok(Value::None)
}

fn cmd_id_arg(args: &Args, index: usize) -> Result<CmdId, CallError> {
    let raw = args.int(index, "cmd_id")?;
    CmdId::try_from(raw).map_err(|_| CallError::new("ValueError", format!("invalid command id {raw}")))
}

/// `add_function(code)`: installs the shell functions defined by `code` as
/// globals and returns their names.
fn add_function(slave: &mut Slave, args: Args) -> CallResult {
    let code = args.str(0, "code")?;
    let names = function_names(code);
    if names.is_empty() {
        return Err(CallError::new("ValueError", "no function definition found"));
    }
    check_syntax(code)?;
    let source: Rc<str> = Rc::from(code);
    for name in &names {
        slave
            .scope_mut()
            .globals
            .insert_fn(name.as_str(), ScriptFn::new(Rc::clone(&source), name));
    }
    Ok(Value::List(names.into_iter().map(Value::Str).collect()))
}

/// `copy_file(name, path, content)`: writes `content` to `path/name` and
/// returns the full path.
fn copy_file(_: &mut Slave, args: Args) -> CallResult {
    let name = args.str(0, "name")?;
    let dir = PathBuf::from(args.str(1, "path")?);
    let content = args.bytes(2, "content")?;
    fs::create_dir_all(&dir)?;
    let target = dir.join(name);
    fs::write(&target, content)?;
    Ok(Value::Str(target.display().to_string()))
}

/// `import_src(name, path=None)`: loads `name.sh` from the search path and
/// publishes its functions under the namespace `name`.
fn import_src(slave: &mut Slave, args: Args) -> CallResult {
    let name = args.str(0, "name")?;
    if let Some(dir) = args.get(1, "path").and_then(Value::as_str) {
        slave.add_search_path(Path::new(dir));
    }
    let file_name = format!("{name}.sh");
    let file = slave
        .search_path()
        .iter()
        .map(|dir| dir.join(&file_name))
        .find(|p| p.is_file())
        .ok_or_else(|| CallError::new("ImportError", format!("no module named '{name}'")))?;
    let text = fs::read_to_string(&file)?;
    let names = function_names(&text);
    if names.is_empty() {
        return Err(CallError::new(
            "ImportError",
            format!("{} defines no functions", file.display()),
        ));
    }
    check_syntax(&text)?;

    let source: Rc<str> = Rc::from(text);
    let mut ns = Namespace::new();
    for fname in &names {
        ns.insert_fn(fname.as_str(), ScriptFn::new(Rc::clone(&source), fname));
    }
    slave.scope_mut().globals.insert(name, Symbol::Namespace(ns));
    Ok(Value::List(names.into_iter().map(Value::Str).collect()))
}

/// `exit()`: stops the slave after this command is acknowledged.
fn exit(slave: &mut Slave, _: Args) -> CallResult {
    slave.request_exit();
    Ok(Value::None)
}

/// `echo(value=None)`: returns its argument.
fn echo(_: &mut Slave, args: Args) -> CallResult {
    Ok(args.get(0, "value").cloned().unwrap_or_default())
}

/// `sleep(seconds)`.
fn sleep(_: &mut Slave, args: Args) -> CallResult {
    let secs = args.float(0, "seconds")?;
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|e| CallError::new("ValueError", e.to_string()))?;
    std::thread::sleep(duration);
    Ok(Value::None)
}

/// `getpid()`: pid of the process running the call.
fn getpid(_: &mut Slave, _: Args) -> CallResult {
    Ok(Value::Int(i64::from(std::process::id())))
}

/// A shell function callable.
///
/// The defining source is replayed in a fresh `/bin/sh` followed by a call
/// of the function with the positional arguments. Keyword arguments are
/// exported as environment variables.
#[derive(Debug, Clone)]
pub struct ScriptFn {
    /// Script the function was defined in.
    source: Rc<str>,
    /// Function to call.
    name: String,
}

impl ScriptFn {
    /// Wraps function `name` defined in `source`.
    pub fn new(source: Rc<str>, name: &str) -> Self {
        Self {
            source,
            name: name.to_owned(),
        }
    }
}

impl Callable for ScriptFn {
    fn call(&self, _: &mut Slave, args: Args) -> CallResult {
        io::stdout().flush()?;
        let script = format!("{}\n{} \"$@\"", self.source, self.name);
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .arg(&self.name)
            .args(args.args.iter().map(ToString::to_string))
            .envs(args.kargs.iter().map(|(k, v)| (k, v.to_string())))
            .status()?;
        if status.success() {
            return Ok(Value::Int(0));
        }
        Err(CallError::new(
            "CalledProcessError",
            format!("function '{}' returned non-zero exit status {}", self.name, exit_code(status)),
        ))
    }
}

/// Names of the functions defined at the start of a line, in either the
/// `name() {` or the `function name {` form.
pub fn function_names(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in source.lines() {
        let line = line.trim_start();
        let (rest, keyword) = match line.strip_prefix("function ") {
            Some(rest) => (rest.trim_start(), true),
            None => (line, false),
        };
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let (name, tail) = rest.split_at(end);
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let tail = tail.trim_start();
        if (tail.starts_with("()") || (keyword && tail.starts_with('{')))
            && !names.iter().any(|n| n == name)
        {
            names.push(name.to_owned());
        }
    }
    names
}

/// Parses `source` with `sh -n`.
fn check_syntax(source: &str) -> Result<(), CallError> {
    let out = Command::new("/bin/sh")
        .arg("-n")
        .arg("-c")
        .arg(source)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()?;
    if out.status.success() {
        return Ok(());
    }
    Err(CallError::new(
        "SyntaxError",
        String::from_utf8_lossy(&out.stderr).trim().to_owned(),
    ))
}
