//! End-to-end tests: a master driving the `rcmd-agent` binary over its stdio.

#![cfg(target_os = "linux")]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use rcmd::{CommanderMaster, Encoding, Error, Transport, Value};
use rcmd_agent::daemon::FIFO_NAMES;

fn agent(encoding: Encoding, scratch: Option<&Path>) -> CommanderMaster {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_rcmd-agent"));
    cmd.arg(match encoding {
        Encoding::Base64 => "agent_base64",
        _ => "agent",
    });
    if let Some(dir) = scratch {
        cmd.env("RCMD_SCRATCH_DIR", dir);
    }
    Transport::spawn_command(cmd, encoding)
        .unwrap()
        .connect()
        .unwrap()
}

fn connect() -> CommanderMaster {
    agent(Encoding::Raw, None)
}

#[test]
fn echo_inline_and_forked() {
    let mut m = connect();
    let v = m.manage("echo").arg(42).send().unwrap().into_value().unwrap();
    assert_eq!(v, Value::Int(42));
    let v = m.call("echo").arg("hi").send().unwrap().into_value().unwrap();
    assert_eq!(v, Value::from("hi"));
    assert_eq!(m.pending(), 0);
    m.close().unwrap();
}

#[test]
fn forked_calls_run_in_a_child() {
    let mut m = connect();
    let inline = m.manage("getpid").send().unwrap().into_value().unwrap();
    let forked = m.call("getpid").send().unwrap().into_value().unwrap();
    assert!(inline.as_int().is_some());
    assert_ne!(inline, forked);
    m.close().unwrap();
}

#[test]
fn shell_output_and_status() {
    let mut m = connect();
    let mut done = m.call("shell").arg("echo out; echo err >&2").send().unwrap();
    assert_eq!(done.stdout(), b"out\n");
    assert_eq!(done.stderr(), b"err\n");
    assert_eq!(done.into_value().unwrap(), Value::Int(0));

    let code = m.call("shell").arg("exit 3").send().unwrap().into_value().unwrap();
    assert_eq!(code, Value::Int(3));
    m.close().unwrap();
}

#[test]
fn added_function_is_callable() {
    let mut m = connect();
    let names = m
        .manage("add_function")
        .arg("greet() { echo \"hello $1\"; }")
        .send()
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(names, Value::List(vec![Value::from("greet")]));

    let mut done = m.call("greet").arg("world").send().unwrap();
    assert_eq!(done.stdout(), b"hello world\n");
    assert_eq!(done.into_value().unwrap(), Value::Int(0));
    m.close().unwrap();
}

#[test]
fn remote_failure_carries_traceback() {
    let mut m = connect();
    m.manage("add_function")
        .arg("bang() { echo boom >&2; return 4; }")
        .send()
        .unwrap();
    match m.call("bang").send() {
        Err(Error::Remote { kind, message, traceback }) => {
            assert_eq!(kind, "CalledProcessError");
            assert!(message.contains("bang"));
            assert!(message.contains('4'));
            assert!(traceback.contains("in bang"));
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
    assert_eq!(m.pending(), 0);
    m.close().unwrap();
}

#[test]
fn spawn_returns_before_completion() {
    let mut m = connect();
    let job = m.spawn("shell").arg("sleep 0.3; echo hi").send().unwrap();
    assert!(!job.is_finished());
    assert!(m.contains(job.cmd_id()));

    let mut done = m.wait(&job, Some(Duration::from_secs(10))).unwrap();
    assert!(done.is_finished());
    assert_eq!(done.stdout(), b"hi\n");
    assert!(!m.contains(job.cmd_id()));
    m.close().unwrap();
}

#[test]
fn timeout_leaves_slave_usable() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let mut m = connect();
    let err = m
        .call("shell")
        .arg(format!("echo $$ > {}; exec sleep 5", pid_file.display()))
        .timeout(Some(Duration::from_secs(1)))
        .send()
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(m.pending(), 1);

    // The timed-out command keeps running.
    let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    let pid = Pid::from_raw(pid);
    assert!(kill(pid, None).is_ok());

    let v = m.manage("echo").arg(7).send().unwrap().into_value().unwrap();
    assert_eq!(v, Value::Int(7));
    let _ = kill(pid, Signal::SIGKILL);
    m.close().unwrap();
}

#[test]
fn stdin_reaches_spawned_command() {
    let mut m = connect();
    let job = m.spawn("interactive").send().unwrap();
    job.send_stdin(&mut m, b"echo 5\n").unwrap();
    m.send_stdin(&job, b"exit\n").unwrap();

    let mut done = job.wait(&mut m, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(done.stdout(), b"5\n");
    assert_eq!(done.into_value().unwrap(), Value::Int(1));
    m.close().unwrap();
}

#[test]
fn unknown_function_is_rejected() {
    let mut m = connect();
    match m.call("no_such_function").send() {
        Err(Error::Commander(text)) => assert!(text.contains("NameError"), "{text}"),
        other => panic!("expected a commander error, got {other:?}"),
    }
    assert_eq!(m.pending(), 0);
    // The slave keeps serving.
    let v = m.manage("echo").arg(1).send().unwrap().into_value().unwrap();
    assert_eq!(v, Value::Int(1));
    m.close().unwrap();
}

#[test]
fn imported_script_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().display().to_string();
    let mut m = connect();

    let written = m
        .manage("copy_file")
        .arg("tools.sh")
        .arg(path.as_str())
        .arg(Value::Bytes(b"hello() { echo \"hi $1\"; }\n".to_vec()))
        .send()
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(written, Value::Str(format!("{path}/tools.sh")));

    m.manage("import_src").arg("tools").arg(path.as_str()).send().unwrap();
    let mut done = m.call("tools").attr("hello").arg("x").send().unwrap();
    assert_eq!(done.stdout(), b"hi x\n");

    match m.manage("import_src").arg("missing").send() {
        Err(Error::Remote { kind, .. }) => assert_eq!(kind, "ImportError"),
        other => panic!("expected ImportError, got {other:?}"),
    }
    m.close().unwrap();
}

#[test]
fn nohup_survives_reconnect() {
    let scratch = tempfile::tempdir().unwrap();
    let mut m = agent(Encoding::Raw, Some(scratch.path()));
    let job = m.nohup("shell").arg("sleep 1; echo done").send().unwrap();
    assert!(job.is_async());

    let root = PathBuf::from(job.cmd_hash().unwrap());
    assert!(root.starts_with(scratch.path()));
    for name in FIFO_NAMES {
        assert!(root.join(name).exists(), "missing {name}");
    }
    m.disconnect().unwrap();

    let mut m = agent(Encoding::Raw, Some(scratch.path()));
    job.set_commander(&mut m).unwrap();
    let mut done = job.wait(&mut m, Some(Duration::from_secs(20))).unwrap();
    assert!(String::from_utf8_lossy(done.stdout()).contains("done"));
    assert_eq!(done.into_value().unwrap(), Value::Int(0));
    assert!(!root.exists());
    m.close().unwrap();
}

#[test]
fn exit_ends_the_agent() {
    let m = connect();
    let status = m.close().unwrap().unwrap();
    assert!(status.success());
}

#[test]
fn base64_transport() {
    let mut m = agent(Encoding::Base64, None);
    let mut done = m.call("shell").arg("printf 'a\\001b'").send().unwrap();
    assert_eq!(done.stdout(), b"a\x01b");
    let v = m.manage("echo").arg(Value::Bytes(vec![0, 255])).send().unwrap().into_value().unwrap();
    assert_eq!(v, Value::Bytes(vec![0, 255]));
    m.close().unwrap();
}
