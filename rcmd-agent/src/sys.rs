//! Thin wrappers over the process and descriptor syscalls the slave needs.

#![allow(unsafe_code)]

use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

/// Which side of a `fork(2)` the caller is on.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Fork {
    /// The new process.
    Child,
    /// The original process, with the child's pid.
    Parent(i32),
}

/// Forks the current process.
///
/// Buffered stdio is flushed first so the child does not inherit and
/// re-emit pending output. The slave is single-threaded, so no lock can
/// be held by another thread across the fork.
pub(crate) fn fork() -> io::Result<Fork> {
    flush_stdio();
    // SAFETY: the slave runs a single thread; the child only touches
    // state it owns before exiting through `exit_now`.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}

/// Flushes the process-wide stdout and stderr buffers.
pub(crate) fn flush_stdio() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Flushes stdio and terminates without running destructors or atexit
/// handlers inherited from the parent.
pub(crate) fn exit_now(code: i32) -> ! {
    flush_stdio();
    // SAFETY: _exit is always safe to call.
    unsafe { libc::_exit(code) }
}

/// Reaps `pid`, blocking until it exits.
///
/// `ECHILD` means the process was already reaped or is not our child
/// (a double-forked daemon); the pid is then assumed to have finished.
/// Returns the exit code, `-signal` if it was killed, or `0` when unknown.
pub(crate) fn reap(pid: i32) -> i32 {
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, sig, _)) => return -(sig as i32),
            Err(Errno::EINTR) => {}
            Ok(_) | Err(_) => return 0,
        }
    }
}

/// Duplicates `fd` to a new close-on-exec descriptor above stdio.
pub(crate) fn dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: fcntl(F_DUPFD_CLOEXEC) on a caller-provided descriptor.
    let new = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) };
    if new < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `new` is a freshly allocated descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// Makes `dst` refer to the same open file as `src`.
pub(crate) fn dup2(src: &impl AsRawFd, dst: RawFd) -> io::Result<()> {
    // SAFETY: dup2 on valid descriptors; `dst` is a stdio slot we own.
    if unsafe { libc::dup2(src.as_raw_fd(), dst) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Points the given stdio slots at `/dev/null`.
pub(crate) fn devnull(slots: &[RawFd]) -> io::Result<()> {
    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for &slot in slots {
        dup2(&null, slot)?;
    }
    Ok(())
}

/// Clears `O_NONBLOCK` on a descriptor.
pub(crate) fn set_blocking(fd: &impl AsRawFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: F_GETFL/F_SETFL on a valid descriptor.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
