//! Daemonized (`nohup`) commands.
//!
//! A nohup command runs under a relay process that is detached from the
//! slave by a double fork. The relay and the slave meet at five named pipes
//! in a rendezvous directory; because the relay opens every FIFO read-write
//! the pipes stay alive while no slave is attached, and a later slave can
//! pick them up again.
//!
//! ```text
//!  slave  <── results ──  relay  <── results ──  task
//!         ── inputs  ──>         ── inputs  ──>
//!         ── stdin   ──>         ── stdin   ──>
//!         <── stdout ──          <── stdout ──
//!         <── stderr ──          <── stderr ──
//! ```

#![allow(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::stat::Mode;
use nix::unistd::{Pid, mkfifo, setsid};
use rcmd_proto::{BaseCmd, CmdFinish, Encoding, Message, poll_readable};
use tracing::debug;

use crate::slave::{CHUNK, Callable, Ends, Slave, spawn_child};
use crate::sys::{self, Fork};

/// File names of the FIFOs inside a rendezvous directory.
pub const FIFO_NAMES: [&str; 5] = ["stdin", "stdout", "stderr", "results", "inputs"];

/// Delay between attempts to reach a daemon that is still starting.
const RETRY: Duration = Duration::from_millis(10);

/// How often the relay checks whether a slave came back.
const READER_POLL: Duration = Duration::from_millis(100);

/// Creates a fresh `cmd_XXXX` rendezvous directory under `root`.
pub fn scratch_dir(root: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(root)?;
    let dir = tempfile::Builder::new()
        .prefix("cmd_")
        .rand_bytes(4)
        .tempdir_in(root)?;
    Ok(dir.keep())
}

/// The named pipes of one rendezvous directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fifos {
    root: PathBuf,
}

impl Fifos {
    /// Refers to the FIFOs under `root` without touching the filesystem.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates any missing FIFOs under `root`.
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let fifos = Self::at(root);
        for name in FIFO_NAMES {
            match mkfifo(&fifos.root.join(name), Mode::S_IRUSR | Mode::S_IWUSR) {
                Ok(()) | Err(Errno::EEXIST) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(fifos)
    }

    /// The rendezvous directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Master-bound result envelopes.
    pub fn results(&self) -> PathBuf {
        self.root.join("results")
    }

    /// Control messages for the task.
    pub fn inputs(&self) -> PathBuf {
        self.root.join("inputs")
    }

    /// Task stdin.
    pub fn stdin(&self) -> PathBuf {
        self.root.join("stdin")
    }

    /// Task stdout.
    pub fn stdout(&self) -> PathBuf {
        self.root.join("stdout")
    }

    /// Task stderr.
    pub fn stderr(&self) -> PathBuf {
        self.root.join("stderr")
    }

    /// Deletes the FIFOs and the directory.
    pub fn remove(&self) -> io::Result<()> {
        fs::remove_dir_all(&self.root)
    }

    /// Opens the slave side.
    ///
    /// The two write ends go first. Opening a FIFO for writing without
    /// blocking fails with `ENXIO` until the relay holds it, which is
    /// retried until `wait` runs out. The relay opens its output FIFOs
    /// before its input FIFOs, so once both writes succeed every FIFO the
    /// slave reads has a live writer.
    pub(crate) fn open_master_side(&self, wait: Duration) -> io::Result<Ends> {
        let deadline = Instant::now() + wait;
        let inputs = open_writer(&self.inputs(), deadline)?;
        let stdin = open_writer(&self.stdin(), deadline)?;
        let results = open_reader(&self.results())?;
        let stdout = open_reader(&self.stdout())?;
        let stderr = open_reader(&self.stderr())?;
        Ok(Ends {
            results,
            inputs,
            stdin,
            stdout,
            stderr,
        })
    }

    /// Opens the relay side. Read-write opens never block and keep each
    /// pipe from ever reporting EOF or `EPIPE`.
    fn open_daemon_side(&self) -> io::Result<Ends> {
        let rw = |path: PathBuf| -> io::Result<OwnedFd> {
            Ok(OpenOptions::new().read(true).write(true).open(path)?.into())
        };
        let results = rw(self.results())?;
        let stdout = rw(self.stdout())?;
        let stderr = rw(self.stderr())?;
        let inputs = rw(self.inputs())?;
        let stdin = rw(self.stdin())?;
        Ok(Ends {
            results,
            inputs,
            stdin,
            stdout,
            stderr,
        })
    }
}

fn open_writer(path: &Path, deadline: Instant) -> io::Result<OwnedFd> {
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(f) => {
                sys::set_blocking(&f)?;
                return Ok(f.into());
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        format!("no daemon behind {}", path.display()),
                    ));
                }
                std::thread::sleep(RETRY);
            }
            Err(e) => return Err(e),
        }
    }
}

fn open_reader(path: &Path) -> io::Result<OwnedFd> {
    let f = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    sys::set_blocking(&f)?;
    Ok(f.into())
}

/// A process holding a file open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Holder {
    /// Process id.
    pub pid: u32,
    /// At least one of its descriptors is open for writing.
    pub writable: bool,
}

/// Lists processes holding `path` open, by scanning `/proc/*/fd`.
///
/// Processes whose descriptor table cannot be read are skipped.
pub fn holders_of(path: &Path) -> io::Result<Vec<Holder>> {
    let target = fs::canonicalize(path)?;
    let mut found = Vec::new();
    for entry in fs::read_dir("/proc")?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let mut holder: Option<Holder> = None;
        for fd in fds.flatten() {
            if fs::read_link(fd.path()).ok().as_deref() != Some(target.as_path()) {
                continue;
            }
            let writable = fd_writable(&entry.path().join("fdinfo").join(fd.file_name()));
            let h = holder.get_or_insert(Holder { pid, writable: false });
            h.writable |= writable;
        }
        found.extend(holder);
    }
    Ok(found)
}

/// Reads the access mode from a `/proc/<pid>/fdinfo/<fd>` file.
fn fd_writable(fdinfo: &Path) -> bool {
    let Ok(text) = fs::read_to_string(fdinfo) else {
        return false;
    };
    text.lines()
        .find_map(|l| l.strip_prefix("flags:"))
        .and_then(|f| i32::from_str_radix(f.trim(), 8).ok())
        .is_some_and(|flags| flags & libc::O_ACCMODE != libc::O_RDONLY)
}

/// Outcome of [`daemonize`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Daemonized {
    /// The calling process; the daemon is running.
    Parent(Fifos),
    /// The detached daemon process.
    Child(Fifos),
    /// A daemon already serves this directory; nothing was forked.
    Existing(Fifos),
}

/// Detaches a daemon bound to the FIFOs under `root`.
///
/// If some other process already writes the stdout FIFO, a daemon is
/// alive and [`Daemonized::Existing`] is returned. Otherwise stale readers
/// are killed, and the process double forks: the grandchild starts a new
/// session, moves to `/`, clears its umask and points stdio at `/dev/null`.
/// The caller waits for the intermediate process, so no zombie is left.
pub fn daemonize(root: &Path) -> io::Result<Daemonized> {
    let fifos = Fifos::create(root)?;
    let me = std::process::id();
    let others: Vec<Holder> = holders_of(&fifos.stdout())?
        .into_iter()
        .filter(|h| h.pid != me)
        .collect();
    if others.iter().any(|h| h.writable) {
        return Ok(Daemonized::Existing(fifos));
    }
    for stale in &others {
        if let Ok(pid) = i32::try_from(stale.pid) {
            debug!(pid, "killing stale reader of {}", root.display());
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    match sys::fork()? {
        Fork::Parent(pid) => {
            sys::reap(pid);
            Ok(Daemonized::Parent(fifos))
        }
        Fork::Child => {
            if setsid().is_err() {
                sys::exit_now(1);
            }
            match sys::fork() {
                Ok(Fork::Child) => {}
                Ok(Fork::Parent(_)) => sys::exit_now(0),
                Err(_) => sys::exit_now(1),
            }
            if std::env::set_current_dir("/").is_err() {
                sys::exit_now(1);
            }
            // SAFETY: umask only changes the process file mode mask.
            unsafe { libc::umask(0) };
            if sys::devnull(&[libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]).is_err() {
                sys::exit_now(1);
            }
            Ok(Daemonized::Child(fifos))
        }
    }
}

/// One direction of the relay.
struct Route {
    src: Option<File>,
    /// Dropped after the first failed write.
    dst: Option<File>,
}

impl Route {
    fn new(src: OwnedFd, dst: OwnedFd) -> Self {
        Self {
            src: Some(File::from(src)),
            dst: Some(File::from(dst)),
        }
    }

    fn src_fd(&self) -> Option<RawFd> {
        self.src.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Moves one chunk. Returns `false` once the source hit EOF.
    fn pump(&mut self) -> bool {
        let Some(src) = self.src.as_mut() else {
            return false;
        };
        let mut buf = [0u8; CHUNK];
        let n = match src.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return true,
            Err(_) => 0,
        };
        if n == 0 {
            self.src = None;
            return false;
        }
        if let Some(dst) = self.dst.as_mut()
            && dst.write_all(&buf[..n]).is_err()
        {
            self.dst = None;
        }
        true
    }

    /// Moves whatever is buffered without waiting for more.
    fn drain(&mut self) {
        while let Some(fd) = self.src_fd()
            && poll_readable(&[fd], Some(Duration::ZERO)).is_ok_and(|r| !r.is_empty())
            && self.pump()
        {}
    }
}

const RESULTS: usize = 0;
const STDOUT: usize = 3;
const STDERR: usize = 4;

/// Body of the daemon: run the task in a child and shuttle bytes between
/// it and the FIFOs until it is done.
///
/// When the task's result pipe closes, its remaining output is flushed,
/// the task is reaped, and once a slave is attached to the results FIFO a
/// parent finish marker is written there.
pub(crate) fn relay(
    slave: &mut Slave,
    func: &Rc<dyn Callable>,
    basecmd: &BaseCmd,
    fifos: &Fifos,
) -> io::Result<()> {
    // The task is forked first so it does not inherit the FIFOs.
    let (pid, task) = spawn_child(slave, func, basecmd)?;
    let upstream = fifos.open_daemon_side()?;
    let mut routes = [
        Route::new(task.results, upstream.results),
        Route::new(upstream.inputs, task.inputs),
        Route::new(upstream.stdin, task.stdin),
        Route::new(task.stdout, upstream.stdout),
        Route::new(task.stderr, upstream.stderr),
    ];

    loop {
        let live: Vec<(usize, RawFd)> = routes
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.src_fd().map(|fd| (i, fd)))
            .collect();
        let fds: Vec<RawFd> = live.iter().map(|&(_, fd)| fd).collect();
        let mut done = false;
        for i in poll_readable(&fds, None)? {
            let idx = live[i].0;
            if !routes[idx].pump() && idx == RESULTS {
                done = true;
            }
        }
        if done {
            break;
        }
    }
    routes[STDOUT].drain();
    routes[STDERR].drain();
    sys::reap(pid);

    // Buffered FIFO contents vanish with the last open descriptor, so the
    // marker is only written once a slave holds the results FIFO.
    wait_for_reader(&fifos.results())?;
    let frame = rcmd_proto::frame(&Message::Finish(CmdFinish::parent()), Encoding::Raw)?;
    if let Some(dst) = routes[RESULTS].dst.as_mut() {
        dst.write_all(&frame)?;
    }
    Ok(())
}

fn wait_for_reader(path: &Path) -> io::Result<()> {
    let me = std::process::id();
    while !holders_of(path)?.iter().any(|h| h.pid != me) {
        std::thread::sleep(READER_POLL);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileTypeExt;

    use super::*;

    #[test]
    fn scratch_dirs_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let a = scratch_dir(root.path()).unwrap();
        let b = scratch_dir(root.path()).unwrap();
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("cmd_"));
        assert_eq!(name.len(), "cmd_".len() + 4);
    }

    #[test]
    fn create_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        Fifos::create(root.path()).unwrap();
        let fifos = Fifos::create(root.path()).unwrap();
        for name in FIFO_NAMES {
            let meta = fs::metadata(fifos.root().join(name)).unwrap();
            assert!(meta.file_type().is_fifo());
        }
        fifos.remove().unwrap();
        assert!(!root.path().exists());
    }

    #[test]
    fn master_side_needs_a_daemon() {
        let root = tempfile::tempdir().unwrap();
        let fifos = Fifos::create(root.path()).unwrap();
        let err = fifos.open_master_side(Duration::from_millis(30)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn sides_connect_and_data_survives_detach() {
        let root = tempfile::tempdir().unwrap();
        let fifos = Fifos::create(root.path()).unwrap();
        let daemon = fifos.open_daemon_side().unwrap();

        // Written while no slave is attached.
        File::from(daemon.stdout.try_clone().unwrap())
            .write_all(b"early")
            .unwrap();

        let master = fifos.open_master_side(Duration::from_secs(1)).unwrap();
        let mut out = File::from(master.stdout);
        let mut buf = [0u8; 5];
        out.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"early");

        File::from(master.stdin).write_all(b"in").unwrap();
        let mut got = [0u8; 2];
        File::from(daemon.stdin).read_exact(&mut got).unwrap();
        assert_eq!(&got, b"in");
    }

    #[test]
    fn holders_reports_access_mode() {
        let root = tempfile::tempdir().unwrap();
        let fifos = Fifos::create(root.path()).unwrap();
        let me = std::process::id();
        assert!(holders_of(&fifos.stdout()).unwrap().is_empty());

        let _rw = OpenOptions::new().read(true).write(true).open(fifos.stdout()).unwrap();
        let holders = holders_of(&fifos.stdout()).unwrap();
        assert_eq!(holders, vec![Holder { pid: me, writable: true }]);
    }

    #[test]
    fn route_moves_bytes_until_eof() {
        let (src_r, src_w) = rcmd_proto::pipe().unwrap();
        let (dst_r, dst_w) = rcmd_proto::pipe().unwrap();
        let mut route = Route::new(src_r, dst_w);
        File::from(src_w).write_all(b"abc").unwrap();
        assert!(route.pump());
        assert!(!route.pump());
        assert!(route.src_fd().is_none());
        drop(route);
        let mut got = Vec::new();
        File::from(dst_r).read_to_end(&mut got).unwrap();
        assert_eq!(got, b"abc");
    }
}
