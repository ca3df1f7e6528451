//! Byte stream wrappers with an encoding policy and timed reads.
//!
//! Any pair of file descriptors works as a transport: pipes, sockets,
//! a pty, or the stdio of an `ssh` child process.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::codec::Encoding;

/// Read half of a transport.
#[derive(Debug)]
pub struct InStream {
    /// Underlying descriptor.
    file: File,
    /// Wire encoding.
    encoding: Encoding,
}

impl InStream {
    /// Wraps a readable descriptor.
    pub fn new(fd: impl Into<OwnedFd>, encoding: Encoding) -> Self {
        Self {
            file: File::from(fd.into()),
            encoding,
        }
    }

    /// Wire encoding of this stream.
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Reads up to `max_len` bytes.
    ///
    /// With `timeout == None` blocks until at least one byte arrives and
    /// returns an empty buffer on EOF. Otherwise returns `Ok(None)` when
    /// nothing became readable within `timeout`.
    pub fn read(&mut self, max_len: usize, timeout: Option<Duration>) -> io::Result<Option<Vec<u8>>> {
        if let Some(t) = timeout
            && !wait_readable(self.file.as_fd(), t)?
        {
            return Ok(None);
        }
        let mut buf = vec![0u8; max_len];
        let n = loop {
            match self.file.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        };
        buf.truncate(n);
        Ok(Some(buf))
    }

    /// Reads until `len` bytes were collected or EOF is hit.
    pub fn read_exact_len(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl AsFd for InStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for InStream {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Write half of a transport.
#[derive(Debug)]
pub struct OutStream {
    /// Underlying descriptor.
    file: File,
    /// Wire encoding.
    encoding: Encoding,
}

impl OutStream {
    /// Wraps a writable descriptor.
    pub fn new(fd: impl Into<OwnedFd>, encoding: Encoding) -> Self {
        Self {
            file: File::from(fd.into()),
            encoding,
        }
    }

    /// Wire encoding of this stream.
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Writes all of `data`.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.file.flush()
    }
}

impl AsFd for OutStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for OutStream {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Creates a close-on-exec pipe, returning `(read_end, write_end)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];

    // SAFETY: fds is a valid 2-element array.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: both FDs are valid after a successful pipe2() call.
    let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read_fd, write_fd))
}

/// Level-triggered readiness wait over many descriptors.
///
/// Returns the indices of `fds` that are readable or hung up. An empty
/// result means the timeout expired. `EINTR` is retried with the remaining
/// time.
pub fn poll_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<usize>> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let wait_ms = match deadline {
            None => -1,
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                i32::try_from(left.as_millis()).unwrap_or(i32::MAX)
            }
        };
        // SAFETY: pfds is a valid array of pollfd structs for its whole length.
        let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, wait_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        return Ok(pfds
            .iter()
            .enumerate()
            .filter(|(_, p)| p.revents & ready != 0)
            .map(|(i, _)| i)
            .collect());
    }
}

/// Waits until `fd` is readable or `timeout` expires.
fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    Ok(!poll_readable(&[fd.as_raw_fd()], Some(timeout))?.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (InStream, OutStream) {
        let (r, w) = pipe().unwrap();
        (InStream::new(r, Encoding::Raw), OutStream::new(w, Encoding::Raw))
    }

    #[test]
    fn timed_read_returns_none_when_idle() {
        let (mut r, _w) = pair();
        let got = r.read(16, Some(Duration::from_millis(50))).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn read_returns_available_bytes() {
        let (mut r, mut w) = pair();
        w.write(b"abc").unwrap();
        assert_eq!(r.read(16, Some(Duration::from_secs(1))).unwrap().unwrap(), b"abc");
        w.write(b"defgh").unwrap();
        assert_eq!(r.read(2, None).unwrap().unwrap(), b"de");
    }

    #[test]
    fn eof_is_empty_read() {
        let (mut r, w) = pair();
        drop(w);
        assert_eq!(r.read(16, None).unwrap().unwrap(), b"");
        // Timed reads see the hang-up as readiness.
        assert_eq!(r.read(16, Some(Duration::from_millis(10))).unwrap().unwrap(), b"");
    }

    #[test]
    fn poll_reports_ready_indices() {
        let (r1, _w1) = pair();
        let (r2, mut w2) = pair();
        w2.write(b"x").unwrap();
        let ready = poll_readable(&[r1.as_raw_fd(), r2.as_raw_fd()], Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(ready, vec![1]);
    }
}
