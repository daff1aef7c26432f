//! Cross-thread wake signal for the multiplexer loop.
//!
//! A non-blocking self-pipe. The read end sits in the same `poll(2)` set as
//! the sockets, so one wait observes both I/O and control requests:
//!
//! ```text
//! owner thread ── raise() ──► [write end] ═pipe═ [read end] ◄── poll() ── loop thread
//!                                                     └── drain() after wake
//! ```
//!
//! Raising is edge-clearing: however many times `raise` is called between
//! two drains, the loop wakes at most once more.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::fd::{set_cloexec, set_nonblocking};

/// Self-pipe that interrupts a blocked `poll` from another thread.
#[derive(Debug)]
pub struct WakeSignal {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakeSignal {
    /// Creates the pipe pair with both ends non-blocking and close-on-exec.
    ///
    /// Both descriptors are closed again if configuring either end fails.
    pub fn new() -> io::Result<Self> {
        let mut fds: [RawFd; 2] = [-1; 2];
        // SAFETY: `pipe` writes exactly two descriptors into `fds` on success.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are owned by nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            set_nonblocking(fd)?;
            set_cloexec(fd)?;
        }

        Ok(Self { read, write })
    }

    /// Wakes the loop's current or next `poll`. Callable from any thread.
    ///
    /// A full pipe already guarantees a pending wake, so `EAGAIN` is ignored.
    pub fn raise(&self) {
        let byte = [1u8];
        loop {
            // SAFETY: writes one byte from a live stack buffer to our own fd.
            let n = unsafe { libc::write(self.write.as_raw_fd(), byte.as_ptr().cast(), 1) };
            if n >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return,
                _ => {
                    log::warn!("[wake] raise failed: {err}");
                    return;
                }
            }
        }
    }

    /// Consumes every pending raise. Called only from the loop thread.
    ///
    /// Returns the number of bytes discarded.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            // SAFETY: reads into a live stack buffer of the stated length.
            let n = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                total += n as usize;
                continue;
            }
            if n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // 0 cannot happen while we hold the write end; EAGAIN means empty.
            return total;
        }
    }

    /// Blocks up to `timeout` for a raise, without draining it.
    ///
    /// Returns `true` if the signal was raised. Used for the client's
    /// reconnect interval so `stop` never waits out a full interval.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut pfd = libc::pollfd {
                fd: self.read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
            // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
            let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
            if ret > 0 {
                return Ok(pfd.revents & libc::POLLIN != 0);
            }
            if ret == 0 {
                return Ok(false);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl AsRawFd for WakeSignal {
    /// The read end, to be registered in a poll set.
    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}
