//! Readiness multiplexing over `poll(2)`.
//!
//! [`PollSet`] is the dynamic descriptor list handed to `poll`; slot 0 is
//! always the [`WakeSignal`]. [`run`] is the loop both engines drive:
//!
//! ```text
//! ┌──────────────────────┐  ready   ┌───────────────────────────────┐
//! │ WaitingForReadiness  │ ───────► │ Dispatching                    │
//! │  poll(set, -1)       │          │  1. drain wake slot            │
//! │  EINTR / 0 → re-wait │ ◄─────── │  2. engine-specific dispatch   │
//! └──────────────────────┘ Continue └───────────────────────────────┘
//! ```
//!
//! The wait never times out. The loop leaves only when `running` is cleared
//! (observed right after a wake), when the dispatcher returns
//! [`Flow::Exit`], or when `poll` itself fails.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::wake::WakeSignal;

/// Index of the wake signal in every [`PollSet`].
pub const WAKE_SLOT: usize = 0;

/// What a dispatcher wants the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Wait for the next batch of readiness.
    Continue,
    /// Leave the loop.
    Exit,
}

/// Readiness of one slot after a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Nothing reported.
    Idle,
    /// Readable, hung up, or errored: a read will not block.
    Readable,
    /// `POLLNVAL`: the descriptor is not open.
    Invalid,
}

/// Engine-specific handling of one wake-up.
pub trait Dispatch {
    /// Called after the wake slot has been drained and `running` re-checked.
    fn dispatch(&mut self, set: &mut PollSet) -> Flow;
}

/// Ordered `pollfd` list, with the wake signal pinned at slot 0.
#[derive(Debug)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    /// Creates a set containing only `wake`.
    pub fn new(wake: &WakeSignal) -> Self {
        let mut set = Self { fds: Vec::with_capacity(4) };
        set.push(wake.as_raw_fd());
        set
    }

    /// Registers `fd` for read readiness and returns its slot.
    pub fn push(&mut self, fd: RawFd) -> usize {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.fds.len() - 1
    }

    /// Unregisters the slot at `index`, shifting later slots down by one.
    ///
    /// Order is preserved, so a scan that removes slot `i` continues at the
    /// same `i` and still visits every remaining slot exactly once.
    pub fn remove(&mut self, index: usize) -> RawFd {
        debug_assert_ne!(index, WAKE_SLOT, "the wake slot is never removed");
        self.fds.remove(index).fd
    }

    /// Points an existing slot at a different descriptor.
    pub fn replace(&mut self, index: usize, fd: RawFd) {
        let slot = &mut self.fds[index];
        slot.fd = fd;
        slot.revents = 0;
    }

    /// Number of registered slots, wake slot included.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Always false: the wake slot is permanent.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Descriptor registered at `index`.
    pub fn fd(&self, index: usize) -> RawFd {
        self.fds[index].fd
    }

    /// Reads and clears the readiness reported for `index`.
    pub fn take_ready(&mut self, index: usize) -> Readiness {
        let revents = std::mem::take(&mut self.fds[index].revents);
        if revents & libc::POLLNVAL != 0 {
            Readiness::Invalid
        } else if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            Readiness::Readable
        } else {
            Readiness::Idle
        }
    }

    /// Blocks until at least one slot is ready.
    ///
    /// Returns the number of ready slots; `EINTR` is surfaced to the caller.
    pub fn wait(&mut self) -> io::Result<usize> {
        // SAFETY: `fds` is a live, correctly sized pollfd array for the call.
        let ret = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}

/// Runs the multiplexer loop until stopped, exited, or failed.
///
/// `EINTR` and zero-ready wakes re-enter the wait. Any other `poll` failure
/// is returned and ends the loop.
pub fn run<D: Dispatch>(
    set: &mut PollSet,
    wake: &WakeSignal,
    running: &AtomicBool,
    dispatcher: &mut D,
) -> io::Result<()> {
    while running.load(Ordering::Acquire) {
        match set.wait() {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        if set.take_ready(WAKE_SLOT) != Readiness::Idle {
            wake.drain();
        }
        if !running.load(Ordering::Acquire) {
            break;
        }

        if dispatcher.dispatch(set) == Flow::Exit {
            break;
        }
    }
    Ok(())
}
