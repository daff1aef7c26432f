//! Engine lifecycle state and the owned loop thread.
//!
//! Both engines follow the same shape:
//!
//! ```text
//! NotRunning ──start()──► Running ──stop()──► Stopping ──joined──► NotRunning
//!                            │
//!                            └── poll failure ──► Faulted ──stop()──► NotRunning
//! ```
//!
//! [`LoopHandle`] owns the background thread. Dropping it (or calling
//! [`LoopHandle::shutdown`]) clears `running`, raises the wake signal and
//! joins, so no loop thread outlives its engine.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{IpcError, Result};
use crate::wake::WakeSignal;

/// Externally visible engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// No loop thread exists.
    NotRunning = 0,
    /// The loop thread is servicing sockets.
    Running = 1,
    /// `stop` is joining the loop thread.
    Stopping = 2,
    /// The loop thread exited on an unrecoverable error. Resources are held
    /// until `stop` releases them; `start` is rejected until then.
    Faulted = 3,
}

/// Atomic cell holding an [`EngineState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(EngineState::NotRunning as u8))
    }
}

impl StateCell {
    pub(crate) fn load(&self) -> EngineState {
        match self.0.load(Ordering::Acquire) {
            1 => EngineState::Running,
            2 => EngineState::Stopping,
            3 => EngineState::Faulted,
            _ => EngineState::NotRunning,
        }
    }

    pub(crate) fn store(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `from` to `to`; returns false and changes nothing otherwise.
    pub(crate) fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Joinable loop thread plus the controls needed to stop it.
#[derive(Debug)]
pub(crate) struct LoopHandle {
    wake: Arc<WakeSignal>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl LoopHandle {
    /// Sets `running` and spawns `body` on a named thread.
    ///
    /// On failure `running` is cleared again and nothing is left behind.
    pub(crate) fn spawn<F>(
        name: String,
        wake: Arc<WakeSignal>,
        running: Arc<AtomicBool>,
        body: F,
    ) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        running.store(true, Ordering::Release);
        match thread::Builder::new().name(name).spawn(body) {
            Ok(thread) => Ok(Self {
                wake,
                running,
                thread: Some(thread),
            }),
            Err(e) => {
                running.store(false, Ordering::Release);
                Err(IpcError::Spawn(e))
            }
        }
    }

    /// True when called from the loop thread itself.
    pub(crate) fn is_loop_thread(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|t| t.thread().id() == thread::current().id())
    }

    /// Clears `running` and wakes the loop without waiting for it.
    pub(crate) fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake.raise();
    }

    /// Stops and joins the loop thread.
    pub(crate) fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.request_stop();

        if thread.thread().id() == thread::current().id() {
            // Joining ourselves would deadlock; the loop exits on its own
            // once control returns to it.
            log::warn!("[lifecycle] loop thread dropped its own handle; detaching");
            return;
        }
        if thread.join().is_err() {
            log::error!("[lifecycle] loop thread panicked");
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{self, Dispatch, Flow, PollSet};

    struct Idle;

    impl Dispatch for Idle {
        fn dispatch(&mut self, _set: &mut PollSet) -> Flow {
            Flow::Continue
        }
    }

    fn spawn_idle_loop() -> (LoopHandle, Arc<AtomicBool>) {
        let wake = Arc::new(WakeSignal::new().unwrap());
        let running = Arc::new(AtomicBool::new(false));
        let loop_wake = Arc::clone(&wake);
        let loop_running = Arc::clone(&running);
        let handle = LoopHandle::spawn("test-loop".into(), wake, Arc::clone(&running), move || {
            let mut set = PollSet::new(&loop_wake);
            poller::run(&mut set, &loop_wake, &loop_running, &mut Idle).unwrap();
        })
        .unwrap();
        (handle, running)
    }

    #[test]
    fn test_state_cell_round_trips_every_state() {
        let cell = StateCell::default();
        assert_eq!(cell.load(), EngineState::NotRunning);
        for state in [
            EngineState::Running,
            EngineState::Stopping,
            EngineState::Faulted,
            EngineState::NotRunning,
        ] {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn test_transition_only_from_expected_state() {
        let cell = StateCell::default();
        cell.store(EngineState::Stopping);
        assert!(!cell.transition(EngineState::Running, EngineState::Faulted));
        assert_eq!(cell.load(), EngineState::Stopping);

        cell.store(EngineState::Running);
        assert!(cell.transition(EngineState::Running, EngineState::Faulted));
        assert_eq!(cell.load(), EngineState::Faulted);
    }

    #[test]
    fn test_spawn_sets_running_and_shutdown_joins() {
        let (handle, running) = spawn_idle_loop();
        assert!(running.load(Ordering::Acquire));
        assert!(!handle.is_loop_thread());

        handle.shutdown();
        assert!(!running.load(Ordering::Acquire));
    }

    #[test]
    fn test_request_stop_does_not_join() {
        let (handle, running) = spawn_idle_loop();
        handle.request_stop();
        assert!(!running.load(Ordering::Acquire));

        // The thread is still owned; shutdown joins whatever is left.
        assert!(handle.thread.is_some());
        handle.shutdown();
    }

    #[test]
    fn test_drop_joins_loop_thread() {
        let (handle, running) = spawn_idle_loop();
        drop(handle);
        assert!(!running.load(Ordering::Acquire));
    }
}
