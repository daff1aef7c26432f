//! Auto-reconnecting Unix domain socket client.
//!
//! The loop thread owns a reconnect loop around the multiplexer:
//!
//! ```text
//!            ┌───────── connect failed: wait reconnect_timeout (wake aborts) ─┐
//!            ▼                                                                │
//! ┌────────────────┐  connect ok   ┌──────────────────┐                       │
//! │  Disconnected  │ ────────────► │    Connected     │                       │
//! │  ready = false │ ◄──────────── │    ready = true  │                       │
//! └────────────────┘  EOF / error  └──────────────────┘                       │
//!            │        (retry now)          │ stop()                           │
//!            └─────────────────────────────┴──► loop exits, ready = false ◄───┘
//! ```
//!
//! Every change of the ready flag goes through one lock and publishes
//! exactly one `ReadyChanged`, so observers never see the same value twice
//! in a row.

use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;

use crate::buffer::{ConnectionBuffer, StreamStatus};
use crate::config::IpcConfig;
use crate::endpoint::{self, Connect};
use crate::error::{write_outcome, IpcError, Result};
use crate::events::{ClientEvent, EventSink};
use crate::lifecycle::{EngineState, LoopHandle, StateCell};
use crate::poller::{self, Dispatch, Flow, PollSet, Readiness};
use crate::wake::WakeSignal;

const CONNECTION_SLOT: usize = 1;

/// Unix domain socket client that keeps reconnecting to one server.
///
/// `start`, `stop`, `send` and the accessors may be called from any thread.
pub struct IpcClient {
    config: IpcConfig,
    shared: Arc<ClientShared>,
    runtime: Mutex<Option<ClientRuntime>>,
}

struct ClientRuntime {
    handle: LoopHandle,
    server_path: PathBuf,
}

/// State touched by both the loop thread and callers.
struct ClientShared {
    sink: Arc<dyn EventSink<ClientEvent>>,
    state: StateCell,
    ready: AtomicBool,
    /// Serialises ready transitions with their notifications.
    ready_lock: Mutex<()>,
    reconnect_timeout_ms: AtomicU64,
    /// Current connection; `Some` only while connected.
    stream: RwLock<Option<Arc<UnixStream>>>,
}

impl ClientShared {
    /// Sets the ready flag, publishing only on an actual change.
    fn set_ready(&self, ready: bool) {
        let _guard = self.ready_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.ready.swap(ready, Ordering::AcqRel) != ready {
            self.sink.publish(ClientEvent::ReadyChanged(ready));
        }
    }

    /// Marks the client ready unless a stop was already requested.
    ///
    /// `stop` clears `running` before forcing ready off under the same lock,
    /// so no `ReadyChanged(true)` can follow the final `false`.
    fn mark_connected(&self, running: &AtomicBool) -> bool {
        let _guard = self.ready_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.load(Ordering::Acquire) {
            return false;
        }
        if !self.ready.swap(true, Ordering::AcqRel) {
            self.sink.publish(ClientEvent::ReadyChanged(true));
        }
        true
    }

    /// Records an unrecoverable loop failure.
    fn fail(&self, reason: String) {
        log::error!("[sockbus-client] loop terminated: {reason}");
        // A concurrent stop keeps its Stopping state.
        self.state.transition(EngineState::Running, EngineState::Faulted);
        self.sink.publish(ClientEvent::LoopFailed(reason));
    }

    fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms.load(Ordering::Relaxed))
    }

    fn set_stream(&self, stream: Option<Arc<UnixStream>>) {
        *self.stream.write().unwrap_or_else(PoisonError::into_inner) = stream;
    }
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("state", &self.state())
            .field("ready", &self.is_ready())
            .field("server_path", &self.server_path())
            .finish_non_exhaustive()
    }
}

impl IpcClient {
    /// Creates a stopped client that will publish to `sink`.
    pub fn new(config: IpcConfig, sink: impl EventSink<ClientEvent> + 'static) -> Self {
        let reconnect_timeout_ms = AtomicU64::new(config.reconnect_timeout_ms);
        Self {
            config,
            shared: Arc::new(ClientShared {
                sink: Arc::new(sink),
                state: StateCell::default(),
                ready: AtomicBool::new(false),
                ready_lock: Mutex::new(()),
                reconnect_timeout_ms,
                stream: RwLock::new(None),
            }),
            runtime: Mutex::new(None),
        }
    }

    /// Starts connecting to the server endpoint `server_name`.
    ///
    /// Returns as soon as the loop thread is running; the connection itself
    /// is reported later through `ReadyChanged(true)`. A missing server is
    /// not an error: the client retries every reconnect interval.
    ///
    /// # Errors
    ///
    /// [`IpcError::AlreadyStarted`] if started or still stopping;
    /// [`IpcError::InvalidName`] /
    /// [`IpcError::PathTooLong`] for bad names; [`IpcError::Setup`] /
    /// [`IpcError::Spawn`] when a resource cannot be acquired.
    pub fn start(&self, server_name: &str) -> Result<()> {
        let mut runtime = self.lock_runtime();
        if runtime.is_some() || self.shared.state.load() == EngineState::Stopping {
            return Err(IpcError::AlreadyStarted);
        }

        let server_path = self.config.socket_path(server_name)?;
        let wake = Arc::new(WakeSignal::new().map_err(IpcError::setup("pipe"))?);
        let running = Arc::new(AtomicBool::new(false));

        let client_loop = ClientLoop {
            server_path: server_path.clone(),
            shared: Arc::clone(&self.shared),
            wake: Arc::clone(&wake),
            running: Arc::clone(&running),
            buffer: ConnectionBuffer::new(self.config.scratch_size()),
        };

        self.shared.state.store(EngineState::Running);
        let spawned = LoopHandle::spawn(
            format!("sockbus-cli-{server_name}"),
            wake,
            running,
            move || client_loop.run(),
        );
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.state.store(EngineState::NotRunning);
                return Err(e);
            }
        };

        log::info!("[sockbus-client] started for {}", server_path.display());
        *runtime = Some(ClientRuntime { handle, server_path });
        Ok(())
    }

    /// Disconnects, stops the loop thread and releases its descriptors.
    ///
    /// Publishes `ReadyChanged(false)` if the client was connected. Blocks
    /// until the loop thread has exited; a pending reconnect wait is cut
    /// short.
    ///
    /// # Errors
    ///
    /// [`IpcError::NotStarted`] if not started; [`IpcError::StopFromLoopThread`]
    /// when called from inside an inline event sink.
    pub fn stop(&self) -> Result<()> {
        let rt = {
            let mut runtime = self.lock_runtime();
            let Some(rt) = runtime.take() else {
                return Err(IpcError::NotStarted);
            };
            if rt.handle.is_loop_thread() {
                *runtime = Some(rt);
                return Err(IpcError::StopFromLoopThread);
            }
            self.shared.state.store(EngineState::Stopping);
            rt
        };

        // `running` must be clear before ready is forced off.
        rt.handle.request_stop();
        self.shared.set_ready(false);
        // Joined without the lifecycle lock: sinks running on the loop
        // thread may still call accessors.
        rt.handle.shutdown();

        self.shared.set_stream(None);
        {
            let _runtime = self.lock_runtime();
            self.shared.state.store(EngineState::NotRunning);
        }
        log::info!("[sockbus-client] stopped for {}", rt.server_path.display());
        Ok(())
    }

    /// Writes `data` to the server with a single non-blocking send.
    ///
    /// # Errors
    ///
    /// [`IpcError::NotConnected`] unless ready; [`IpcError::WouldBlock`] /
    /// [`IpcError::PartialWrite`] when the socket buffer could not take the
    /// whole payload; [`IpcError::Io`] otherwise.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        if !self.is_ready() {
            return Err(IpcError::NotConnected);
        }
        let stream = self.shared.stream.read().unwrap_or_else(PoisonError::into_inner);
        let stream = stream.as_ref().ok_or(IpcError::NotConnected)?;
        write_outcome(endpoint::send_once(stream, data), data.len())
    }

    /// True while connected and usable.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Current reconnect interval.
    pub fn reconnect_timeout(&self) -> Duration {
        self.shared.reconnect_timeout()
    }

    /// Changes the reconnect interval. Applies from the next failed attempt.
    pub fn set_reconnect_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.shared.reconnect_timeout_ms.store(millis, Ordering::Relaxed);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.shared.state.load()
    }

    /// Path of the server socket while started.
    pub fn server_path(&self) -> Option<PathBuf> {
        self.lock_runtime().as_ref().map(|rt| rt.server_path.clone())
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Option<ClientRuntime>> {
        self.runtime.lock().unwrap_or_else(|poisoned| {
            log::warn!("[sockbus-client] lifecycle mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        match self.stop() {
            Ok(()) | Err(IpcError::NotStarted) => {}
            Err(e) => log::warn!("[sockbus-client] stop on drop failed: {e}"),
        }
    }
}

/// State owned by the loop thread.
struct ClientLoop {
    server_path: PathBuf,
    shared: Arc<ClientShared>,
    wake: Arc<WakeSignal>,
    running: Arc<AtomicBool>,
    buffer: ConnectionBuffer,
}

impl ClientLoop {
    fn run(mut self) {
        let mut set = PollSet::new(&self.wake);
        // Negative descriptors are ignored by poll until a connection exists.
        set.push(-1);

        let mut fault = None;
        while self.running.load(Ordering::Acquire) {
            let Some(stream) = self.connect() else {
                if let Err(e) = self.wait_before_retry() {
                    fault = Some(format!("reconnect wait failed: {e}"));
                    break;
                }
                continue;
            };

            set.replace(CONNECTION_SLOT, stream.as_raw_fd());
            self.shared.set_stream(Some(Arc::clone(&stream)));
            if !self.shared.mark_connected(&self.running) {
                self.shared.set_stream(None);
                set.replace(CONNECTION_SLOT, -1);
                break;
            }
            log::info!("[sockbus-client] connected to {}", self.server_path.display());

            let mut session = Session {
                stream: &stream,
                buffer: &mut self.buffer,
                sink: &*self.shared.sink,
            };
            let result = poller::run(&mut set, &self.wake, &self.running, &mut session);

            self.shared.set_stream(None);
            set.replace(CONNECTION_SLOT, -1);
            drop(stream);
            self.shared.set_ready(false);

            if let Err(e) = result {
                fault = Some(format!("poll failed: {e}"));
                break;
            }
            if self.running.load(Ordering::Acquire) {
                log::info!("[sockbus-client] disconnected from {}; reconnecting", self.server_path.display());
            }
        }

        self.shared.set_ready(false);
        if let Some(reason) = fault {
            self.shared.fail(reason);
        }
    }

    /// One connect attempt. Never blocks past a wake or one reconnect
    /// interval; the stream is returned non-blocking.
    fn connect(&self) -> Option<Arc<UnixStream>> {
        let attempt = match endpoint::connect_nonblocking(&self.server_path) {
            Ok(Connect::Ready(stream)) => Ok(stream),
            Ok(Connect::InProgress(stream)) => self.finish_connect(stream),
            Err(e) => Err(e),
        };
        match attempt {
            Ok(stream) => Some(Arc::new(stream)),
            Err(e) => {
                log::debug!(
                    "[sockbus-client] connect to {} failed: {e}; retrying in {:?}",
                    self.server_path.display(),
                    self.shared.reconnect_timeout()
                );
                None
            }
        }
    }

    /// Waits for an in-progress connect to settle, or for the wake signal.
    fn finish_connect(&self, stream: UnixStream) -> io::Result<UnixStream> {
        let timeout = self.shared.reconnect_timeout().as_millis();
        let mut fds = [
            libc::pollfd {
                fd: self.wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: stream.as_raw_fd(),
                events: libc::POLLOUT,
                revents: 0,
            },
        ];
        // SAFETY: `fds` is a live two-element pollfd array for the call.
        let ret = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                libc::c_int::try_from(timeout).unwrap_or(libc::c_int::MAX),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if fds[0].revents != 0 {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "woken while connecting"));
        }
        if ret == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        }
        match stream.take_error()? {
            Some(e) => Err(e),
            None => Ok(stream),
        }
    }

    /// Sleeps one reconnect interval, returning early when woken.
    fn wait_before_retry(&self) -> std::io::Result<()> {
        if self.wake.wait_timeout(self.shared.reconnect_timeout())? {
            self.wake.drain();
        }
        Ok(())
    }
}

/// Dispatcher for one established connection.
struct Session<'a> {
    stream: &'a UnixStream,
    buffer: &'a mut ConnectionBuffer,
    sink: &'a dyn EventSink<ClientEvent>,
}

impl Dispatch for Session<'_> {
    fn dispatch(&mut self, set: &mut PollSet) -> Flow {
        match set.take_ready(CONNECTION_SLOT) {
            Readiness::Idle => Flow::Continue,
            Readiness::Invalid => {
                log::warn!("[sockbus-client] connection descriptor became invalid");
                Flow::Exit
            }
            Readiness::Readable => {
                let drained = self.buffer.drain(&mut &*self.stream);
                if !drained.data.is_empty() {
                    log::debug!("[sockbus-client] {} byte(s) from server", drained.data.len());
                    self.sink.publish(ClientEvent::DataReceived(Bytes::from(drained.data)));
                }
                match drained.status {
                    StreamStatus::Open => Flow::Continue,
                    StreamStatus::Closed => Flow::Exit,
                    StreamStatus::Failed(e) => {
                        log::warn!("[sockbus-client] read error: {e}");
                        Flow::Exit
                    }
                }
            }
        }
    }
}
