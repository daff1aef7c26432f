//! Multi-client Unix domain socket server.
//!
//! Binds `<prefix><name>` and runs one background loop thread that accepts
//! clients and reads from them. Every connection is announced, drained and
//! retired through the server's [`EventSink`].
//!
//! # Poll set layout
//!
//! ```text
//! slot 0   wake signal
//! slot 1   listener
//! slot 2.. accepted connections, in accept order
//! ```
//!
//! Connection `i` in the loop's stream list always lives at slot `i + 2`.
//! Both lists are edited together, and removal preserves order, so a scan
//! that closes a connection keeps visiting the rest exactly once.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bytes::Bytes;

use crate::buffer::{ConnectionBuffer, StreamStatus};
use crate::config::IpcConfig;
use crate::endpoint;
use crate::error::{write_outcome, IpcError, Result};
use crate::events::{ConnectionId, EventSink, ServerEvent};
use crate::lifecycle::{EngineState, LoopHandle, StateCell};
use crate::poller::{self, Dispatch, Flow, PollSet, Readiness};
use crate::wake::WakeSignal;

const LISTENER_SLOT: usize = 1;
const FIRST_CONNECTION_SLOT: usize = 2;

/// Open connections, shared between the loop thread and `send`.
///
/// Only the loop thread inserts or removes entries.
type Registry = RwLock<HashMap<ConnectionId, Arc<UnixStream>>>;

/// Unix domain socket server accepting any number of clients.
///
/// `start`, `stop` and `send` may be called from any thread. Events are
/// published from the loop thread.
pub struct IpcServer {
    config: IpcConfig,
    sink: Arc<dyn EventSink<ServerEvent>>,
    state: Arc<StateCell>,
    registry: Arc<Registry>,
    runtime: Mutex<Option<ServerRuntime>>,
}

struct ServerRuntime {
    handle: LoopHandle,
    socket_path: PathBuf,
    listener_fd: RawFd,
}

impl std::fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcServer")
            .field("state", &self.state())
            .field("socket_path", &self.socket_path())
            .finish_non_exhaustive()
    }
}

impl IpcServer {
    /// Creates a stopped server that will publish to `sink`.
    pub fn new(config: IpcConfig, sink: impl EventSink<ServerEvent> + 'static) -> Self {
        Self {
            config,
            sink: Arc::new(sink),
            state: Arc::new(StateCell::default()),
            registry: Arc::new(RwLock::new(HashMap::new())),
            runtime: Mutex::new(None),
        }
    }

    /// Binds the endpoint `name` and starts the loop thread.
    ///
    /// Any stale socket file at the derived path is removed first. If any
    /// step fails, everything opened so far is closed before returning.
    ///
    /// # Errors
    ///
    /// [`IpcError::AlreadyRunning`] if started, faulted and not yet stopped,
    /// or still stopping; [`IpcError::InvalidName`] / [`IpcError::PathTooLong`] for
    /// bad names; [`IpcError::Setup`] / [`IpcError::Spawn`] when a resource
    /// cannot be acquired.
    pub fn start(&self, name: &str) -> Result<()> {
        let mut runtime = self.lock_runtime();
        if runtime.is_some() || self.state.load() == EngineState::Stopping {
            return Err(IpcError::AlreadyRunning);
        }

        let socket_path = self.config.socket_path(name)?;
        let buffer = ConnectionBuffer::new(self.config.scratch_size());
        let wake = Arc::new(WakeSignal::new().map_err(IpcError::setup("pipe"))?);
        let listener = endpoint::bind_listener(&socket_path, self.config.backlog)?;
        let listener_fd = listener.as_raw_fd();
        let running = Arc::new(AtomicBool::new(false));

        let mut event_loop = ServerLoop {
            listener,
            streams: Vec::new(),
            buffer,
            registry: Arc::clone(&self.registry),
            sink: Arc::clone(&self.sink),
            accept_failures: FailureStreak::default(),
            fault: None,
        };
        let loop_wake = Arc::clone(&wake);
        let loop_running = Arc::clone(&running);
        let loop_state = Arc::clone(&self.state);
        let loop_sink = Arc::clone(&self.sink);

        self.state.store(EngineState::Running);
        let spawned = LoopHandle::spawn(format!("sockbus-srv-{name}"), wake, running, move || {
            let mut set = PollSet::new(&loop_wake);
            set.push(event_loop.listener.as_raw_fd());

            let fault = match poller::run(&mut set, &loop_wake, &loop_running, &mut event_loop) {
                Ok(()) => event_loop.fault.take(),
                Err(e) => Some(format!("poll failed: {e}")),
            };
            if let Some(reason) = fault {
                log::error!("[sockbus-server] loop terminated: {reason}");
                // A concurrent stop keeps its Stopping state.
                loop_state.transition(EngineState::Running, EngineState::Faulted);
                loop_sink.publish(ServerEvent::LoopFailed(reason));
            }
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.state.store(EngineState::NotRunning);
                return Err(e);
            }
        };

        log::info!("[sockbus-server] listening on {}", socket_path.display());
        *runtime = Some(ServerRuntime {
            handle,
            socket_path,
            listener_fd,
        });
        Ok(())
    }

    /// Stops the loop thread and closes every descriptor `start` opened.
    ///
    /// Blocks until the loop thread has exited. Open connections are closed
    /// without `ClientDisconnected` events. The socket file is left in place.
    ///
    /// # Errors
    ///
    /// [`IpcError::NotRunning`] if not started; [`IpcError::StopFromLoopThread`]
    /// when called from inside an inline event sink.
    pub fn stop(&self) -> Result<()> {
        let rt = {
            let mut runtime = self.lock_runtime();
            let Some(rt) = runtime.take() else {
                return Err(IpcError::NotRunning);
            };
            if rt.handle.is_loop_thread() {
                *runtime = Some(rt);
                return Err(IpcError::StopFromLoopThread);
            }
            self.state.store(EngineState::Stopping);
            rt
        };

        // Joined without the lifecycle lock: sinks running on the loop
        // thread may still call accessors. `start` is held off by Stopping.
        rt.handle.shutdown();

        let closed = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let count = registry.len();
            registry.clear();
            count
        };
        {
            let _runtime = self.lock_runtime();
            self.state.store(EngineState::NotRunning);
        }
        log::info!(
            "[sockbus-server] stopped {} (listener fd {}, {closed} connection(s) closed)",
            rt.socket_path.display(),
            rt.listener_fd
        );
        Ok(())
    }

    /// Writes `data` to connection `id` with a single non-blocking send.
    ///
    /// Nothing is queued. Returns the byte count when everything was
    /// accepted by the kernel.
    ///
    /// # Errors
    ///
    /// [`IpcError::UnknownConnection`] if `id` is not open;
    /// [`IpcError::WouldBlock`] / [`IpcError::PartialWrite`] when the socket
    /// buffer could not take the whole payload; [`IpcError::Io`] otherwise.
    pub fn send(&self, id: ConnectionId, data: &[u8]) -> Result<usize> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let stream = registry.get(&id).ok_or(IpcError::UnknownConnection(id))?;
        write_outcome(endpoint::send_once(stream, data), data.len())
    }

    /// Ids of all currently open connections, ascending.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<ConnectionId> = registry.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state.load()
    }

    /// True between a successful `start` and the matching `stop`.
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Path of the bound socket while started.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.lock_runtime().as_ref().map(|rt| rt.socket_path.clone())
    }

    /// Configuration this server was built with.
    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Option<ServerRuntime>> {
        self.runtime.lock().unwrap_or_else(|poisoned| {
            log::warn!("[sockbus-server] lifecycle mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        match self.stop() {
            Ok(()) | Err(IpcError::NotRunning) => {}
            Err(e) => log::warn!("[sockbus-server] stop on drop failed: {e}"),
        }
    }
}

/// State owned by the loop thread.
struct ServerLoop {
    listener: UnixListener,
    /// Connection `i` is registered at poll slot `i + FIRST_CONNECTION_SLOT`.
    streams: Vec<Arc<UnixStream>>,
    buffer: ConnectionBuffer,
    registry: Arc<Registry>,
    sink: Arc<dyn EventSink<ServerEvent>>,
    accept_failures: FailureStreak,
    fault: Option<String>,
}

/// Counts consecutive failures and decides which ones are worth a warning.
#[derive(Debug, Default)]
struct FailureStreak {
    consecutive: u32,
}

impl FailureStreak {
    /// Records one failure. True on the 1st, 2nd, 4th, 8th... in a row.
    fn record(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive.is_power_of_two()
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Accept errors after which the listener can never accept again.
fn listener_is_dead(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBADF | libc::ENOTSOCK | libc::EINVAL | libc::EOPNOTSUPP)
    )
}

impl ServerLoop {
    /// Accepts every pending connection.
    ///
    /// Transient accept failures are logged and the loop carries on; a
    /// listener that can no longer accept at all ends the loop.
    fn accept_pending(&mut self, set: &mut PollSet) -> Flow {
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _addr)) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if listener_is_dead(&e) => {
                    self.fault = Some(format!("accept failed: {e}"));
                    return Flow::Exit;
                }
                Err(e) => {
                    // The listener stays readable while this persists (EMFILE
                    // and friends), so the loop comes straight back here.
                    // Only a thinning sample of the streak is logged.
                    let warn = self.accept_failures.record();
                    let failures = self.accept_failures.consecutive;
                    if warn {
                        log::warn!("[sockbus-server] accept failed ({failures} in a row): {e}");
                    } else {
                        log::debug!("[sockbus-server] accept failed ({failures} in a row): {e}");
                    }
                    return Flow::Continue;
                }
            };
            self.accept_failures.reset();
            if let Err(e) = stream.set_nonblocking(true) {
                log::warn!("[sockbus-server] dropping accepted client: set_nonblocking failed: {e}");
                continue;
            }

            let id = ConnectionId::from_raw_fd(stream.as_raw_fd());
            let stream = Arc::new(stream);
            set.push(id.as_raw_fd());
            self.streams.push(Arc::clone(&stream));
            self.registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, stream);

            log::info!("[sockbus-server] client connected: {id}");
            self.sink.publish(ServerEvent::ClientConnected(id));
        }
    }

    /// Reads connection at `slot` dry. Returns true if it must be closed.
    fn service(&mut self, slot: usize) -> bool {
        let stream = Arc::clone(&self.streams[slot - FIRST_CONNECTION_SLOT]);
        let id = ConnectionId::from_raw_fd(stream.as_raw_fd());
        let drained = self.buffer.drain(&mut &*stream);

        if !drained.data.is_empty() {
            log::debug!("[sockbus-server] {} byte(s) from {id}", drained.data.len());
            self.sink.publish(ServerEvent::DataReceived {
                id,
                data: Bytes::from(drained.data),
            });
        }
        match drained.status {
            StreamStatus::Open => false,
            StreamStatus::Closed => true,
            StreamStatus::Failed(e) => {
                log::warn!("[sockbus-server] read error on {id}: {e}");
                true
            }
        }
    }

    /// Unregisters and closes the connection at `slot`.
    fn close(&mut self, set: &mut PollSet, slot: usize) {
        let fd = set.remove(slot);
        let stream = self.streams.remove(slot - FIRST_CONNECTION_SLOT);
        debug_assert_eq!(stream.as_raw_fd(), fd);

        let id = ConnectionId::from_raw_fd(fd);
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        // Last reference: closes the descriptor.
        drop(stream);

        log::info!("[sockbus-server] client disconnected: {id}");
        self.sink.publish(ServerEvent::ClientDisconnected(id));
    }
}

impl Dispatch for ServerLoop {
    fn dispatch(&mut self, set: &mut PollSet) -> Flow {
        match set.take_ready(LISTENER_SLOT) {
            Readiness::Idle => {}
            Readiness::Readable => {
                if self.accept_pending(set) == Flow::Exit {
                    return Flow::Exit;
                }
            }
            Readiness::Invalid => {
                self.fault = Some("listening socket became invalid".to_string());
                return Flow::Exit;
            }
        }

        // Connections accepted above have no revents yet and are skipped.
        let mut slot = FIRST_CONNECTION_SLOT;
        while slot < set.len() {
            let must_close = match set.take_ready(slot) {
                Readiness::Idle => false,
                Readiness::Readable => self.service(slot),
                Readiness::Invalid => true,
            };
            if must_close {
                self.close(set, slot);
            } else {
                slot += 1;
            }
        }
        Flow::Continue
    }
}
