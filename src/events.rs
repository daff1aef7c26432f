//! Notifications from the loop thread to the outside world.
//!
//! Engines never call user code directly. Each engine owns one
//! [`EventSink`] and publishes every connect, disconnect, data and ready
//! change through it. The sink decides where the event is handled:
//!
//! - `std::sync::mpsc::Sender<E>` hands it to whichever thread holds the receiver
//! - `tokio::sync::mpsc::UnboundedSender<E>` hands it into a tokio task
//! - [`FnSink`] runs a closure inline on the loop thread
//! - [`Observers`] fans it out to any number of the above
//!
//! Payloads move into the event; the engine keeps no reference afterwards.
//! Data is carried as [`Bytes`] so fan-out shares a single allocation.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

/// Identity of an open server-side connection.
///
/// This is the connection's descriptor number. The OS reuses numbers after
/// close, so an id is only unique while its connection is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(RawFd);

impl ConnectionId {
    /// Wraps a raw descriptor number.
    pub const fn from_raw_fd(fd: RawFd) -> Self {
        Self(fd)
    }

    /// The descriptor number.
    pub const fn as_raw_fd(self) -> RawFd {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events published by [`IpcServer`](crate::IpcServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client was accepted. Fired once per accept.
    ClientConnected(ConnectionId),

    /// A client connection was closed after EOF or a read error.
    ///
    /// Fired once per connection, after any final `DataReceived` for it.
    /// Not fired for connections closed by `stop`.
    ClientDisconnected(ConnectionId),

    /// Bytes read from a client during one readiness wake-up.
    DataReceived {
        /// Sending connection.
        id: ConnectionId,
        /// Exactly the bytes read, uninterpreted.
        data: Bytes,
    },

    /// The loop thread hit an unrecoverable `poll` error and exited.
    LoopFailed(String),
}

/// Events published by [`IpcClient`](crate::IpcClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The connection became usable (`true`) or stopped being usable
    /// (`false`). Consecutive events never carry the same value.
    ReadyChanged(bool),

    /// Bytes read from the server during one readiness wake-up.
    DataReceived(Bytes),

    /// The loop thread hit an unrecoverable error and exited.
    LoopFailed(String),
}

/// Destination for engine events.
///
/// `publish` is called from the engine's loop thread (and, for the client's
/// final `ReadyChanged(false)`, possibly from the thread calling `stop`).
/// Implementations must not block for long: the loop does not service
/// sockets while a publish is in progress.
pub trait EventSink<E>: Send + Sync {
    /// Delivers one event. Ownership of the payload moves to the sink.
    fn publish(&self, event: E);
}

impl<E: Send> EventSink<E> for std::sync::mpsc::Sender<E> {
    fn publish(&self, event: E) {
        // Receiver gone means nobody is listening any more.
        let _ = self.send(event);
    }
}

impl<E: Send> EventSink<E> for tokio::sync::mpsc::UnboundedSender<E> {
    fn publish(&self, event: E) {
        let _ = self.send(event);
    }
}

impl<E, S: EventSink<E> + ?Sized> EventSink<E> for Arc<S> {
    fn publish(&self, event: E) {
        (**self).publish(event);
    }
}

/// Runs a closure for every event, inline on the publishing thread.
pub struct FnSink<F>(pub F);

impl<F> fmt::Debug for FnSink<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSink").finish_non_exhaustive()
    }
}

impl<E, F: Fn(E) + Send + Sync> EventSink<E> for FnSink<F> {
    fn publish(&self, event: E) {
        (self.0)(event);
    }
}

/// Fan-out registry: every published event reaches every subscribed sink.
///
/// With no subscribers, events are discarded.
pub struct Observers<E> {
    sinks: RwLock<Vec<Box<dyn EventSink<E>>>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
        }
    }
}

impl<E> fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<E> Observers<E> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink. It receives every event published after this call.
    pub fn subscribe(&self, sink: impl EventSink<E> + 'static) {
        self.sinks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Box::new(sink));
    }

    /// Number of subscribed sinks.
    pub fn len(&self) -> usize {
        self.sinks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// True when nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone + Send> EventSink<E> for Observers<E> {
    fn publish(&self, event: E) {
        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((last, rest)) = sinks.split_last() {
            for sink in rest {
                sink.publish(event.clone());
            }
            last.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_mpsc_sender_sink_delivers_to_receiver_thread() {
        let (tx, rx) = mpsc::channel::<ServerEvent>();
        let id = ConnectionId::from_raw_fd(7);

        std::thread::spawn(move || tx.publish(ServerEvent::ClientConnected(id)));

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, ServerEvent::ClientConnected(id));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = mpsc::channel::<ClientEvent>();
        drop(rx);
        tx.publish(ClientEvent::ReadyChanged(true));
    }

    #[test]
    fn test_fn_sink_runs_inline() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sink = FnSink(move |_: ClientEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sink.publish(ClientEvent::ReadyChanged(true));
        sink.publish(ClientEvent::ReadyChanged(false));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observers_fan_out_shares_payload() {
        let observers = Observers::<ClientEvent>::new();
        assert!(observers.is_empty());
        observers.publish(ClientEvent::ReadyChanged(true)); // no subscribers: dropped

        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        observers.subscribe(tx_a);
        observers.subscribe(tx_b);
        assert_eq!(observers.len(), 2);

        observers.publish(ClientEvent::DataReceived(Bytes::from_static(b"hi")));

        let (ClientEvent::DataReceived(a), ClientEvent::DataReceived(b)) =
            (rx_a.try_recv().unwrap(), rx_b.try_recv().unwrap())
        else {
            panic!("Expected DataReceived on both observers");
        };
        assert_eq!(a, b"hi"[..]);
        assert_eq!(a.as_ptr(), b.as_ptr(), "fan-out should not copy the payload");
        assert!(rx_a.try_recv().is_err(), "the subscriber-less publish must not be replayed");
    }

    #[test]
    fn test_arc_sink_forwards() {
        let observers = Arc::new(Observers::<ServerEvent>::new());
        let (tx, rx) = mpsc::channel();
        observers.subscribe(tx);

        let shared: Arc<Observers<ServerEvent>> = Arc::clone(&observers);
        shared.publish(ServerEvent::LoopFailed("boom".into()));
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::LoopFailed("boom".into()));
    }

    #[tokio::test]
    async fn test_tokio_sender_hands_off_to_task() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ClientEvent>();

        std::thread::spawn(move || tx.publish(ClientEvent::DataReceived(Bytes::from_static(b"x"))));

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timed out waiting for event")
            .expect("Channel closed");
        assert_eq!(event, ClientEvent::DataReceived(Bytes::from_static(b"x")));
    }

    #[test]
    fn test_connection_id_display_is_fd_number() {
        assert_eq!(ConnectionId::from_raw_fd(12).to_string(), "12");
        assert_eq!(ConnectionId::from_raw_fd(12).as_raw_fd(), 12);
    }
}
