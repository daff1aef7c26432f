//! sockbus - named Unix domain socket IPC.
//!
//! Two engines share one connection-lifecycle core:
//!
//! - [`IpcServer`] binds `<prefix><name>` and serves any number of clients
//! - [`IpcClient`] connects to a named server and reconnects when it goes away
//!
//! Each engine runs a single background thread that blocks in `poll(2)` on
//! its sockets plus a [`WakeSignal`]. `start`, `stop` and `send` are callable
//! from any thread; `stop` returns only after the loop thread has exited and
//! every descriptor it opened is closed.
//!
//! Received bytes are delivered uninterpreted, one event per readiness
//! wake-up, through an [`EventSink`] supplied at construction.
//!
//! # Modules
//!
//! - [`server`] / [`client`] - the two engines
//! - [`events`] - event types and sinks
//! - [`poller`] - the multiplexer loop
//! - [`config`] - configuration and endpoint naming

pub mod buffer;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod poller;
pub mod server;
pub mod wake;

mod endpoint;
mod fd;

pub use client::IpcClient;
pub use config::IpcConfig;
pub use error::{IpcError, Result};
pub use events::{ClientEvent, ConnectionId, EventSink, FnSink, Observers, ServerEvent};
pub use lifecycle::EngineState;
pub use server::IpcServer;
pub use wake::WakeSignal;
