//! Crate-wide defaults for sockbus.
//!
//! These are the values [`IpcConfig::default`](crate::IpcConfig) is built
//! from. Grouped by the engine that consumes them.

use std::time::Duration;

// ============================================================================
// Endpoint naming
// ============================================================================

/// Prefix prepended to an endpoint name to form its socket path.
///
/// `"chat"` becomes `/tmp/sockbus.chat`.
pub const DEFAULT_SOCKET_PREFIX: &str = "/tmp/sockbus.";

/// Maximum path length for a Unix domain socket.
///
/// `sun_path` is 104 bytes on macOS and 108 on Linux; the smaller limit is
/// used everywhere so a path that works on one platform works on both.
pub const MAX_SOCKET_PATH: usize = 104;

// ============================================================================
// Multiplexer loop
// ============================================================================

/// Size of the scratch region each bounded read lands in.
///
/// A single readiness event may need several reads of this size; the
/// connection buffer grows to hold all of them.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

// ============================================================================
// Server
// ============================================================================

/// Pending-connection queue length passed to `listen(2)`.
pub const DEFAULT_BACKLOG: i32 = 16;

// ============================================================================
// Client
// ============================================================================

/// Fixed interval between client connect attempts.
///
/// There is no backoff growth: every failed attempt waits exactly this long.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);
