//! Socket setup and raw writes for named endpoints.
//!
//! `std::os::unix::net::UnixListener::bind` always listens with the
//! platform default backlog, so the listener is built by hand:
//! `socket` → `bind` → `listen(backlog)` → non-blocking. Every descriptor is
//! an `OwnedFd` from the moment it exists, so an early `?` closes whatever
//! was already opened.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use crate::error::{IpcError, Result};
use crate::fd::{set_cloexec, set_nonblocking};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

/// Removes a leftover socket file at `path`, if any.
pub(crate) fn remove_stale(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            log::debug!("Removed stale socket: {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Binds a non-blocking listener at `path` with the given backlog.
///
/// Any stale file at `path` is removed first and the parent directory is
/// created if missing.
pub(crate) fn bind_listener(path: &Path, backlog: i32) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(IpcError::setup("create socket directory"))?;
    }
    remove_stale(path).map_err(IpcError::setup("remove stale socket"))?;

    // SAFETY: plain socket(2) call; the result is checked before use.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if raw == -1 {
        return Err(IpcError::setup("socket")(io::Error::last_os_error()));
    }
    // SAFETY: `raw` is a fresh descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    set_cloexec(fd.as_raw_fd()).map_err(IpcError::setup("fcntl"))?;

    let (addr, len) = socket_addr(path).map_err(IpcError::setup("bind"))?;
    // SAFETY: `addr` is a fully initialised sockaddr_un of length `len`.
    let ret = unsafe { libc::bind(fd.as_raw_fd(), std::ptr::addr_of!(addr).cast(), len) };
    if ret == -1 {
        return Err(IpcError::setup("bind")(io::Error::last_os_error()));
    }

    // SAFETY: listen(2) on a bound socket we own.
    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } == -1 {
        return Err(IpcError::setup("listen")(io::Error::last_os_error()));
    }

    let listener = UnixListener::from(fd);
    listener
        .set_nonblocking(true)
        .map_err(IpcError::setup("set_nonblocking"))?;
    Ok(listener)
}

/// Result of starting a non-blocking connect.
#[derive(Debug)]
pub(crate) enum Connect {
    /// The connection is established.
    Ready(UnixStream),
    /// The connection completes asynchronously; wait for writability, then
    /// check `take_error`.
    InProgress(UnixStream),
}

/// Starts a non-blocking connect to the listener at `path`.
///
/// Never blocks. A listener whose backlog is full yields `WouldBlock` on
/// Linux rather than parking the caller.
pub(crate) fn connect_nonblocking(path: &Path) -> io::Result<Connect> {
    // SAFETY: plain socket(2) call; the result is checked before use.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if raw == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a fresh descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    set_cloexec(fd.as_raw_fd())?;
    set_nonblocking(fd.as_raw_fd())?;

    let (addr, len) = socket_addr(path)?;
    // SAFETY: `addr` is a fully initialised sockaddr_un of length `len`.
    let ret = unsafe { libc::connect(fd.as_raw_fd(), std::ptr::addr_of!(addr).cast(), len) };
    if ret == 0 {
        return Ok(Connect::Ready(UnixStream::from(fd)));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS | libc::EINTR) => Ok(Connect::InProgress(UnixStream::from(fd))),
        _ => Err(err),
    }
}

/// Builds a `sockaddr_un` for `path`.
fn socket_addr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Keep at least one trailing NUL.
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("socket path too long: {}", path.display()),
        ));
    }
    for (dst, &src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = src as libc::c_char;
    }

    Ok((addr, std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t))
}

/// One non-blocking `send(2)` that never raises `SIGPIPE` (where supported).
///
/// Returns how many bytes the kernel accepted; no retry on short writes.
pub(crate) fn send_once(stream: &UnixStream, data: &[u8]) -> io::Result<usize> {
    loop {
        // SAFETY: `data` is a live slice for the duration of the call.
        let n = unsafe { libc::send(stream.as_raw_fd(), data.as_ptr().cast(), data.len(), SEND_FLAGS) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
