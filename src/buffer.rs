//! Per-wake-up read accumulation.
//!
//! When `poll` reports a descriptor readable, [`ConnectionBuffer::drain`]
//! reads it dry through a fixed scratch region and hands back everything it
//! got as one owned `Vec<u8>`, plus why it stopped:
//!
//! - `WouldBlock` → [`StreamStatus::Open`], the peer simply paused
//! - `Ok(0)` → [`StreamStatus::Closed`], the peer hung up
//! - any other error → [`StreamStatus::Failed`]
//!
//! Callers publish the accumulated bytes (if any) before acting on a
//! terminal status, so data always precedes the matching disconnect.

use std::io::{self, Read};

/// Why a drain stopped reading.
#[derive(Debug)]
pub enum StreamStatus {
    /// No more data for now; the connection stays registered.
    Open,
    /// End of stream.
    Closed,
    /// Unrecoverable read error.
    Failed(io::Error),
}

/// Result of draining one ready descriptor.
#[derive(Debug)]
pub struct Drained {
    /// Every byte read during this wake-up, in order.
    pub data: Vec<u8>,
    /// How the drain ended.
    pub status: StreamStatus,
}

impl Drained {
    /// True when the connection must be closed and removed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, StreamStatus::Open)
    }
}

/// Fixed scratch region reused by every drain on one engine.
///
/// Allocated once per `start`; accumulated data is always a fresh `Vec`
/// so nothing is shared between wake-ups.
#[derive(Debug)]
pub struct ConnectionBuffer {
    scratch: Box<[u8]>,
}

impl ConnectionBuffer {
    /// Allocates a scratch region of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            scratch: vec![0u8; size.max(1)].into_boxed_slice(),
        }
    }

    /// Scratch region size.
    pub fn capacity(&self) -> usize {
        self.scratch.len()
    }

    /// Reads `reader` until it would block, hits EOF, or fails.
    pub fn drain<R: Read>(&mut self, reader: &mut R) -> Drained {
        let mut data = Vec::new();
        let status = loop {
            match reader.read(&mut self.scratch) {
                Ok(0) => break StreamStatus::Closed,
                Ok(n) => data.extend_from_slice(&self.scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break StreamStatus::Open,
                Err(e) => break StreamStatus::Failed(e),
            }
        };
        Drained { data, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Reader that replays a script of chunks and errors, one per `read`.
    struct Scripted(VecDeque<io::Result<Vec<u8>>>);

    impl Scripted {
        fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
            Self(steps.into())
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(mut chunk)) => {
                    assert!(chunk.len() <= buf.len(), "script chunk larger than scratch");
                    let n = chunk.len();
                    buf[..n].copy_from_slice(&chunk);
                    chunk.clear();
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn test_accumulates_chunks_until_would_block() {
        let mut buffer = ConnectionBuffer::new(4);
        let mut reader = Scripted::new(vec![Ok(b"hel".to_vec()), Ok(b"lo".to_vec())]);

        let drained = buffer.drain(&mut reader);
        assert_eq!(drained.data, b"hello");
        assert!(matches!(drained.status, StreamStatus::Open));
        assert!(!drained.is_terminal());
    }

    #[test]
    fn test_growth_keeps_earlier_bytes() {
        let mut buffer = ConnectionBuffer::new(8);
        let chunks: Vec<io::Result<Vec<u8>>> = (0u8..100).map(|i| Ok(vec![i; 8])).collect();
        let mut reader = Scripted::new(chunks);

        let drained = buffer.drain(&mut reader);
        assert_eq!(drained.data.len(), 800);
        for (i, chunk) in drained.data.chunks(8).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8), "chunk {i} corrupted");
        }
    }

    #[test]
    fn test_eof_with_no_data() {
        let mut buffer = ConnectionBuffer::new(16);
        let mut reader = Scripted::new(vec![Ok(Vec::new())]);

        let drained = buffer.drain(&mut reader);
        assert!(drained.data.is_empty());
        assert!(matches!(drained.status, StreamStatus::Closed));
        assert!(drained.is_terminal());
    }

    #[test]
    fn test_data_then_eof_keeps_data() {
        let mut buffer = ConnectionBuffer::new(16);
        let mut reader = Scripted::new(vec![Ok(b"bye".to_vec()), Ok(Vec::new())]);

        let drained = buffer.drain(&mut reader);
        assert_eq!(drained.data, b"bye");
        assert!(matches!(drained.status, StreamStatus::Closed));
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let mut buffer = ConnectionBuffer::new(16);
        let mut reader = Scripted::new(vec![
            Ok(b"a".to_vec()),
            Err(io::ErrorKind::Interrupted.into()),
            Ok(b"b".to_vec()),
        ]);

        let drained = buffer.drain(&mut reader);
        assert_eq!(drained.data, b"ab");
        assert!(matches!(drained.status, StreamStatus::Open));
    }

    #[test]
    fn test_hard_error_is_terminal() {
        let mut buffer = ConnectionBuffer::new(16);
        let mut reader = Scripted::new(vec![
            Ok(b"x".to_vec()),
            Err(io::ErrorKind::ConnectionReset.into()),
        ]);

        let drained = buffer.drain(&mut reader);
        assert_eq!(drained.data, b"x");
        match drained.status {
            StreamStatus::Failed(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("Expected Failed, got: {other:?}"),
        }
    }

    #[test]
    fn test_zero_size_scratch_is_clamped() {
        assert_eq!(ConnectionBuffer::new(0).capacity(), 1);
    }
}
