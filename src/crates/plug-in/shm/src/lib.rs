//! Bulk data channels for moving tile pixels between host and plug-in.
//!
//! The host creates one channel per process. With shared memory available
//! the pixels are written into a POSIX segment both processes map, and
//! only the tile header travels through the pipe. Otherwise the pixels are
//! carried inline in the message.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};

#[cfg(unix)]
mod posix;

#[cfg(unix)]
pub use posix::{PosixShm, segment_name};

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("cannot open shared memory segment {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot map shared memory segment {name}: {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{len} bytes do not fit a channel of {capacity} bytes")]
    TooLarge { len: usize, capacity: usize },

    #[error("expected {expected} inline bytes, got {found}")]
    InlineMismatch { expected: usize, found: usize },

    #[error("shared memory is not supported on this platform")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, ShmError>;

/// Side channel for tile pixels.
pub trait BulkChannel: Send + Sync + fmt::Debug {
    /// Segment id announced to the plug-in, `-1` for inline transfer
    fn segment_id(&self) -> i32;

    /// Largest payload the channel accepts
    fn capacity(&self) -> usize;

    /// Stage `data` for the peer. Returns the bytes that must travel in
    /// the message itself, if any.
    fn send(&self, data: &[u8]) -> Result<Option<Bytes>>;

    /// Collect `len` bytes written by the peer, given whatever the
    /// message carried inline.
    fn receive(&self, inline: Option<Bytes>, len: usize) -> Result<Bytes>;

    fn uses_shm(&self) -> bool {
        self.segment_id() >= 0
    }
}

/// Inline transfer through the message pipe
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeChannel;

impl BulkChannel for PipeChannel {
    fn segment_id(&self) -> i32 {
        -1
    }

    fn capacity(&self) -> usize {
        usize::MAX
    }

    fn send(&self, data: &[u8]) -> Result<Option<Bytes>> {
        Ok(Some(Bytes::copy_from_slice(data)))
    }

    fn receive(&self, inline: Option<Bytes>, len: usize) -> Result<Bytes> {
        let data = inline.unwrap_or_default();
        if data.len() != len {
            return Err(ShmError::InlineMismatch {
                expected: len,
                found: data.len(),
            });
        }
        Ok(data)
    }
}

/// Pick the channel for a new plug-in process.
///
/// Falls back to [`PipeChannel`] when shared memory is disabled or the
/// segment cannot be created.
pub fn negotiate(size: usize, use_shm: bool) -> Arc<dyn BulkChannel> {
    if !use_shm {
        info!("shared memory disabled, tiles travel through the pipe");
        return Arc::new(PipeChannel);
    }

    match create_segment(size) {
        Ok(channel) => {
            info!(
                segment = channel.segment_id(),
                size, "using shared memory for tile transfer"
            );
            channel
        }
        Err(e) => {
            warn!("{}, falling back to pipe transfer", e);
            Arc::new(PipeChannel)
        }
    }
}

#[cfg(unix)]
fn create_segment(size: usize) -> Result<Arc<dyn BulkChannel>> {
    Ok(Arc::new(PosixShm::create(size)?))
}

#[cfg(not(unix))]
fn create_segment(_size: usize) -> Result<Arc<dyn BulkChannel>> {
    Err(ShmError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_channel_carries_inline() {
        let channel = PipeChannel;
        assert!(!channel.uses_shm());

        let inline = channel.send(&[1, 2, 3]).unwrap();
        assert_eq!(inline.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(&channel.receive(inline, 3).unwrap()[..], &[1, 2, 3]);
    }

    #[test]
    fn test_pipe_channel_rejects_short_payload() {
        let err = PipeChannel
            .receive(Some(Bytes::from_static(&[1, 2])), 3)
            .unwrap_err();
        assert!(matches!(
            err,
            ShmError::InlineMismatch {
                expected: 3,
                found: 2
            }
        ));
    }

    #[test]
    fn test_negotiate_disabled() {
        assert_eq!(negotiate(1024, false).segment_id(), -1);
    }
}
