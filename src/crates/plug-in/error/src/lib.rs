//! Error types shared by the plug-in host crates.
//!
//! Transport and codec failures are always fatal to the single connection
//! that produced them. [`PlugInError::VersionMismatch`] is kept separate from
//! the transport variants so callers can reject an incompatible plug-in
//! without reporting it as a broken pipe.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlugInError {
    /// I/O error on one of the pipes
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer announced a different protocol version
    #[error("protocol version mismatch: expected {expected:#x}, found {found:#x}")]
    VersionMismatch { expected: u32, found: u32 },

    /// A frame could not be decoded
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The frame header names a message kind we do not know
    #[error("unknown message kind {0}")]
    UnknownMessage(u32),

    /// The frame header announces a payload larger than we accept
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// A message could not be encoded
    #[error("cannot encode message: {0}")]
    Encode(String),

    /// The connection was closed (EOF or torn down locally)
    #[error("connection closed")]
    Closed,

    /// The child process could not be spawned
    #[error("failed to execute plug-in {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The procedure is not implemented by an executable that can be started
    #[error("procedure \"{0}\" is not implemented by a plug-in executable")]
    NotExecutable(String),

    /// A message arrived that is not valid in the current call mode
    #[error("plug-in \"{name}\" ({}) violated the protocol: {reason}", .path.display())]
    Violation {
        name: String,
        path: PathBuf,
        reason: String,
    },
}

impl PlugInError {
    /// Build a [`PlugInError::Malformed`] from anything printable
    pub fn malformed(reason: impl Into<String>) -> Self {
        PlugInError::Malformed(reason.into())
    }

    /// True for failures of the byte stream itself, as opposed to a
    /// protocol-level disagreement with a well-formed peer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PlugInError::Io(_)
                | PlugInError::Malformed(_)
                | PlugInError::UnknownMessage(_)
                | PlugInError::FrameTooLarge { .. }
                | PlugInError::Closed
        )
    }
}

/// A specialized Result type for plug-in host operations
pub type Result<T> = std::result::Result<T, PlugInError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch_is_not_transport() {
        let err = PlugInError::VersionMismatch {
            expected: 0x0112,
            found: 0x0100,
        };
        assert!(!err.is_transport());
        assert_eq!(
            err.to_string(),
            "protocol version mismatch: expected 0x112, found 0x100"
        );
    }

    #[test]
    fn test_io_is_transport() {
        let err: PlugInError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(err.is_transport());
    }
}
