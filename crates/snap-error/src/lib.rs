#![forbid(unsafe_code)]
//! Error types for snapserv.
//!
//! Defines `SnapError` and a `Result<T>` alias used throughout the
//! workspace. The request loop answers some failures over the wire and
//! dies on others; `is_request_scoped` encodes that split in one place.

use snap_types::ParseError;
use thiserror::Error;

/// Unified error type for all snapserv operations.
#[derive(Debug, Error)]
pub enum SnapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("no operation mapped at chunk {0}")]
    UnknownChunk(u64),

    #[error("unknown COW operation kind {0}")]
    UnknownOp(u16),

    #[error("corrupt merge metadata in area {area}: {detail}")]
    MergeCorruption { area: u64, detail: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl SnapError {
    /// Whether this failure is confined to the request that triggered it.
    ///
    /// Request-scoped errors are answered with an error response and the
    /// loop keeps serving; everything else terminates the device.
    #[must_use]
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::BadRequest(_)
                | Self::UnknownChunk(_)
                | Self::UnknownOp(_)
                | Self::MergeCorruption { .. }
        )
    }
}

/// Result alias defaulting to `SnapError`.
pub type Result<T, E = SnapError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_split() {
        assert!(SnapError::UnknownChunk(9).is_request_scoped());
        assert!(SnapError::UnknownOp(77).is_request_scoped());
        assert!(SnapError::BadRequest("oversize".to_owned()).is_request_scoped());
        assert!(
            SnapError::MergeCorruption {
                area: 0,
                detail: "mismatch".to_owned()
            }
            .is_request_scoped()
        );
        assert!(
            SnapError::Io(std::io::Error::new(std::io::ErrorKind::Other, "eio"))
                .is_request_scoped()
        );

        assert!(!SnapError::Format("bad header".to_owned()).is_request_scoped());
        assert!(!SnapError::Protocol("unframeable".to_owned()).is_request_scoped());
        assert!(!SnapError::Invariant("stride".to_owned()).is_request_scoped());
        assert!(
            !SnapError::Parse(ParseError::IntegerConversion { field: "x" }).is_request_scoped()
        );
    }
}
