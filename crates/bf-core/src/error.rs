//! Unified error type for the bytefit pipeline.
//!
//! All crates funnel their failures into [`Error`]. The variants mirror the
//! failure taxonomy of the compression pipeline: request validation happens
//! before a job exists, probe and process failures are fatal to a job, and
//! hardware-detection problems are absorbed long before they could reach
//! this type.

use std::fmt;

/// Unified error type covering all failure modes in bytefit.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation; no job was created.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The source media is unusable (e.g. non-positive duration).
    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    /// Media probing failed.
    #[error("Probe error: {0}")]
    Probe(String),

    /// An external tool could not be located or spawned.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// The encode process exited non-zero.
    #[error("Process failed with {status}: {tail}")]
    Process {
        /// Exit status description (code or signal).
        status: String,
        /// Captured tail of the diagnostic output.
        tail: String,
    },

    /// The process reported success but produced no usable output.
    #[error("Artifact validation failed: {0}")]
    ArtifactValidation(String),

    /// The job was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Process`].
    pub fn process(status: impl Into<String>, tail: impl Into<String>) -> Self {
        Error::Process {
            status: status.into(),
            tail: tail.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("job", "abc-123");
        assert_eq!(err.to_string(), "job not found: abc-123");
    }

    #[test]
    fn invalid_request_display() {
        let err = Error::InvalidRequest("target size must be positive".into());
        assert_eq!(
            err.to_string(),
            "Invalid request: target size must be positive"
        );
    }

    #[test]
    fn invalid_media_display() {
        let err = Error::InvalidMedia("duration is zero".into());
        assert_eq!(err.to_string(), "Invalid media: duration is zero");
    }

    #[test]
    fn tool_display() {
        let err = Error::tool("ffmpeg", "failed to spawn");
        assert_eq!(err.to_string(), "Tool error [ffmpeg]: failed to spawn");
    }

    #[test]
    fn process_display_carries_tail() {
        let err = Error::process("exit code 1", "No NVENC capable devices found");
        let s = err.to_string();
        assert!(s.contains("exit code 1"));
        assert!(s.contains("NVENC"));
    }

    #[test]
    fn cancelled_display() {
        assert_eq!(Error::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn result_alias() {
        fn ok_fn() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(ok_fn().unwrap(), 42);
    }
}
