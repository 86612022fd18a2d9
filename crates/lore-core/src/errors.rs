use std::time::Duration;

use crate::checkpoint::CheckpointKey;

/// Typed failures of calls that cross the privilege boundary.
/// Classifies errors as transient (retry with backoff), fatal to the caller's
/// current unit of work, or handled internally.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BridgeError {
    // Transient
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("engine error: {0}")]
    Engine(String),

    // Fatal to the affected room-direction
    #[error("duplicate checkpoint for {0}")]
    DuplicateCheckpoint(CheckpointKey),

    // Handled by wiping and rebuilding the index
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },

    // Identity flow only
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // Programming errors on either side of the boundary
    #[error("codec error: {0}")]
    Codec(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChannelUnavailable(_) | Self::Timeout(_) | Self::Engine(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ChannelUnavailable(_) => "channel_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Engine(_) => "engine_error",
            Self::DuplicateCheckpoint(_) => "duplicate_checkpoint",
            Self::SchemaVersionMismatch { .. } => "schema_version_mismatch",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Codec(_) => "codec_error",
            Self::MethodNotFound(_) => "method_not_found",
            Self::Cancelled => "cancelled",
        }
    }

    /// Stable code used on the wire.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::ChannelUnavailable(_) => "CHANNEL_UNAVAILABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Engine(_) => "ENGINE_ERROR",
            Self::DuplicateCheckpoint(_) => "DUPLICATE_CHECKPOINT",
            Self::SchemaVersionMismatch { .. } => "SCHEMA_VERSION_MISMATCH",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::Codec(_) => "INVALID_PARAMS",
            Self::MethodNotFound(_) => "METHOD_NOT_FOUND",
            Self::Cancelled => "CANCELLED",
        }
    }
}
