//! Error types for Graal

use thiserror::Error;

/// Core error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraalError {
    #[error("Unsupported transform size: {0} (supported: 16..=4096, power of two)")]
    UnsupportedTransformSize(usize),

    #[error("Block size must be a power of two: {0}")]
    BlockSizeNotPowerOfTwo(usize),

    #[error("Channel count must be non-zero")]
    ZeroChannels,

    #[error("Invalid stream multiplier: {0} (must be a power of two >= 1)")]
    InvalidMultiplier(usize),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("IR update already in flight")]
    UpdateInFlight,

    #[error("Channel {channel} out of range (configured: {configured})")]
    ChannelOutOfRange { channel: usize, configured: usize },

    #[error("IR version {version} out of range (slots: {slots})")]
    VersionOutOfRange { version: usize, slots: usize },

    #[error("Buffer mismatch: {0}")]
    BufferMismatch(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Engine terminated")]
    Terminated,
}

impl GraalError {
    /// Configuration errors are fatal to the call but recoverable by retrying
    /// with corrected parameters.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GraalError::UnsupportedTransformSize(_)
                | GraalError::BlockSizeNotPowerOfTwo(_)
                | GraalError::ZeroChannels
                | GraalError::InvalidMultiplier(_)
                | GraalError::InvalidParam(_)
        )
    }
}

/// Result type alias
pub type GraalResult<T> = Result<T, GraalError>;

/// Reserve exactly `len` elements, mapping allocator failure to
/// [`GraalError::ResourceExhausted`].
pub fn try_alloc_zeroed<T: Copy + Default>(len: usize, what: &str) -> GraalResult<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|e| GraalError::ResourceExhausted(format!("{what}: {e}")))?;
    v.resize(len, T::default());
    Ok(v)
}
