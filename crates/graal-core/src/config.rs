//! Engine configuration
//!
//! Resolved once at `Initialize`; the processing path dispatches on the
//! resulting [`ConvolutionMode`] and [`Execution`] instead of testing flags.

use serde::{Deserialize, Serialize};

use crate::{GraalError, GraalResult};

/// Smallest supported input block (transform size 16)
pub const MIN_BLOCK_SIZE: usize = 8;

/// Largest supported input block (transform size 4096)
pub const MAX_BLOCK_SIZE: usize = 2048;

/// Largest supported Hartley transform length
pub const MAX_TRANSFORM_SIZE: usize = 4096;

/// Default number of partial-sum buffers used by the MAD head
pub const DEFAULT_ACCUM_LOOPS: usize = 4;

/// Cycles at the end of a coarse period kept free of divided tail work.
/// The coarse head inverse transform always runs on the period's last cycle.
pub const MAD_CYCLE_OFFSET: usize = 1;

/// Partitioning scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvolutionMode {
    /// Every partition has the stream-1 block size
    Uniform,
    /// Fine stream for the head of the filter, coarse stream for the tail
    NonUniform,
}

impl Default for ConvolutionMode {
    fn default() -> Self {
        Self::Uniform
    }
}

/// Where per-channel block work runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Execution {
    /// Channels processed in order on the caller's thread
    SingleThreaded,
    /// Channels fanned out over the shared worker pool
    Heterogeneous,
}

impl Default for Execution {
    fn default() -> Self {
        Self::SingleThreaded
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for `SetChannelCount`
    pub max_channels: usize,
    /// Stream-1 input block size in samples
    pub block_size: usize,
    /// Impulse response capacity in samples
    pub kernel_length: usize,
    /// Number of IR version slots per channel
    pub ir_versions: usize,
    /// Uniform or two-stream partitioning
    pub mode: ConvolutionMode,
    /// Stream-2 block size / stream-1 block size (non-uniform only)
    pub multiplier: usize,
    /// Channel execution strategy
    pub execution: Execution,
    /// Partial-sum buffers per MAD sweep
    pub accum_loops: usize,
    /// Crossfade window in samples (`None` = one block)
    pub fade_length: Option<usize>,
    /// Idle cycles at the end of each coarse period
    pub mad_cycle_offset: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_channels: 2,
            block_size: 256,
            kernel_length: 48_000,
            ir_versions: 2,
            mode: ConvolutionMode::Uniform,
            multiplier: 1,
            execution: Execution::SingleThreaded,
            accum_loops: DEFAULT_ACCUM_LOOPS,
            fade_length: None,
            mad_cycle_offset: MAD_CYCLE_OFFSET,
        }
    }
}

impl EngineConfig {
    /// Uniform configuration
    pub fn uniform(channels: usize, block_size: usize, kernel_length: usize) -> Self {
        Self {
            max_channels: channels,
            block_size,
            kernel_length,
            ..Self::default()
        }
    }

    /// Two-stream configuration with `multiplier` = coarse / fine block ratio
    pub fn non_uniform(
        channels: usize,
        block_size: usize,
        kernel_length: usize,
        multiplier: usize,
    ) -> Self {
        Self {
            max_channels: channels,
            block_size,
            kernel_length,
            mode: ConvolutionMode::NonUniform,
            multiplier,
            ..Self::default()
        }
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> GraalResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GraalError::InvalidParam(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Stream-1 transform size
    #[inline]
    pub fn transform_size(&self) -> usize {
        self.block_size * 2
    }

    /// Effective stream ratio (1 in uniform mode)
    #[inline]
    pub fn stream_ratio(&self) -> usize {
        match self.mode {
            ConvolutionMode::Uniform => 1,
            ConvolutionMode::NonUniform => self.multiplier,
        }
    }

    /// Crossfade window, clamped to one block
    #[inline]
    pub fn fade_samples(&self) -> usize {
        self.fade_length
            .unwrap_or(self.block_size)
            .clamp(1, self.block_size)
    }

    /// Check every parameter once
    pub fn validate(&self) -> GraalResult<()> {
        if self.max_channels == 0 {
            return Err(GraalError::ZeroChannels);
        }
        validate_block_size(self.block_size)?;
        if self.kernel_length == 0 {
            return Err(GraalError::InvalidParam("kernel_length must be > 0".into()));
        }
        if self.ir_versions == 0 {
            return Err(GraalError::InvalidParam("ir_versions must be > 0".into()));
        }
        if !self.accum_loops.is_power_of_two() {
            return Err(GraalError::InvalidParam(format!(
                "accum_loops must be a power of two, got {}",
                self.accum_loops
            )));
        }
        if self.mode == ConvolutionMode::NonUniform {
            if !self.multiplier.is_power_of_two() {
                return Err(GraalError::InvalidMultiplier(self.multiplier));
            }
            let coarse = self.transform_size() * self.multiplier;
            if coarse > MAX_TRANSFORM_SIZE {
                return Err(GraalError::UnsupportedTransformSize(coarse));
            }
        }
        Ok(())
    }
}

/// Validate a stream-1 block size
pub fn validate_block_size(block_size: usize) -> GraalResult<()> {
    if !block_size.is_power_of_two() {
        return Err(GraalError::BlockSizeNotPowerOfTwo(block_size));
    }
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(GraalError::UnsupportedTransformSize(block_size * 2));
    }
    Ok(())
}

/// Channel layout for `SetChannelCount`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub input_channels: usize,
    pub input_subchannels: usize,
    pub output_channels: usize,
    pub output_subchannels: usize,
}

impl ChannelLayout {
    /// One subchannel per channel, same count in and out
    pub fn simple(channels: usize) -> Self {
        Self {
            input_channels: channels,
            input_subchannels: 1,
            output_channels: channels,
            output_subchannels: 1,
        }
    }

    /// Number of independent convolution channels
    #[inline]
    pub fn convolution_channels(&self) -> usize {
        self.input_channels * self.input_subchannels
    }

    pub fn validate(&self, max_channels: usize) -> GraalResult<()> {
        let inputs = self.convolution_channels();
        let outputs = self.output_channels * self.output_subchannels;
        if inputs == 0 || outputs == 0 {
            return Err(GraalError::ZeroChannels);
        }
        if inputs != outputs {
            return Err(GraalError::InvalidParam(format!(
                "input streams ({inputs}) != output streams ({outputs})"
            )));
        }
        if inputs > max_channels {
            return Err(GraalError::ChannelOutOfRange {
                channel: inputs - 1,
                configured: max_channels,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_block_size_validation() {
        assert_eq!(
            validate_block_size(100),
            Err(GraalError::BlockSizeNotPowerOfTwo(100))
        );
        assert_eq!(
            validate_block_size(4),
            Err(GraalError::UnsupportedTransformSize(8))
        );
        assert_eq!(
            validate_block_size(4096),
            Err(GraalError::UnsupportedTransformSize(8192))
        );
        assert!(validate_block_size(8).is_ok());
        assert!(validate_block_size(2048).is_ok());
    }

    #[test]
    fn test_non_uniform_validation() {
        let config = EngineConfig::non_uniform(1, 256, 8192, 3);
        assert_eq!(config.validate(), Err(GraalError::InvalidMultiplier(3)));

        // 2 * 1024 * 4 = 8192 > 4096
        let config = EngineConfig::non_uniform(1, 1024, 8192, 4);
        assert_eq!(
            config.validate(),
            Err(GraalError::UnsupportedTransformSize(8192))
        );

        let config = EngineConfig::non_uniform(1, 256, 8192, 4);
        assert!(config.validate().is_ok());
        assert_eq!(config.stream_ratio(), 4);
    }

    #[test]
    fn test_zero_channels() {
        let config = EngineConfig::uniform(0, 256, 1024);
        assert_eq!(config.validate(), Err(GraalError::ZeroChannels));
    }

    #[test]
    fn test_fade_samples_clamped() {
        let mut config = EngineConfig::uniform(1, 64, 1024);
        assert_eq!(config.fade_samples(), 64);
        config.fade_length = Some(10_000);
        assert_eq!(config.fade_samples(), 64);
        config.fade_length = Some(16);
        assert_eq!(config.fade_samples(), 16);
    }

    #[test]
    fn test_from_json() {
        let config = EngineConfig::from_json(
            r#"{ "block_size": 128, "kernel_length": 4096, "mode": "NonUniform", "multiplier": 4 }"#,
        )
        .unwrap();
        assert_eq!(config.block_size, 128);
        assert_eq!(config.mode, ConvolutionMode::NonUniform);
        assert_eq!(config.max_channels, 2);

        assert!(EngineConfig::from_json(r#"{ "block_size": 100 }"#).is_err());
    }

    #[test]
    fn test_channel_layout() {
        assert!(ChannelLayout::simple(2).validate(2).is_ok());
        assert_eq!(ChannelLayout::simple(0).validate(2), Err(GraalError::ZeroChannels));
        assert!(ChannelLayout::simple(3).validate(2).is_err());

        let layout = ChannelLayout {
            input_channels: 2,
            input_subchannels: 2,
            output_channels: 4,
            output_subchannels: 1,
        };
        assert_eq!(layout.convolution_channels(), 4);
        assert!(layout.validate(4).is_ok());
    }
}
