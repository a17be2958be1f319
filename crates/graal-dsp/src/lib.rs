//! graal-dsp: FHT partitioned convolution for Graal
//!
//! ## Modules
//! - `fht` - Fast Hartley Transform kernels (N = 16..=4096) and the fused
//!   ingest / inverse multiply-add routines
//! - `bins` - Bin arenas, history rings and the rolling input queue
//! - `partition` - Impulse response partitioning and filter banks
//! - `mad` - Hartley-domain multiply-accumulate sweeps (head, tail, divided)
//! - `crossfade` - IR update state machine and output blending
//! - `scheduler` - Per-block uniform / two-stream convolution over channels

pub mod bins;
pub mod crossfade;
pub mod fht;
pub mod mad;
pub mod partition;
pub mod scheduler;

pub use bins::{BinArena, HistoryRing, InputQueue};
pub use crossfade::{blend, Crossfade, FadeKind, Transition, XfadeState};
pub use fht::FhtPlan;
pub use mad::{mad_accumulate, DividedSweep, MadEngine};
pub use partition::{partition_and_transform, FilterBank, PartitionLayout};
pub use scheduler::{BlockContext, BlockScheduler, ChannelConvolver, RunState, SchedulerConfig};

/// Trait for all DSP processors
pub trait Processor: Send + Sync {
    /// Reset processor state
    fn reset(&mut self);

    /// Get latency in samples
    fn latency(&self) -> usize {
        0
    }
}
