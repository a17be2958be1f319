//! Per-block execution passes
//!
//! The execution strategy is resolved once when the engine is configured.
//! Every block then runs through one `match`: channels in order on the
//! caller's thread, or fanned out over the context's worker pool. Channels
//! share nothing mutable, so both produce identical output.

use std::ops::Range;

use graal_core::{Execution, Sample};
use graal_dsp::BlockScheduler;
use rayon::prelude::*;

use crate::context::GraalContext;

/// Caller buffers for one block
pub(crate) struct BlockFeed<'a> {
    /// Caller input buffers, in `channel_ids` order
    pub inputs: &'a [&'a [Sample]],
    /// Position in `inputs` for every configured channel, `None` if unlisted
    pub slots: &'a [Option<usize>],
    /// Sample range of this block inside the caller buffers
    pub range: Range<usize>,
}

impl<'a> BlockFeed<'a> {
    #[inline]
    fn input(&self, channel: usize) -> Option<&'a [Sample]> {
        self.slots
            .get(channel)
            .copied()
            .flatten()
            .map(|slot| &self.inputs[slot][self.range.clone()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelPass {
    Sequential,
    Pooled,
}

impl ChannelPass {
    pub fn resolve(execution: Execution, context: &GraalContext) -> Self {
        match (execution, context.pool()) {
            (Execution::SingleThreaded, _) => Self::Sequential,
            (Execution::Heterogeneous, Some(_)) => Self::Pooled,
            (Execution::Heterogeneous, None) => {
                log::warn!("Heterogeneous execution without a worker pool, running sequentially");
                Self::Sequential
            }
        }
    }

    /// Run one block for every channel into `out_blocks`
    pub fn run(
        self,
        context: &GraalContext,
        scheduler: &mut BlockScheduler,
        feed: &BlockFeed<'_>,
        out_blocks: &mut [Vec<Sample>],
    ) {
        scheduler.begin_block();
        let (ctx, channels) = scheduler.split();

        match (self, context.pool()) {
            (Self::Pooled, Some(pool)) => pool.install(|| {
                channels
                    .par_iter_mut()
                    .zip(out_blocks.par_iter_mut())
                    .enumerate()
                    .for_each(|(index, (channel, out))| {
                        channel.process(&ctx, feed.input(index), out);
                    });
            }),
            _ => {
                let lanes = channels.iter_mut().zip(out_blocks.iter_mut());
                for (index, (channel, out)) in lanes.enumerate() {
                    channel.process(&ctx, feed.input(index), out);
                }
            }
        }

        scheduler.end_block();
    }
}
