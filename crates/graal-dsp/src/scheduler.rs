//! Block scheduler
//!
//! Runs one block of `B` samples per channel through both streams:
//!
//! 1. Store the block in the channel's input queue
//! 2. Stream 1: sweep partitions `1..` against the history, ingest the new
//!    block, then the zero-delay head plus tail through one inverse transform
//! 3. Stream 2 (two-stream mode): a slice of the coarse output produced at the
//!    last coarse boundary; the tail sweep for the next boundary is spread
//!    over the period and the boundary block ingests the finished coarse block
//! 4. Crossfade blending while an update is in flight
//!
//! Channels never share mutable state, so a block can be split with
//! [`BlockScheduler::split`] and the channels processed on any thread.

use std::sync::Arc;

use graal_core::{
    add_into, scale_into, try_alloc_zeroed, EngineConfig, GraalError, GraalResult, Sample,
};

use crate::bins::{BinArena, HistoryRing, InputQueue};
use crate::crossfade::{blend, Crossfade, FadeKind, Transition, XfadeState};
use crate::fht::FhtPlan;
use crate::mad::{DividedSweep, MadEngine};
use crate::partition::{FilterBank, PartitionLayout};
use crate::Processor;

/// Scheduling parameters resolved from the engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub layout: PartitionLayout,
    pub accum_loops: usize,
    /// Crossfade window in samples, at most one block
    pub fade_length: usize,
    /// Cycles at the end of each coarse period without divided tail work
    pub mad_cycle_offset: usize,
}

impl SchedulerConfig {
    pub fn from_engine(config: &EngineConfig) -> GraalResult<Self> {
        config.validate()?;
        Ok(Self {
            layout: PartitionLayout::new(
                config.block_size,
                config.kernel_length,
                config.mode,
                config.multiplier,
            )?,
            accum_loops: config.accum_loops,
            fade_length: config.fade_samples(),
            mad_cycle_offset: config.mad_cycle_offset,
        })
    }

    /// Cycles per coarse period that carry a share of the divided tail sweep
    #[inline]
    pub fn sweep_cycles(&self) -> usize {
        self.layout
            .ratio
            .saturating_sub(self.mad_cycle_offset)
            .max(1)
    }
}

/// Per-block state shared read-only by every channel
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    pub run: u64,
    pub state: XfadeState,
    pub fine: &'a FhtPlan,
    pub coarse: Option<&'a FhtPlan>,
    pub ratio: usize,
    pub fade_length: usize,
    pub sweep_cycles: usize,
}

impl BlockContext<'_> {
    /// Position of this block inside its coarse period
    #[inline]
    pub fn cycle(&self) -> usize {
        (self.run % self.ratio as u64) as usize
    }

    #[inline]
    fn is_boundary(&self) -> bool {
        self.cycle() + 1 == self.ratio
    }
}

/// Stream-1 state of one channel
#[derive(Debug)]
struct FineStream {
    history: HistoryRing,
    mad: MadEngine,
    mad_old: MadEngine,
    tail: Vec<Sample>,
    tail_old: Vec<Sample>,
    inverse: Vec<Sample>,
}

impl FineStream {
    fn new(layout: &PartitionLayout, accum_loops: usize) -> GraalResult<Self> {
        let n = layout.block_size * 2;
        Ok(Self {
            history: HistoryRing::new(layout.stream1_partitions(), n)?,
            mad: MadEngine::new(accum_loops, n)?,
            mad_old: MadEngine::new(accum_loops, n)?,
            tail: try_alloc_zeroed(n, "stream-1 tail")?,
            tail_old: try_alloc_zeroed(n, "stream-1 tail")?,
            inverse: try_alloc_zeroed(n, "stream-1 inverse")?,
        })
    }

    fn clear(&mut self) {
        self.history.clear();
        self.mad.reset();
        self.mad_old.reset();
        self.tail.fill(0.0);
        self.tail_old.fill(0.0);
    }

    fn ingest(&mut self, plan: &FhtPlan, run: u64, queue: &InputQueue) {
        let bin = self.history.advance(run);
        plan.direct_from_two_blocks(bin, queue.block(run), queue.previous(run));
    }

    /// Sweep partitions `1..` against the history as it stands before the
    /// new block is ingested. Returns whether there is a tail.
    fn sweep(&mut self, filters: &BinArena) -> bool {
        if filters.count() < 2 {
            return false;
        }
        self.mad.reset();
        let next = self.mad.mad_head(filters, &self.history, 1, 1);
        self.mad
            .mad_range(filters, &self.history, next..filters.count(), 1);
        self.mad.mad_tail(&mut self.tail);
        true
    }

    fn sweep_xfade(&mut self, filters: &BinArena, old_filters: &BinArena) -> bool {
        if filters.count() < 2 {
            return false;
        }
        self.mad.reset();
        self.mad_old.reset();
        let next = self.mad.mad_head_xfade(
            &mut self.mad_old,
            filters,
            old_filters,
            &self.history,
            1,
            1,
        );
        self.mad.mad_range_xfade(
            &mut self.mad_old,
            filters,
            old_filters,
            &self.history,
            next..filters.count(),
            1,
        );
        self.mad
            .mad_tail_xfade(&mut self.mad_old, &mut self.tail, &mut self.tail_old);
        true
    }

    /// Full stream-1 block against one filter. `None` only keeps the
    /// history moving and writes silence.
    fn run(
        &mut self,
        plan: &FhtPlan,
        run: u64,
        queue: &InputQueue,
        filters: Option<&BinArena>,
        out: &mut [Sample],
    ) {
        let Some(filters) = filters else {
            self.ingest(plan, run, queue);
            out.fill(0.0);
            return;
        };

        let has_tail = self.sweep(filters);
        self.ingest(plan, run, queue);

        fine_head(
            plan,
            &mut self.inverse,
            self.history.latest(),
            filters,
            has_tail.then_some(self.tail.as_slice()),
            out,
        );
    }

    /// Stream-1 block against the new and the outgoing filter
    #[allow(clippy::too_many_arguments)]
    fn run_dual(
        &mut self,
        plan: &FhtPlan,
        run: u64,
        queue: &InputQueue,
        filters: &BinArena,
        old_filters: Option<&BinArena>,
        out: &mut [Sample],
        out_old: &mut [Sample],
    ) {
        let Some(old_filters) = old_filters else {
            out_old.fill(0.0);
            self.run(plan, run, queue, Some(filters), out);
            return;
        };

        let has_tail = self.sweep_xfade(filters, old_filters);
        self.ingest(plan, run, queue);

        let latest = self.history.latest();
        fine_head(
            plan,
            &mut self.inverse,
            latest,
            old_filters,
            has_tail.then_some(self.tail_old.as_slice()),
            out_old,
        );
        fine_head(
            plan,
            &mut self.inverse,
            latest,
            filters,
            has_tail.then_some(self.tail.as_slice()),
            out,
        );
    }
}

/// Zero-delay partition plus tail through one inverse transform
fn fine_head(
    plan: &FhtPlan,
    inverse: &mut [Sample],
    latest: &[Sample],
    filters: &BinArena,
    tail: Option<&[Sample]>,
    out: &mut [Sample],
) {
    plan.inverse_mad_with_tail(inverse, latest, filters.bin(0), tail);
    let len = out.len();
    scale_into(out, &inverse[..len], plan.scale());
}

/// Stream-2 state of one channel
#[derive(Debug)]
struct CoarseStream {
    history: HistoryRing,
    mad: MadEngine,
    mad_old: MadEngine,
    sweep: DividedSweep,
    tail: Vec<Sample>,
    tail_old: Vec<Sample>,
    inverse: Vec<Sample>,
    /// Coarse output for the current period, new filter
    out: Vec<Sample>,
    /// Coarse output for the current period, outgoing filter
    out_prev: Vec<Sample>,
}

impl CoarseStream {
    /// Partition 1 is the coarse head, 2.. the divided tail
    const TAIL_SHIFT: usize = 2;

    fn new(layout: &PartitionLayout, accum_loops: usize) -> GraalResult<Self> {
        let block = layout.coarse_block_size();
        let n = block * 2;
        Ok(Self {
            history: HistoryRing::new(layout.stream2_partitions(), n)?,
            mad: MadEngine::new(accum_loops, n)?,
            mad_old: MadEngine::new(accum_loops, n)?,
            sweep: DividedSweep::default(),
            tail: try_alloc_zeroed(n, "stream-2 tail")?,
            tail_old: try_alloc_zeroed(n, "stream-2 tail")?,
            inverse: try_alloc_zeroed(n, "stream-2 inverse")?,
            out: try_alloc_zeroed(block, "stream-2 output")?,
            out_prev: try_alloc_zeroed(block, "stream-2 output")?,
        })
    }

    fn clear(&mut self) {
        self.history.clear();
        self.mad.reset();
        self.mad_old.reset();
        self.sweep = DividedSweep::default();
        self.tail.fill(0.0);
        self.tail_old.fill(0.0);
        self.out.fill(0.0);
        self.out_prev.fill(0.0);
    }

    #[inline]
    fn slice(&self, cycle: usize, len: usize) -> &[Sample] {
        &self.out[cycle * len..(cycle + 1) * len]
    }

    #[inline]
    fn prev_slice(&self, cycle: usize, len: usize) -> &[Sample] {
        &self.out_prev[cycle * len..(cycle + 1) * len]
    }

    /// Advance the coarse stream by one fine block. `old_filters` runs the
    /// same work against the outgoing filter into the `_old` buffers.
    fn step(
        &mut self,
        ctx: &BlockContext<'_>,
        plan: &FhtPlan,
        queue: &InputQueue,
        filters: &BinArena,
        old_filters: Option<&BinArena>,
    ) {
        let cycle = ctx.cycle();
        if cycle == 0 {
            self.mad.reset();
            self.mad_old.reset();
            self.sweep = DividedSweep::start(Self::TAIL_SHIFT..filters.count(), ctx.sweep_cycles);
        }

        if cycle < ctx.sweep_cycles {
            match old_filters {
                Some(old) => self.mad.mad_divided_xfade(
                    &mut self.mad_old,
                    &mut self.sweep,
                    filters,
                    old,
                    &self.history,
                    Self::TAIL_SHIFT,
                ),
                None => self
                    .mad
                    .mad_divided(&mut self.sweep, filters, &self.history, Self::TAIL_SHIFT),
            }
        }

        if ctx.is_boundary() {
            self.boundary(ctx, plan, queue, filters, old_filters);
        }
    }

    /// Last block of a coarse period: finish the tail, ingest the completed
    /// coarse block and produce the output for the next period.
    fn boundary(
        &mut self,
        ctx: &BlockContext<'_>,
        plan: &FhtPlan,
        queue: &InputQueue,
        filters: &BinArena,
        old_filters: Option<&BinArena>,
    ) {
        let rest = self.sweep.finish();
        match old_filters {
            Some(old) => {
                self.mad.mad_range_xfade(
                    &mut self.mad_old,
                    filters,
                    old,
                    &self.history,
                    rest,
                    Self::TAIL_SHIFT,
                );
                self.mad
                    .mad_tail_xfade(&mut self.mad_old, &mut self.tail, &mut self.tail_old);
            }
            None => {
                self.mad
                    .mad_range(filters, &self.history, rest, Self::TAIL_SHIFT);
                self.mad.mad_tail(&mut self.tail);
            }
        }

        let coarse_index = ctx.run / ctx.ratio as u64;
        let (current, previous) = queue.coarse_pair(ctx.run);
        let bin = self.history.advance(coarse_index);
        plan.direct_from_two_blocks(bin, current, previous);

        let scale = plan.scale();
        let len = self.out.len();
        plan.inverse_mad_with_tail(
            &mut self.inverse,
            self.history.latest(),
            filters.bin(1),
            Some(self.tail.as_slice()),
        );
        scale_into(&mut self.out, &self.inverse[..len], scale);

        if let Some(old) = old_filters {
            plan.inverse_mad_with_tail(
                &mut self.inverse,
                self.history.latest(),
                old.bin(1),
                Some(self.tail_old.as_slice()),
            );
            scale_into(&mut self.out_prev, &self.inverse[..len], scale);
        }
    }
}

/// Whether a channel is consuming input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Fed silence until the filter tail has drained
    Stopping { remaining: usize },
    /// Flushed, silent, no compute
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Steady,
    /// Output follows the outgoing filter while the coarse stream runs dual
    Coarse,
    /// Fine stream runs dual and the outputs are blended
    Blend,
}

/// Convolution state of one channel
#[derive(Debug)]
pub struct ChannelConvolver {
    queue: InputQueue,
    fine: FineStream,
    coarse: Option<CoarseStream>,
    active: Option<Arc<FilterBank>>,
    previous: Option<Arc<FilterBank>>,
    staged: Option<Arc<FilterBank>>,
    fade: FadeKind,
    run_state: RunState,
    tail_blocks: usize,
    scratch: Vec<Sample>,
    scratch_old: Vec<Sample>,
}

impl ChannelConvolver {
    pub fn new(config: &SchedulerConfig) -> GraalResult<Self> {
        let layout = &config.layout;
        let coarse = if layout.has_stream2() {
            Some(CoarseStream::new(layout, config.accum_loops)?)
        } else {
            None
        };
        Ok(Self {
            queue: InputQueue::new(layout.block_size, layout.ratio)?,
            fine: FineStream::new(layout, config.accum_loops)?,
            coarse,
            active: None,
            previous: None,
            staged: None,
            fade: FadeKind::Hold,
            run_state: RunState::Running,
            tail_blocks: layout.tail_blocks(),
            scratch: try_alloc_zeroed(layout.block_size, "channel scratch")?,
            scratch_old: try_alloc_zeroed(layout.block_size, "channel scratch")?,
        })
    }

    /// Filter currently convolved
    #[inline]
    pub fn active(&self) -> Option<&Arc<FilterBank>> {
        self.active.as_ref()
    }

    #[inline]
    pub fn fade(&self) -> FadeKind {
        self.fade
    }

    #[inline]
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    /// No filter or stopped: no compute, silent output
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.active.is_none() || self.run_state == RunState::Stopped
    }

    /// Zero history, queue and overlap buffers
    pub fn flush(&mut self) {
        self.queue.clear();
        self.fine.clear();
        if let Some(coarse) = &mut self.coarse {
            coarse.clear();
        }
    }

    /// Let the filter tail ring out on silence, then go idle
    pub fn stop(&mut self) {
        self.run_state = match (self.run_state, self.active.is_some()) {
            (RunState::Stopped, _) | (_, false) => {
                self.flush();
                RunState::Stopped
            }
            (RunState::Stopping { remaining }, true) => RunState::Stopping { remaining },
            (RunState::Running, true) => RunState::Stopping {
                remaining: self.tail_blocks,
            },
        };
    }

    pub fn start(&mut self) {
        self.run_state = RunState::Running;
    }

    fn stage(&mut self, bank: Arc<FilterBank>) {
        self.staged = Some(bank);
    }

    fn swap_in(&mut self) {
        let Some(staged) = self.staged.take() else {
            return;
        };
        self.previous = self.active.replace(staged);
        self.fade = if self.previous.is_some() {
            FadeKind::FromPrevious
        } else {
            FadeKind::FromSilence
        };
        if let Some(coarse) = &mut self.coarse {
            coarse.out_prev.fill(0.0);
        }
    }

    fn finish_fade(&mut self) {
        self.previous = None;
        self.fade = FadeKind::Hold;
    }

    /// Process one block. `None` input is silence.
    pub fn process(&mut self, ctx: &BlockContext<'_>, input: Option<&[Sample]>, out: &mut [Sample]) {
        let input = match self.run_state {
            RunState::Stopped => {
                out.fill(0.0);
                return;
            }
            RunState::Stopping { .. } => None,
            RunState::Running => input,
        };

        let Self {
            queue,
            fine,
            coarse,
            active,
            previous,
            fade,
            scratch,
            scratch_old,
            ..
        } = self;

        let Some(active) = active.as_deref() else {
            out.fill(0.0);
            return;
        };
        let previous = previous.as_deref();

        match input {
            Some(block) => queue.write(ctx.run, block),
            None => queue.write_silence(ctx.run),
        }

        let phase = match (ctx.state, *fade) {
            (_, FadeKind::Hold) | (XfadeState::Over | XfadeState::Pending, _) => Phase::Steady,
            (XfadeState::Stream2InProgress, _) => Phase::Coarse,
            (XfadeState::Stream1InProgress, _) => Phase::Blend,
        };

        let block = out.len();
        let cycle = ctx.cycle();
        let coarse_filters = ctx.coarse.zip(active.stream2());

        match phase {
            Phase::Steady => {
                fine.run(ctx.fine, ctx.run, queue, Some(active.stream1()), out);
                if let (Some(cs), Some((plan, filters))) = (coarse.as_mut(), coarse_filters) {
                    add_into(out, cs.slice(cycle, block));
                    cs.step(ctx, plan, queue, filters, None);
                }
            }
            Phase::Coarse => {
                fine.run(ctx.fine, ctx.run, queue, previous.map(FilterBank::stream1), out);
                if let (Some(cs), Some((plan, filters))) = (coarse.as_mut(), coarse_filters) {
                    add_into(out, cs.slice(cycle, block));
                    let old = previous.and_then(FilterBank::stream2);
                    cs.step(ctx, plan, queue, filters, old);
                }
            }
            Phase::Blend => {
                fine.run_dual(
                    ctx.fine,
                    ctx.run,
                    queue,
                    active.stream1(),
                    previous.map(FilterBank::stream1),
                    scratch,
                    scratch_old,
                );
                if let (Some(cs), Some((plan, filters))) = (coarse.as_mut(), coarse_filters) {
                    add_into(scratch, cs.slice(cycle, block));
                    add_into(scratch_old, cs.prev_slice(cycle, block));
                    cs.step(ctx, plan, queue, filters, None);
                }
                blend(out, scratch_old, scratch, ctx.fade_length);
            }
        }

        if let RunState::Stopping { remaining } = &mut self.run_state {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                log::debug!("Channel tail drained, stopping");
                self.flush();
                self.run_state = RunState::Stopped;
            }
        }
    }
}

/// Uniform / two-stream partitioned convolution over a set of channels
#[derive(Debug)]
pub struct BlockScheduler {
    config: SchedulerConfig,
    fine: Arc<FhtPlan>,
    coarse: Option<Arc<FhtPlan>>,
    channels: Vec<ChannelConvolver>,
    xfade: Crossfade,
    /// Staged update waiting for the next block
    queued: bool,
    run: u64,
}

impl BlockScheduler {
    /// Build with shared plans. `coarse` is required in two-stream mode.
    pub fn new(
        config: SchedulerConfig,
        fine: Arc<FhtPlan>,
        coarse: Option<Arc<FhtPlan>>,
        channels: usize,
    ) -> GraalResult<Self> {
        let layout = &config.layout;
        if channels == 0 {
            return Err(GraalError::ZeroChannels);
        }
        if fine.half() != layout.block_size {
            return Err(GraalError::BufferMismatch(format!(
                "stream-1 plan size {} for block size {}",
                fine.size(),
                layout.block_size
            )));
        }
        let coarse = if layout.has_stream2() {
            let plan = coarse.ok_or_else(|| {
                GraalError::InvalidParam("two-stream layout needs a stream-2 plan".into())
            })?;
            if plan.half() != layout.coarse_block_size() {
                return Err(GraalError::BufferMismatch(format!(
                    "stream-2 plan size {} for coarse block size {}",
                    plan.size(),
                    layout.coarse_block_size()
                )));
            }
            Some(plan)
        } else {
            None
        };

        let channels = (0..channels)
            .map(|_| ChannelConvolver::new(&config))
            .collect::<GraalResult<Vec<_>>>()?;

        log::debug!(
            "Scheduler: {} channels, block {}, {} + {} partitions",
            channels.len(),
            layout.block_size,
            layout.stream1_partitions(),
            layout.stream2_partitions()
        );

        Ok(Self {
            config,
            fine,
            coarse,
            channels,
            xfade: Crossfade::new(layout.ratio),
            queued: false,
            run: 0,
        })
    }

    /// Build with private plans
    pub fn with_plans(config: SchedulerConfig, channels: usize) -> GraalResult<Self> {
        let layout = &config.layout;
        let fine = Arc::new(FhtPlan::new(layout.block_size * 2)?);
        let coarse = if layout.has_stream2() {
            Some(Arc::new(FhtPlan::new(layout.coarse_block_size() * 2)?))
        } else {
            None
        };
        Self::new(config, fine, coarse, channels)
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    pub fn layout(&self) -> &PartitionLayout {
        &self.config.layout
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.config.layout.block_size
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Blocks processed so far
    #[inline]
    pub fn run(&self) -> u64 {
        self.run
    }

    #[inline]
    pub fn state(&self) -> XfadeState {
        self.xfade.state()
    }

    /// Stream-1 plan and, in two-stream mode, the stream-2 plan
    #[inline]
    pub fn plans(&self) -> (&Arc<FhtPlan>, Option<&Arc<FhtPlan>>) {
        (&self.fine, self.coarse.as_ref())
    }

    #[inline]
    pub fn channel(&self, index: usize) -> Option<&ChannelConvolver> {
        self.channels.get(index)
    }

    /// No update in flight and none staged
    #[inline]
    pub fn ready_for_update(&self) -> bool {
        self.xfade.is_over() && !self.queued
    }

    fn channel_mut(&mut self, index: usize) -> GraalResult<&mut ChannelConvolver> {
        let configured = self.channels.len();
        self.channels
            .get_mut(index)
            .ok_or(GraalError::ChannelOutOfRange {
                channel: index,
                configured,
            })
    }

    /// Stage new filters. They take effect from the next block on.
    pub fn request_update<I>(&mut self, staged: I) -> GraalResult<()>
    where
        I: IntoIterator<Item = (usize, Arc<FilterBank>)>,
    {
        if !self.ready_for_update() {
            log::warn!("IR update rejected: update already in flight");
            return Err(GraalError::UpdateInFlight);
        }

        let mut any = false;
        for (index, bank) in staged {
            match self.channel_mut(index) {
                Ok(channel) => channel.stage(bank),
                Err(e) => {
                    for channel in &mut self.channels {
                        channel.staged = None;
                    }
                    return Err(e);
                }
            }
            any = true;
        }
        self.queued = any;
        Ok(())
    }

    /// Evaluate the crossfade machine for the coming block and apply any
    /// staged update. Must run once before the channels of a block.
    pub fn begin_block(&mut self) -> Transition {
        let mut transition = self.xfade.evaluate(self.run);
        self.apply(transition);

        if self.queued {
            self.queued = false;
            let first_upload = self
                .channels
                .iter()
                .filter(|c| c.staged.is_some())
                .all(|c| c.active.is_none());
            if first_upload && self.run == 0 {
                // Nothing has been output yet: no fade needed
                self.apply(Transition::Swap);
                self.apply(Transition::Finished);
                return Transition::Swap;
            }
            match self.xfade.request(first_upload) {
                Ok(t) => {
                    self.apply(t);
                    if t != Transition::None {
                        transition = t;
                    }
                }
                Err(e) => log::warn!("Staged update dropped: {e}"),
            }
        }
        transition
    }

    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::None => {}
            Transition::Swap => self.channels.iter_mut().for_each(ChannelConvolver::swap_in),
            Transition::Finished => self
                .channels
                .iter_mut()
                .for_each(ChannelConvolver::finish_fade),
        }
    }

    /// Block context and channels, borrowed separately so channels can be
    /// processed in parallel
    pub fn split(&mut self) -> (BlockContext<'_>, &mut [ChannelConvolver]) {
        let ctx = BlockContext {
            run: self.run,
            state: self.xfade.state(),
            fine: &self.fine,
            coarse: self.coarse.as_deref(),
            ratio: self.config.layout.ratio,
            fade_length: self.config.fade_length,
            sweep_cycles: self.config.sweep_cycles(),
        };
        (ctx, &mut self.channels)
    }

    pub fn end_block(&mut self) {
        self.run += 1;
    }

    /// One block for every channel on the calling thread.
    /// `inputs[i]` feeds channel `i`; `None` is silence.
    pub fn process_block(
        &mut self,
        inputs: &[Option<&[Sample]>],
        outputs: &mut [&mut [Sample]],
    ) -> GraalResult<()> {
        let block = self.block_size();
        if inputs.len() != self.channels.len() || outputs.len() != self.channels.len() {
            return Err(GraalError::BufferMismatch(format!(
                "{} inputs / {} outputs for {} channels",
                inputs.len(),
                outputs.len(),
                self.channels.len()
            )));
        }
        if inputs.iter().flatten().any(|i| i.len() != block)
            || outputs.iter().any(|o| o.len() != block)
        {
            return Err(GraalError::BufferMismatch(format!(
                "buffers must hold exactly {block} samples"
            )));
        }

        self.begin_block();
        let (ctx, channels) = self.split();
        for ((channel, input), out) in channels.iter_mut().zip(inputs).zip(outputs.iter_mut()) {
            channel.process(&ctx, *input, out);
        }
        self.end_block();
        Ok(())
    }

    pub fn flush_channel(&mut self, index: usize) -> GraalResult<()> {
        self.channel_mut(index)?.flush();
        Ok(())
    }

    pub fn stop_channel(&mut self, index: usize) -> GraalResult<()> {
        self.channel_mut(index)?.stop();
        Ok(())
    }

    pub fn start_channel(&mut self, index: usize) -> GraalResult<()> {
        self.channel_mut(index)?.start();
        Ok(())
    }
}

impl Processor for BlockScheduler {
    fn reset(&mut self) {
        self.xfade.reset();
        self.queued = false;
        for channel in &mut self.channels {
            channel.staged = None;
            channel.finish_fade();
            channel.flush();
        }
    }

    /// The head partition is zero-delay: block `t` of output already
    /// carries block `t` of input
    fn latency(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graal_core::ConvolutionMode;

    fn config(block: usize, kernel: usize, mode: ConvolutionMode, ratio: usize) -> SchedulerConfig {
        SchedulerConfig {
            layout: PartitionLayout::new(block, kernel, mode, ratio).unwrap(),
            accum_loops: 4,
            fade_length: block,
            mad_cycle_offset: 1,
        }
    }

    fn bank(scheduler: &BlockScheduler, ir: &[Sample]) -> Arc<FilterBank> {
        Arc::new(
            FilterBank::prepare(
                scheduler.layout(),
                &scheduler.fine,
                scheduler.coarse.as_deref(),
                ir,
            )
            .unwrap(),
        )
    }

    fn run_block(scheduler: &mut BlockScheduler, input: &[Sample]) -> Vec<Sample> {
        let mut out = vec![0.0; input.len()];
        scheduler
            .process_block(&[Some(input)], &mut [out.as_mut_slice()])
            .unwrap();
        out
    }

    #[test]
    fn test_idle_channel_is_silent() {
        let mut scheduler =
            BlockScheduler::with_plans(config(16, 64, ConvolutionMode::Uniform, 1), 1).unwrap();
        let channel = scheduler.channel(0).unwrap();
        assert!(channel.is_idle());
        let out = run_block(&mut scheduler, &[1.0; 16]);
        assert!(out.iter().all(|&v| v == 0.0));
        assert_eq!(scheduler.run(), 1);
    }

    #[test]
    fn test_first_upload_takes_effect_next_block() {
        let mut scheduler =
            BlockScheduler::with_plans(config(16, 64, ConvolutionMode::Uniform, 1), 1).unwrap();
        let mut ir = vec![0.0; 64];
        ir[0] = 1.0;
        let filters = bank(&scheduler, &ir);
        run_block(&mut scheduler, &[0.0; 16]);
        scheduler.request_update([(0, filters)]).unwrap();
        assert!(!scheduler.ready_for_update());

        assert_eq!(scheduler.begin_block(), Transition::Swap);
        assert_eq!(scheduler.state(), XfadeState::Stream1InProgress);
        assert_eq!(scheduler.channel(0).unwrap().fade(), FadeKind::FromSilence);
        scheduler.end_block();

        assert_eq!(scheduler.begin_block(), Transition::Finished);
        assert!(scheduler.ready_for_update());
        assert_eq!(scheduler.channel(0).unwrap().fade(), FadeKind::Hold);
    }

    #[test]
    fn test_cold_start_upload_skips_fade() {
        let mut scheduler =
            BlockScheduler::with_plans(config(16, 64, ConvolutionMode::Uniform, 1), 1).unwrap();
        let filters = bank(&scheduler, &[1.0]);
        scheduler.request_update([(0, filters)]).unwrap();
        assert_eq!(scheduler.begin_block(), Transition::Swap);
        assert_eq!(scheduler.state(), XfadeState::Over);
        assert!(scheduler.ready_for_update());
        assert_eq!(scheduler.channel(0).unwrap().fade(), FadeKind::Hold);
        assert!(scheduler.channel(0).unwrap().active().is_some());
    }

    #[test]
    fn test_update_rejected_while_in_flight() {
        let mut scheduler =
            BlockScheduler::with_plans(config(16, 64, ConvolutionMode::Uniform, 1), 2).unwrap();
        let filters = bank(&scheduler, &[1.0]);
        scheduler
            .request_update([(0, Arc::clone(&filters))])
            .unwrap();
        assert_eq!(
            scheduler.request_update([(1, Arc::clone(&filters))]),
            Err(GraalError::UpdateInFlight)
        );
    }

    #[test]
    fn test_update_out_of_range_channel() {
        let mut scheduler =
            BlockScheduler::with_plans(config(16, 64, ConvolutionMode::Uniform, 1), 1).unwrap();
        let filters = bank(&scheduler, &[1.0]);
        assert!(matches!(
            scheduler.request_update([(0, Arc::clone(&filters)), (3, filters)]),
            Err(GraalError::ChannelOutOfRange { channel: 3, .. })
        ));
        assert!(scheduler.ready_for_update());
        assert!(scheduler.channel(0).unwrap().staged.is_none());
    }

    #[test]
    fn test_stop_drains_then_idles() {
        let mut scheduler =
            BlockScheduler::with_plans(config(16, 64, ConvolutionMode::Uniform, 1), 1).unwrap();
        let filters = bank(&scheduler, &[1.0; 64]);
        scheduler.request_update([(0, filters)]).unwrap();
        run_block(&mut scheduler, &[1.0; 16]);
        run_block(&mut scheduler, &[1.0; 16]);

        scheduler.stop_channel(0).unwrap();
        let tail_blocks = scheduler.layout().tail_blocks();
        assert_eq!(tail_blocks, 4 + 2);

        let first = run_block(&mut scheduler, &[1.0; 16]);
        // Input is ignored but the tail keeps ringing
        assert!(first.iter().any(|&v| v.abs() > 0.1));
        for _ in 1..tail_blocks {
            run_block(&mut scheduler, &[1.0; 16]);
        }
        assert_eq!(scheduler.channel(0).unwrap().run_state(), RunState::Stopped);
        assert!(scheduler.channel(0).unwrap().is_idle());
        let silent = run_block(&mut scheduler, &[1.0; 16]);
        assert!(silent.iter().all(|&v| v == 0.0));

        scheduler.start_channel(0).unwrap();
        let resumed = run_block(&mut scheduler, &[1.0; 16]);
        assert!(resumed.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_buffer_mismatch() {
        let mut scheduler =
            BlockScheduler::with_plans(config(16, 64, ConvolutionMode::Uniform, 1), 1).unwrap();
        let mut out = vec![0.0; 8];
        assert!(matches!(
            scheduler.process_block(&[Some(&[0.0; 8][..])], &mut [out.as_mut_slice()]),
            Err(GraalError::BufferMismatch(_))
        ));
        assert_eq!(scheduler.run(), 0);
    }

    #[test]
    fn test_sweep_cycles() {
        let c = config(16, 1024, ConvolutionMode::NonUniform, 8);
        assert_eq!(c.sweep_cycles(), 7);
        let c = config(16, 1024, ConvolutionMode::NonUniform, 1);
        assert_eq!(c.sweep_cycles(), 1);
    }

    #[test]
    fn test_no_algorithmic_latency() {
        let mut scheduler =
            BlockScheduler::with_plans(config(32, 64, ConvolutionMode::Uniform, 1), 1).unwrap();
        assert_eq!(scheduler.latency(), 0);

        let filters = bank(&scheduler, &[1.0]);
        scheduler.request_update([(0, filters)]).unwrap();
        let mut input = [0.0; 32];
        input[0] = 1.0;
        let out = run_block(&mut scheduler, &input);
        assert!((out[0] - 1.0).abs() < 1e-5);
        assert!(out[1..].iter().all(|v| v.abs() < 1e-5));
    }
}
