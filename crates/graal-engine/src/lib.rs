//! graal-engine: Graal convolution engine entry points
//!
//! Wraps the block scheduler with everything a host needs:
//! - Initialize / Terminate lifecycle over a shared [`GraalContext`]
//! - Geometry changes (`set_block_size`, `set_channel_count`) that
//!   re-partition every stored impulse response
//! - Impulse response upload into version slots, prepared on a background
//!   thread and handed to the audio thread by pointer
//! - `process` with whole-block rounding, per-call channel selection and
//!   the crossfade request flag
//! - Channel flush, stop (tail drain) and start

// Too many arguments is common in audio processing functions
#![allow(clippy::too_many_arguments)]

mod context;
mod pass;
mod updater;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use context::GraalContext;
pub use graal_core::{
    ChannelLayout, ConvolutionMode, EngineConfig, Execution, GraalError, GraalResult, Sample,
};
pub use graal_dsp::{FadeKind, Processor, RunState, XfadeState};

use graal_core::{try_alloc_zeroed, validate_block_size};
use graal_dsp::{BlockScheduler, SchedulerConfig};

use pass::{BlockFeed, ChannelPass};
use updater::{PrepareJob, Updater};

/// Outcome of one `process` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessReport {
    /// Samples actually processed (rounded down to whole blocks)
    pub samples_processed: usize,
    pub blocks: usize,
    /// A requested crossfade was staged for this call's first block
    pub update_accepted: bool,
}

/// One convolution engine instance
pub struct Engine {
    config: EngineConfig,
    context: Arc<GraalContext>,
    scheduler: BlockScheduler,
    pass: ChannelPass,
    updater: Updater,
    channel_count: usize,
    /// Bumped on every geometry change
    generation: u64,
    /// Raw responses per (channel, version), kept for re-partitioning
    irs: HashMap<(usize, usize), Arc<[Sample]>>,
    /// Version last staged per channel
    active_versions: Vec<Option<usize>>,
    /// Versions to re-stage after a geometry change
    pending_restore: Vec<(usize, usize)>,
    slots: Vec<Option<usize>>,
    out_blocks: Vec<Vec<Sample>>,
    terminated: bool,
}

impl Engine {
    /// Initialize with a private context. Heterogeneous execution gets a
    /// default-sized worker pool.
    pub fn initialize(config: EngineConfig) -> GraalResult<Self> {
        let context = match config.execution {
            Execution::SingleThreaded => GraalContext::new(),
            Execution::Heterogeneous => GraalContext::with_default_workers()?,
        };
        Self::initialize_with_context(config, context)
    }

    /// Initialize on a context shared with other engines
    pub fn initialize_with_context(
        config: EngineConfig,
        context: Arc<GraalContext>,
    ) -> GraalResult<Self> {
        config.validate()?;
        let channel_count = config.max_channels;
        let scheduler = build_scheduler(&config, &context, channel_count)?;
        let out_blocks = alloc_out_blocks(channel_count, config.block_size)?;
        let pass = ChannelPass::resolve(config.execution, &context);
        let updater = Updater::spawn()?;

        log::info!(
            "Graal engine initialized: {} channels, block {}, kernel {}, {:?}/{:?}",
            channel_count,
            config.block_size,
            config.kernel_length,
            config.mode,
            config.execution
        );

        Ok(Self {
            config,
            context,
            scheduler,
            pass,
            updater,
            channel_count,
            generation: 0,
            irs: HashMap::new(),
            active_versions: vec![None; channel_count],
            pending_restore: Vec::new(),
            slots: vec![None; channel_count],
            out_blocks,
            terminated: false,
        })
    }

    /// Stop the update thread. Every later call returns `Terminated`.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.updater.shutdown();
        self.irs.clear();
        self.pending_restore.clear();
        self.terminated = true;
        log::info!("Graal engine terminated");
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn check_alive(&self) -> GraalResult<()> {
        if self.terminated {
            Err(GraalError::Terminated)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn context(&self) -> &Arc<GraalContext> {
        &self.context
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Crossfade state of the running scheduler
    #[inline]
    pub fn xfade_state(&self) -> XfadeState {
        self.scheduler.state()
    }

    pub fn run_state(&self, channel: usize) -> GraalResult<RunState> {
        self.scheduler
            .channel(channel)
            .map(|c| c.run_state())
            .ok_or(GraalError::ChannelOutOfRange {
                channel,
                configured: self.channel_count,
            })
    }

    /// Version last staged on `channel`
    pub fn active_version(&self, channel: usize) -> Option<usize> {
        self.active_versions.get(channel).copied().flatten()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // GEOMETRY
    // ═══════════════════════════════════════════════════════════════════════

    /// Change the stream-1 block size. Stored responses are re-partitioned
    /// and the active versions come back once they are prepared.
    pub fn set_block_size(&mut self, block_size: usize) -> GraalResult<()> {
        self.check_alive()?;
        validate_block_size(block_size)?;
        if block_size == self.config.block_size {
            return Ok(());
        }
        let mut config = self.config.clone();
        config.block_size = block_size;
        config.validate()?;

        self.rebuild(config, self.channel_count)?;
        log::info!("Block size set to {block_size}");
        Ok(())
    }

    pub fn set_channel_count(&mut self, layout: ChannelLayout) -> GraalResult<()> {
        self.check_alive()?;
        layout.validate(self.config.max_channels)?;
        let channels = layout.convolution_channels();
        if channels == self.channel_count {
            return Ok(());
        }

        self.rebuild(self.config.clone(), channels)?;
        log::info!("Channel count set to {channels}");
        Ok(())
    }

    fn rebuild(&mut self, config: EngineConfig, channels: usize) -> GraalResult<()> {
        let scheduler = build_scheduler(&config, &self.context, channels)?;
        let out_blocks = alloc_out_blocks(channels, config.block_size)?;

        self.generation += 1;
        self.updater.invalidate(self.generation);
        self.config = config;
        self.scheduler = scheduler;
        self.out_blocks = out_blocks;
        self.channel_count = channels;
        self.slots = vec![None; channels];

        self.irs.retain(|&(channel, _), _| channel < channels);
        self.pending_restore = self
            .active_versions
            .iter()
            .enumerate()
            .filter(|&(channel, _)| channel < channels)
            .filter_map(|(channel, version)| version.map(|v| (channel, v)))
            .collect();
        self.active_versions = vec![None; channels];

        let jobs: Vec<_> = self
            .irs
            .iter()
            .map(|(&(channel, version), ir)| (channel, version, Arc::clone(ir)))
            .collect();
        for (channel, version, ir) in jobs {
            self.submit(channel, version, ir)?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // IMPULSE RESPONSES
    // ═══════════════════════════════════════════════════════════════════════

    /// Store `irs[i]` as `version` of `channel_ids[i]` and queue it for
    /// partitioning. The active filter is never touched; the new version
    /// is used once an update requests it.
    pub fn upload_impulse_response(
        &mut self,
        channel_ids: &[usize],
        irs: &[&[Sample]],
        version: usize,
    ) -> GraalResult<()> {
        self.check_alive()?;
        if channel_ids.len() != irs.len() {
            return Err(GraalError::BufferMismatch(format!(
                "{} channel ids for {} impulse responses",
                channel_ids.len(),
                irs.len()
            )));
        }
        self.check_version(version)?;
        for &channel in channel_ids {
            self.check_channel(channel)?;
        }

        for (&channel, &ir) in channel_ids.iter().zip(irs) {
            let ir: Arc<[Sample]> = Arc::from(ir);
            self.irs.insert((channel, version), Arc::clone(&ir));
            self.submit(channel, version, ir)?;
        }
        log::debug!(
            "Uploaded version {version} for {} channels",
            channel_ids.len()
        );
        Ok(())
    }

    fn submit(&self, channel: usize, version: usize, ir: Arc<[Sample]>) -> GraalResult<()> {
        let (fine, coarse) = self.scheduler.plans();
        self.updater.submit(PrepareJob {
            channel,
            version,
            generation: self.generation,
            sequence: 0,
            ir,
            layout: *self.scheduler.layout(),
            fine: Arc::clone(fine),
            coarse: coarse.cloned(),
        })
    }

    /// Block until queued uploads are partitioned. Returns `false` on timeout.
    pub fn wait_for_updates(&self, timeout: Duration) -> bool {
        self.updater.wait_idle(timeout)
    }

    /// Most recent preparation failure, if any
    pub fn take_update_error(&self) -> Option<GraalError> {
        self.updater.take_error()
    }

    /// No crossfade in flight and none staged
    pub fn ready_for_update(&self) -> bool {
        !self.terminated && self.pending_restore.is_empty() && self.scheduler.ready_for_update()
    }

    /// Stage `version` on `channel_ids`; it takes effect on the next block
    pub fn request_update(&mut self, channel_ids: &[usize], version: usize) -> GraalResult<()> {
        self.check_alive()?;
        self.check_version(version)?;
        for &channel in channel_ids {
            self.check_channel(channel)?;
        }
        self.drop_failed_restores();
        if !self.ready_for_update() {
            log::warn!("IR update rejected: update already in flight");
            return Err(GraalError::UpdateInFlight);
        }
        if let Some(&channel) = channel_ids
            .iter()
            .find(|&&channel| !self.updater.is_prepared(channel, version))
        {
            return Err(GraalError::InvalidParam(format!(
                "version {version} of channel {channel} is not prepared"
            )));
        }
        if self.stage(channel_ids.iter().map(|&channel| (channel, version))) {
            Ok(())
        } else {
            Err(GraalError::UpdateInFlight)
        }
    }

    /// Forget restores whose re-partitioning failed; those channels stay
    /// silent until a new upload and update
    fn drop_failed_restores(&mut self) {
        if self.pending_restore.is_empty() {
            return;
        }
        let Some(prepared) = self.updater.try_prepared() else {
            return;
        };
        self.pending_restore.retain(|&(channel, version)| {
            let failed = prepared.has_failed(channel, version);
            if failed {
                log::warn!("Dropping restore of channel {channel} version {version}: preparation failed");
            }
            !failed
        });
    }

    /// Hand prepared banks to the scheduler without blocking
    fn stage<I>(&mut self, requests: I) -> bool
    where
        I: Iterator<Item = (usize, usize)> + Clone,
    {
        let Some(prepared) = self.updater.try_prepared() else {
            return false;
        };
        if !requests
            .clone()
            .all(|(channel, version)| prepared.get(channel, version).is_some())
        {
            return false;
        }
        let staged = requests.clone().filter_map(|(channel, version)| {
            prepared
                .get(channel, version)
                .map(|bank| (channel, Arc::clone(bank)))
        });
        if self.scheduler.request_update(staged).is_err() {
            return false;
        }
        drop(prepared);

        for (channel, version) in requests {
            self.active_versions[channel] = Some(version);
        }
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PROCESSING
    // ═══════════════════════════════════════════════════════════════════════

    /// Convolve `num_samples` of `inputs[i]` on channel `channel_ids[i]`
    /// into `outputs[i]`. Only whole blocks are processed; channels not
    /// listed are fed silence. With `crossfade_requested` the prepared
    /// `ir_version` of the listed channels is faded in, if no other update
    /// is in flight.
    pub fn process(
        &mut self,
        inputs: &[&[Sample]],
        outputs: &mut [&mut [Sample]],
        num_samples: usize,
        channel_ids: &[usize],
        ir_version: usize,
        crossfade_requested: bool,
    ) -> GraalResult<ProcessReport> {
        self.check_alive()?;
        self.check_version(ir_version)?;
        if inputs.len() != channel_ids.len() || outputs.len() != channel_ids.len() {
            return Err(GraalError::BufferMismatch(format!(
                "{} inputs / {} outputs for {} channel ids",
                inputs.len(),
                outputs.len(),
                channel_ids.len()
            )));
        }
        if inputs.iter().any(|i| i.len() < num_samples)
            || outputs.iter().any(|o| o.len() < num_samples)
        {
            return Err(GraalError::BufferMismatch(format!(
                "buffers shorter than {num_samples} samples"
            )));
        }

        self.slots.fill(None);
        for (slot, &channel) in channel_ids.iter().enumerate() {
            self.check_channel(channel)?;
            if self.slots[channel].replace(slot).is_some() {
                return Err(GraalError::InvalidParam(format!(
                    "channel {channel} listed twice"
                )));
            }
        }

        let block = self.config.block_size;
        let blocks = num_samples / block;
        if num_samples % block != 0 {
            log::trace!("Processing {} of {num_samples} samples", blocks * block);
        }

        if !self.pending_restore.is_empty() && self.scheduler.ready_for_update() {
            self.drop_failed_restores();
            let restore = std::mem::take(&mut self.pending_restore);
            if !restore.is_empty() && !self.stage(restore.iter().copied()) {
                self.pending_restore = restore;
            }
        }

        let mut update_accepted = false;
        if crossfade_requested && blocks > 0 && !channel_ids.is_empty() {
            update_accepted = self.ready_for_update()
                && self.stage(channel_ids.iter().map(|&channel| (channel, ir_version)));
            if !update_accepted {
                log::debug!("Crossfade request not accepted this call");
            }
        }

        for b in 0..blocks {
            let range = b * block..(b + 1) * block;
            let feed = BlockFeed {
                inputs,
                slots: &self.slots,
                range: range.clone(),
            };
            self.pass
                .run(&self.context, &mut self.scheduler, &feed, &mut self.out_blocks);

            for (output, &channel) in outputs.iter_mut().zip(channel_ids) {
                output[range.clone()].copy_from_slice(&self.out_blocks[channel]);
            }
        }

        Ok(ProcessReport {
            samples_processed: blocks * block,
            blocks,
            update_accepted,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CHANNEL CONTROL
    // ═══════════════════════════════════════════════════════════════════════

    /// Zero history and overlap state of `channel` immediately
    pub fn flush(&mut self, channel: usize) -> GraalResult<()> {
        self.check_alive()?;
        self.scheduler.flush_channel(channel)
    }

    /// Let the filter tail ring out on silence, then idle the channel
    pub fn stop_channel(&mut self, channel: usize) -> GraalResult<()> {
        self.check_alive()?;
        self.scheduler.stop_channel(channel)
    }

    pub fn start_channel(&mut self, channel: usize) -> GraalResult<()> {
        self.check_alive()?;
        self.scheduler.start_channel(channel)
    }

    fn check_channel(&self, channel: usize) -> GraalResult<()> {
        if channel < self.channel_count {
            Ok(())
        } else {
            Err(GraalError::ChannelOutOfRange {
                channel,
                configured: self.channel_count,
            })
        }
    }

    fn check_version(&self, version: usize) -> GraalResult<()> {
        if version < self.config.ir_versions {
            Ok(())
        } else {
            Err(GraalError::VersionOutOfRange {
                version,
                slots: self.config.ir_versions,
            })
        }
    }
}

impl Processor for Engine {
    fn reset(&mut self) {
        self.scheduler.reset();
    }

    fn latency(&self) -> usize {
        self.scheduler.latency()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("channel_count", &self.channel_count)
            .field("generation", &self.generation)
            .field("terminated", &self.terminated)
            .finish()
    }
}

fn build_scheduler(
    config: &EngineConfig,
    context: &GraalContext,
    channels: usize,
) -> GraalResult<BlockScheduler> {
    let scheduler_config = SchedulerConfig::from_engine(config)?;
    let layout = &scheduler_config.layout;
    let fine = context.plan(layout.block_size * 2)?;
    let coarse = if layout.has_stream2() {
        Some(context.plan(layout.coarse_block_size() * 2)?)
    } else {
        None
    };
    BlockScheduler::new(scheduler_config, fine, coarse, channels)
}

fn alloc_out_blocks(channels: usize, block_size: usize) -> GraalResult<Vec<Vec<Sample>>> {
    (0..channels)
        .map(|_| try_alloc_zeroed(block_size, "output block"))
        .collect()
}
