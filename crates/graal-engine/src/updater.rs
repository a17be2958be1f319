//! Background filter preparation
//!
//! Partitioning and transforming an impulse response is far too slow for
//! the audio thread. Jobs go to a dedicated thread over a channel; finished
//! filter banks land in a map the audio thread only ever `try_lock`s, so
//! the hand-off is a pointer copy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use graal_core::{GraalError, GraalResult, Sample};
use graal_dsp::{FhtPlan, FilterBank, PartitionLayout};
use parking_lot::{Condvar, Mutex, MutexGuard};

/// One impulse response to partition
pub(crate) struct PrepareJob {
    pub channel: usize,
    pub version: usize,
    /// Geometry generation the job was submitted for
    pub generation: u64,
    /// Upload order for this (channel, version), assigned by `submit`
    pub sequence: u64,
    pub ir: Arc<[Sample]>,
    pub layout: PartitionLayout,
    pub fine: Arc<FhtPlan>,
    pub coarse: Option<Arc<FhtPlan>>,
}

#[derive(Default)]
pub(crate) struct PreparedBanks {
    generation: u64,
    next_sequence: u64,
    /// Sequence of the newest submitted job per key. Older jobs for the
    /// same key are discarded when they finish.
    latest: HashMap<(usize, usize), u64>,
    banks: HashMap<(usize, usize), Arc<FilterBank>>,
    failed: HashSet<(usize, usize)>,
}

impl PreparedBanks {
    pub fn get(&self, channel: usize, version: usize) -> Option<&Arc<FilterBank>> {
        self.banks.get(&(channel, version))
    }

    /// The newest job for this key failed
    pub fn has_failed(&self, channel: usize, version: usize) -> bool {
        self.failed.contains(&(channel, version))
    }

    fn is_current(&self, job: &PrepareJob) -> bool {
        self.generation == job.generation
            && self.latest.get(&(job.channel, job.version)) == Some(&job.sequence)
    }
}

#[derive(Default)]
struct UpdateShared {
    prepared: Mutex<PreparedBanks>,
    outstanding: Mutex<usize>,
    idle: Condvar,
    last_error: Mutex<Option<GraalError>>,
}

impl UpdateShared {
    fn run(&self, job: PrepareJob) {
        let result = FilterBank::prepare(&job.layout, &job.fine, job.coarse.as_deref(), &job.ir);
        let key = (job.channel, job.version);

        let mut prepared = self.prepared.lock();
        if !prepared.is_current(&job) {
            log::debug!(
                "Dropping superseded filter for channel {} version {} (sequence {}, generation {})",
                job.channel,
                job.version,
                job.sequence,
                job.generation
            );
        } else {
            match result {
                Ok(bank) => {
                    log::debug!(
                        "Filter ready: channel {} version {}",
                        job.channel,
                        job.version
                    );
                    prepared.banks.insert(key, Arc::new(bank));
                }
                Err(e) => {
                    log::error!(
                        "Filter preparation failed for channel {} version {}: {e}",
                        job.channel,
                        job.version
                    );
                    prepared.failed.insert(key);
                    *self.last_error.lock() = Some(e);
                }
            }
        }
        drop(prepared);

        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

/// Handle to the update thread
pub(crate) struct Updater {
    tx: Option<Sender<PrepareJob>>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<UpdateShared>,
}

impl Updater {
    pub fn spawn() -> GraalResult<Self> {
        let (tx, rx) = unbounded::<PrepareJob>();
        let shared = Arc::new(UpdateShared::default());
        let worker = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("graal-update".into())
            .spawn(move || {
                for job in rx.iter() {
                    worker.run(job);
                }
                log::info!("Update thread exiting");
            })
            .map_err(|e| GraalError::Backend(format!("update thread: {e}")))?;

        log::info!("Update thread started");
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            shared,
        })
    }

    /// Queue a job. It supersedes every earlier job for the same
    /// (channel, version): the key reads as not prepared until this one
    /// finishes.
    pub fn submit(&self, mut job: PrepareJob) -> GraalResult<()> {
        let tx = self.tx.as_ref().ok_or(GraalError::Terminated)?;
        {
            let mut prepared = self.shared.prepared.lock();
            let key = (job.channel, job.version);
            prepared.next_sequence += 1;
            job.sequence = prepared.next_sequence;
            prepared.latest.insert(key, job.sequence);
            prepared.banks.remove(&key);
            prepared.failed.remove(&key);
        }
        *self.shared.outstanding.lock() += 1;
        if tx.send(job).is_err() {
            *self.shared.outstanding.lock() -= 1;
            return Err(GraalError::Terminated);
        }
        Ok(())
    }

    /// Start a new geometry generation: prepared banks are discarded and
    /// jobs from older generations are dropped when they finish.
    pub fn invalidate(&self, generation: u64) {
        let mut prepared = self.shared.prepared.lock();
        prepared.generation = generation;
        prepared.latest.clear();
        prepared.banks.clear();
        prepared.failed.clear();
    }

    /// Non-blocking access for the audio thread
    pub fn try_prepared(&self) -> Option<MutexGuard<'_, PreparedBanks>> {
        self.shared.prepared.try_lock()
    }

    pub fn is_prepared(&self, channel: usize, version: usize) -> bool {
        self.shared.prepared.lock().get(channel, version).is_some()
    }

    /// Block until every submitted job has finished or `timeout` elapses
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            if self
                .shared
                .idle
                .wait_until(&mut outstanding, deadline)
                .timed_out()
            {
                return *outstanding == 0;
            }
        }
        true
    }

    pub fn take_error(&self) -> Option<GraalError> {
        self.shared.last_error.lock().take()
    }

    /// Close the queue and join the thread. Queued jobs are still drained.
    pub fn shutdown(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Update thread panicked");
            }
        }
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        self.shutdown();
    }
}
