//! Shared engine context
//!
//! Owns what several engines may share: FHT plans (tables are immutable
//! once built) and the worker pool used for heterogeneous execution.
//! Engines hold the context through `Arc`; it is released when the last
//! engine referencing it goes away.

use std::collections::HashMap;
use std::sync::Arc;

use graal_core::{GraalError, GraalResult};
use graal_dsp::FhtPlan;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};

pub struct GraalContext {
    plans: Mutex<HashMap<usize, Arc<FhtPlan>>>,
    pool: Option<ThreadPool>,
}

impl GraalContext {
    /// Context without a worker pool
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(HashMap::new()),
            pool: None,
        })
    }

    /// Context with a pool of `workers` threads
    pub fn with_workers(workers: usize) -> GraalResult<Arc<Self>> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("graal-worker-{i}"))
            .build()
            .map_err(|e| GraalError::Backend(format!("worker pool: {e}")))?;
        log::info!("Graal context created with {workers} workers");
        Ok(Arc::new(Self {
            plans: Mutex::new(HashMap::new()),
            pool: Some(pool),
        }))
    }

    /// One worker per core, leaving one for the audio thread
    pub fn with_default_workers() -> GraalResult<Arc<Self>> {
        Self::with_workers(num_cpus::get().saturating_sub(1).max(1))
    }

    /// Plan for transform size `size`, built on first use
    pub fn plan(&self, size: usize) -> GraalResult<Arc<FhtPlan>> {
        let mut plans = self.plans.lock();
        if let Some(plan) = plans.get(&size) {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(FhtPlan::new(size)?);
        log::debug!("FHT plan built for N={size}");
        plans.insert(size, Arc::clone(&plan));
        Ok(plan)
    }

    /// Number of transform sizes with a cached plan
    pub fn cached_plans(&self) -> usize {
        self.plans.lock().len()
    }

    #[inline]
    pub fn pool(&self) -> Option<&ThreadPool> {
        self.pool.as_ref()
    }

    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(0, ThreadPool::current_num_threads)
    }
}

impl std::fmt::Debug for GraalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraalContext")
            .field("cached_plans", &self.cached_plans())
            .field("workers", &self.workers())
            .finish()
    }
}

impl Drop for GraalContext {
    fn drop(&mut self) {
        log::info!(
            "Graal context released ({} cached plans)",
            self.plans.get_mut().len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plans_are_cached() {
        let context = GraalContext::new();
        let a = context.plan(256).unwrap();
        let b = context.plan(256).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        context.plan(512).unwrap();
        assert_eq!(context.cached_plans(), 2);
    }

    #[test]
    fn test_unsupported_plan() {
        let context = GraalContext::new();
        assert_eq!(
            context.plan(100).unwrap_err(),
            GraalError::UnsupportedTransformSize(100)
        );
        assert_eq!(context.cached_plans(), 0);
    }

    #[test]
    fn test_worker_pool() {
        let context = GraalContext::with_workers(2).unwrap();
        assert_eq!(context.workers(), 2);
        assert!(context.pool().is_some());
        assert_eq!(GraalContext::new().workers(), 0);
    }
}
