use once_cell::sync::Lazy;

use crate::{
    gc::PreservedMark,
    utils::{read_bool_from_env, read_uint_from_env, stack::default_segment_size},
};

/// Runtime switches for the synchronization and header-preservation layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// Try biased locking before stack locking.
    pub use_biased_locking: bool,
    /// Collect [`BiasedLockingCounters`](crate::runtime::counters::BiasedLockingCounters).
    pub biased_locking_statistics: bool,
    /// Lock records available to each thread.
    pub lock_stack_capacity: usize,
    /// Default number of workers for parallel mark restoration.
    pub parallel_gc_threads: usize,
    /// Entries per segment of a preserved marks stack.
    pub preserved_marks_segment_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            use_biased_locking: true,
            biased_locking_statistics: false,
            lock_stack_capacity: 256,
            parallel_gc_threads: num_cpus::get(),
            preserved_marks_segment_size: default_segment_size::<PreservedMark>(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(enabled) = read_bool_from_env("USE_BIASED_LOCKING") {
            config.use_biased_locking = enabled;
        }
        if let Some(enabled) = read_bool_from_env("BIASED_LOCKING_STATISTICS") {
            config.biased_locking_statistics = enabled;
        }
        config.lock_stack_capacity = match read_uint_from_env("LOCK_STACK_CAPACITY") {
            Some(capacity) if capacity > 0 => capacity,
            _ => config.lock_stack_capacity,
        };
        config.parallel_gc_threads = match read_uint_from_env("PARALLEL_GC_THREADS") {
            Some(threads) if threads > 0 => threads,
            _ => config.parallel_gc_threads,
        };
        config.preserved_marks_segment_size =
            match read_uint_from_env("PRESERVED_MARKS_SEGMENT_SIZE") {
                Some(size) if size > 0 => size,
                _ => config.preserved_marks_segment_size,
            };

        config
    }

    /// Worker pool sized for parallel mark restoration.
    pub fn worker_pool(&self) -> scoped_thread_pool::Pool {
        scoped_thread_pool::Pool::new(self.parallel_gc_threads)
    }

    /// Process-wide configuration, read from the environment once.
    pub fn global() -> &'static SyncConfig {
        static GLOBAL: Lazy<SyncConfig> = Lazy::new(SyncConfig::from_env);
        &GLOBAL
    }
}
