//! Pool sizing
//!
//! Detects hardware parallelism and derives the background worker pool
//! bounds used by async-mode writers.

use std::sync::OnceLock;

use sysinfo::System;

/// Pending tasks a worker queue holds by default
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Worker pool bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    /// Threads started with the pool
    pub min_threads: usize,
    /// Ceiling reached only while the queue is full
    pub max_threads: usize,
    /// Bounded queue capacity
    pub queue_capacity: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
}

impl PoolSizing {
    /// Bounds for a machine with `cores` CPUs
    pub fn for_cores(cores: usize) -> Self {
        let cores = cores.max(1);
        Self {
            min_threads: cores * 2 + 1,
            max_threads: cores * 4 + 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            detected_cores: cores,
        }
    }

    /// Most tasks the pool can hold at once before rejecting
    pub fn saturation_point(&self) -> usize {
        self.max_threads + self.queue_capacity
    }
}

/// Detect the number of available CPU cores (cached for the process)
pub fn detect_cpu_cores() -> usize {
    static CORES: OnceLock<usize> = OnceLock::new();
    *CORES.get_or_init(|| {
        let sys = System::new_all();
        sys.cpus().len().max(1)
    })
}

/// Pool bounds for this machine
pub fn pool_sizing() -> PoolSizing {
    PoolSizing::for_cores(detect_cpu_cores())
}

/// Get a human-readable summary of the pool sizing
pub fn sizing_summary(sizing: &PoolSizing) -> String {
    format!(
        "Detected: {} cores\n\
         Workers: {} core threads, up to {} under load\n\
         Queue: {} pending writes",
        sizing.detected_cores, sizing.min_threads, sizing.max_threads, sizing.queue_capacity,
    )
}
