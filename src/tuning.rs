//! Auto-tuning module
//!
//! Detects hardware capabilities and derives sizing for the entry
//! processing pipeline. One core is reserved for the WAL reader and
//! dispatcher so mapping never starves them.

use sysinfo::System;

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Parallelism for the entry mapping pool: all cores but one, minimum one
pub fn map_parallelism() -> usize {
    detect_cpu_cores().saturating_sub(1).max(1)
}

/// Channel capacity for the pipeline stages
///
/// Scales with both the worker pool and the partition count so a fan-out
/// burst does not immediately stall the WAL reader.
pub fn pipeline_channel_capacity(parallelism: usize, num_partitions: u32) -> usize {
    (parallelism * num_partitions as usize * 10).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelism_leaves_a_core_free() {
        let cores = detect_cpu_cores();
        let parallelism = map_parallelism();
        assert!(parallelism >= 1);
        assert!(parallelism >= cores.saturating_sub(1).max(1));
    }

    #[test]
    fn channel_capacity_is_never_zero() {
        assert_eq!(pipeline_channel_capacity(1, 0), 1);
        assert_eq!(pipeline_channel_capacity(2, 4), 80);
    }
}
