//! Sub-instance block accounting.
//!
//! An instance is split into blocks so several jobs can share one physical
//! machine. The block count is either requested explicitly or derived from
//! the offer's resources.

use nimbus_backend::Resources;
use nimbus_state::BlocksSpec;

/// Resolve the total block count for an instance.
///
/// `Auto` picks the largest count such that each block still has at least
/// one vCPU and, when GPUs are present, at least one GPU:
/// `min(cpus, gpus)` with GPUs, `cpus` without.
pub fn total_blocks(spec: BlocksSpec, resources: &Resources) -> u32 {
    match spec {
        BlocksSpec::Count(count) => count,
        BlocksSpec::Auto => {
            if resources.gpus > 0 {
                resources.cpus.min(resources.gpus)
            } else {
                resources.cpus
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(cpus: u32, gpus: u32) -> Resources {
        Resources {
            cpus,
            memory_mib: 64 * 1024,
            gpus,
            gpu_name: (gpus > 0).then(|| "H100".to_string()),
            disk_gib: 500,
            spot: false,
        }
    }

    #[test]
    fn auto_blocks_gpu_bound() {
        assert_eq!(total_blocks(BlocksSpec::Auto, &resources(32, 8)), 8);
    }

    #[test]
    fn auto_blocks_cpu_bound() {
        assert_eq!(total_blocks(BlocksSpec::Auto, &resources(4, 8)), 4);
    }

    #[test]
    fn auto_blocks_without_gpus_uses_cpus() {
        assert_eq!(total_blocks(BlocksSpec::Auto, &resources(32, 0)), 32);
    }

    #[test]
    fn explicit_count_passes_through() {
        assert_eq!(total_blocks(BlocksSpec::Count(2), &resources(32, 8)), 2);
    }
}
