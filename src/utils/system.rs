// src/utils/system.rs: System functions

use std::time::Duration;

use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Determines number of physical cores and the current CPU load.
///
/// # Returns
///
/// (physical cores, current cpu usage in percent)
pub async fn detect_cores_and_load() -> (usize, f32) {
    let refresh_kind = RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_cpu_usage());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_usage();
    let physical_cores = System::physical_core_count().unwrap_or_else(num_cpus::get_physical);
    sleep(Duration::from_millis(200)).await;
    system.refresh_cpu_usage();
    let cpu_load = system.global_cpu_usage();
    (physical_cores.max(1), cpu_load)
}


/// Number of concurrent stages to run when the user gives no `--max-parallel`:
/// one worker slot per physical core, divided by the threads each tool gets.
///
/// # Arguments
///
/// * `physical_cores` - Number of real cores on the system
/// * `threads_per_tool` - Threads handed to each external tool
pub fn default_worker_slots(physical_cores: usize, threads_per_tool: usize) -> usize {
    (physical_cores / threads_per_tool.max(1)).max(1)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_worker_slots() {
        assert_eq!(default_worker_slots(16, 4), 4);
        assert_eq!(default_worker_slots(2, 4), 1);
        assert_eq!(default_worker_slots(8, 0), 8);
    }

    #[tokio::test]
    async fn test_detect_cores_and_load() {
        let (cores, load) = detect_cores_and_load().await;
        assert!(cores >= 1);
        assert!(load >= 0.0);
    }
}
