use std::fs;
use std::path::Path;
use sysinfo::Disks;

use super::state::UpdateState;

/// Host-side monitors the coordinator consults before downloading.
pub trait HostProbe: Send + Sync {
    fn network_available(&self) -> bool {
        true
    }

    /// Bytes available on the volume holding `dir`, if known.
    fn free_space(&self, _dir: &Path) -> Option<u64> {
        None
    }
}

/// Network assumed up, free space unknown.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProbe;

impl HostProbe for DefaultProbe {}

/// Free space from the mounted volumes as reported by `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn free_space(&self, dir: &Path) -> Option<u64> {
        let dir = fs::canonicalize(dir).ok()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|d| dir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

/// Receives status and progress on the host thread, from `poll`/`wait`.
pub trait UpdateObserver {
    fn on_status(&mut self, _state: UpdateState, _message: &str) {}

    /// Bytes done in the current stage; `total` is `None` when unknown.
    fn on_progress(&mut self, _done: u64, _total: Option<u64>) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl UpdateObserver for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_probe_knows_nothing_about_disks() {
        assert!(DefaultProbe.network_available());
        assert_eq!(DefaultProbe.free_space(Path::new("/")), None);
    }

    #[test]
    fn system_probe_sees_the_temp_volume() {
        let free = SystemProbe.free_space(&std::env::temp_dir());
        if let Some(n) = free {
            assert!(n > 0);
        }
    }
}
