use super::helpers::run_helper;
use crate::config::Config;
use crate::registry::{Disk, DiskState};
use nix::fcntl::{flock, FlockArg};
use shared::errors::ArbitrationError;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

/// Repair stage (spec.md §4.5): holds an advisory exclusive lock on the
/// container device for the duration of the repair helper's run, blocking
/// concurrent writers (spec.md §5 "Shared resources").
#[allow(deprecated)]
pub async fn repair(config: &Config, disk: &mut Disk) -> Result<(), ArbitrationError> {
    let Some(device_path) = disk.descriptor.device_path().map(str::to_string) else {
        return Err(ArbitrationError::NotFound(disk.id.clone()));
    };

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device_path)
        .map_err(|e| ArbitrationError::Busy(format!("cannot open {device_path} for repair lock: {e}")))?;

    flock(lock_file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
        .map_err(|e| ArbitrationError::ExclusiveAccess.tap_log(&device_path, e))?;

    let helper = config.helper_dir.join(format!(
        "diskarbd-repair-{}",
        disk.descriptor.volume_kind().unwrap_or("generic")
    ));
    let outcome = run_helper(&helper, &[device_path.clone()]).await;

    let _ = flock(lock_file.as_raw_fd(), FlockArg::Unlock);

    match outcome {
        Ok(outcome) if outcome.success => {
            disk.state.remove(DiskState::REQUIRE_REPAIR);
            disk.state.remove(DiskState::REQUIRE_REPAIR_QUOTAS);
            disk.state |= DiskState::STAGED_REPAIR;
            Ok(())
        }
        Ok(outcome) => {
            disk.state |= DiskState::STAGED_REPAIR;
            Err(ArbitrationError::DirtyVolume.tap_log(&device_path, std::io::Error::other(outcome.stderr)))
        }
        Err(e) => {
            disk.state |= DiskState::STAGED_REPAIR;
            Err(ArbitrationError::NoResources.tap_log(&device_path, e))
        }
    }
}

trait TapLog {
    fn tap_log(self, device_path: &str, source: impl std::fmt::Display) -> ArbitrationError;
}

impl TapLog for ArbitrationError {
    fn tap_log(self, device_path: &str, source: impl std::fmt::Display) -> ArbitrationError {
        log::warn!("repair of {device_path} failed: {source}");
        self
    }
}
