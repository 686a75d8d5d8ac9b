use super::helpers::{parse_kv_lines, run_helper};
use crate::config::Config;
use crate::registry::{Disk, DiskState};
use shared::descriptor::{DescriptorKey, DescriptorValue};

/// Probe stage (spec.md §4.5): runs the filesystem-identification helper
/// against the device node, populates kind/name/UUID and the
/// dirty/quota-dirty flags, and sets `StagedProbe` regardless of outcome
/// (§4.2: "probe completed, success or failure").
pub async fn probe(config: &Config, disk: &mut Disk) {
    let Some(device_path) = disk.descriptor.device_path().map(str::to_string) else {
        log::warn!("probe: disk {} has no device path, marking staged with no findings", disk.id);
        disk.state |= DiskState::STAGED_PROBE;
        return;
    };

    let helper = config.helper_dir.join("diskarbd-probe");
    let outcome = match run_helper(&helper, &[device_path]).await {
        Ok(outcome) => outcome,
        Err(e) => {
            log::warn!("probe helper for {} failed to launch: {e}", disk.id);
            disk.state |= DiskState::STAGED_PROBE;
            return;
        }
    };

    if !outcome.success {
        log::info!("probe for {} reported no recognizable filesystem: {}", disk.id, outcome.stderr.trim());
        disk.state |= DiskState::STAGED_PROBE;
        return;
    }

    let fields = parse_kv_lines(&outcome.stdout);
    if let Some(kind) = fields.get("kind") {
        disk.descriptor.set(DescriptorKey::MediaType, DescriptorValue::String(kind.clone()));
        disk.descriptor.set(DescriptorKey::VolumeKind, DescriptorValue::String(kind.clone()));
        disk.descriptor.set(DescriptorKey::VolumeMountable, DescriptorValue::Bool(true));
    }
    if let Some(name) = fields.get("name") {
        disk.descriptor.set(DescriptorKey::MediaName, DescriptorValue::String(name.clone()));
        disk.descriptor.set(DescriptorKey::VolumeName, DescriptorValue::String(name.clone()));
    }
    if let Some(uuid) = fields.get("uuid").and_then(|s| uuid::Uuid::parse_str(s).ok()) {
        disk.descriptor.set(DescriptorKey::MediaContentUuid, DescriptorValue::Uuid(uuid));
        disk.descriptor.set(DescriptorKey::VolumeUuid, DescriptorValue::Uuid(uuid));
    }

    if fields.get("dirty").map(String::as_str) == Some("true") {
        disk.state |= DiskState::REQUIRE_REPAIR;
    }
    if fields.get("dirty_quotas").map(String::as_str) == Some("true") {
        disk.state |= DiskState::REQUIRE_REPAIR_QUOTAS;
    }

    disk.state |= DiskState::STAGED_PROBE;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DatabaseConfig, DeferralPolicy, MountBackend};
    use shared::descriptor::Descriptor;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            mount_root: PathBuf::from("/media/diskarbd"),
            mount_map_path: PathBuf::from("/etc/diskarbd/mount-map.toml"),
            rpc_socket_path: PathBuf::from("/var/run/diskarbd.sock"),
            pid_file_path: PathBuf::from("/var/run/diskarbd.pid"),
            database: DatabaseConfig {
                path: "telemetry.db".into(),
                purge_on_restart: false,
                synchronous: "NORMAL".into(),
                journal_size_limit: 1_000_000,
            },
            deferral: DeferralPolicy::default(),
            always_repair: false,
            helper_dir: PathBuf::from("/usr/libexec/diskarbd"),
            mount_backend: MountBackend::UserFs,
            console_user_proxy_present: true,
            base_system_image_creator: false,
        }
    }

    #[tokio::test]
    async fn disk_without_device_path_is_marked_staged_with_no_findings() {
        let mut disk = Disk::new("sdb1", Descriptor::new());
        probe(&test_config(), &mut disk).await;
        assert!(disk.state.contains(DiskState::STAGED_PROBE));
        assert!(!disk.state.contains(DiskState::REQUIRE_REPAIR));
    }
}
