//! Mount-stage option composition and the mount/unmount/eject external
//! helper invocations (spec.md §4.5). `probe.rs`/`repair.rs` cover the two
//! stages ahead of this one; `engine.rs` sequences all four.

use super::helpers::run_helper;
use crate::config::{Config, DeferralPolicy, MountMap, TrustTier};
use crate::registry::{Disk, DiskState, Unit};
use shared::descriptor::DescriptorKey;
use shared::errors::ArbitrationError;

/// Classifies a disk into the trust/deferral tier used by both the
/// deferral-policy lookup and untrusted-mount option composition (spec.md
/// §4.5: "same removable/internal/external tiers").
pub fn trust_tier(disk: &Disk) -> TrustTier {
    if disk.descriptor.is_removable() {
        TrustTier::Removable
    } else if disk.descriptor.is_internal() {
        TrustTier::InternalFixed
    } else {
        TrustTier::ExternalFixed
    }
}

/// Whether the mount stage should defer this disk pending a console-user
/// login (spec.md §4.5 deferral policy), honoring `MountAutomaticNoDefer`.
pub fn should_defer(disk: &Disk, policy: &DeferralPolicy) -> bool {
    if disk.state.contains(DiskState::MOUNT_AUTOMATIC_NODEFER) {
        return false;
    }
    policy.defer_by_default(trust_tier(disk))
}

/// Predicates a disk must satisfy before the mount stage proceeds (spec.md
/// §4.5 "Mount stage" predicates, invariant/scenario S6). `unit` is the
/// disk's parent unit, if attached to one; a quiesced unit gates the first
/// mount decision (GLOSSARY "Quiesced").
pub fn is_mount_eligible(disk: &Disk, unit: Option<&Unit>) -> Result<(), ArbitrationError> {
    if !disk.descriptor.is_mountable() {
        return Err(ArbitrationError::NotReady);
    }
    if unit.is_some_and(|u| !u.is_quiesced()) {
        return Err(ArbitrationError::NotReady);
    }
    if disk.descriptor.volume_path().is_some() {
        return Err(ArbitrationError::Busy(format!("{} is already mounted", disk.id)));
    }
    let preboot = disk.descriptor.content_role() == Some("PreBoot");
    if disk.descriptor.is_tdm_locked() && !preboot {
        return Err(ArbitrationError::NotPermitted(format!(
            "{} is target-disk-mode locked",
            disk.id
        )));
    }
    Ok(())
}

/// Composes the mount-option string for `disk` (spec.md §4.5 "Compose the
/// options string"). `force` is the caller-supplied force flag (from the
/// request's options bitmask); `read_only_retry` is set only by the
/// automatic-retry rule (scenario S3).
pub fn compose_mount_options(config: &Config, disk: &Disk, read_only_retry: bool) -> Vec<String> {
    let mut options = Vec::new();

    let read_only = read_only_retry || !disk.descriptor.is_writable();
    if read_only {
        options.push("rdonly".to_string());
    }

    if config.deferral.is_untrusted(trust_tier(disk)) {
        options.push("nosuid".to_string());
        options.push("noowners".to_string());
        options.push("nodev".to_string());
    }

    let role = disk.descriptor.content_role();
    let is_apfs = disk.descriptor.volume_kind() == Some("apfs");
    let automatic = disk.state.contains(DiskState::MOUNT_AUTOMATIC);
    if is_apfs && automatic && role == Some("System") {
        if !options.iter().any(|o| o == "rdonly") {
            options.push("rdonly".to_string());
        }
        if config.base_system_image_creator {
            options.push("nobrowse".to_string());
        }
    } else if config.base_system_image_creator && is_apfs && automatic && role.is_none() {
        options.push("nobrowse".to_string());
    }

    if disk.state.contains(DiskState::MOUNT_QUARANTINED) {
        options.push("quarantine".to_string());
    }

    // HFS-style synthetic ownership entries (spec.md §4.5: "prepend
    // synthetic -u, -g, -m entries"). Expressed as generic mount options
    // here since there is no `-u/-g/-m` argv form on a Linux `mount(8)`.
    if disk.descriptor.volume_kind() == Some("hfs") {
        let mut hfs_opts = Vec::new();
        if let Some(uid) = disk.descriptor.suggested_uid() {
            hfs_opts.push(format!("uid={uid}"));
        }
        if let Some(gid) = disk.descriptor.suggested_gid() {
            hfs_opts.push(format!("gid={gid}"));
        }
        if let Some(mode) = disk.descriptor.suggested_mode() {
            hfs_opts.push(format!("mode={mode:o}"));
        }
        hfs_opts.extend(options);
        options = hfs_opts;
    }

    options
}

/// Applies a per-device-UUID mount-map override on top of the composed
/// options (spec.md §3 "Mount map", §4.5 "consult the mount-map
/// collaborator"). Returns `None` if the override says to suppress
/// automatic mounting for this volume entirely.
pub fn apply_mount_map_override(
    mount_map: &MountMap,
    disk: &Disk,
    mut options: Vec<String>,
) -> Option<Vec<String>> {
    let Some(uuid) = disk.descriptor.volume_uuid() else {
        return Some(options);
    };
    let Some(over) = mount_map.lookup(&uuid.to_string()) else {
        return Some(options);
    };
    if over.ignore {
        return None;
    }
    if over.force_read_only && !options.iter().any(|o| o == "rdonly") {
        options.push("rdonly".to_string());
    }
    Some(options)
}

/// Invokes the `mount` helper (spec.md §4.5 "Mount"). The exit status
/// convention mirrors `stage::probe`/`stage::repair`: success is a zero
/// exit, a dirty-volume failure is reported via stderr containing
/// `EDIRTY` so the automatic-retry rule (scenario S3) can recognize it.
pub async fn do_mount(
    config: &Config,
    device_path: &str,
    mount_point: &std::path::Path,
    options: &[String],
) -> Result<(), ArbitrationError> {
    let helper = config.helper_dir.join("mount");
    let mut args = vec!["-o".to_string(), options.join(","), device_path.to_string()];
    args.push(mount_point.display().to_string());

    let outcome = run_helper(&helper, &args)
        .await
        .map_err(|e| ArbitrationError::NoResources.tap(device_path, e))?;

    if outcome.success {
        return Ok(());
    }
    if outcome.stderr.contains("EDIRTY") {
        return Err(ArbitrationError::DirtyVolume);
    }
    Err(ArbitrationError::UnsupportedFileSystem(outcome.stderr.trim().to_string()))
}

/// Invokes the quota-repair helper after a mount whose probe reported
/// stale quotas (spec.md §4.5 "On completion, if quotas require repair,
/// invoke the quota-repair helper").
pub async fn repair_quotas(config: &Config, device_path: &str) {
    let helper = config.helper_dir.join("diskarbd-repair-quotas");
    if let Err(e) = run_helper(&helper, &[device_path.to_string()]).await {
        log::warn!("quota repair helper for {device_path} failed to launch: {e}");
    }
}

/// Locks the logical-volume-manager group `family` after a console-user
/// logout has unmounted every disk it backs (spec.md §4.6: "if the disk
/// backs a logical-volume family, lock that family afterward").
pub async fn lock_logical_volume_family(config: &Config, family: &str) {
    let helper = config.helper_dir.join("vgchange");
    if let Err(e) = run_helper(&helper, &["--lock-vg".to_string(), family.to_string()]).await {
        log::warn!("failed to lock logical-volume family {family}: {e}");
    }
}

/// Forceful unmount used both by an explicit client `unmount` request and
/// by disappearance handling (spec.md §4.3 "Disappearance handling").
pub async fn force_unmount(mount_point: &url::Url) -> Result<(), ArbitrationError> {
    let path = mount_point
        .to_file_path()
        .map_err(|_| ArbitrationError::BadArgument(format!("not a file URL: {mount_point}")))?;
    let outcome = run_helper(std::path::Path::new("umount"), &["-f".into(), path.display().to_string()])
        .await
        .map_err(|e| ArbitrationError::NoResources.tap(&path.display().to_string(), e))?;
    if outcome.success {
        Ok(())
    } else {
        Err(ArbitrationError::Busy(outcome.stderr.trim().to_string()))
    }
}

/// Graceful unmount honoring an explicit `force` flag on the request.
pub async fn unmount(mount_point: &url::Url, force: bool) -> Result<(), ArbitrationError> {
    if force {
        return force_unmount(mount_point).await;
    }
    let path = mount_point
        .to_file_path()
        .map_err(|_| ArbitrationError::BadArgument(format!("not a file URL: {mount_point}")))?;
    let outcome = run_helper(std::path::Path::new("umount"), &[path.display().to_string()])
        .await
        .map_err(|e| ArbitrationError::NoResources.tap(&path.display().to_string(), e))?;
    if outcome.success {
        Ok(())
    } else {
        Err(ArbitrationError::Busy(outcome.stderr.trim().to_string()))
    }
}

/// Ejects the whole-media device backing `device_path` (spec.md §6
/// `eject` request kind).
pub async fn eject(device_path: &str) -> Result<(), ArbitrationError> {
    let outcome = run_helper(std::path::Path::new("eject"), &[device_path.to_string()])
        .await
        .map_err(|e| ArbitrationError::NoResources.tap(device_path, e))?;
    if outcome.success {
        Ok(())
    } else {
        Err(ArbitrationError::Busy(outcome.stderr.trim().to_string()))
    }
}

/// Renames a currently-mounted volume's directory in place (spec.md §4.3
/// "Property change": "attempt to rename the mount point directory").
pub fn rename_mount_point(disk: &mut Disk) -> std::io::Result<()> {
    let Some(old_path) = disk.descriptor.volume_path().cloned() else {
        return Ok(());
    };
    let Some(new_name) = disk.descriptor.volume_name() else {
        return Ok(());
    };
    let old = old_path
        .to_file_path()
        .map_err(|_| std::io::Error::other("volume path is not a file URL"))?;
    let new_path = old
        .parent()
        .map(|parent| parent.join(super::mount_point::sanitize_name(new_name)))
        .ok_or_else(|| std::io::Error::other("mount point has no parent"))?;

    std::fs::rename(&old, &new_path)?;

    let url = url::Url::from_file_path(&new_path).map_err(|_| std::io::Error::other("bad new path"))?;
    disk.descriptor.set(DescriptorKey::VolumePath, shared::descriptor::DescriptorValue::Url(url));
    Ok(())
}

trait Tap {
    fn tap(self, device_path: &str, source: impl std::fmt::Display) -> ArbitrationError;
}

impl Tap for ArbitrationError {
    fn tap(self, device_path: &str, source: impl std::fmt::Display) -> ArbitrationError {
        log::warn!("{device_path}: {source}");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::descriptor::{Descriptor, DescriptorValue};

    fn config() -> Config {
        crate::config::Config {
            mount_root: "/media/diskarbd".into(),
            mount_map_path: "/etc/diskarbd/mount-map.toml".into(),
            rpc_socket_path: "/var/run/diskarbd.sock".into(),
            pid_file_path: "/var/run/diskarbd.pid".into(),
            database: crate::config::DatabaseConfig {
                path: "telemetry.db".into(),
                purge_on_restart: false,
                synchronous: "NORMAL".into(),
                journal_size_limit: 1_000_000,
            },
            deferral: DeferralPolicy::default(),
            always_repair: false,
            helper_dir: "/usr/libexec/diskarbd".into(),
            mount_backend: crate::config::MountBackend::UserFs,
            console_user_proxy_present: true,
            base_system_image_creator: false,
        }
    }

    #[test]
    fn untrusted_removable_media_gets_nosuid_noowners_nodev() {
        let mut disk = Disk::new("sdb1", Descriptor::new());
        disk.descriptor.set(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(true));
        disk.descriptor.set(DescriptorKey::DeviceWritable, DescriptorValue::Bool(true));
        let options = compose_mount_options(&config(), &disk, false);
        assert!(options.contains(&"nosuid".to_string()));
        assert!(options.contains(&"noowners".to_string()));
        assert!(options.contains(&"nodev".to_string()));
        assert!(!options.contains(&"rdonly".to_string()));
    }

    #[test]
    fn read_only_media_gets_rdonly() {
        let mut disk = Disk::new("sdb1", Descriptor::new());
        disk.descriptor.set(DescriptorKey::DeviceWritable, DescriptorValue::Bool(false));
        let options = compose_mount_options(&config(), &disk, false);
        assert!(options.contains(&"rdonly".to_string()));
    }

    #[test]
    fn tdm_locked_non_preboot_is_rejected() {
        let mut disk = Disk::new("sdb1", Descriptor::new());
        disk.descriptor.set(DescriptorKey::VolumeMountable, DescriptorValue::Bool(true));
        disk.descriptor.set(DescriptorKey::DeviceTdmLocked, DescriptorValue::Bool(true));
        assert!(matches!(is_mount_eligible(&disk, None), Err(ArbitrationError::NotPermitted(_))));
    }

    #[test]
    fn tdm_locked_preboot_is_allowed() {
        let mut disk = Disk::new("sdb1", Descriptor::new());
        disk.descriptor.set(DescriptorKey::VolumeMountable, DescriptorValue::Bool(true));
        disk.descriptor.set(DescriptorKey::DeviceTdmLocked, DescriptorValue::Bool(true));
        disk.descriptor.set(DescriptorKey::MediaContentRole, DescriptorValue::String("PreBoot".into()));
        assert!(is_mount_eligible(&disk, None).is_ok());
    }

    #[test]
    fn already_mounted_is_rejected() {
        let mut disk = Disk::new("sdb1", Descriptor::new());
        disk.descriptor.set(DescriptorKey::VolumeMountable, DescriptorValue::Bool(true));
        disk.descriptor.set(
            DescriptorKey::VolumePath,
            DescriptorValue::Url(url::Url::parse("file:///media/diskarbd/USB").unwrap()),
        );
        assert!(matches!(is_mount_eligible(&disk, None), Err(ArbitrationError::Busy(_))));
    }

    #[test]
    fn mount_map_ignore_override_suppresses_mount() {
        let mut disk = Disk::new("sdb1", Descriptor::new());
        let uuid = uuid::Uuid::new_v4();
        disk.descriptor.set(DescriptorKey::VolumeUuid, DescriptorValue::Uuid(uuid));

        let toml = format!(
            "[[volume]]\nuuid = \"{uuid}\"\nignore = true\n"
        );
        let mount_map: MountMap = toml::from_str(&toml).unwrap();

        assert!(apply_mount_map_override(&mount_map, &disk, vec![]).is_none());
    }
}
