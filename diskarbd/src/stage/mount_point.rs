//! Mount-point directory synthesis and sweep (spec.md §4.5, §4.7).

use crate::registry::MountPointRegistry;
use shared::constants::{AUTOMOUNT_COOKIE_FILE, MAX_MOUNT_POINT_SUFFIXES};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Sanitizes a volume name for use as a path component, matching the
/// original's `/`→`:` substitution (spec.md §4.5).
pub fn sanitize_name(name: &str) -> String {
    name.replace('/', ":")
}

/// Synthesizes an unused mount point under `mount_root`, trying
/// `<root>/<name>`, then `<root>/<name> 1`, … up to
/// `MAX_MOUNT_POINT_SUFFIXES` suffixes (spec.md §4.5), skipping any
/// candidate already reserved in the `MountPointRegistry` and, if the
/// candidate directory exists as a stray empty mount-point folder,
/// removing it before reuse.
pub fn synthesize_mount_point(
    mount_root: &Path,
    volume_name: &str,
    registry: &MountPointRegistry,
) -> io::Result<PathBuf> {
    let sanitized = sanitize_name(volume_name);
    for suffix in 0..MAX_MOUNT_POINT_SUFFIXES {
        let candidate = if suffix == 0 {
            mount_root.join(&sanitized)
        } else {
            mount_root.join(format!("{sanitized} {suffix}"))
        };

        if registry.is_reserved(&candidate) {
            continue;
        }

        if candidate.exists() {
            if is_stray_mount_point(&candidate)? {
                fs::remove_file(candidate.join(AUTOMOUNT_COOKIE_FILE)).ok();
                fs::remove_dir(&candidate)?;
            } else {
                continue;
            }
        }

        return Ok(candidate);
    }
    Err(io::Error::other(format!(
        "no free mount point under {} after {MAX_MOUNT_POINT_SUFFIXES} attempts",
        mount_root.display()
    )))
}

/// Creates the mount point directory with mode `0111` and, if a uid is
/// given, that ownership (spec.md §4.5).
pub fn create_mount_point_dir(path: &Path, owner_uid: Option<u32>) -> io::Result<()> {
    fs::create_dir(path)?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o111))?;
    if let Some(uid) = owner_uid {
        nix::unistd::chown(path, Some(nix::unistd::Uid::from_raw(uid)), None)
            .map_err(|e| io::Error::other(format!("chown {}: {e}", path.display())))?;
    }
    fs::write(path.join(AUTOMOUNT_COOKIE_FILE), b"")?;
    Ok(())
}

/// Removes a daemon-created mount point (spec.md §4.7): only if it is one
/// level under the mount root, not itself on an auto-mount filesystem, and
/// carries the cookie file.
pub fn remove_if_daemon_created(path: &Path) -> io::Result<()> {
    if is_stray_mount_point(path)? {
        fs::remove_file(path.join(AUTOMOUNT_COOKIE_FILE)).ok();
        fs::remove_dir(path)?;
    }
    Ok(())
}

fn is_stray_mount_point(path: &Path) -> io::Result<bool> {
    Ok(path.is_dir() && path.join(AUTOMOUNT_COOKIE_FILE).exists())
}

/// Sweeps `mount_root` at startup for stray top-level directories carrying
/// the cookie file, and stray symlinks (spec.md §6 Filesystem surface).
pub fn sweep_stray_entries(mount_root: &Path) -> io::Result<()> {
    if !mount_root.exists() {
        fs::create_dir_all(mount_root)?;
        return Ok(());
    }

    for entry in fs::read_dir(mount_root)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            fs::remove_file(&path)?;
            continue;
        }

        if file_type.is_dir() && is_stray_mount_point(&path)? {
            log::info!("sweeping stray mount point {}", path.display());
            remove_if_daemon_created(&path)?;
        }
    }
    Ok(())
}
