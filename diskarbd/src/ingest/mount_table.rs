//! Mount-table parsing (spec.md §4.3 "Mount-table events"), reading
//! `/proc/self/mountinfo` the way the original daemon reads the kernel's
//! notify-mount-table stream.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Filesystem kinds excluded from "create a new Disk for this unmatched
/// entry" per spec.md §4.3 ("not on a bind/union/devfs filesystem").
const IGNORED_FS_KINDS: &[&str] = &["devtmpfs", "proc", "sysfs", "cgroup", "cgroup2", "overlay", "tmpfs", "devpts", "mqueue", "securityfs", "debugfs", "tracefs", "pstore", "bpf"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device_path: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

pub fn read_mount_table() -> io::Result<Vec<MountEntry>> {
    let contents = fs::read_to_string("/proc/self/mountinfo")?;
    Ok(parse_mountinfo(&contents))
}

fn parse_mountinfo(contents: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        let Some(sep) = line.find(" - ") else { continue };
        let (_, after) = line.split_at(sep + 3);
        let mut fields = after.split_whitespace();
        let Some(fs_type) = fields.next() else { continue };
        let Some(device_path) = fields.next() else { continue };

        let before = &line[..sep];
        let mut before_fields = before.split_whitespace();
        // mountinfo layout: id parent major:minor root mount_point opts...
        let mount_point = before_fields.nth(4);

        if let Some(mount_point) = mount_point {
            entries.push(MountEntry {
                device_path: device_path.to_string(),
                mount_point: PathBuf::from(mount_point),
                fs_type: fs_type.to_string(),
            });
        }
    }
    entries
}

pub fn is_ignored_fs_kind(fs_type: &str) -> bool {
    IGNORED_FS_KINDS.contains(&fs_type)
}

/// Entries that newly appeared between two snapshots, keyed by mount point.
pub fn newly_mounted<'a>(previous: &[MountEntry], current: &'a [MountEntry]) -> Vec<&'a MountEntry> {
    let previous_points: HashSet<&PathBuf> = previous.iter().map(|e| &e.mount_point).collect();
    current.iter().filter(|e| !previous_points.contains(&e.mount_point)).collect()
}

/// Entries that vanished between two snapshots.
pub fn newly_unmounted(previous: &[MountEntry], current: &[MountEntry]) -> Vec<MountEntry> {
    let current_points: HashSet<&PathBuf> = current.iter().map(|e| &e.mount_point).collect();
    previous
        .iter()
        .filter(|e| !current_points.contains(&e.mount_point))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
36 35 98:0 / / rw,noatime master:1 - ext4 /dev/root rw,errors=remount-ro\n\
60 36 8:17 / /media/diskarbd/USB rw,nosuid,nodev,relatime shared:25 - vfat /dev/sdb1 rw,uid=0\n\
61 36 0:30 / /proc rw,nosuid,nodev,noexec,relatime shared:13 - proc proc rw\n";

    #[test]
    fn parses_device_and_mount_point_per_entry() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].device_path, "/dev/sdb1");
        assert_eq!(entries[1].mount_point, PathBuf::from("/media/diskarbd/USB"));
        assert_eq!(entries[1].fs_type, "vfat");
    }

    #[test]
    fn proc_is_an_ignored_fs_kind() {
        let entries = parse_mountinfo(SAMPLE);
        let proc_entry = entries.iter().find(|e| e.fs_type == "proc").unwrap();
        assert!(is_ignored_fs_kind(&proc_entry.fs_type));
    }

    #[test]
    fn diff_reports_additions_and_removals() {
        let before = parse_mountinfo(SAMPLE);
        let after: Vec<_> = before[..1].to_vec();
        let removed = newly_unmounted(&before, &after);
        assert_eq!(removed.len(), 2);
    }
}
