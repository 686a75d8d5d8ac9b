//! Console-User & Permissions Policy (spec.md §4.6).
//!
//! The original observes `SCDynamicStore`/`CGSessionCopyCurrentDictionary`
//! console-user transitions, possibly proxied through a UI agent. On Linux
//! the equivalent source is `logind` (`org.freedesktop.login1`) over the
//! system bus; `LogindConsoleUserSource` polls it for active-seat session
//! changes via `zbus`, mirroring `ingest::UdevEventSource`'s
//! run-on-a-dedicated-thread shape (`ingest/udev_source.rs`).

use crate::registry::{Disk, DiskRegistry, DiskState};
use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsoleUser {
    pub uid: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum ConsoleUserEvent {
    LoggedIn(ConsoleUser),
    LoggedOut(ConsoleUser),
}

/// Abstracts the concrete console-user notification transport (spec.md §9
/// "Open questions": "whether the console-user proxy is present" is a
/// `Config` field, not a build-time branch; this trait is the other half —
/// which bus/service actually reports logins).
pub trait ConsoleUserSource: Send {
    fn run(self: Box<Self>, tx: mpsc::UnboundedSender<ConsoleUserEvent>);
}

/// Tracks which users currently hold an active console/seat session
/// (spec.md §3 "Session" is the RPC-client kind; this is the distinct
/// notion of "who is logged into the console" referenced by §4.6).
#[derive(Debug, Default)]
pub struct ConsoleUserState {
    users: HashSet<ConsoleUser>,
}

impl ConsoleUserState {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsoleUser> {
        self.users.iter()
    }

    /// Applies a login/logout event; returns `true` if this was the first
    /// login transition (0 -> 1 users), which re-triggers deferred mounts
    /// (spec.md §4.6 "if this is the first console user, re-evaluate
    /// deferred mounts").
    pub fn apply(&mut self, event: &ConsoleUserEvent) -> bool {
        match event {
            ConsoleUserEvent::LoggedIn(user) => {
                let was_empty = self.users.is_empty();
                self.users.insert(user.clone());
                was_empty
            }
            ConsoleUserEvent::LoggedOut(user) => {
                self.users.remove(user);
                false
            }
        }
    }

    pub fn is_last_logout(&self) -> bool {
        self.users.is_empty()
    }
}

/// Computes the device-node mode/owner for `disk` given the current set of
/// logged-in console users (spec.md §4.6 "Permissions policy",
/// testable property 9):
///   - single user: `0640 & writable_mask`, owner = that user
///   - multiple users: `0666`, owner = root
///   - no user (post-logout / none yet): `0666`, owner = root (same as the
///     multi-user case — there is no single user to grant exclusive access
///     to)
///   - read-only device: mode additionally masked down to `0444`
fn node_permission_for(disk: &Disk, users: &ConsoleUserState) -> (u32, Option<u32>) {
    let read_only = !disk.descriptor.is_writable();
    let (mode, uid) = if users.len() == 1 {
        let user = users.iter().next().expect("len == 1");
        (0o640, Some(user.uid))
    } else {
        (0o666, None)
    };
    let mode = if read_only { mode & 0o444 } else { mode };
    (mode, uid)
}

/// Applies device-node permissions to every disk in the registry (spec.md
/// §4.6 "On login: for each disk, set device-node permissions"; also
/// called symmetrically on logout with an empty `ConsoleUserState`).
pub fn apply_permissions(disks: &DiskRegistry, users: &ConsoleUserState) {
    for disk in disks.iter() {
        let Some(device_path) = disk.descriptor.device_path() else {
            continue;
        };
        let (mode, uid) = node_permission_for(disk, users);
        if let Err(e) = apply_node_permission(device_path, mode, uid) {
            log::warn!("console-user policy: failed to set permissions on {device_path}: {e}");
        }
    }
}

fn apply_node_permission(device_path: &str, mode: u32, uid: Option<u32>) -> std::io::Result<()> {
    std::fs::set_permissions(device_path, std::fs::Permissions::from_mode(mode))?;
    nix::unistd::chown(
        device_path,
        uid.map(nix::unistd::Uid::from_raw).or(Some(nix::unistd::Uid::from_raw(0))),
        None,
    )
    .map_err(|e| std::io::Error::other(format!("chown {device_path}: {e}")))
}

/// Disk ids eligible to unmount on logout (spec.md §4.6 "On logout...
/// for each mountable disk whose policy says 'defer' and which is not
/// `MountAutomaticNoDefer`, unmount").
pub fn logout_unmount_candidates<'a>(
    disks: &'a DiskRegistry,
    deferral: &'a crate::config::DeferralPolicy,
) -> Vec<&'a str> {
    disks
        .iter()
        .filter(|d| d.descriptor.volume_path().is_some())
        .filter(|d| !d.state.contains(DiskState::MOUNT_AUTOMATIC_NODEFER))
        .filter(|d| crate::stage::mount::should_defer(d, deferral))
        .map(|d| d.id.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::descriptor::{Descriptor, DescriptorKey, DescriptorValue};

    #[test]
    fn single_user_gets_0640_owned_by_that_user() {
        let mut disk = Disk::new("sdb1", Descriptor::new());
        disk.descriptor.set(DescriptorKey::DeviceWritable, DescriptorValue::Bool(true));
        let mut users = ConsoleUserState::default();
        users.apply(&ConsoleUserEvent::LoggedIn(ConsoleUser { uid: 501, name: "alice".into() }));

        let (mode, uid) = node_permission_for(&disk, &users);
        assert_eq!(mode, 0o640);
        assert_eq!(uid, Some(501));
    }

    #[test]
    fn two_users_get_0666_owned_by_root() {
        let mut disk = Disk::new("sdb1", Descriptor::new());
        disk.descriptor.set(DescriptorKey::DeviceWritable, DescriptorValue::Bool(true));
        let mut users = ConsoleUserState::default();
        users.apply(&ConsoleUserEvent::LoggedIn(ConsoleUser { uid: 501, name: "alice".into() }));
        users.apply(&ConsoleUserEvent::LoggedIn(ConsoleUser { uid: 502, name: "bob".into() }));

        let (mode, uid) = node_permission_for(&disk, &users);
        assert_eq!(mode, 0o666);
        assert_eq!(uid, None);
    }

    #[test]
    fn read_only_device_is_masked_to_0444() {
        let mut disk = Disk::new("sdb1", Descriptor::new());
        disk.descriptor.set(DescriptorKey::DeviceWritable, DescriptorValue::Bool(false));
        let mut users = ConsoleUserState::default();
        users.apply(&ConsoleUserEvent::LoggedIn(ConsoleUser { uid: 501, name: "alice".into() }));

        let (mode, _) = node_permission_for(&disk, &users);
        assert_eq!(mode, 0o444);
    }

    #[test]
    fn first_login_transition_is_reported() {
        let mut users = ConsoleUserState::default();
        let first = users.apply(&ConsoleUserEvent::LoggedIn(ConsoleUser { uid: 501, name: "alice".into() }));
        assert!(first);
        let second = users.apply(&ConsoleUserEvent::LoggedIn(ConsoleUser { uid: 502, name: "bob".into() }));
        assert!(!second);
    }
}

/// `logind`-backed `ConsoleUserSource`. Polls `ListSessions` on
/// `org.freedesktop.login1.Manager` for the active seat, diffing against
/// the previously observed set to synthesize login/logout events — logind
/// does emit `SessionNew`/`SessionRemoved` signals, but polling keeps this
/// collaborator's shape identical to `UdevEventSource`'s blocking loop
/// without pulling in `zbus`'s signal-stream machinery for a once-in-a-
/// while event.
pub struct LogindConsoleUserSource {
    poll_interval: std::time::Duration,
}

impl LogindConsoleUserSource {
    pub fn new(poll_interval: std::time::Duration) -> Self {
        Self { poll_interval }
    }
}

impl ConsoleUserSource for LogindConsoleUserSource {
    fn run(self: Box<Self>, tx: mpsc::UnboundedSender<ConsoleUserEvent>) {
        let connection = match zbus::blocking::Connection::system() {
            Ok(c) => c,
            Err(e) => {
                log::error!("console-user policy: failed to connect to the system bus: {e}");
                return;
            }
        };

        let mut previous: HashSet<ConsoleUser> = HashSet::new();
        loop {
            match list_active_users(&connection) {
                Ok(current) => {
                    for user in current.difference(&previous) {
                        if tx.send(ConsoleUserEvent::LoggedIn(user.clone())).is_err() {
                            return;
                        }
                    }
                    for user in previous.difference(&current) {
                        if tx.send(ConsoleUserEvent::LoggedOut(user.clone())).is_err() {
                            return;
                        }
                    }
                    previous = current;
                }
                Err(e) => log::warn!("console-user policy: logind query failed: {e}"),
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

fn list_active_users(connection: &zbus::blocking::Connection) -> zbus::Result<HashSet<ConsoleUser>> {
    let proxy = zbus::blocking::Proxy::new(
        connection,
        "org.freedesktop.login1",
        "/org/freedesktop/login1",
        "org.freedesktop.login1.Manager",
    )?;
    let sessions: Vec<(String, u32, String, String, zbus::zvariant::OwnedObjectPath)> =
        proxy.call("ListSessions", &())?;

    Ok(sessions
        .into_iter()
        .map(|(_, uid, name, _, _)| ConsoleUser { uid, name })
        .collect())
}
