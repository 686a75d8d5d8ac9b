//! The Stage Engine (spec.md §4.5): drives each disk through
//! `probe → repair (conditional) → mount (conditional) → appear`, and
//! through `unmount → disappear`, one stage at a time, whenever signaled.
//!
//! Per the "External helper dispatch" Design Note (spec.md §9), every
//! helper invocation is a `tokio::process::Command` awaited from here.
//! Because this runs inside a single-threaded `LocalSet`
//! (`daemon::Daemon::run`), awaiting a helper suspends only this disk's
//! pipeline — other disks' `advance` calls, RPC commands, and ingest events
//! keep being processed by the executor in the meantime. The disk's state
//! flags (`StagedProbe`, `StagedMount`, ...) record progress for
//! observability and for `CommandActive` serialization; the actual
//! suspension point is the `.await`, which is the idiomatic Rust
//! counterpart to the original's flag-driven resumption.

use super::mount::{
    apply_mount_map_override, compose_mount_options, do_mount, is_mount_eligible, repair_quotas, should_defer,
};
use super::mount_point::{create_mount_point_dir, synthesize_mount_point};
use super::{probe, repair};
use crate::registry::{Disk, DiskState, Request};
use shared::descriptor::{DescriptorKey, DescriptorValue};
use shared::errors::ArbitrationError;
use shared::proto::callback::CallbackKind;
use std::rc::Rc;
use std::cell::RefCell;

/// Outcome of one call to `advance`: either the pipeline needs another
/// signal later (suspended on a console-user/approval gate), or it ran to
/// completion (mounted/failed/skipped), in which case `request` (if any)
/// should be completed with the given result and dispatcher should emit
/// appeared.
pub enum AdvanceOutcome {
    Suspended,
    ReachedAppear,
    Failed(ArbitrationError),
}

/// Runs every stage that doesn't require an external helper completion to
/// cross a suspension point, advancing `disk_id` as far as it can go in one
/// call. Mount/probe/repair each await their helper inline; by the time
/// this returns, the disk has either reached `StagedAppear`, failed
/// terminally, or is waiting on a console-user login (`Suspended`).
///
/// `request` carries the pending mount request, if this advance was
/// triggered by an explicit `SessionQueueRequest(mount)` rather than
/// appearance-time auto-mount; `automatic` mirrors `Request::automatic`
/// and drives scenario S3's retry rule.
pub async fn advance_mount(
    daemon: &Rc<RefCell<crate::daemon::Daemon>>,
    disk_id: &str,
    automatic: bool,
    force: bool,
) -> AdvanceOutcome {
    // --- Probe -------------------------------------------------------
    let needs_probe = {
        let d = daemon.borrow();
        d.disks
            .lookup(disk_id)
            .map(|disk| !disk.state.contains(DiskState::STAGED_PROBE))
            .unwrap_or(false)
    };
    if needs_probe {
        let config = daemon.borrow().config.clone();
        let mut disk = {
            let mut d = daemon.borrow_mut();
            let Some(disk) = d.disks.lookup_any_mut(disk_id) else {
                return AdvanceOutcome::Failed(ArbitrationError::NotFound(disk_id.to_string()));
            };
            std::mem::replace(disk, Disk::new(disk_id, shared::descriptor::Descriptor::new()))
        };
        probe::probe(&config, &mut disk).await;
        let mut d = daemon.borrow_mut();
        if let Some(slot) = d.disks.lookup_any_mut(disk_id) {
            *slot = disk;
        }
    }

    let (mountable, already_mounted, require_repair, tdm_role_ok) = {
        let d = daemon.borrow();
        let Some(disk) = d.disks.lookup(disk_id) else {
            return AdvanceOutcome::Failed(ArbitrationError::NotFound(disk_id.to_string()));
        };
        let unit = disk.unit_id.and_then(|id| d.units.lookup(id));
        (
            is_mount_eligible(disk, unit).is_ok(),
            disk.descriptor.volume_path().is_some(),
            disk.state.contains(DiskState::REQUIRE_REPAIR),
            is_mount_eligible(disk, unit),
        )
    };

    if let Err(e) = tdm_role_ok {
        return AdvanceOutcome::Failed(e);
    }
    if already_mounted {
        return AdvanceOutcome::Failed(ArbitrationError::Busy(format!("{disk_id} already mounted")));
    }
    if !mountable {
        // Not mountable is not a failure: it simply skips straight to
        // appear (spec.md §4.5 Appear: "mount has reached a terminal stage
        // (success or 'not to be mounted')").
        mark_staged_mount(daemon, disk_id);
        return AdvanceOutcome::ReachedAppear;
    }

    // --- Deferral ------------------------------------------------------
    let (deferred, has_console_user, no_defer) = {
        let d = daemon.borrow();
        let disk = d.disks.lookup(disk_id).unwrap();
        let defer = should_defer(disk, &d.config.deferral);
        (defer, !d.console_users.is_empty(), disk.state.contains(DiskState::MOUNT_AUTOMATIC_NODEFER))
    };
    if deferred && !no_defer && !has_console_user {
        return AdvanceOutcome::Suspended;
    }

    // --- Repair decision -------------------------------------------------
    let read_only_requested = {
        let d = daemon.borrow();
        !d.disks.lookup(disk_id).unwrap().descriptor.is_writable()
    };
    if read_only_requested && require_repair && !force {
        mark_staged_mount(daemon, disk_id);
        return AdvanceOutcome::Failed(ArbitrationError::DirtyVolume);
    }

    let should_repair = {
        let d = daemon.borrow();
        require_repair || d.config.always_repair
    };
    if should_repair && !{
        let d = daemon.borrow();
        d.disks.lookup(disk_id).unwrap().state.contains(DiskState::STAGED_REPAIR)
    } {
        let config = daemon.borrow().config.clone();
        let mut disk = {
            let mut d = daemon.borrow_mut();
            let disk = d.disks.lookup_any_mut(disk_id).unwrap();
            std::mem::replace(disk, Disk::new(disk_id, shared::descriptor::Descriptor::new()))
        };
        let result = repair::repair(&config, &mut disk).await;
        {
            let mut d = daemon.borrow_mut();
            *d.disks.lookup_any_mut(disk_id).unwrap() = disk;
        }
        if let Err(e) = result {
            if !force {
                mark_staged_mount(daemon, disk_id);
                return AdvanceOutcome::Failed(e);
            }
        }
    }

    // --- Mount -----------------------------------------------------------
    let (config, mount_map, device_path, volume_name) = {
        let d = daemon.borrow();
        let disk = d.disks.lookup(disk_id).unwrap();
        (
            d.config.clone(),
            d.mount_map.clone(),
            disk.descriptor.device_path().map(str::to_string),
            disk.descriptor
                .volume_name()
                .map(str::to_string)
                .unwrap_or_else(|| disk_id.to_string()),
        )
    };
    let Some(device_path) = device_path else {
        mark_staged_mount(daemon, disk_id);
        return AdvanceOutcome::Failed(ArbitrationError::NotFound(disk_id.to_string()));
    };

    let options = {
        let d = daemon.borrow();
        let disk = d.disks.lookup(disk_id).unwrap();
        compose_mount_options(&config, disk, false)
    };
    let Some(options) = ({
        let d = daemon.borrow();
        apply_mount_map_override(&mount_map, d.disks.lookup(disk_id).unwrap(), options)
    }) else {
        // Mount-map says skip this volume entirely.
        mark_staged_mount(daemon, disk_id);
        return AdvanceOutcome::ReachedAppear;
    };

    // Mount-approval solicitation (spec.md §4.4 Approvals, scenarios
    // S1/S2): gated before the mount point is created so a dissent leaves
    // no directory behind and never invokes the mount helper.
    if let Err(e) = crate::daemon::gate_approval(daemon, disk_id, CallbackKind::DiskMountApproval).await {
        mark_staged_mount(daemon, disk_id);
        return AdvanceOutcome::Failed(e);
    }

    let mount_point = {
        let mut d = daemon.borrow_mut();
        let owner_uid = d.disks.lookup(disk_id).unwrap().descriptor.suggested_uid().map(|u| u as u32);
        let candidate = match synthesize_mount_point(&config.mount_root, &volume_name, &d.mount_points) {
            Ok(p) => p,
            Err(e) => {
                mark_staged_mount(daemon, disk_id);
                return AdvanceOutcome::Failed(ArbitrationError::NoResources.tap(&e));
            }
        };
        d.mount_points.reserve(&candidate);
        if let Some(disk) = d.disks.lookup_any_mut(disk_id) {
            disk.state |= DiskState::MOUNT_ONGOING;
        }
        if let Err(e) = create_mount_point_dir(&candidate, owner_uid) {
            d.mount_points.release(&candidate);
            mark_staged_mount(daemon, disk_id);
            return AdvanceOutcome::Failed(ArbitrationError::NoResources.tap(&e));
        }
        candidate
    };

    let mut result = do_mount(&config, &device_path, &mount_point, &options).await;

    // Automatic-retry rule (spec.md §4.5, invariant 7, scenario S3).
    if automatic && matches!(result, Err(ArbitrationError::DirtyVolume)) {
        let mut retry_options = options.clone();
        if !retry_options.iter().any(|o| o == "force") {
            retry_options.push("force".to_string());
        }
        if !retry_options.iter().any(|o| o == "rdonly") {
            retry_options.push("rdonly".to_string());
        }
        result = do_mount(&config, &device_path, &mount_point, &retry_options).await;
    }

    {
        let mut d = daemon.borrow_mut();
        d.mount_points.release(&mount_point);
        if let Some(disk) = d.disks.lookup_any_mut(disk_id) {
            disk.state.remove(DiskState::MOUNT_ONGOING);
        }
    }

    match result {
        Ok(()) => {
            let requires_quota_repair = {
                let d = daemon.borrow();
                d.disks.lookup(disk_id).unwrap().state.contains(DiskState::REQUIRE_REPAIR_QUOTAS)
            };
            if requires_quota_repair {
                repair_quotas(&config, &device_path).await;
                let mut d = daemon.borrow_mut();
                if let Some(disk) = d.disks.lookup_any_mut(disk_id) {
                    disk.state.remove(DiskState::REQUIRE_REPAIR_QUOTAS);
                }
            }

            let url = url::Url::from_file_path(&mount_point).expect("mount point is an absolute path");
            let mut d = daemon.borrow_mut();
            if let Some(disk) = d.disks.lookup_any_mut(disk_id) {
                disk.descriptor.set(DescriptorKey::VolumePath, DescriptorValue::Url(url));
                disk.state |= DiskState::MOUNTED_WITH_USERFS;
            }
            drop(d);
            mark_staged_mount(daemon, disk_id);
            AdvanceOutcome::ReachedAppear
        }
        Err(e) => {
            let _ = super::mount_point::remove_if_daemon_created(&mount_point);
            mark_staged_mount(daemon, disk_id);
            AdvanceOutcome::Failed(e)
        }
    }
}

fn mark_staged_mount(daemon: &Rc<RefCell<crate::daemon::Daemon>>, disk_id: &str) {
    let mut d = daemon.borrow_mut();
    if let Some(disk) = d.disks.lookup_any_mut(disk_id) {
        disk.state |= DiskState::STAGED_MOUNT;
    }
}

/// Advances a disk all the way to `disk-appeared` once its stage is
/// terminal (spec.md §4.5 "Appear"): dispatches the callback and sets
/// `StagedAppear`.
pub fn mark_appeared(daemon: &Rc<RefCell<crate::daemon::Daemon>>, disk_id: &str) {
    let mut d = daemon.borrow_mut();
    let crate::daemon::Daemon { disks, sessions, dispatcher, .. } = &mut *d;
    if let Some(disk) = disks.lookup_any_mut(disk_id) {
        disk.state |= DiskState::STAGED_APPEAR;
    }
    if let Some(disk) = disks.lookup(disk_id) {
        dispatcher.dispatch_appeared(sessions, disk);
    }
}

pub fn is_approval_kind_for_request(kind: shared::proto::request::RequestKind) -> Option<CallbackKind> {
    use shared::proto::request::RequestKind as RK;
    match kind {
        RK::Mount => Some(CallbackKind::DiskMountApproval),
        RK::Unmount => Some(CallbackKind::DiskUnmountApproval),
        RK::Eject => Some(CallbackKind::DiskEjectApproval),
        _ => None,
    }
}

trait TapIo {
    fn tap(self, e: &std::io::Error) -> ArbitrationError;
}

impl TapIo for ArbitrationError {
    fn tap(self, e: &std::io::Error) -> ArbitrationError {
        log::warn!("{self}: {e}");
        self
    }
}

/// Request completion bookkeeping shared by both the auto-mount path
/// (appearance handling) and the explicit `SessionQueueRequest(mount)`
/// path.
pub fn complete_request(request: &mut Request, result: Result<(), ArbitrationError>) {
    request.complete(result);
}
