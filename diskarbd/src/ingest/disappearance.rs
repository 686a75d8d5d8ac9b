use super::IngestContext;
use crate::registry::{DiskState, UnitState};

/// Disk state relevant to disappearance handling, read out before any
/// `.await` so a caller holding the registries behind a `RefCell` (the real
/// `Daemon`, via `daemon::disappear`) never needs to keep that borrow alive
/// across the force-unmount helper invocation.
pub struct DisappearancePlan {
    pub was_staged_appear: bool,
    pub was_staged_mount: bool,
    pub volume_path: Option<url::Url>,
    pub unit_id: Option<u32>,
    /// Whole-media removal means every child volume under `unit_id` is gone
    /// at once, not just one partition (spec.md §4.3, GLOSSARY "Quiesced").
    pub is_whole_media: bool,
    /// Whether this disk was a mounted, writable volume a removal dialog
    /// should have been shown for (spec.md §4.3 "Disappearance handling").
    pub removal_dialog_eligible: bool,
}

/// First half of `MediaDisappeared` handling (spec.md §4.3): a synchronous
/// read of what the disappearing disk was doing, taken before any helper
/// invocation.
pub fn plan_disappearance(ctx: &IngestContext<'_>, kernel_object: &str) -> Option<DisappearancePlan> {
    let disk = ctx.disks.lookup(kernel_object)?;
    Some(DisappearancePlan {
        was_staged_appear: disk.state.contains(DiskState::STAGED_APPEAR),
        was_staged_mount: disk.state.contains(DiskState::STAGED_MOUNT),
        volume_path: disk.descriptor.volume_path().cloned(),
        unit_id: disk.unit_id,
        is_whole_media: disk.descriptor.is_whole_media(),
        removal_dialog_eligible: disk.descriptor.is_writable() && disk.descriptor.volume_path().is_some(),
    })
}

/// Second half: dispatches `disk-disappeared`, surfaces a removal dialog for
/// an unmounted-by-surprise writable volume, detaches the unit (clearing its
/// quiesced flags first on whole-media removal, since a fresh unit number
/// may be reused by a later appearance), marks the disk a zombie, and
/// removes it — everything that runs after the force-unmount helper (if
/// any) has completed.
pub fn finish_disappearance(ctx: &mut IngestContext<'_>, kernel_object: &str, plan: &DisappearancePlan) {
    if plan.was_staged_appear {
        if let Some(disk) = ctx.disks.lookup(kernel_object) {
            ctx.dispatcher.dispatch_disappeared(ctx.sessions, disk);
        }
    }

    if plan.was_staged_mount && plan.removal_dialog_eligible {
        log::warn!(
            "{kernel_object} disappeared while mounted (unit {:?}); surfacing a removal dialog",
            plan.unit_id
        );
    }

    if let Some(unit_id) = plan.unit_id {
        if plan.is_whole_media {
            if let Some(unit) = ctx.units.lookup_mut(unit_id) {
                unit.state.remove(UnitState::QUIESCED | UnitState::QUIESCED_WITHOUT_TIMEOUT);
            }
        }
        ctx.units.detach_disk(unit_id);
    }

    if let Some(disk) = ctx.disks.lookup_any_mut(kernel_object) {
        disk.state |= DiskState::ZOMBIE;
    }
    ctx.disks.remove(kernel_object);

    log::info!("disk disappeared: {kernel_object}");
}

/// Handles a kernel `MediaDisappeared` notification (spec.md §4.3) in one
/// call. Async because a disk that disappears while mounted must be
/// force-unmounted before its registry entry is torn down.
///
/// Convenience wrapper over `plan_disappearance`/`finish_disappearance` for
/// callers that don't need to release a lock across the `.await` (tests,
/// and any future non-`Rc<RefCell<_>>` harness); `daemon::disappear` calls
/// the two halves directly instead.
pub async fn handle_disappearance(ctx: &mut IngestContext<'_>, kernel_object: String) {
    let Some(plan) = plan_disappearance(ctx, &kernel_object) else {
        log::debug!("disappearance for unknown disk {kernel_object}, ignoring");
        return;
    };

    if plan.was_staged_mount {
        if let Some(path) = &plan.volume_path {
            if let Err(e) = crate::stage::mount::force_unmount(path).await {
                log::warn!("force-unmount of {kernel_object} during disappearance failed: {e}");
            }
        }
    }

    finish_disappearance(ctx, &kernel_object, &plan);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CallbackDispatcher;
    use crate::ingest::StageQueue;
    use crate::registry::{Disk, DiskRegistry, SessionRegistry, UnitRegistry};
    use shared::descriptor::Descriptor;

    #[tokio::test]
    async fn disappearance_removes_disk_and_detaches_unit() {
        let mut disks = DiskRegistry::new();
        let mut disk = Disk::new("sdb1", Descriptor::new());
        disk.unit_id = Some(8);
        disks.insert(disk).unwrap();
        let mut units = UnitRegistry::new();
        units.attach_disk(8);

        let mut sessions = SessionRegistry::new();
        let mut dispatcher = CallbackDispatcher::new();
        let mut stage_queue = StageQueue::default();
        let mut ctx = IngestContext {
            disks: &mut disks,
            units: &mut units,
            sessions: &mut sessions,
            dispatcher: &mut dispatcher,
            stage_queue: &mut stage_queue,
        };

        handle_disappearance(&mut ctx, "sdb1".into()).await;

        assert!(disks.lookup("sdb1").is_none());
        assert!(units.lookup(8).is_none());
    }

    #[tokio::test]
    async fn disappearance_of_unknown_disk_is_a_no_op() {
        let mut disks = DiskRegistry::new();
        let mut units = UnitRegistry::new();
        let mut sessions = SessionRegistry::new();
        let mut dispatcher = CallbackDispatcher::new();
        let mut stage_queue = StageQueue::default();
        let mut ctx = IngestContext {
            disks: &mut disks,
            units: &mut units,
            sessions: &mut sessions,
            dispatcher: &mut dispatcher,
            stage_queue: &mut stage_queue,
        };

        handle_disappearance(&mut ctx, "ghost".into()).await;
        assert!(disks.is_empty());
    }
}
