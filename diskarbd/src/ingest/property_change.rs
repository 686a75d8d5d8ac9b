use super::IngestContext;
use crate::registry::DiskState;
use shared::descriptor::{Descriptor, DescriptorKey};

/// Handles a kernel `MediaPropertyChanged` notification, and re-registration
/// appearances routed here by `handle_appearance` (spec.md §4.3 "Property
/// change").
pub fn handle_property_change(ctx: &mut IngestContext<'_>, kernel_object: String, new_descriptor: Descriptor) {
    let Some(disk) = ctx.disks.lookup_mut(&kernel_object) else {
        log::debug!("property change for unknown disk {kernel_object}, ignoring");
        return;
    };

    let changed = disk.reconcile_descriptor(new_descriptor);
    if changed.is_empty() {
        return;
    }

    let currently_mounted = disk.descriptor.volume_path().is_some();
    if changed.contains(&DescriptorKey::VolumeName) && currently_mounted {
        if let Some(disk) = ctx.disks.lookup_mut(&kernel_object) {
            if let Err(e) = crate::stage::mount::rename_mount_point(disk) {
                log::warn!("renaming mount point for {kernel_object} failed: {e}");
            }
        }
    }

    let staged_appear = ctx
        .disks
        .lookup(&kernel_object)
        .map(|d| d.state.contains(DiskState::STAGED_APPEAR))
        .unwrap_or(false);

    if staged_appear {
        if let Some(disk) = ctx.disks.lookup(&kernel_object) {
            ctx.dispatcher.dispatch_description_changed(ctx.sessions, disk, &changed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CallbackDispatcher;
    use crate::ingest::StageQueue;
    use crate::registry::{Disk, DiskRegistry, SessionRegistry, UnitRegistry};
    use shared::descriptor::DescriptorValue;

    #[test]
    fn unchanged_descriptor_does_not_dispatch() {
        let mut disks = DiskRegistry::new();
        disks.insert(Disk::new("sdb1", Descriptor::new())).unwrap();
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

        handle_property_change(&mut ctx, "sdb1".into(), Descriptor::new());
        assert!(sessions.iter().next().is_none());
    }

    #[test]
    fn changed_descriptor_updates_registry_state() {
        let mut disks = DiskRegistry::new();
        disks.insert(Disk::new("sdb1", Descriptor::new())).unwrap();
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

        let mut next = Descriptor::new();
        next.set(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(true));
        handle_property_change(&mut ctx, "sdb1".into(), next);

        assert!(disks.lookup("sdb1").unwrap().descriptor.is_removable());
    }
}
