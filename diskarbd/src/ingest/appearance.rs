use super::IngestContext;
use crate::registry::{Disk, UnitState};
use shared::descriptor::Descriptor;

/// Handles a kernel `MediaAppeared` notification (spec.md §4.3).
///
/// The original daemon races two independent iterators (appearance,
/// disappearance) and must re-derive ordering with an explicit
/// queue-crossing rule. Here both kinds of kernel notification already
/// arrive serialized through a single channel (`KernelEventSource::run`),
/// so the crossing rule collapses to: a live disk under this id is always
/// a re-registration, never a race with a not-yet-processed disappearance.
pub fn handle_appearance(
    ctx: &mut IngestContext<'_>,
    kernel_object: String,
    unit_id: Option<u32>,
    descriptor: Descriptor,
) {
    if ctx.disks.lookup(&kernel_object).is_some() {
        super::handle_property_change(ctx, kernel_object, descriptor);
        return;
    }

    let mut disk = Disk::new(kernel_object.clone(), descriptor);
    disk.unit_id = unit_id;
    if ctx.disks.insert(disk).is_err() {
        log::warn!("appearance: {kernel_object} already present as a zombie awaiting teardown, dropping duplicate");
        return;
    }

    if let Some(unit_id) = unit_id {
        let unit = ctx.units.attach_disk(unit_id);
        unit.state |= UnitState::QUIESCED;
    }

    log::info!("disk appeared: {kernel_object}");
    ctx.stage_queue.signal(kernel_object);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CallbackDispatcher;
    use crate::ingest::StageQueue;
    use crate::registry::{DiskRegistry, SessionRegistry, UnitRegistry};

    #[test]
    fn fresh_appearance_inserts_disk_and_signals_stage_engine() {
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

        handle_appearance(&mut ctx, "sdb1".into(), Some(8), Descriptor::new());

        assert!(disks.lookup("sdb1").is_some());
        assert_eq!(units.lookup(8).unwrap().disk_count, 1);
        assert_eq!(stage_queue.pop().as_deref(), Some("sdb1"));
    }
}
