mod appearance;
mod disappearance;
mod kernel_source;
mod mount_table;
mod property_change;
mod udev_source;

pub use kernel_source::{KernelEvent, KernelEventSource};
pub use mount_table::{is_ignored_fs_kind, newly_mounted, newly_unmounted, read_mount_table, MountEntry};
pub use udev_source::UdevEventSource;

use crate::dispatch::CallbackDispatcher;
use crate::registry::{DiskRegistry, SessionRegistry, UnitRegistry};
use std::collections::VecDeque;

/// A request for the Stage Engine to (re-)examine a disk's pipeline,
/// deduplicated so a burst of ingest activity against the same disk
/// doesn't queue redundant work (spec.md §4.5: "advance leftmost-first
/// whenever the Stage Engine is signaled").
#[derive(Debug, Default)]
pub struct StageQueue {
    queue: VecDeque<String>,
}

impl StageQueue {
    pub fn signal(&mut self, disk_id: impl Into<String>) {
        let disk_id = disk_id.into();
        if !self.queue.contains(&disk_id) {
            self.queue.push_back(disk_id);
        }
    }

    pub fn pop(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Bundles the mutable registry/dispatcher state Event Ingest touches, so
/// `appearance`/`disappearance`/`property_change` read as free functions
/// over borrowed state rather than methods on a god object (per spec.md §9
/// "Global mutable state": a single root value passed through handlers,
/// not true globals — `Daemon` owns all of this; `IngestContext` is the
/// per-call borrow of it).
pub struct IngestContext<'a> {
    pub disks: &'a mut DiskRegistry,
    pub units: &'a mut UnitRegistry,
    pub sessions: &'a mut SessionRegistry,
    pub dispatcher: &'a mut CallbackDispatcher,
    pub stage_queue: &'a mut StageQueue,
}

pub use appearance::handle_appearance;
pub use disappearance::{finish_disappearance, handle_disappearance, plan_disappearance, DisappearancePlan};
pub use property_change::handle_property_change;
