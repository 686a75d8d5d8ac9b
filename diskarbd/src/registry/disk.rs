use bitflags::bitflags;
use shared::descriptor::Descriptor;

bitflags! {
    /// Independent lifecycle flags for a disk (spec.md §4.2). Orthogonal
    /// rather than a single enum because stages can be entered
    /// independently of each other.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskState: u32 {
        const STAGED_PROBE            = 1 << 0;
        const STAGED_REPAIR           = 1 << 1;
        const STAGED_MOUNT            = 1 << 2;
        const STAGED_APPEAR           = 1 << 3;
        const MOUNT_AUTOMATIC         = 1 << 4;
        const MOUNT_AUTOMATIC_NODEFER = 1 << 5;
        const REQUIRE_REPAIR          = 1 << 6;
        const REQUIRE_REPAIR_QUOTAS   = 1 << 7;
        const COMMAND_ACTIVE          = 1 << 8;
        const ZOMBIE                  = 1 << 9;
        const MOUNT_ONGOING           = 1 << 10;
        const MOUNT_QUARANTINED       = 1 << 11;
        const MOUNTED_WITH_USERFS     = 1 << 12;
        const MOUNTED_WITH_FSKIT      = 1 << 13;
    }
}

impl DiskState {
    /// Bits a client session may read/write through `DiskGetOptions` /
    /// `DiskSetOptions` (spec.md §6). Everything else is internal
    /// bookkeeping the RPC surface doesn't expose.
    pub const CLIENT_OPTIONS: DiskState = DiskState::MOUNT_AUTOMATIC
        .union(DiskState::MOUNT_AUTOMATIC_NODEFER)
        .union(DiskState::MOUNT_QUARANTINED);
}

/// One block device / media object (spec.md §3).
#[derive(Debug, Clone)]
pub struct Disk {
    /// Stable device id (the kernel's BSD-name analogue, e.g. `sdb1`).
    pub id: String,
    /// Kernel unit number of the backing whole-media disk, if known.
    pub unit_id: Option<u32>,
    pub descriptor: Descriptor,
    pub state: DiskState,
    /// Session holding the exclusive-use claim, if any (invariant (iii)).
    pub claim: Option<u64>,
    /// Request currently in flight against this disk.
    pub in_flight_request: Option<u64>,
    /// Descriptor snapshot as it was before the most recent property
    /// change, used by `diff_changed_keys`.
    pub previous_descriptor: Option<Descriptor>,
}

impl Disk {
    pub fn new(id: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            id: id.into(),
            unit_id: None,
            descriptor,
            state: DiskState::empty(),
            claim: None,
            in_flight_request: None,
            previous_descriptor: None,
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state.contains(DiskState::ZOMBIE)
    }

    pub fn is_claimed(&self) -> bool {
        self.claim.is_some()
    }

    /// Applies a fresh descriptor snapshot, recording the prior one so
    /// property-change handling can diff against it (spec.md §4.3).
    pub fn reconcile_descriptor(&mut self, new_descriptor: Descriptor) -> Vec<shared::descriptor::DescriptorKey> {
        let previous = std::mem::replace(&mut self.descriptor, new_descriptor);
        let changed = self.descriptor.diff_changed_keys(&previous);
        self.previous_descriptor = Some(previous);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_disk_has_no_flags_set() {
        let disk = Disk::new("sdb1", Descriptor::new());
        assert!(disk.state.is_empty());
        assert!(!disk.is_zombie());
        assert!(!disk.is_claimed());
    }

    #[test]
    fn reconcile_descriptor_reports_changed_keys() {
        use shared::descriptor::{DescriptorKey, DescriptorValue};
        let mut disk = Disk::new("sdb1", Descriptor::new());
        disk.descriptor.set(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(true));

        let mut next = Descriptor::new();
        next.set(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(false));
        let changed = disk.reconcile_descriptor(next);

        assert_eq!(changed, vec![DescriptorKey::DeviceRemovable]);
        assert!(disk.previous_descriptor.is_some());
    }
}
