use bitflags::bitflags;

bitflags! {
    /// Per-unit flags (spec.md §3, §4.5 serialization).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnitState: u32 {
        const QUIESCED                 = 1 << 0;
        const QUIESCED_WITHOUT_TIMEOUT = 1 << 1;
        const HAS_NESTED_CONTAINER     = 1 << 2;
        const HAS_UNREADABLE_MEDIA     = 1 << 3;
        const COMMAND_ACTIVE           = 1 << 4;
        const EXCLUSIVE_LOCK           = 1 << 5;
    }
}

/// Virtual grouping of disks sharing a physical backing unit (spec.md §3).
#[derive(Debug, Clone)]
pub struct Unit {
    /// Kernel unit number of the whole-media disk.
    pub id: u32,
    pub state: UnitState,
    /// Number of disks (whole media + partitions) currently attributed to
    /// this unit; the unit is destroyed once this reaches zero.
    pub disk_count: u32,
}

impl Unit {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: UnitState::empty(),
            disk_count: 0,
        }
    }

    pub fn is_quiesced(&self) -> bool {
        self.state.contains(UnitState::QUIESCED)
    }
}
