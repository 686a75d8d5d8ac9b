use shared::descriptor::{DescriptorKey, DescriptorValue};
use shared::proto::callback::CallbackKind;
use std::collections::BTreeMap;

/// A subscription or solicitation registered by a session (spec.md §3).
#[derive(Debug, Clone)]
pub struct Callback {
    pub kind: CallbackKind,
    pub order: i32,
    /// Opaque client-side identity, echoed back verbatim on delivery.
    pub address: u64,
    pub context: u64,
    pub match_dict: Option<BTreeMap<DescriptorKey, DescriptorValue>>,
    pub watch_set: Option<Vec<DescriptorKey>>,
    /// Monotonically increasing insertion sequence, used as the stable
    /// tiebreak within a session when `order` values are equal (spec.md
    /// §4.4: "ordered by their `order` field, stable tiebreak by
    /// insertion").
    pub sequence: u64,
}

impl Callback {
    /// True if this callback should be delivered for `descriptor`
    /// (spec.md §4.4: match predicate holds against the disk's current
    /// descriptor).
    pub fn matches(&self, descriptor: &shared::descriptor::Descriptor) -> bool {
        match &self.match_dict {
            Some(predicate) => descriptor.matches(predicate),
            None => true,
        }
    }

    /// True if this description-changed callback watches at least one of
    /// `changed_keys`.
    pub fn watches_any(&self, changed_keys: &[DescriptorKey]) -> bool {
        match &self.watch_set {
            Some(watch) => watch.iter().any(|k| changed_keys.contains(k)),
            None => true,
        }
    }

    /// Sort key for fan-out ordering within a session: `order` field first,
    /// registration sequence as tiebreak.
    pub fn sort_key(&self) -> (i32, u64) {
        (self.order, self.sequence)
    }
}

pub fn is_approval_kind(kind: CallbackKind) -> bool {
    matches!(
        kind,
        CallbackKind::DiskMountApproval | CallbackKind::DiskUnmountApproval | CallbackKind::DiskEjectApproval
    )
}
