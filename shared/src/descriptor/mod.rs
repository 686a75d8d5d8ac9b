//! The disk descriptor: a dictionary from well-known keys to typed values
//! (spec.md §3), exposed through a typed-accessor API per the "Dynamic
//! descriptor bag" Design Note in spec.md §9 rather than as a free-form
//! dynamic map at the public boundary. Internally it is still a single
//! tagged-union map, which is what keeps property-change reconciliation
//! (`diff_changed_keys`) a single generic walk instead of one branch per
//! field.

mod keys;
mod value;

pub use keys::{DescriptorKey, DescriptorValueKind};
pub use value::DescriptorValue;

use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Descriptor {
    fields: BTreeMap<DescriptorKey, DescriptorValue>,
}

impl Descriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: DescriptorKey) -> Option<&DescriptorValue> {
        self.fields.get(&key)
    }

    /// Sets `key`, asserting the value matches the key's declared kind
    /// (invariant (i), spec.md §3). A mismatch is a programmer error in the
    /// caller (probe/ingest code), not a client-facing fault, so this
    /// panics rather than returning a `Result`.
    pub fn set(&mut self, key: DescriptorKey, value: DescriptorValue) {
        debug_assert_eq!(
            std::mem::discriminant(&key.value_kind()),
            std::mem::discriminant(&kind_of(&value)),
            "descriptor value kind mismatch for {:?}",
            key
        );
        self.fields.insert(key, value);
    }

    pub fn remove(&mut self, key: DescriptorKey) -> Option<DescriptorValue> {
        self.fields.remove(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DescriptorKey, &DescriptorValue)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    // ---- typed accessors (spec.md §9 Design Notes) -------------------

    pub fn is_internal(&self) -> bool {
        self.bool_or(DescriptorKey::DeviceInternal, false)
    }

    pub fn is_removable(&self) -> bool {
        self.bool_or(DescriptorKey::DeviceRemovable, false)
    }

    pub fn is_writable(&self) -> bool {
        self.bool_or(DescriptorKey::DeviceWritable, true)
    }

    pub fn is_whole_media(&self) -> bool {
        self.bool_or(DescriptorKey::DeviceWholeMedia, false)
    }

    pub fn is_leaf(&self) -> bool {
        self.bool_or(DescriptorKey::DeviceLeaf, true)
    }

    pub fn is_tdm_locked(&self) -> bool {
        self.bool_or(DescriptorKey::DeviceTdmLocked, false)
    }

    pub fn is_mountable(&self) -> bool {
        self.bool_or(DescriptorKey::VolumeMountable, false)
    }

    pub fn is_encrypted(&self) -> bool {
        self.bool_or(DescriptorKey::MediaEncrypted, false)
    }

    pub fn media_size(&self) -> Option<u64> {
        self.get(DescriptorKey::DeviceSize).and_then(DescriptorValue::as_u64)
    }

    pub fn block_size(&self) -> Option<u64> {
        self.get(DescriptorKey::DeviceBlockSize).and_then(DescriptorValue::as_u64)
    }

    pub fn media_name(&self) -> Option<&str> {
        self.get(DescriptorKey::MediaName).and_then(DescriptorValue::as_str)
    }

    pub fn media_kind(&self) -> Option<&str> {
        self.get(DescriptorKey::MediaType).and_then(DescriptorValue::as_str)
    }

    pub fn content_role(&self) -> Option<&str> {
        self.get(DescriptorKey::MediaContentRole).and_then(DescriptorValue::as_str)
    }

    /// The logical-volume-manager group this disk belongs to, if any
    /// (sourced from udev's `DM_VG_NAME` property on Linux). `None` means
    /// the disk is not LVM-backed.
    pub fn logical_volume_family(&self) -> Option<&str> {
        self.get(DescriptorKey::DeviceLogicalVolumeFamily).and_then(DescriptorValue::as_str)
    }

    pub fn volume_name(&self) -> Option<&str> {
        self.get(DescriptorKey::VolumeName).and_then(DescriptorValue::as_str)
    }

    pub fn volume_kind(&self) -> Option<&str> {
        self.get(DescriptorKey::VolumeKind).and_then(DescriptorValue::as_str)
    }

    pub fn volume_uuid(&self) -> Option<Uuid> {
        self.get(DescriptorKey::VolumeUuid).and_then(DescriptorValue::as_uuid)
    }

    pub fn volume_path(&self) -> Option<&url::Url> {
        self.get(DescriptorKey::VolumePath).and_then(DescriptorValue::as_url)
    }

    pub fn device_path(&self) -> Option<&str> {
        self.get(DescriptorKey::DevicePath).and_then(DescriptorValue::as_str)
    }

    pub fn suggested_uid(&self) -> Option<u64> {
        self.get(DescriptorKey::OwnerUid).and_then(DescriptorValue::as_u64)
    }

    pub fn suggested_gid(&self) -> Option<u64> {
        self.get(DescriptorKey::OwnerGid).and_then(DescriptorValue::as_u64)
    }

    pub fn suggested_mode(&self) -> Option<u64> {
        self.get(DescriptorKey::OwnerMode).and_then(DescriptorValue::as_u64)
    }

    fn bool_or(&self, key: DescriptorKey, default: bool) -> bool {
        self.get(key).and_then(DescriptorValue::as_bool).unwrap_or(default)
    }

    /// True if every entry in `predicate` equals the corresponding entry
    /// here (spec.md §4.4: "all listed key/value pairs equal").
    pub fn matches(&self, predicate: &BTreeMap<DescriptorKey, DescriptorValue>) -> bool {
        predicate.iter().all(|(k, v)| self.fields.get(k) == Some(v))
    }

    /// Diffs `self` (the new state) against `previous`, returning the keys
    /// among `DescriptorKey::WATCHED_ON_PROPERTY_CHANGE` whose value
    /// differs (spec.md §4.3).
    pub fn diff_changed_keys(&self, previous: &Descriptor) -> Vec<DescriptorKey> {
        DescriptorKey::WATCHED_ON_PROPERTY_CHANGE
            .iter()
            .copied()
            .filter(|k| self.fields.get(k) != previous.fields.get(k))
            .collect()
    }

    pub fn to_wire(&self) -> crate::proto::descriptor::Descriptor {
        crate::proto::descriptor::Descriptor {
            fields: self
                .fields
                .iter()
                .map(|(k, v)| (k.name().to_string(), v.to_wire()))
                .collect(),
        }
    }

    pub fn from_wire(wire: &crate::proto::descriptor::Descriptor) -> Self {
        Self {
            fields: fields_from_wire(&wire.fields),
        }
    }
}

/// Decodes a wire field map — the shape shared by `Descriptor`, `MatchDict`
/// (spec.md §4.4 match predicates), into the typed internal representation.
/// Unrecognized key names or malformed values are dropped rather than
/// rejected outright: a client on a newer wire revision shouldn't be able
/// to wedge a session by sending a key this build doesn't know about.
pub fn fields_from_wire(
    wire: &std::collections::HashMap<String, crate::proto::descriptor::DescriptorValue>,
) -> BTreeMap<DescriptorKey, DescriptorValue> {
    wire.iter()
        .filter_map(|(name, v)| {
            let key = DescriptorKey::from_name(name)?;
            let value = DescriptorValue::from_wire(v)?;
            Some((key, value))
        })
        .collect()
}

fn kind_of(value: &DescriptorValue) -> DescriptorValueKind {
    match value {
        DescriptorValue::Bool(_) => DescriptorValueKind::Bool,
        DescriptorValue::UInt(_) => DescriptorValueKind::UInt,
        DescriptorValue::Int(_) => DescriptorValueKind::Int,
        DescriptorValue::String(_) => DescriptorValueKind::String,
        DescriptorValue::Uuid(_) => DescriptorValueKind::Uuid,
        DescriptorValue::Url(_) => DescriptorValueKind::Url,
        DescriptorValue::Data(_) => DescriptorValueKind::Data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_round_trip() {
        let mut d = Descriptor::new();
        d.set(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(true));
        d.set(DescriptorKey::DeviceSize, DescriptorValue::UInt(4_096_000));
        d.set(
            DescriptorKey::MediaName,
            DescriptorValue::String("USB".into()),
        );

        assert!(d.is_removable());
        assert_eq!(d.media_size(), Some(4_096_000));
        assert_eq!(d.media_name(), Some("USB"));
        assert!(!d.is_internal());
    }

    #[test]
    fn diff_changed_keys_reports_only_watched_differences() {
        let mut before = Descriptor::new();
        before.set(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(true));
        before.set(DescriptorKey::OwnerUid, DescriptorValue::UInt(501));

        let mut after = before.clone();
        after.set(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(false));
        after.set(DescriptorKey::OwnerUid, DescriptorValue::UInt(502));

        let changed = after.diff_changed_keys(&before);
        assert_eq!(changed, vec![DescriptorKey::DeviceRemovable]);
    }

    #[test]
    fn matches_requires_all_predicate_entries_equal() {
        let mut d = Descriptor::new();
        d.set(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(true));
        d.set(DescriptorKey::MediaName, DescriptorValue::String("X".into()));

        let mut predicate = BTreeMap::new();
        predicate.insert(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(true));
        assert!(d.matches(&predicate));

        predicate.insert(DescriptorKey::MediaName, DescriptorValue::String("Y".into()));
        assert!(!d.matches(&predicate));
    }
}
