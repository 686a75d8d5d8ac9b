/// Well-known descriptor keys (spec.md §3). Each key maps to a fixed value
/// type (invariant (i) in §3) — see `DescriptorKey::value_kind` and the
/// typed accessors on `Descriptor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DescriptorKey {
    // Device attributes
    DeviceInternal,
    DeviceRemovable,
    DeviceWritable,
    DeviceBlockSize,
    DeviceSize,
    DeviceTdmLocked,
    DeviceWholeMedia,
    DeviceLeaf,
    DeviceBusPath,
    DeviceNetworkAttached,
    DeviceLogicalVolumeFamily,
    MediaEncrypted,
    MediaEncryptionDetail,
    MediaContentUuid,
    MediaUuid,
    MediaName,
    MediaType,
    MediaContentRole,
    DevicePath,
    DeviceRawDevicePath,

    // Volume attributes
    VolumeKind,
    VolumeName,
    VolumeUuid,
    VolumePath,
    VolumeMountable,

    // Ownership hints
    OwnerUid,
    OwnerGid,
    OwnerMode,
}

/// The declared wire/value type for a given key, used by the typed
/// accessors to guard against cross-key confusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorValueKind {
    Bool,
    UInt,
    Int,
    String,
    Uuid,
    Url,
    Data,
}

impl DescriptorKey {
    /// Canonical wire name, matching the original daemon's `DAMediaXxx` /
    /// `DAVolumeXxx` naming so diagnostics stay recognizable.
    pub fn name(self) -> &'static str {
        use DescriptorKey::*;
        match self {
            DeviceInternal => "DADeviceInternal",
            DeviceRemovable => "DADeviceRemovable",
            DeviceWritable => "DAMediaWritable",
            DeviceBlockSize => "DAMediaBlockSize",
            DeviceSize => "DAMediaSize",
            DeviceTdmLocked => "DADeviceTDMLocked",
            DeviceWholeMedia => "DAMediaWhole",
            DeviceLeaf => "DAMediaLeaf",
            DeviceBusPath => "DADeviceBusPath",
            DeviceNetworkAttached => "DADeviceNetworkAttached",
            DeviceLogicalVolumeFamily => "DADeviceLogicalVolumeFamily",
            MediaEncrypted => "DAMediaEncrypted",
            MediaEncryptionDetail => "DAMediaEncryptionDetail",
            MediaContentUuid => "DAMediaContentUUID",
            MediaUuid => "DAMediaUUID",
            MediaName => "DAMediaName",
            MediaType => "DAMediaKind",
            MediaContentRole => "DAMediaContentRole",
            DevicePath => "DADevicePath",
            DeviceRawDevicePath => "DADeviceRawPath",
            VolumeKind => "DAVolumeKind",
            VolumeName => "DAVolumeName",
            VolumeUuid => "DAVolumeUUID",
            VolumePath => "DAVolumePath",
            VolumeMountable => "DAVolumeMountable",
            OwnerUid => "DAOwnerUID",
            OwnerGid => "DAOwnerGID",
            OwnerMode => "DAOwnerMode",
        }
    }

    /// Inverse of `name`, used to decode wire `MatchDict`/`WatchSet` keys
    /// back into the typed enum at the RPC boundary.
    pub fn from_name(name: &str) -> Option<Self> {
        use DescriptorKey::*;
        Some(match name {
            "DADeviceInternal" => DeviceInternal,
            "DADeviceRemovable" => DeviceRemovable,
            "DAMediaWritable" => DeviceWritable,
            "DAMediaBlockSize" => DeviceBlockSize,
            "DAMediaSize" => DeviceSize,
            "DADeviceTDMLocked" => DeviceTdmLocked,
            "DAMediaWhole" => DeviceWholeMedia,
            "DAMediaLeaf" => DeviceLeaf,
            "DADeviceBusPath" => DeviceBusPath,
            "DADeviceNetworkAttached" => DeviceNetworkAttached,
            "DADeviceLogicalVolumeFamily" => DeviceLogicalVolumeFamily,
            "DAMediaEncrypted" => MediaEncrypted,
            "DAMediaEncryptionDetail" => MediaEncryptionDetail,
            "DAMediaContentUUID" => MediaContentUuid,
            "DAMediaUUID" => MediaUuid,
            "DAMediaName" => MediaName,
            "DAMediaKind" => MediaType,
            "DAMediaContentRole" => MediaContentRole,
            "DADevicePath" => DevicePath,
            "DADeviceRawPath" => DeviceRawDevicePath,
            "DAVolumeKind" => VolumeKind,
            "DAVolumeName" => VolumeName,
            "DAVolumeUUID" => VolumeUuid,
            "DAVolumePath" => VolumePath,
            "DAVolumeMountable" => VolumeMountable,
            "DAOwnerUID" => OwnerUid,
            "DAOwnerGID" => OwnerGid,
            "DAOwnerMode" => OwnerMode,
            _ => return None,
        })
    }

    pub fn value_kind(self) -> DescriptorValueKind {
        use DescriptorKey::*;
        use DescriptorValueKind as K;
        match self {
            DeviceInternal | DeviceRemovable | DeviceWritable | DeviceTdmLocked
            | DeviceWholeMedia | DeviceLeaf | DeviceNetworkAttached | MediaEncrypted
            | VolumeMountable => K::Bool,
            DeviceBlockSize | DeviceSize | OwnerUid | OwnerGid | OwnerMode => K::UInt,
            MediaContentUuid | MediaUuid | VolumeUuid => K::Uuid,
            VolumePath => K::Url,
            MediaEncryptionDetail => K::Data,
            MediaName | MediaType | MediaContentRole | DevicePath | DeviceRawDevicePath
            | DeviceBusPath | DeviceLogicalVolumeFamily | VolumeKind | VolumeName => K::String,
        }
    }

    /// All keys watched for property-change reconciliation (spec.md §4.3).
    pub const WATCHED_ON_PROPERTY_CHANGE: &'static [DescriptorKey] = &[
        DescriptorKey::MediaContentUuid,
        DescriptorKey::DeviceWholeMedia, // "ejectable" stand-in: whole-media toggles with ejectability
        DescriptorKey::DeviceLeaf,
        DescriptorKey::DeviceBlockSize,
        DescriptorKey::DeviceRemovable,
        DescriptorKey::DeviceSize,
        DescriptorKey::DeviceWritable,
        DescriptorKey::MediaEncrypted,
        DescriptorKey::DeviceTdmLocked,
        DescriptorKey::VolumeName,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_round_trips_through_its_wire_name() {
        let all = [
            DescriptorKey::DeviceInternal,
            DescriptorKey::DeviceRemovable,
            DescriptorKey::DeviceWritable,
            DescriptorKey::DeviceBlockSize,
            DescriptorKey::DeviceSize,
            DescriptorKey::DeviceTdmLocked,
            DescriptorKey::DeviceWholeMedia,
            DescriptorKey::DeviceLeaf,
            DescriptorKey::DeviceBusPath,
            DescriptorKey::DeviceNetworkAttached,
            DescriptorKey::DeviceLogicalVolumeFamily,
            DescriptorKey::MediaEncrypted,
            DescriptorKey::MediaEncryptionDetail,
            DescriptorKey::MediaContentUuid,
            DescriptorKey::MediaUuid,
            DescriptorKey::MediaName,
            DescriptorKey::MediaType,
            DescriptorKey::MediaContentRole,
            DescriptorKey::DevicePath,
            DescriptorKey::DeviceRawDevicePath,
            DescriptorKey::VolumeKind,
            DescriptorKey::VolumeName,
            DescriptorKey::VolumeUuid,
            DescriptorKey::VolumePath,
            DescriptorKey::VolumeMountable,
            DescriptorKey::OwnerUid,
            DescriptorKey::OwnerGid,
            DescriptorKey::OwnerMode,
        ];
        for key in all {
            assert_eq!(DescriptorKey::from_name(key.name()), Some(key));
        }
        assert_eq!(DescriptorKey::from_name("bogus"), None);
    }
}
