//! `udev`-backed `KernelEventSource` (spec.md §4.3): monitors the `block`
//! subsystem's netlink stream for `add`/`remove`/`change` events and
//! translates each into a `Descriptor`.

use super::kernel_source::{KernelEvent, KernelEventSource};
use shared::descriptor::{Descriptor, DescriptorKey, DescriptorValue};
use tokio::sync::mpsc;
use udev::{Device, EventType};

pub struct UdevEventSource;

impl UdevEventSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UdevEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelEventSource for UdevEventSource {
    fn run(self: Box<Self>, tx: mpsc::UnboundedSender<KernelEvent>) {
        let socket = match udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem("block"))
            .and_then(|b| b.listen())
        {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("udev: failed to open block-subsystem monitor: {e}");
                return;
            }
        };

        for event in socket.iter() {
            let device = event.device();
            let Some(kernel_object) = device.sysname().to_str().map(str::to_string) else {
                continue;
            };

            let kernel_event = match event.event_type() {
                EventType::Add | EventType::Change => {
                    let descriptor = descriptor_from_device(&device);
                    let unit_id = whole_media_unit_id(&device);
                    if event.event_type() == EventType::Add {
                        KernelEvent::MediaAppeared { kernel_object, unit_id, descriptor }
                    } else {
                        KernelEvent::MediaPropertyChanged { kernel_object, descriptor }
                    }
                }
                EventType::Remove => KernelEvent::MediaDisappeared { kernel_object },
                _ => continue,
            };

            if tx.send(kernel_event).is_err() {
                log::debug!("udev: ingest channel closed, stopping monitor loop");
                return;
            }
        }
    }
}

fn descriptor_from_device(device: &Device) -> Descriptor {
    let mut descriptor = Descriptor::new();

    let removable = device
        .property_value("ID_BUS")
        .map(|v| v == "usb")
        .unwrap_or(false);
    descriptor.set(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(removable));
    descriptor.set(DescriptorKey::DeviceInternal, DescriptorValue::Bool(!removable));

    let read_only = device
        .attribute_value("ro")
        .and_then(|v| v.to_str())
        .map(|v| v == "1")
        .unwrap_or(false);
    descriptor.set(DescriptorKey::DeviceWritable, DescriptorValue::Bool(!read_only));

    let whole_media = device
        .property_value("DEVTYPE")
        .map(|v| v == "disk")
        .unwrap_or(false);
    descriptor.set(DescriptorKey::DeviceWholeMedia, DescriptorValue::Bool(whole_media));
    descriptor.set(DescriptorKey::DeviceLeaf, DescriptorValue::Bool(!whole_media));

    if let Some(node) = device.devnode().and_then(|p| p.to_str()) {
        descriptor.set(DescriptorKey::DevicePath, DescriptorValue::String(node.to_string()));
        descriptor.set(
            DescriptorKey::DeviceRawDevicePath,
            DescriptorValue::String(node.to_string()),
        );
    }

    if let Some(bus) = device.property_value("ID_PATH").and_then(|v| v.to_str()) {
        descriptor.set(DescriptorKey::DeviceBusPath, DescriptorValue::String(bus.to_string()));
    }

    if let Some(fs_type) = device.property_value("ID_FS_TYPE").and_then(|v| v.to_str()) {
        descriptor.set(DescriptorKey::MediaType, DescriptorValue::String(fs_type.to_string()));
        descriptor.set(DescriptorKey::VolumeKind, DescriptorValue::String(fs_type.to_string()));
    }

    if let Some(label) = device.property_value("ID_FS_LABEL").and_then(|v| v.to_str()) {
        descriptor.set(DescriptorKey::MediaName, DescriptorValue::String(label.to_string()));
        descriptor.set(DescriptorKey::VolumeName, DescriptorValue::String(label.to_string()));
    }

    if let Some(uuid) = device
        .property_value("ID_FS_UUID")
        .and_then(|v| v.to_str())
        .and_then(|s| uuid::Uuid::parse_str(s).ok())
    {
        descriptor.set(DescriptorKey::MediaContentUuid, DescriptorValue::Uuid(uuid));
        descriptor.set(DescriptorKey::VolumeUuid, DescriptorValue::Uuid(uuid));
    }

    descriptor.set(DescriptorKey::VolumeMountable, DescriptorValue::Bool(!whole_media));

    if let Some(size_attr) = device.attribute_value("size").and_then(|v| v.to_str()) {
        if let Ok(sectors) = size_attr.parse::<u64>() {
            descriptor.set(DescriptorKey::DeviceSize, DescriptorValue::UInt(sectors * 512));
        }
    }
    descriptor.set(DescriptorKey::DeviceBlockSize, DescriptorValue::UInt(512));
    descriptor.set(DescriptorKey::DeviceTdmLocked, DescriptorValue::Bool(false));
    descriptor.set(DescriptorKey::MediaEncrypted, DescriptorValue::Bool(false));

    let network_attached = device
        .property_value("ID_BUS")
        .map(|v| v == "iscsi" || v == "nvme-fabrics")
        .unwrap_or(false);
    descriptor.set(
        DescriptorKey::DeviceNetworkAttached,
        DescriptorValue::Bool(network_attached),
    );

    if let Some(vg_name) = device.property_value("DM_VG_NAME").and_then(|v| v.to_str()) {
        descriptor.set(
            DescriptorKey::DeviceLogicalVolumeFamily,
            DescriptorValue::String(vg_name.to_string()),
        );
    }

    descriptor
}

/// Extracts the kernel unit number for a disk's whole-media device, used to
/// group partitions under a shared `Unit` (spec.md §3). `udev` exposes the
/// whole-media device number via `MINOR`/`MAJOR`; the partition table's
/// parent disk number is the unit identity here.
fn whole_media_unit_id(device: &Device) -> Option<u32> {
    device
        .property_value("MINOR")
        .and_then(|v| v.to_str())
        .and_then(|s| s.parse::<u32>().ok())
}
