use shared::descriptor::Descriptor;
use tokio::sync::mpsc;

/// A notification from the kernel storage subsystem or the mount table
/// (spec.md §4.3 Sources).
#[derive(Debug, Clone)]
pub enum KernelEvent {
    MediaAppeared {
        kernel_object: String,
        unit_id: Option<u32>,
        descriptor: Descriptor,
    },
    MediaDisappeared {
        kernel_object: String,
    },
    MediaPropertyChanged {
        kernel_object: String,
        descriptor: Descriptor,
    },
    MountTableChanged,
}

/// Abstracts the concrete kernel-notification transport so Event Ingest's
/// appearance/disappearance/property-change/mount-table logic (spec.md
/// §4.3) is independent of it. The shipped implementation
/// (`udev_source::UdevEventSource`) monitors Linux's `udev` netlink
/// subsystem; a test double can replay a scripted event sequence to drive
/// the queue-crossing invariant (spec.md §8, invariant 8).
pub trait KernelEventSource: Send {
    /// Runs the source to completion (or until the receiver is dropped),
    /// sending events as they occur. Implementations that need a blocking
    /// read loop should be driven via `tokio::task::spawn_blocking`
    /// (spec.md §9 "External helper dispatch" Design Note: long-running
    /// collaborators communicate through a channel, not synchronous calls
    /// from the event loop).
    fn run(self: Box<Self>, tx: mpsc::UnboundedSender<KernelEvent>);
}
