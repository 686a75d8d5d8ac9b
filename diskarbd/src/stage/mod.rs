mod engine;
mod helpers;
mod mount;
mod mount_point;
mod probe;
mod repair;

pub use engine::{advance_mount, complete_request, is_approval_kind_for_request, mark_appeared, AdvanceOutcome};
pub use mount::{
    apply_mount_map_override, compose_mount_options, do_mount, eject, force_unmount, is_mount_eligible,
    lock_logical_volume_family, rename_mount_point, repair_quotas, should_defer, trust_tier, unmount,
};
pub use mount_point::{create_mount_point_dir, remove_if_daemon_created, sanitize_name, sweep_stray_entries, synthesize_mount_point};
pub use probe::probe;
pub use repair::repair;
