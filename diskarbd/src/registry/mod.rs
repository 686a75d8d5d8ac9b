mod callback;
mod disk;
mod disk_registry;
mod mount_point_registry;
mod request;
mod session;
mod session_registry;
mod unit;
mod unit_registry;

pub use callback::{is_approval_kind, Callback};
pub use disk::{Disk, DiskState};
pub use disk_registry::DiskRegistry;
pub use mount_point_registry::MountPointRegistry;
pub use request::{Request, RequestIdAllocator};
pub use session::{Session, SessionState};
pub use session_registry::SessionRegistry;
pub use unit::{Unit, UnitState};
pub use unit_registry::UnitRegistry;
