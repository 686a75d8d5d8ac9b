mod connection;
mod telemetry;

pub use connection::init_database;
pub use telemetry::{DiskEvent, RequestEvent, SessionEvent, UnitEvent};
