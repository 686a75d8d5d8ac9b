use crate::proto::request::ArbitrationStatus;
use thiserror::Error;

/// The closed set of error kinds surfaced to RPC clients (spec.md §7).
///
/// Every request completion and RPC reply carries one of these. The variant
/// names intentionally mirror the wire enum (`ArbitrationStatus`) so the two
/// stay trivially convertible; keeping them as a distinct Rust type (instead
/// of using the generated enum everywhere) lets subsystem code attach
/// `#[source]`/detail without fighting prost's derive set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArbitrationError {
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("not permitted: {0}")]
    NotPermitted(String),
    #[error("not privileged")]
    NotPrivileged,
    #[error("not ready")]
    NotReady,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("canceled")]
    Canceled,
    #[error("exclusive access held by another session")]
    ExclusiveAccess,
    #[error("no resources available")]
    NoResources,
    #[error("dirty volume")]
    DirtyVolume,
    #[error("unsupported file system: {0}")]
    UnsupportedFileSystem(String),
}

impl ArbitrationError {
    pub fn status(&self) -> ArbitrationStatus {
        match self {
            ArbitrationError::BadArgument(_) => ArbitrationStatus::BadArgument,
            ArbitrationError::NotPermitted(_) => ArbitrationStatus::NotPermitted,
            ArbitrationError::NotPrivileged => ArbitrationStatus::NotPrivileged,
            ArbitrationError::NotReady => ArbitrationStatus::NotReady,
            ArbitrationError::NotFound(_) => ArbitrationStatus::NotFound,
            ArbitrationError::Busy(_) => ArbitrationStatus::Busy,
            ArbitrationError::Canceled => ArbitrationStatus::Canceled,
            ArbitrationError::ExclusiveAccess => ArbitrationStatus::ExclusiveAccess,
            ArbitrationError::NoResources => ArbitrationStatus::NoResources,
            ArbitrationError::DirtyVolume => ArbitrationStatus::DirtyVolume,
            ArbitrationError::UnsupportedFileSystem(_) => ArbitrationStatus::UnsupportedFileSystem,
        }
    }

    pub fn detail(&self) -> String {
        self.to_string()
    }

    /// Inverse of `status`, used to decode a client-submitted dissent
    /// (spec.md §6 `SessionQueueResponse`) back into an `ArbitrationError`.
    /// Returns `None` for `Success`/unspecified, since those carry no error.
    pub fn from_status(status: ArbitrationStatus, detail: impl Into<String>) -> Option<Self> {
        let detail = detail.into();
        Some(match status {
            ArbitrationStatus::Success | ArbitrationStatus::StatusUnspecified => return None,
            ArbitrationStatus::BadArgument => ArbitrationError::BadArgument(detail),
            ArbitrationStatus::NotPermitted => ArbitrationError::NotPermitted(detail),
            ArbitrationStatus::NotPrivileged => ArbitrationError::NotPrivileged,
            ArbitrationStatus::NotReady => ArbitrationError::NotReady,
            ArbitrationStatus::NotFound => ArbitrationError::NotFound(detail),
            ArbitrationStatus::Busy => ArbitrationError::Busy(detail),
            ArbitrationStatus::Canceled => ArbitrationError::Canceled,
            ArbitrationStatus::ExclusiveAccess => ArbitrationError::ExclusiveAccess,
            ArbitrationStatus::NoResources => ArbitrationError::NoResources,
            ArbitrationStatus::DirtyVolume => ArbitrationError::DirtyVolume,
            ArbitrationStatus::UnsupportedFileSystem => ArbitrationError::UnsupportedFileSystem(detail),
        })
    }

    /// Process exit code an uncaught, startup-time instance of this error
    /// should translate to (spec.md §6/§7). RPC-scoped errors never reach
    /// this path; it only matters for the handful of fatal startup checks.
    pub fn exit_code(&self) -> i32 {
        match self {
            ArbitrationError::BadArgument(_) => 64,
            ArbitrationError::NotPrivileged => 77,
            ArbitrationError::NotReady => 69,
            _ => 70,
        }
    }
}
