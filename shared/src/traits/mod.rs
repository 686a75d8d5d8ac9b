mod auditable;

pub use auditable::Auditable;
