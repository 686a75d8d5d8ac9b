mod approval;
mod dispatcher;

pub use approval::PendingApproval;
pub use dispatcher::CallbackDispatcher;
