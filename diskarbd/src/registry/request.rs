use shared::errors::ArbitrationError;
use shared::proto::request::RequestKind;
use tokio::sync::oneshot;

/// A client-submitted operation, owned by the RPC handler before queueing
/// and by the Stage Engine afterward (spec.md §3).
pub struct Request {
    pub id: u64,
    pub session_id: u64,
    pub kind: RequestKind,
    pub disk_id: String,
    pub options: u32,
    pub argument1: String,
    pub argument2: String,
    pub caller_euid: u32,
    pub caller_egid: u32,
    pub address: u64,
    pub context: u64,
    /// Whether this request was issued automatically (e.g. appearance-time
    /// auto-mount) rather than by explicit client action; drives the
    /// auto-retry rule (spec.md §4.5, invariant 7).
    pub automatic: bool,
    pub canceled: bool,
    completion: Option<oneshot::Sender<Result<(), ArbitrationError>>>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        session_id: u64,
        kind: RequestKind,
        disk_id: String,
        options: u32,
        argument1: String,
        argument2: String,
        caller_euid: u32,
        caller_egid: u32,
        address: u64,
        context: u64,
        completion: oneshot::Sender<Result<(), ArbitrationError>>,
    ) -> Self {
        Self {
            id,
            session_id,
            kind,
            disk_id,
            options,
            argument1,
            argument2,
            caller_euid,
            caller_egid,
            address,
            context,
            automatic: false,
            canceled: false,
            completion: Some(completion),
        }
    }

    pub fn complete(&mut self, result: Result<(), ArbitrationError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }

    /// Cancellable until the helper invocation has begun (spec.md §5).
    pub fn cancel(&mut self) {
        self.canceled = true;
        self.complete(Err(ArbitrationError::Canceled));
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_none()
    }
}

/// Monotonic request-id allocator, mirroring the session-id allocator's
/// shape (`SessionRegistry::create`).
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    next: u64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}
