use super::callback::Callback;
use bitflags::bitflags;
use shared::constants::CALLBACK_QUEUE_STALL_THRESHOLD;
use shared::proto::callback::CallbackInvocation;
use std::collections::VecDeque;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionState: u32 {
        const IDLE_OBSERVED = 1 << 0;
        const TIMEOUT       = 1 << 1;
    }
}

/// A connected client (spec.md §3).
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub client_name: String,
    pub pid: u32,
    pub client_endpoint: Option<String>,
    pub authorization: Option<Vec<u8>>,
    pub callbacks: Vec<Callback>,
    pub pending_queue: VecDeque<CallbackInvocation>,
    pub state: SessionState,
    next_callback_sequence: u64,
}

impl Session {
    pub fn new(id: u64, client_name: String, pid: u32) -> Self {
        Self {
            id,
            client_name,
            pid,
            client_endpoint: None,
            authorization: None,
            callbacks: Vec::new(),
            pending_queue: VecDeque::new(),
            state: SessionState::empty(),
            next_callback_sequence: 0,
        }
    }

    pub fn register_callback(&mut self, mut callback: Callback) {
        callback.sequence = self.next_callback_sequence;
        self.next_callback_sequence += 1;
        self.callbacks.push(callback);
    }

    pub fn unregister_callback(&mut self, address: u64, context: u64) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|c| !(c.address == address && c.context == context));
        self.callbacks.len() != before
    }

    /// Enqueues an invocation for later draining, marking the session
    /// `timeout`-eligible if the queue exceeds the stall threshold
    /// (spec.md §4.4).
    pub fn enqueue(&mut self, invocation: CallbackInvocation) {
        self.pending_queue.push_back(invocation);
        if self.pending_queue.len() > CALLBACK_QUEUE_STALL_THRESHOLD {
            self.state |= SessionState::TIMEOUT;
        }
    }

    /// Drains the entire pending queue (`SessionCopyCallbackQueue`,
    /// spec.md §6).
    pub fn drain_queue(&mut self) -> Vec<CallbackInvocation> {
        self.pending_queue.drain(..).collect()
    }

    pub fn is_idle_observed(&self) -> bool {
        self.state.contains(SessionState::IDLE_OBSERVED)
    }

    pub fn mark_idle_observed(&mut self, idle: bool) {
        self.state.set(SessionState::IDLE_OBSERVED, idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::proto::callback::CallbackKind;

    #[test]
    fn register_assigns_monotonic_sequence() {
        let mut s = Session::new(1, "client".into(), 100);
        s.register_callback(Callback {
            kind: CallbackKind::DiskAppeared,
            order: 0,
            address: 1,
            context: 1,
            match_dict: None,
            watch_set: None,
            sequence: 0,
        });
        s.register_callback(Callback {
            kind: CallbackKind::DiskAppeared,
            order: 0,
            address: 2,
            context: 2,
            match_dict: None,
            watch_set: None,
            sequence: 0,
        });
        assert_eq!(s.callbacks[0].sequence, 0);
        assert_eq!(s.callbacks[1].sequence, 1);
    }

    #[test]
    fn queue_beyond_threshold_marks_timeout() {
        let mut s = Session::new(1, "client".into(), 100);
        for _ in 0..=CALLBACK_QUEUE_STALL_THRESHOLD {
            s.enqueue(CallbackInvocation {
                kind: CallbackKind::DiskAppeared as i32,
                disk_id: "sdb1".into(),
                address: 0,
                context: 0,
                response_id: 0,
                changed_keys: vec![],
            });
        }
        assert!(s.state.contains(SessionState::TIMEOUT));
    }
}
