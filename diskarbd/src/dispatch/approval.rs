use shared::errors::ArbitrationError;
use std::collections::HashSet;

/// An in-flight mount/unmount/eject solicitation (spec.md §4.4, §9 Design
/// Note "Approval gating via callback queues"): modeled as an explicit
/// record accumulating responses rather than a bare scatter-gather, with a
/// count of still-expected responders decremented on response or session
/// teardown.
#[derive(Debug)]
pub struct PendingApproval {
    pub response_id: u64,
    pub disk_id: String,
    /// Sessions whose approval callback matched and is still awaited.
    still_expected: HashSet<u64>,
    /// First non-empty dissent observed, if any (invariant 4: dissent
    /// precedence — first dissent wins, operation fails with its status).
    dissent: Option<ArbitrationError>,
}

impl PendingApproval {
    pub fn new(response_id: u64, disk_id: impl Into<String>, expected_sessions: HashSet<u64>) -> Self {
        Self {
            response_id,
            disk_id: disk_id.into(),
            still_expected: expected_sessions,
            dissent: None,
        }
    }

    /// A response arrived from `session_id`. `dissent` is `Some` if the
    /// response carried a non-empty dissent status.
    pub fn record_response(&mut self, session_id: u64, dissent: Option<ArbitrationError>) {
        self.still_expected.remove(&session_id);
        if self.dissent.is_none() {
            self.dissent = dissent;
        }
    }

    /// Session torn down before responding: treated as implicit "approve
    /// with no dissent" (spec.md §5, Cancellation).
    pub fn record_session_teardown(&mut self, session_id: u64) {
        self.still_expected.remove(&session_id);
    }

    pub fn is_complete(&self) -> bool {
        self.still_expected.is_empty()
    }

    /// `Ok(())` if quorum completed with no dissent; the dissent's error
    /// otherwise. Panics if called before `is_complete()`.
    pub fn outcome(&self) -> Result<(), ArbitrationError> {
        debug_assert!(self.is_complete());
        match &self.dissent {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_only_after_all_responders() {
        let mut approval = PendingApproval::new(1, "sdb1", HashSet::from([10, 20]));
        assert!(!approval.is_complete());
        approval.record_response(10, None);
        assert!(!approval.is_complete());
        approval.record_response(20, None);
        assert!(approval.is_complete());
        assert_eq!(approval.outcome(), Ok(()));
    }

    #[test]
    fn first_dissent_wins() {
        let mut approval = PendingApproval::new(1, "sdb1", HashSet::from([10, 20]));
        approval.record_response(10, Some(ArbitrationError::NotPermitted("no".into())));
        approval.record_response(20, Some(ArbitrationError::Busy("also no".into())));
        assert!(approval.is_complete());
        assert_eq!(
            approval.outcome(),
            Err(ArbitrationError::NotPermitted("no".into()))
        );
    }

    #[test]
    fn session_teardown_counts_as_implicit_approval() {
        let mut approval = PendingApproval::new(1, "sdb1", HashSet::from([10]));
        approval.record_session_teardown(10);
        assert!(approval.is_complete());
        assert_eq!(approval.outcome(), Ok(()));
    }
}
