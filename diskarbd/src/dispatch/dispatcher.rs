//! Callback Dispatcher (spec.md §4.4): fans out lifecycle notifications and
//! approval solicitations to subscribed sessions, collects dissents, and
//! tracks the global idle predicate.

use super::approval::PendingApproval;
use crate::registry::{is_approval_kind, Disk, DiskState, Session, SessionRegistry};
use rustc_hash::FxHashMap;
use shared::descriptor::DescriptorKey;
use shared::errors::ArbitrationError;
use shared::proto::callback::{CallbackInvocation, CallbackKind};
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct CallbackDispatcher {
    next_response_id: u64,
    pending_approvals: FxHashMap<u64, PendingApproval>,
    idle: bool,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self {
            next_response_id: 1,
            pending_approvals: FxHashMap::default(),
            idle: true,
        }
    }

    /// Delivers `disk-appeared` to every session whose appearance callback
    /// matches (spec.md §4.5 Appear stage).
    pub fn dispatch_appeared(&mut self, sessions: &mut SessionRegistry, disk: &Disk) {
        self.fan_out(sessions, disk, CallbackKind::DiskAppeared, &[]);
    }

    pub fn dispatch_disappeared(&mut self, sessions: &mut SessionRegistry, disk: &Disk) {
        self.fan_out(sessions, disk, CallbackKind::DiskDisappeared, &[]);
    }

    pub fn dispatch_description_changed(
        &mut self,
        sessions: &mut SessionRegistry,
        disk: &Disk,
        changed_keys: &[DescriptorKey],
    ) {
        self.fan_out(sessions, disk, CallbackKind::DiskDescriptionChanged, changed_keys);
    }

    pub fn dispatch_peek(&mut self, sessions: &mut SessionRegistry, disk: &Disk) {
        self.fan_out(sessions, disk, CallbackKind::DiskPeek, &[]);
    }

    pub fn dispatch_claim_release(&mut self, sessions: &mut SessionRegistry, disk: &Disk) {
        self.fan_out(sessions, disk, CallbackKind::DiskClaimRelease, &[]);
    }

    /// Opens a mount/unmount/eject solicitation against every matching
    /// session (spec.md §4.4 Approvals, §9 Design Note). Returns `None`
    /// immediately (quorum of zero) when no session has a matching
    /// approval callback registered.
    pub fn solicit_approval(
        &mut self,
        sessions: &mut SessionRegistry,
        disk: &Disk,
        kind: CallbackKind,
    ) -> Option<u64> {
        debug_assert!(is_approval_kind(kind));
        let response_id = self.next_response_id;
        self.next_response_id += 1;

        let mut expected = HashSet::new();
        for session in sessions.iter_mut() {
            let matching: Vec<_> = ordered_matching_callbacks(session, disk, kind, &[]);
            if matching.is_empty() {
                continue;
            }
            for callback in matching {
                let invocation = CallbackInvocation {
                    kind: kind as i32,
                    disk_id: disk.id.clone(),
                    address: callback.address,
                    context: callback.context,
                    response_id,
                    changed_keys: vec![],
                };
                session.enqueue(invocation);
            }
            expected.insert(session.id);
        }

        if expected.is_empty() {
            return None;
        }
        self.pending_approvals
            .insert(response_id, PendingApproval::new(response_id, disk.id.clone(), expected));
        Some(response_id)
    }

    /// `SessionQueueResponse` (spec.md §6). Returns `Some(outcome)` once
    /// quorum completes.
    pub fn record_response(
        &mut self,
        response_id: u64,
        session_id: u64,
        dissent: Option<ArbitrationError>,
    ) -> Option<Result<(), ArbitrationError>> {
        let approval = self.pending_approvals.get_mut(&response_id)?;
        approval.record_response(session_id, dissent);
        if approval.is_complete() {
            let outcome = approval.outcome();
            self.pending_approvals.remove(&response_id);
            Some(outcome)
        } else {
            None
        }
    }

    /// A session tore down: resolve any pending approvals it owed a
    /// response to as implicit approval (spec.md §5 Cancellation).
    pub fn session_torn_down(&mut self, session_id: u64) -> Vec<(u64, Result<(), ArbitrationError>)> {
        let mut completed = Vec::new();
        self.pending_approvals.retain(|response_id, approval| {
            approval.record_session_teardown(session_id);
            if approval.is_complete() {
                completed.push((*response_id, approval.outcome()));
                false
            } else {
                true
            }
        });
        completed
    }

    pub fn has_outstanding_approvals(&self) -> bool {
        !self.pending_approvals.is_empty()
    }

    /// Replays appearance for every currently-appeared disk to a newly
    /// registering session, then `disk-list-complete`, then `idle` if the
    /// system is currently idle (spec.md §4.4 Registration).
    pub fn replay_appearance_on_registration<'a>(
        &mut self,
        session: &mut Session,
        disks: impl Iterator<Item = &'a Disk>,
    ) {
        let matching: Vec<_> = session
            .callbacks
            .iter()
            .filter(|c| c.kind == CallbackKind::DiskAppeared)
            .cloned()
            .collect();
        if matching.is_empty() {
            return;
        }
        for disk in disks.filter(|d| d.state.contains(DiskState::STAGED_APPEAR)) {
            for callback in &matching {
                if !callback.matches(&disk.descriptor) {
                    continue;
                }
                session.enqueue(CallbackInvocation {
                    kind: CallbackKind::DiskAppeared as i32,
                    disk_id: disk.id.clone(),
                    address: callback.address,
                    context: callback.context,
                    response_id: 0,
                    changed_keys: vec![],
                });
            }
        }
        session.enqueue(CallbackInvocation {
            kind: CallbackKind::DiskListComplete as i32,
            disk_id: String::new(),
            address: 0,
            context: 0,
            response_id: 0,
            changed_keys: vec![],
        });
        if self.idle {
            self.deliver_idle_to(session);
        }
    }

    /// `idle` registration-time delivery for a newly-registered idle
    /// callback (spec.md §4.4 Registration).
    pub fn replay_idle_on_registration(&mut self, session: &mut Session, kind: CallbackKind) {
        if kind == CallbackKind::Idle && self.idle {
            self.deliver_idle_to(session);
        }
    }

    /// Re-evaluates the idle predicate (spec.md §4.4 Idle tracking,
    /// invariant 5). Broadcasts `idle` only on a false→true edge, to every
    /// session not already flagged idle-observed.
    pub fn update_idle(&mut self, sessions: &mut SessionRegistry, is_idle: bool) {
        if is_idle && !self.idle {
            self.idle = true;
            for session in sessions.iter_mut() {
                if !session.is_idle_observed() {
                    self.deliver_idle_to(session);
                }
            }
        } else if !is_idle {
            self.idle = false;
            for session in sessions.iter_mut() {
                session.mark_idle_observed(false);
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    fn deliver_idle_to(&self, session: &mut Session) {
        session.enqueue(CallbackInvocation {
            kind: CallbackKind::Idle as i32,
            disk_id: String::new(),
            address: 0,
            context: 0,
            response_id: 0,
            changed_keys: vec![],
        });
        session.mark_idle_observed(true);
    }

    fn fan_out(
        &mut self,
        sessions: &mut SessionRegistry,
        disk: &Disk,
        kind: CallbackKind,
        changed_keys: &[DescriptorKey],
    ) {
        let changed_names: Vec<String> = changed_keys.iter().map(|k| k.name().to_string()).collect();
        for session in sessions.iter_mut() {
            for callback in ordered_matching_callbacks(session, disk, kind, changed_keys) {
                session.enqueue(CallbackInvocation {
                    kind: kind as i32,
                    disk_id: disk.id.clone(),
                    address: callback.address,
                    context: callback.context,
                    response_id: 0,
                    changed_keys: changed_names.clone(),
                });
            }
        }
    }
}

/// Callbacks of `kind` on `session` whose match/watch predicates hold for
/// `disk`, ordered by (order, insertion sequence) (spec.md §4.4 Fan-out).
fn ordered_matching_callbacks(
    session: &Session,
    disk: &Disk,
    kind: CallbackKind,
    changed_keys: &[DescriptorKey],
) -> Vec<crate::registry::Callback> {
    let mut matching: Vec<_> = session
        .callbacks
        .iter()
        .filter(|c| c.kind == kind)
        .filter(|c| c.matches(&disk.descriptor))
        .filter(|c| kind != CallbackKind::DiskDescriptionChanged || c.watches_any(changed_keys))
        .cloned()
        .collect();
    matching.sort_by_key(|c| c.sort_key());
    matching
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Callback, Disk, DiskState, SessionRegistry};
    use shared::descriptor::Descriptor;

    fn appeared_disk(id: &str) -> Disk {
        let mut disk = Disk::new(id, Descriptor::new());
        disk.state |= DiskState::STAGED_APPEAR;
        disk
    }

    #[test]
    fn solicitation_with_no_subscribers_resolves_to_none() {
        let mut dispatcher = CallbackDispatcher::new();
        let mut sessions = SessionRegistry::new();
        let disk = appeared_disk("sdb1");
        assert!(dispatcher
            .solicit_approval(&mut sessions, &disk, CallbackKind::DiskMountApproval)
            .is_none());
    }

    #[test]
    fn solicitation_waits_for_every_matching_session() {
        let mut dispatcher = CallbackDispatcher::new();
        let mut sessions = SessionRegistry::new();
        let id1 = sessions.create("a".into(), 1);
        let id2 = sessions.create("b".into(), 2);
        for id in [id1, id2] {
            sessions.lookup_mut(id).unwrap().register_callback(Callback {
                kind: CallbackKind::DiskMountApproval,
                order: 0,
                address: id,
                context: 0,
                match_dict: None,
                watch_set: None,
                sequence: 0,
            });
        }

        let disk = appeared_disk("sdb1");
        let response_id = dispatcher
            .solicit_approval(&mut sessions, &disk, CallbackKind::DiskMountApproval)
            .unwrap();

        assert!(dispatcher.record_response(response_id, id1, None).is_none());
        let outcome = dispatcher.record_response(response_id, id2, None).unwrap();
        assert_eq!(outcome, Ok(()));
    }

    #[test]
    fn idle_broadcasts_only_on_false_to_true_edge() {
        let mut dispatcher = CallbackDispatcher::new();
        dispatcher.idle = false;
        let mut sessions = SessionRegistry::new();
        let id = sessions.create("a".into(), 1);
        sessions.lookup_mut(id).unwrap().register_callback(Callback {
            kind: CallbackKind::Idle,
            order: 0,
            address: 0,
            context: 0,
            match_dict: None,
            watch_set: None,
            sequence: 0,
        });

        dispatcher.update_idle(&mut sessions, true);
        assert_eq!(sessions.lookup(id).unwrap().pending_queue.len(), 1);

        dispatcher.update_idle(&mut sessions, true);
        assert_eq!(sessions.lookup(id).unwrap().pending_queue.len(), 1);
    }
}
