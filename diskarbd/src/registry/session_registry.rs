use super::session::Session;
use rustc_hash::FxHashMap;

/// Tracks connected clients (spec.md §3).
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: FxHashMap<u64, Session>,
    next_id: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: FxHashMap::default(),
            next_id: 1,
        }
    }

    /// `SessionCreate` (spec.md §6).
    pub fn create(&mut self, client_name: String, pid: u32) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(id, Session::new(id, client_name, pid));
        id
    }

    pub fn lookup(&self, id: u64) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn lookup_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// `SessionRelease`. Idempotent: releasing an already-released (or
    /// never-existent) session returns `false` (invariant 10).
    pub fn release(&mut self, id: u64) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_idempotent() {
        let mut reg = SessionRegistry::new();
        let id = reg.create("client".into(), 100);
        assert!(reg.release(id));
        assert!(!reg.release(id));
    }

    #[test]
    fn ids_are_monotonic_and_unique() {
        let mut reg = SessionRegistry::new();
        let a = reg.create("a".into(), 1);
        let b = reg.create("b".into(), 2);
        assert_ne!(a, b);
    }
}
