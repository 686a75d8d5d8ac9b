use super::disk::Disk;
use rustc_hash::FxHashMap;
use shared::errors::ArbitrationError;
use std::collections::VecDeque;

/// The authoritative in-memory table of known disks (spec.md §4.1).
///
/// `order` records insertion order separately from the lookup map so
/// appearance-callback replay (§4.4) can iterate disks in the order clients
/// actually observed them, while lookups stay O(1) via `disks`.
#[derive(Debug, Default)]
pub struct DiskRegistry {
    disks: FxHashMap<String, Disk>,
    order: VecDeque<String>,
}

impl DiskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live disk for `id`, or `None` if absent or zombie (invariant (iv)).
    pub fn lookup(&self, id: &str) -> Option<&Disk> {
        self.disks.get(id).filter(|d| !d.is_zombie())
    }

    pub fn lookup_mut(&mut self, id: &str) -> Option<&mut Disk> {
        self.disks.get_mut(id).filter(|d| !d.is_zombie())
    }

    /// Looks up a disk by the identity of its backing kernel object. In
    /// this implementation device ids are derived directly from the kernel
    /// object (the `udev` device node), so this is the same lookup as
    /// `lookup`; kept distinct to mirror the two call sites in Event
    /// Ingest, which reason about different things even when the
    /// underlying key coincides.
    pub fn lookup_by_kernel_object(&self, kernel_object: &str) -> Option<&Disk> {
        self.lookup(kernel_object)
    }

    /// Returns the disk regardless of zombie status — used when draining
    /// callbacks against a disk mid-teardown (invariant (iv)).
    pub fn lookup_any(&self, id: &str) -> Option<&Disk> {
        self.disks.get(id)
    }

    pub fn lookup_any_mut(&mut self, id: &str) -> Option<&mut Disk> {
        self.disks.get_mut(id)
    }

    /// Inserts a new disk at the front of iteration order (spec.md §4.1).
    /// Rejects duplicate ids (invariant (ii)).
    pub fn insert(&mut self, disk: Disk) -> Result<(), ArbitrationError> {
        if self.disks.contains_key(&disk.id) {
            return Err(ArbitrationError::BadArgument(format!(
                "disk id already present: {}",
                disk.id
            )));
        }
        self.order.push_front(disk.id.clone());
        self.disks.insert(disk.id.clone(), disk);
        Ok(())
    }

    /// Idempotent removal (spec.md §4.1).
    pub fn remove(&mut self, id: &str) -> Option<Disk> {
        self.order.retain(|existing| existing != id);
        self.disks.remove(id)
    }

    /// Iterates live (non-zombie) disks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Disk> {
        self.order
            .iter()
            .filter_map(move |id| self.disks.get(id))
            .filter(|d| !d.is_zombie())
    }

    pub fn len(&self) -> usize {
        self.disks.values().filter(|d| !d.is_zombie()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::descriptor::Descriptor;

    #[test]
    fn insert_rejects_duplicate_ids() {
        let mut reg = DiskRegistry::new();
        reg.insert(Disk::new("sdb1", Descriptor::new())).unwrap();
        let err = reg.insert(Disk::new("sdb1", Descriptor::new())).unwrap_err();
        assert!(matches!(err, ArbitrationError::BadArgument(_)));
    }

    #[test]
    fn lookup_excludes_zombies() {
        let mut reg = DiskRegistry::new();
        reg.insert(Disk::new("sdb1", Descriptor::new())).unwrap();
        reg.lookup_any_mut("sdb1").unwrap().state |= super::super::disk::DiskState::ZOMBIE;
        assert!(reg.lookup("sdb1").is_none());
        assert!(reg.lookup_any("sdb1").is_some());
    }

    #[test]
    fn iteration_preserves_insertion_order_with_newest_first() {
        let mut reg = DiskRegistry::new();
        reg.insert(Disk::new("sdb1", Descriptor::new())).unwrap();
        reg.insert(Disk::new("sdc1", Descriptor::new())).unwrap();
        let ids: Vec<&str> = reg.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["sdc1", "sdb1"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = DiskRegistry::new();
        reg.insert(Disk::new("sdb1", Descriptor::new())).unwrap();
        assert!(reg.remove("sdb1").is_some());
        assert!(reg.remove("sdb1").is_none());
    }
}
