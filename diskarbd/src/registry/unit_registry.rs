use super::unit::Unit;
use rustc_hash::FxHashMap;

/// Holds per-unit state, created lazily on first disk and destroyed when
/// the last disk of that unit departs (spec.md §3).
#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: FxHashMap<u32, Unit>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: u32) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn lookup_mut(&mut self, id: u32) -> Option<&mut Unit> {
        self.units.get_mut(&id)
    }

    /// Returns the unit for `id`, creating it (and bumping its disk count)
    /// if this is the first disk attributed to it.
    pub fn attach_disk(&mut self, id: u32) -> &mut Unit {
        let unit = self.units.entry(id).or_insert_with(|| Unit::new(id));
        unit.disk_count += 1;
        unit
    }

    /// Detaches a disk from its unit, destroying the unit once its count
    /// reaches zero.
    pub fn detach_disk(&mut self, id: u32) {
        if let Some(unit) = self.units.get_mut(&id) {
            unit.disk_count = unit.disk_count.saturating_sub(1);
            if unit.disk_count == 0 {
                self.units.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_is_created_on_first_attach_and_destroyed_on_last_detach() {
        let mut reg = UnitRegistry::new();
        reg.attach_disk(4);
        reg.attach_disk(4);
        assert_eq!(reg.lookup(4).unwrap().disk_count, 2);

        reg.detach_disk(4);
        assert!(reg.lookup(4).is_some());

        reg.detach_disk(4);
        assert!(reg.lookup(4).is_none());
    }
}
