use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Directory paths currently reserved for mounts-in-flight (spec.md §3),
/// preventing two concurrent mount operations from colliding on a
/// generated path (invariant 6).
#[derive(Debug, Default)]
pub struct MountPointRegistry {
    reserved: HashSet<PathBuf>,
}

impl MountPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `path`; returns `false` if already reserved.
    pub fn reserve(&mut self, path: &Path) -> bool {
        self.reserved.insert(path.to_path_buf())
    }

    pub fn release(&mut self, path: &Path) {
        self.reserved.remove(path);
    }

    pub fn is_reserved(&self, path: &Path) -> bool {
        self.reserved.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_prevents_double_booking() {
        let mut reg = MountPointRegistry::new();
        let path = PathBuf::from("/media/diskarbd/USB");
        assert!(reg.reserve(&path));
        assert!(!reg.reserve(&path));
        reg.release(&path);
        assert!(reg.reserve(&path));
    }
}
