use serde::Deserialize;
use shared::errors::ConfigError;
use std::{collections::HashMap, fs, path::Path};

/// Per-volume mount overrides, keyed by the volume UUID string.
///
/// Loaded and validated the same way as `Config` in `settings.rs`, but as
/// a second, independently hot-reloaded TOML file rather than a nested
/// table, so mount overrides can be edited without touching daemon policy.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct MountMap {
    #[serde(default, rename = "volume")]
    entries: Vec<MountOverride>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MountOverride {
    /// Volume content UUID this override applies to.
    pub uuid: String,
    /// Mount point name to use instead of the volume name, if set.
    #[serde(default)]
    pub mount_point_name: Option<String>,
    /// Force read-only regardless of probe-reported writability.
    #[serde(default)]
    pub force_read_only: bool,
    /// Suppress automatic mounting for this volume entirely.
    #[serde(default)]
    pub ignore: bool,
}

impl MountMap {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(MountMap::default());
        }
        let s = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let map: MountMap = toml::from_str(&s).map_err(ConfigError::Parse)?;
        Ok(map)
    }

    pub fn lookup(&self, uuid: &str) -> Option<&MountOverride> {
        self.entries.iter().find(|e| e.uuid == uuid)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_empty_map() {
        let map = MountMap::load(Path::new("/nonexistent/mount-map.toml")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn parses_overrides_and_looks_up_by_uuid() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
[[volume]]
uuid = "11111111-1111-1111-1111-111111111111"
mount_point_name = "Backups"
force_read_only = true

[[volume]]
uuid = "22222222-2222-2222-2222-222222222222"
ignore = true
"#
        )
        .unwrap();

        let map = MountMap::load(f.path()).unwrap();
        assert_eq!(map.len(), 2);

        let first = map.lookup("11111111-1111-1111-1111-111111111111").unwrap();
        assert_eq!(first.mount_point_name.as_deref(), Some("Backups"));
        assert!(first.force_read_only);

        let second = map.lookup("22222222-2222-2222-2222-222222222222").unwrap();
        assert!(second.ignore);

        assert!(map.lookup("not-present").is_none());
    }
}
