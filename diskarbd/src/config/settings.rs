use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use shared::errors::ConfigError;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, RwLock},
    thread,
};

/// Full daemon configuration, loaded from TOML (`diskarbd.toml`): a
/// `serde`-derived struct loaded with `toml`, validated after parse, and
/// hot-reloaded through a `notify` watcher behind `ConfigManager`.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Root directory new mounts are created under (spec.md §4.7, §6).
    pub mount_root: PathBuf,
    /// Path to the mount-map override file (spec.md §3 "Mount map").
    pub mount_map_path: PathBuf,
    /// Unix domain socket the RPC surface listens on.
    pub rpc_socket_path: PathBuf,
    /// PID file path (spec.md §6).
    pub pid_file_path: PathBuf,
    /// Telemetry persistence settings.
    pub database: DatabaseConfig,
    /// Deferral defaults per media tier (spec.md §4.5).
    pub deferral: DeferralPolicy,
    /// Whether probe-reported dirty volumes are always repaired, not just
    /// when a mount is requested read-write (spec.md §4.5 repair decision).
    #[serde(default)]
    pub always_repair: bool,
    /// Directory holding the external probe/repair/mount/unmount/eject
    /// helper binaries (spec.md §1 Non-goals: these are external
    /// collaborators, not part of the core).
    pub helper_dir: PathBuf,
    /// Which mount backend implementation the mount stage targets — a
    /// build-time-flag-turned-config per the Design Notes Open Question
    /// (spec.md §9: "whether UserFS is the default mount implementation").
    #[serde(default)]
    pub mount_backend: MountBackend,
    /// Whether a console-user proxy (e.g. a login-manager agent) is present
    /// on this system — the other Open Question in spec.md §9. When false,
    /// console-user transitions are inferred directly from logind without
    /// waiting for a proxy's notification.
    #[serde(default = "default_true")]
    pub console_user_proxy_present: bool,
    /// Mirrors the original daemon's base-system/image-creator build
    /// target (spec.md §4.5 "System/boot-installer special-case"): when
    /// set, APFS System and no-role volumes get `nobrowse` under automatic
    /// mount. Has no equivalent host role on a general-purpose Linux
    /// install, so it defaults off; kept as config rather than removed so
    /// the branch stays reachable for embedded-style deployments.
    #[serde(default)]
    pub base_system_image_creator: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MountBackend {
    #[default]
    UserFs,
    FsKit,
}

/// Default-defer-true/false per tier, overridable in `[deferral]`
/// (spec.md §4.5):
///   - removable: default defer = true
///   - internal non-removable: default defer = false
///   - external non-removable: default defer = true
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct DeferralPolicy {
    #[serde(default = "default_true")]
    pub removable: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default = "default_true")]
    pub external: bool,
}

impl Default for DeferralPolicy {
    fn default() -> Self {
        Self {
            removable: true,
            internal: false,
            external: true,
        }
    }
}

/// Trust tier used by both the deferral policy and the untrusted-mount
/// option composition (spec.md §4.5: "same removable/internal/external
/// tiers").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustTier {
    Removable,
    InternalFixed,
    ExternalFixed,
}

impl DeferralPolicy {
    pub fn defer_by_default(&self, tier: TrustTier) -> bool {
        match tier {
            TrustTier::Removable => self.removable,
            TrustTier::InternalFixed => self.internal,
            TrustTier::ExternalFixed => self.external,
        }
    }

    /// Untrusted tiers get `nosuid,noowners,nodev` (spec.md §4.5). Internal
    /// fixed media is the one trusted tier.
    pub fn is_untrusted(&self, tier: TrustTier) -> bool {
        tier != TrustTier::InternalFixed
    }
}

/// Telemetry database configuration `[database]`.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    #[serde(default)]
    pub purge_on_restart: bool,
    #[serde(default = "default_synchronous")]
    pub synchronous: String,
    #[serde(default = "default_journal_limit")]
    pub journal_size_limit: u64,
}

fn default_synchronous() -> String {
    "NORMAL".into()
}

fn default_journal_limit() -> u64 {
    20_000_000
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let cfg: Config = toml::from_str(&s).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mount_root.as_os_str().is_empty() {
            return Err(ConfigError::Validation("mount_root must not be empty".into()));
        }
        if !self.mount_root.is_absolute() {
            return Err(ConfigError::Validation("mount_root must be absolute".into()));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn from_str(toml: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(toml).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Manages a live-updating `Config` behind a file watcher, so readers
/// always see a consistent value without locking out a concurrent reload.
pub struct ConfigManager {
    inner: Arc<RwLock<Config>>,
    _watcher: RecommendedWatcher,
}

impl ConfigManager {
    pub fn new(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Config::load(path)?;
        let shared_cfg = Arc::new(RwLock::new(cfg));
        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            tx,
            notify::Config::default().with_poll_interval(std::time::Duration::from_secs(1)),
        )
        .map_err(|e| ConfigError::Validation(format!("watcher error: {e}")))?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Validation(format!("watch error: {e}")))?;

        let cfg_path = path.to_path_buf();
        let shared_clone = Arc::clone(&shared_cfg);
        thread::Builder::new()
            .name("config_watcher".into())
            .spawn(move || {
                for evt in rx {
                    if let Ok(event) = evt {
                        if let EventKind::Modify(_) = event.kind {
                            match Config::load(&cfg_path) {
                                Ok(new_cfg) => {
                                    *shared_clone.write().unwrap() = new_cfg;
                                    log::info!("Configuration reloaded from {}", cfg_path.display());
                                }
                                Err(e) => log::error!("Failed to reload configuration: {e}"),
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn config watcher thread");

        Ok(ConfigManager {
            inner: shared_cfg,
            _watcher: watcher,
        })
    }

    /// Snapshot-like read of the current config.
    pub fn get(&self) -> Config {
        self.inner.read().unwrap().clone()
    }

    /// Forces a synchronous reload, used by the `SIGHUP` handler so reloads
    /// aren't solely dependent on the (polling) file watcher noticing.
    pub fn reload_now(&self, path: &Path) {
        match Config::load(path) {
            Ok(new_cfg) => *self.inner.write().unwrap() = new_cfg,
            Err(e) => log::error!("SIGHUP reload failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mount_root = "/media/diskarbd"
mount_map_path = "/etc/diskarbd/mount-map.toml"
rpc_socket_path = "/var/run/diskarbd.sock"
pid_file_path = "/var/run/diskarbd.pid"
helper_dir = "/usr/libexec/diskarbd"

[database]
path = "telemetry.db"

[deferral]
removable = true
internal = false
external = true
"#;

    #[test]
    fn parses_full_config_with_defaults() {
        let cfg = Config::from_str(SAMPLE).expect("should parse");
        assert_eq!(cfg.mount_root, PathBuf::from("/media/diskarbd"));
        assert!(cfg.deferral.removable);
        assert!(!cfg.deferral.internal);
        assert!(cfg.deferral.external);
        assert!(!cfg.always_repair);
        assert_eq!(cfg.mount_backend, MountBackend::UserFs);
        assert!(cfg.console_user_proxy_present);
    }

    #[test]
    fn rejects_relative_mount_root() {
        let toml = SAMPLE.replace("/media/diskarbd", "media/diskarbd");
        assert!(matches!(
            Config::from_str(&toml).unwrap_err(),
            ConfigError::Validation(_)
        ));
    }

    #[test]
    fn deferral_defaults_match_spec_tiers() {
        let policy = DeferralPolicy::default();
        assert!(policy.defer_by_default(TrustTier::Removable));
        assert!(!policy.defer_by_default(TrustTier::InternalFixed));
        assert!(policy.defer_by_default(TrustTier::ExternalFixed));
        assert!(!policy.is_untrusted(TrustTier::InternalFixed));
        assert!(policy.is_untrusted(TrustTier::Removable));
        assert!(policy.is_untrusted(TrustTier::ExternalFixed));
    }
}
