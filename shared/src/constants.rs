//! Process-wide constants: RPC transport location, on-disk layout, and the
//! handful of magic names the filesystem surface depends on (spec.md §6).

/// Default Unix domain socket the RPC surface listens on.
pub const RPC_SOCKET_PATH: &str = "/var/run/diskarbd.sock";

/// PID file written on startup unless running with `-d` (spec.md §6).
pub const PID_FILE_PATH: &str = "/var/run/diskarbd.pid";

/// Default mount-point root. Analogous to `/Volumes` in the original
/// `diskarbitrationd`; mode `01777`, owner `root:disk` (spec.md §6).
pub const DEFAULT_MOUNT_ROOT: &str = "/media/diskarbd";

/// Marker file dropped inside every daemon-created mount point so it can be
/// identified and swept on startup or removed once empty (spec.md §4.7).
pub const AUTOMOUNT_COOKIE_FILE: &str = ".autodiskmounted";

/// Environment variable that overrides the config file search path.
pub const CONFIG_PATH_ENV: &str = "DISKARBD_CONFIG";

/// Default config file path, used when `CONFIG_PATH_ENV` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/diskarbd/diskarbd.toml";

/// Directory the telemetry database lives under (spec.md §1 Non-goals:
/// diagnostic-only persistence, never arbitration state).
pub const DEFAULT_STATE_DIR: &str = "/var/lib/diskarbd";

/// Maximum numeric suffixes tried when synthesizing a mount point name
/// (spec.md §4.5: `/Volumes/<name>`, `/Volumes/<name> 1`, ... up to 100).
pub const MAX_MOUNT_POINT_SUFFIXES: u32 = 100;

/// Number of pending callback-queue entries after which a session is marked
/// `timeout` and eligible for disconnect (spec.md §4.4).
pub const CALLBACK_QUEUE_STALL_THRESHOLD: usize = 256;

/// Bit layout of `SessionQueueRequest`'s integer `options` field (spec.md
/// §3). Distinct from a disk's mount-options string
/// (`stage::mount::compose_mount_options`); this bitmask travels on the
/// request itself and is this implementation's own invention, since the
/// wire protocol leaves its layout unspecified.
///
/// Set on an unmount/eject request to skip the "busy" refusal and detach
/// whatever is using the volume (spec.md §4.4 testable property 6).
pub const REQUEST_OPTION_FORCE: u32 = 1 << 0;

/// Set on a mount request to bypass the dirty-volume auto-repair gate and
/// mount read-only instead of retrying repair (operator escape hatch for
/// scenario S3's retry loop).
pub const REQUEST_OPTION_SKIP_REPAIR: u32 = 1 << 1;
