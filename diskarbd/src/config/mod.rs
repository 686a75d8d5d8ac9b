mod mount_map;
mod settings;

pub use mount_map::{MountMap, MountOverride};
pub use settings::{
    Config, ConfigManager, DatabaseConfig, DeferralPolicy, MountBackend, TrustTier,
};
