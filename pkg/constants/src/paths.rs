//! Filesystem path constants.

/// Default config file path for `lockctl`.
pub const DEFAULT_CONFIG: &str = "/etc/lockctl/config.yaml";

/// Default data directory for the SlateDB state store.
pub const DEFAULT_DATA_DIR: &str = "/tmp/lockctl-data";
