//! Lock protocol constants.

/// Collection (namespace) that lock documents live in unless overridden.
pub const DEFAULT_COLLECTION: &str = "distributed-locks";

/// Smallest delay before a renewal fires when its scheduled instant has
/// already passed.
pub const KEEPALIVE_MIN_DELAY_MS: u64 = 1;

/// Lease TTL used by `lockctl` when neither a flag nor the config file sets one.
pub const DEFAULT_TTL_MS: u64 = 15_000;

/// Renewal margin used by `lockctl hold`: renew this long before expiry.
pub const DEFAULT_BEFORE_EXPIRY_MS: u64 = 5_000;
