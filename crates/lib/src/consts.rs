//! Crate-wide constants.

/// Application name used for cache and config directories.
pub const APP_NAME: &str = "repro";

/// Project configuration file name.
pub const CONFIG_FILENAME: &str = "repro.toml";

/// Default pin file name, relative to the project root.
pub const PINS_FILENAME: &str = "repro.pins.json";

/// Dependency lock file consumed by the vendoring layer.
pub const CARGO_LOCK_FILENAME: &str = "Cargo.lock";

/// Project-local work directory (vendor sets, sandboxes, job checkouts).
pub const WORK_DIR_NAME: &str = ".repro";

/// Marker written into cache entries once they are complete.
pub const COMPLETE_MARKER: &str = ".repro-complete";

/// Length of the hash prefix used in human-readable cache directory names.
pub const HASH_PREFIX_LEN: usize = 20;

/// January 1, 1980 00:00:00 UTC (ZIP epoch), used for reproducible timestamps.
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Environment variable overriding the cache root.
pub const CACHE_ENV: &str = "REPRO_CACHE";
