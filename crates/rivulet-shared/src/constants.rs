/// Application name
pub const APP_NAME: &str = "Rivulet";

/// Maximum number of lookups merged into one batch request
pub const BATCH_MAX: usize = 100;

/// How long lookups for the same partition are collected before flushing (ms)
pub const BATCH_WINDOW_MS: u64 = 50;

/// Cache capacities (entries)
pub const STREAM_CACHE_CAPACITY: usize = 100;
pub const MESSAGE_CACHE_CAPACITY: usize = 1000;
pub const PARTICIPANT_CACHE_CAPACITY: usize = 1000;
pub const AVATAR_CACHE_CAPACITY: usize = 1000;
pub const RELATED_CACHE_CAPACITY: usize = 100;
pub const PARTICIPATING_CACHE_CAPACITY: usize = 10;

/// Largest ordinal gap a waiter will listen for before fetching instead
pub const WAIT_MAX: u64 = 5;

/// How long a waiter listens before falling back to a fetch (ms)
pub const WAIT_TIMEOUT_MS: u64 = 1000;

/// Minimum spacing between two global refreshes (seconds)
pub const REFRESH_MIN_SECS: u64 = 3;

/// Refresh ticker period (ms)
pub const TICK_MS: u64 = 1000;

/// A tick arriving this much later than scheduled means the host slept (ms)
pub const TICK_STALL_MS: u64 = 5000;

/// Debounce window for refreshes triggered by message types (ms)
pub const REFRESH_DEBOUNCE_MS: u64 = 75;

/// Fallback shown when an avatar has no name parts
pub const ANONYMOUS_NAME: &str = "Someone";

/// Retain key used for the current user's participating list
pub const PARTICIPATING_RETAIN_KEY: &str = "Streams";

/// Name of the per-user stream listing their participations
pub const PARTICIPATING_STREAM: &str = "Streams/participating";
