//! Coordinator configuration loaded from environment variables.
//!
//! Every setting has a default, so `StreamsConfig::default()` with a base
//! URL is enough for a working client.

use std::path::PathBuf;
use std::time::Duration;

use rivulet_net::Router;
use rivulet_shared::constants::*;

/// Whether a waiter may skip fetching because a live participant channel
/// will deliver the missing messages anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantSkip {
    /// Always fetch when listening is not an option.
    Never,
    /// Skip when the cached stream says the current user is participating.
    WhenParticipating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheCapacities {
    pub streams: usize,
    pub messages: usize,
    pub participants: usize,
    pub avatars: usize,
    pub related: usize,
    pub participating: usize,
}

impl Default for CacheCapacities {
    fn default() -> Self {
        Self {
            streams: STREAM_CACHE_CAPACITY,
            messages: MESSAGE_CACHE_CAPACITY,
            participants: PARTICIPANT_CACHE_CAPACITY,
            avatars: AVATAR_CACHE_CAPACITY,
            related: RELATED_CACHE_CAPACITY,
            participating: PARTICIPATING_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamsConfig {
    /// Streams service base URL.
    /// Env: `RIVULET_BASE_URL`
    /// Default: `http://localhost:8080`
    pub base_url: String,

    /// Partition base URLs; publishers are hashed across them.
    /// Env: `RIVULET_SHARDS` (comma-separated)
    /// Default: none (everything goes to `base_url`).
    pub shards: Vec<String>,

    /// Env: `RIVULET_BATCH_MAX`
    pub batch_max: usize,

    /// Env: `RIVULET_BATCH_WINDOW_MS`
    pub batch_window: Duration,

    /// Largest ordinal gap a waiter listens for.
    /// Env: `RIVULET_WAIT_MAX`
    pub wait_max: u64,

    /// Env: `RIVULET_WAIT_TIMEOUT_MS`
    pub wait_timeout: Duration,

    /// Minimum spacing between global refreshes.
    /// Env: `RIVULET_REFRESH_MIN_SECS`
    pub refresh_min_interval: Duration,

    /// Env: `RIVULET_TICK_MS`
    pub tick_interval: Duration,

    /// A tick this late means the host was suspended.
    pub stall_threshold: Duration,

    pub refresh_debounce: Duration,

    /// Disable the refresh that runs after a stalled tick.
    /// Env: `RIVULET_PREVENT_AUTO_REFRESH` (true/false)
    pub prevent_automatic_refresh: bool,

    /// Attempt a (rate-limited) global refresh on every tick.
    pub refresh_every_tick: bool,

    pub participant_skip: ParticipantSkip,

    /// SQLite file backing the stream and message caches.
    /// Env: `RIVULET_CACHE_PATH`
    /// Default: none (memory only).
    pub cache_path: Option<PathBuf>,

    pub capacities: CacheCapacities,

    /// Delay before a dropped push channel is reopened.
    pub socket_retry: Duration,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            shards: Vec::new(),
            batch_max: BATCH_MAX,
            batch_window: Duration::from_millis(BATCH_WINDOW_MS),
            wait_max: WAIT_MAX,
            wait_timeout: Duration::from_millis(WAIT_TIMEOUT_MS),
            refresh_min_interval: Duration::from_secs(REFRESH_MIN_SECS),
            tick_interval: Duration::from_millis(TICK_MS),
            stall_threshold: Duration::from_millis(TICK_STALL_MS),
            refresh_debounce: Duration::from_millis(REFRESH_DEBOUNCE_MS),
            prevent_automatic_refresh: false,
            refresh_every_tick: false,
            participant_skip: ParticipantSkip::WhenParticipating,
            cache_path: None,
            capacities: CacheCapacities::default(),
            socket_retry: Duration::from_secs(5),
        }
    }
}

impl StreamsConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = get("RIVULET_BASE_URL") {
            config.base_url = url;
        }

        if let Some(list) = get("RIVULET_SHARDS") {
            config.shards = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(val) = get("RIVULET_BATCH_MAX") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.batch_max = n,
                _ => tracing::warn!(value = %val, "Invalid RIVULET_BATCH_MAX, using default"),
            }
        }

        if let Some(ms) = parse_u64(&get, "RIVULET_BATCH_WINDOW_MS") {
            config.batch_window = Duration::from_millis(ms);
        }

        if let Some(n) = parse_u64(&get, "RIVULET_WAIT_MAX") {
            config.wait_max = n;
        }

        if let Some(ms) = parse_u64(&get, "RIVULET_WAIT_TIMEOUT_MS") {
            config.wait_timeout = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_u64(&get, "RIVULET_REFRESH_MIN_SECS") {
            config.refresh_min_interval = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_u64(&get, "RIVULET_TICK_MS") {
            if ms > 0 {
                config.tick_interval = Duration::from_millis(ms);
            }
        }

        if let Some(path) = get("RIVULET_CACHE_PATH") {
            if !path.is_empty() {
                config.cache_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = get("RIVULET_PREVENT_AUTO_REFRESH") {
            config.prevent_automatic_refresh = val != "false" && val != "0";
        }

        config
    }

    pub fn router(&self) -> Router {
        Router::new(&self.base_url, &self.shards)
    }
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let val = get(name)?;
    match val.parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(value = %val, variable = name, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = StreamsConfig::default();
        assert_eq!(config.batch_max, 100);
        assert_eq!(config.batch_window, Duration::from_millis(50));
        assert_eq!(config.wait_max, 5);
        assert_eq!(config.refresh_min_interval, Duration::from_secs(3));
        assert_eq!(config.participant_skip, ParticipantSkip::WhenParticipating);
        assert!(config.cache_path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = StreamsConfig::from_lookup(lookup(&[
            ("RIVULET_BASE_URL", "https://streams.example"),
            ("RIVULET_SHARDS", "https://a.example, https://b.example,"),
            ("RIVULET_BATCH_MAX", "20"),
            ("RIVULET_WAIT_TIMEOUT_MS", "250"),
            ("RIVULET_PREVENT_AUTO_REFRESH", "1"),
        ]));
        assert_eq!(config.base_url, "https://streams.example");
        assert_eq!(config.shards.len(), 2);
        assert_eq!(config.batch_max, 20);
        assert_eq!(config.wait_timeout, Duration::from_millis(250));
        assert!(config.prevent_automatic_refresh);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = StreamsConfig::from_lookup(lookup(&[
            ("RIVULET_BATCH_MAX", "0"),
            ("RIVULET_WAIT_MAX", "lots"),
        ]));
        assert_eq!(config.batch_max, 100);
        assert_eq!(config.wait_max, 5);
    }
}
