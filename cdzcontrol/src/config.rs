//! Runtime configuration for the playback controller.
//!
//! A plain serde struct with embedded defaults, injected through the
//! controller constructor. There is deliberately no process-wide
//! configuration singleton.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Maximum entries the local backend keeps primed at once.
    pub local_max_preload: usize,

    /// Upper bound on the playlist-playback buffer size (preloaded plus
    /// controller-buffered playlist entries).
    pub max_prefetch_count: usize,

    /// Bounded retry for local data fetch failures; exhaustion is terminal.
    pub max_fetch_retries: u32,

    /// Bounded wait for in-flight lane work during backend migration.
    pub lane_drain_timeout: Duration,

    /// Retention bound of the controller-side play history.
    pub history_limit: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            local_max_preload: 3,
            max_prefetch_count: 10,
            max_fetch_retries: 3,
            lane_drain_timeout: Duration::from_secs(2),
            history_limit: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PlayerConfig::default();
        assert!(config.local_max_preload >= 1);
        assert!(config.max_prefetch_count >= config.local_max_preload);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: PlayerConfig = serde_json::from_str(r#"{"local_max_preload": 5}"#).unwrap();
        assert_eq!(config.local_max_preload, 5);
        assert_eq!(config.max_fetch_retries, PlayerConfig::default().max_fetch_retries);
    }
}
