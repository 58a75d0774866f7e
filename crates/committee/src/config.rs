//! Committee node configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use state::Profile;

fn default_private_key_path() -> PathBuf {
    PathBuf::from("/private_key.txt")
}

fn default_polling_interval() -> f64 {
    1.0
}

fn default_http_request_timeout() -> u64 {
    300
}

fn default_max_delta_size() -> usize {
    65536
}

fn default_fact_cache_size() -> usize {
    merkle::DEFAULT_FACT_CACHE_SIZE
}

/// Configuration of the committee node; loadable from a JSON file, with
/// per-profile defaults for the tree geometry.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitteeConfig {
    /// Availability gateway base URL.
    pub availability_gateway_endpoint: String,

    /// Directory holding `user.crt`, `user.key` and `server.crt` for mutual
    /// TLS; plain TLS/HTTP when unset.
    #[serde(default)]
    pub certificates_path: Option<PathBuf>,

    /// File holding the member's hex private key.
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,

    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: f64,

    #[serde(default = "default_http_request_timeout")]
    pub http_request_timeout_seconds: u64,

    pub profile: Profile,

    /// Height of the account-state tree; profile default when unset.
    #[serde(default)]
    pub tree_height: Option<usize>,

    /// Height of the order tree; profile default when unset.
    #[serde(default)]
    pub order_tree_height: Option<usize>,

    /// Maximum number of delta entries accepted per tree per batch.
    #[serde(default = "default_max_delta_size")]
    pub max_delta_size: usize,

    /// Node-fact cache capacity, in entries.
    #[serde(default = "default_fact_cache_size")]
    pub fact_cache_size: usize,

    /// Directory for the local sled database; in-memory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl CommitteeConfig {
    /// A configuration with profile defaults, for tests and programmatic
    /// assembly.
    pub fn for_profile(profile: Profile, endpoint: impl Into<String>) -> Self {
        Self {
            availability_gateway_endpoint: endpoint.into(),
            certificates_path: None,
            private_key_path: default_private_key_path(),
            polling_interval_seconds: default_polling_interval(),
            http_request_timeout_seconds: default_http_request_timeout(),
            profile,
            tree_height: None,
            order_tree_height: None,
            max_delta_size: default_max_delta_size(),
            fact_cache_size: default_fact_cache_size(),
            data_dir: None,
        }
    }

    pub fn state_height(&self) -> usize {
        self.tree_height
            .unwrap_or_else(|| self.profile.default_state_height())
    }

    pub fn order_height(&self) -> usize {
        self.order_tree_height
            .unwrap_or_else(|| self.profile.default_order_height())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs_f64(self.polling_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_request_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_profile() {
        let config = CommitteeConfig::for_profile(Profile::StarkEx, "https://gw.example");
        assert_eq!(config.state_height(), 31);
        assert_eq!(config.order_height(), 31);

        let config = CommitteeConfig::for_profile(Profile::Perpetual, "https://gw.example");
        assert_eq!(config.state_height(), 64);
        assert_eq!(config.order_height(), 31);
    }

    #[test]
    fn test_explicit_heights_win() {
        let mut config = CommitteeConfig::for_profile(Profile::StarkEx, "https://gw.example");
        config.tree_height = Some(4);
        config.order_tree_height = Some(4);
        assert_eq!(config.state_height(), 4);
        assert_eq!(config.order_height(), 4);
    }

    #[test]
    fn test_loads_from_json() {
        let config: CommitteeConfig = serde_json::from_str(
            r#"{
                "availability_gateway_endpoint": "https://gw.example",
                "profile": "perpetual",
                "polling_interval_seconds": 0.5,
                "tree_height": 10
            }"#,
        )
        .unwrap();
        assert_eq!(config.profile, Profile::Perpetual);
        assert_eq!(config.polling_interval(), Duration::from_millis(500));
        assert_eq!(config.state_height(), 10);
        assert_eq!(config.max_delta_size, 65536);
        assert_eq!(config.private_key_path, PathBuf::from("/private_key.txt"));
    }
}
