//! Client configuration
//!
//! Plain-data options with documented defaults, optional environment overrides
//! and validation. Options that are objects (auth provider, retry policy, pool
//! config, middleware) are set on the factory builder instead.

use crate::error::{ClientError, ClientResult};
use crate::pool::PoolProfile;
use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DISCOVERY_PATH: &str = "/openapi/v3";
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// slurmrestd base URL (e.g., "http://localhost:6820")
    pub base_url: String,
    /// Explicit revision; skips discovery when set
    pub api_version: Option<String>,
    /// Revision used when discovery fails
    pub stable_version: String,
    /// Per-request timeout
    pub timeout: Duration,
    pub discovery_path: String,
    pub discovery_timeout: Duration,
    pub pool_profile: PoolProfile,
    pub max_retries: u32,
    pub retry_wait_min: Duration,
    pub retry_wait_max: Duration,
    pub user_agent: Option<String>,
    pub insecure_skip_verify: bool,
    /// Log version resolution at info instead of debug
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("http://localhost:6820")
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_version: None,
            stable_version: ProtocolVersion::stable().to_string(),
            timeout: DEFAULT_TIMEOUT,
            discovery_path: DEFAULT_DISCOVERY_PATH.to_string(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            pool_profile: PoolProfile::Default,
            max_retries: 3,
            retry_wait_min: Duration::from_secs(1),
            retry_wait_max: Duration::from_secs(30),
            user_agent: None,
            insecure_skip_verify: false,
            debug: false,
        }
    }

    /// Defaults overridden by `SLURM_*` environment variables. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("SLURM_REST_URL") {
            self.base_url = url;
        }

        if let Some(version) = var("SLURM_API_VERSION") {
            let version = version.trim();
            if !version.is_empty() {
                self.api_version = Some(version.to_string());
            }
        }

        if let Some(timeout) = var("SLURM_TIMEOUT") {
            if let Ok(secs) = timeout.trim().parse::<u64>() {
                self.timeout = Duration::from_secs(secs);
            }
        }

        if let Some(retries) = var("SLURM_MAX_RETRIES") {
            if let Ok(count) = retries.trim().parse::<u32>() {
                self.max_retries = count;
            }
        }

        if let Some(agent) = var("SLURM_USER_AGENT") {
            self.user_agent = Some(agent);
        }

        if let Some(profile) = var("SLURM_POOL_PROFILE") {
            if let Ok(profile) = profile.parse::<PoolProfile>() {
                self.pool_profile = profile;
            }
        }

        if let Some(skip) = var("SLURM_INSECURE_SKIP_VERIFY") {
            if let Some(flag) = parse_flag(&skip) {
                self.insecure_skip_verify = flag;
            }
        }

        if let Some(debug) = var("SLURM_DEBUG") {
            if let Some(flag) = parse_flag(&debug) {
                self.debug = flag;
            }
        }
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_pool_profile(mut self, profile: PoolProfile) -> Self {
        self.pool_profile = profile;
        self
    }

    /// Base URL without trailing slashes
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Parsed explicit revision, if one was configured
    pub fn explicit_version(&self) -> ClientResult<Option<ProtocolVersion>> {
        self.api_version
            .as_deref()
            .map(ProtocolVersion::parse)
            .transpose()
    }

    pub fn stable(&self) -> ClientResult<ProtocolVersion> {
        ProtocolVersion::parse(&self.stable_version)
    }

    pub fn validate(&self) -> ClientResult<()> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(ClientError::config("base_url", "Base URL cannot be empty"));
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ClientError::config(
                "base_url",
                "URL must start with http:// or https://",
            ));
        }

        if self.timeout.is_zero() {
            return Err(ClientError::config("timeout", "Timeout must be greater than 0"));
        }

        if self.discovery_timeout.is_zero() {
            return Err(ClientError::config(
                "discovery_timeout",
                "Discovery timeout must be greater than 0",
            ));
        }

        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ClientError::config(
                "max_retries",
                format!("Maximum retries cannot exceed {}", MAX_RETRIES_LIMIT),
            ));
        }

        if self.retry_wait_min > self.retry_wait_max {
            return Err(ClientError::config(
                "retry_wait_min",
                "Minimum retry wait cannot exceed maximum retry wait",
            ));
        }

        if !self.discovery_path.starts_with('/') {
            return Err(ClientError::config(
                "discovery_path",
                "Discovery path must start with /",
            ));
        }

        self.explicit_version()
            .map_err(|e| ClientError::config("api_version", e.to_string()))?;
        self.stable()
            .map_err(|e| ClientError::config("stable_version", e.to_string()))?;

        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.stable_version, "v0.0.42");
        assert_eq!(config.discovery_path, "/openapi/v3");
        assert_eq!(config.pool_profile, PoolProfile::Default);
        assert_eq!(config.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SLURM_REST_URL", "https://slurm.example:6820"),
            ("SLURM_API_VERSION", "v0.0.44"),
            ("SLURM_TIMEOUT", "12"),
            ("SLURM_MAX_RETRIES", "not-a-number"),
            ("SLURM_POOL_PROFILE", "high-throughput"),
            ("SLURM_INSECURE_SKIP_VERIFY", "true"),
            ("SLURM_DEBUG", "maybe"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.base_url, "https://slurm.example:6820");
        assert_eq!(config.explicit_version().unwrap(), Some(ProtocolVersion::V0_0_44));
        assert_eq!(config.timeout, Duration::from_secs(12));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.pool_profile, PoolProfile::HighThroughput);
        assert!(config.insecure_skip_verify);
        assert!(!config.debug);
    }

    #[test]
    fn test_validation_failures() {
        let cases: Vec<(ClientConfig, &str)> = vec![
            (ClientConfig::new(""), "base_url"),
            (ClientConfig::new("ftp://host"), "base_url"),
            (ClientConfig::default().with_timeout(Duration::ZERO), "timeout"),
            (
                ClientConfig {
                    max_retries: 11,
                    ..ClientConfig::default()
                },
                "max_retries",
            ),
            (
                ClientConfig {
                    retry_wait_min: Duration::from_secs(60),
                    ..ClientConfig::default()
                },
                "retry_wait_min",
            ),
            (ClientConfig::default().with_api_version("0.0.42"), "api_version"),
            (
                ClientConfig {
                    stable_version: "latest".to_string(),
                    ..ClientConfig::default()
                },
                "stable_version",
            ),
        ];

        for (config, field) in cases {
            match config.validate() {
                Err(ClientError::Config { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected config error on {}, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_base_url_trims_trailing_slash() {
        assert_eq!(ClientConfig::new("http://h:6820//").base_url(), "http://h:6820");
    }

    #[test]
    fn test_serde_uses_defaults_for_missing_fields() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"base_url":"http://h","pool_profile":"batch"}"#).unwrap();
        assert_eq!(config.pool_profile, PoolProfile::Batch);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }
}
