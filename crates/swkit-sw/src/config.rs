//! Gateway configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use swkit_common::{RetryConfig, SwKitError};
use url::Url;

/// How install treats manifest URLs that cannot be fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrecachePolicy {
    /// Cache what can be fetched, log the rest.
    #[default]
    BestEffort,
    /// Any failure fails the install and nothing is stored.
    Atomic,
}

/// Configuration for one deployed version of the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Cache name prefix, e.g. `turni-vvf`
    pub cache_prefix: String,

    /// Version string; changing it triggers install and stale-cache cleanup
    pub version: String,

    /// Scope URL. Relative manifest entries resolve against it and its
    /// origin defines same-origin requests.
    pub scope: Url,

    /// Asset manifest precached at install
    pub manifest: Vec<String>,

    /// External hosts whose requests are also served cache-first
    /// (`host` or `*.suffix`)
    pub allowed_hosts: Vec<String>,

    /// Document served when the network fails
    pub offline_fallback: String,

    /// Precache failure policy
    pub precache_policy: PrecachePolicy,

    /// Attempts per precache URL
    pub precache_attempts: u32,

    /// Activate right after install instead of waiting for a
    /// `skipWaiting` message
    pub skip_waiting: bool,

    /// Background sync tag handled by the gateway
    pub sync_tag: String,

    /// Optional network timeout in milliseconds
    pub fetch_timeout_ms: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "swkit".to_string(),
            version: "v1".to_string(),
            scope: Url::parse("http://localhost:8080/").expect("static URL is valid"),
            manifest: vec!["./".to_string(), "./index.html".to_string()],
            allowed_hosts: Vec::new(),
            offline_fallback: "./index.html".to_string(),
            precache_policy: PrecachePolicy::default(),
            precache_attempts: 1,
            skip_waiting: true,
            sync_tag: "sync-data".to_string(),
            fetch_timeout_ms: None,
        }
    }
}

impl GatewayConfig {
    /// Create a config for `scope` with defaults for everything else.
    pub fn for_scope(scope: Url) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    /// Parse from a JSON document and validate.
    pub fn from_json_str(json: &str) -> Result<Self, SwKitError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SwKitError::config_with_source("invalid gateway config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SwKitError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SwKitError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        Self::from_json_str(&json)
    }

    /// Check invariants the handlers rely on.
    pub fn validate(&self) -> Result<(), SwKitError> {
        if self.cache_prefix.trim().is_empty() {
            return Err(SwKitError::config("cache_prefix must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(SwKitError::config("version must not be empty"));
        }
        if self.precache_attempts == 0 {
            return Err(SwKitError::config("precache_attempts must be at least 1"));
        }
        if self.fetch_timeout_ms == Some(0) {
            return Err(SwKitError::config(
                "fetch_timeout_ms must be greater than 0, omit it to disable the timeout",
            ));
        }
        if self.scope.cannot_be_a_base() {
            return Err(SwKitError::config(format!(
                "scope {} cannot be used as a base URL",
                self.scope
            )));
        }
        self.fallback_url()?;
        Ok(())
    }

    /// Name of the cache owned by this version.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Manifest entries resolved against the scope, paired with the raw entry.
    pub fn manifest_urls(&self) -> Vec<(String, Result<Url, url::ParseError>)> {
        self.manifest
            .iter()
            .map(|entry| (entry.clone(), self.scope.join(entry)))
            .collect()
    }

    /// Resolved offline fallback document.
    pub fn fallback_url(&self) -> Result<Url, SwKitError> {
        self.scope.join(&self.offline_fallback).map_err(|e| {
            SwKitError::config_with_source(
                format!("invalid offline_fallback '{}'", self.offline_fallback),
                e,
            )
        })
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// Retry policy for precache fetches.
    pub fn precache_retry(&self) -> RetryConfig {
        RetryConfig::attempts(self.precache_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.cache_name(), "swkit-v1");
        assert_eq!(config.precache_policy, PrecachePolicy::BestEffort);
        assert_eq!(config.sync_tag, "sync-data");
        assert!(config.skip_waiting);
        assert!(config.fetch_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = GatewayConfig::from_json_str(
            r#"{
                "cache_prefix": "turni-vvf",
                "version": "v3",
                "scope": "https://turni.example.org/app/",
                "manifest": ["./index.html", "https://fonts.googleapis.com/css2?family=Inter"],
                "allowed_hosts": ["fonts.googleapis.com", "*.gstatic.com"],
                "precache_policy": "atomic",
                "fetch_timeout_ms": 1500
            }"#,
        )
        .unwrap();

        assert_eq!(config.cache_name(), "turni-vvf-v3");
        assert_eq!(config.precache_policy, PrecachePolicy::Atomic);
        assert_eq!(config.offline_fallback, "./index.html");
        assert_eq!(config.fetch_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.precache_retry().max_attempts, 1);
    }

    #[test]
    fn test_manifest_resolution() {
        let mut config =
            GatewayConfig::for_scope(Url::parse("https://turni.example.org/app/").unwrap());
        config.manifest = vec![
            "./index.html".into(),
            "icon-192.png".into(),
            "https://cdnjs.cloudflare.com/ajax/libs/jspdf/2.5.1/jspdf.umd.min.js".into(),
        ];

        let urls: Vec<String> = config
            .manifest_urls()
            .into_iter()
            .map(|(_, url)| url.unwrap().to_string())
            .collect();

        assert_eq!(
            urls,
            vec![
                "https://turni.example.org/app/index.html",
                "https://turni.example.org/app/icon-192.png",
                "https://cdnjs.cloudflare.com/ajax/libs/jspdf/2.5.1/jspdf.umd.min.js",
            ]
        );
        assert_eq!(
            config.fallback_url().unwrap().as_str(),
            "https://turni.example.org/app/index.html"
        );
    }

    #[test]
    fn test_validation_failures() {
        let mut config = GatewayConfig::default();
        config.version = " ".into();
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.precache_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.fetch_timeout_ms = Some(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fetch_timeout_ms"));
        config.fetch_timeout_ms = Some(1);
        assert!(config.validate().is_ok());
        assert!(GatewayConfig::from_json_str(r#"{"fetch_timeout_ms": 0}"#).is_err());

        assert!(GatewayConfig::from_json_str(r#"{"scope": "mailto:ops@example.org"}"#).is_err());
        assert!(GatewayConfig::from_json_str(r#"{"version": 3}"#).is_err());
    }

    #[test]
    fn test_from_missing_file() {
        let err = GatewayConfig::from_file("/nonexistent/sw.json").unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
