//! Runtime Configuration
//!
//! Configuration knobs shared by every container. A config can be built in
//! code, decoded from JSON, or read from the environment.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default `type` attribute of the embedded state script.
pub const DEFAULT_PAYLOAD_TYPE: &str = "qwik/json";

/// Configuration for a container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Enables dev-only consistency warnings (dirty watches at pause time,
    /// disconnected or foreign elements in the state graph).
    pub dev: bool,

    /// Module base URL, written to the container as `q:base` when the
    /// container does not already carry one.
    pub base: Option<String>,

    /// `type` attribute of the `<script>` element holding the payload.
    pub payload_type: String,

    /// Verify that values written into stores are serializable.
    pub strict_serializable: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dev: cfg!(debug_assertions),
            base: None,
            payload_type: DEFAULT_PAYLOAD_TYPE.to_string(),
            strict_serializable: true,
        }
    }
}

impl RuntimeConfig {
    /// Decode a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build a config from `RESUMO_DEV` and `RESUMO_BASE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dev) = std::env::var("RESUMO_DEV") {
            config.dev = matches!(dev.as_str(), "1" | "true" | "yes");
        }
        if let Ok(base) = std::env::var("RESUMO_BASE") {
            if !base.is_empty() {
                config.base = Some(base);
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = RuntimeConfig::from_json(r#"{"base": "/build/"}"#).unwrap();
        assert_eq!(config.base.as_deref(), Some("/build/"));
        assert_eq!(config.payload_type, DEFAULT_PAYLOAD_TYPE);
        assert!(config.strict_serializable);
    }

    #[test]
    fn invalid_json_is_a_payload_error() {
        let err = RuntimeConfig::from_json("[").unwrap_err();
        assert_eq!(err.code(), 302);
    }
}
