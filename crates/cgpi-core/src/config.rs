use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CgpiError, CgpiResult};

/// Default key service host used when neither the credentials nor the
/// environment name one.
pub const DEFAULT_HOST: &str = "https://api.cryptograpi.com";

/// Client configuration (loaded from cryptograpi.toml or built in code).
///
/// Passed by reference into the engines; there is no process-wide default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub service: ServiceConfig,
    pub http: HttpConfig,
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Path prefix of every key service endpoint (default: /api/v0)
    pub api_prefix: String,
    /// user-agent header sent with every request
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// TCP connect timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
    /// Response read timeout in seconds (default: 60)
    pub read_timeout_secs: u64,
    /// Request write timeout in seconds (default: 60)
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Uses requested for a data key by the one-shot helpers (default: 1)
    pub default_uses: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_prefix: "/api/v0".into(),
            user_agent: format!("cryptograpi-rust/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            write_timeout_secs: 60,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self { default_uses: 1 }
    }
}

impl ClientConfig {
    /// Parse a config from TOML text; missing sections take their defaults.
    pub fn from_toml(text: &str) -> CgpiResult<Self> {
        let config: ClientConfig =
            toml::from_str(text).map_err(|e| CgpiError::Config(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> CgpiResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CgpiError::Config(format!("reading {}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "loaded client config");
        Ok(config)
    }

    fn validate(&self) -> CgpiResult<()> {
        if !self.service.api_prefix.starts_with('/') {
            return Err(CgpiError::Config(format!(
                "service.api_prefix must start with '/': {}",
                self.service.api_prefix
            )));
        }
        if self.encryption.default_uses == 0 {
            return Err(CgpiError::Config(
                "encryption.default_uses must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Absolute request path for an endpoint below the API prefix.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.service.api_prefix.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_defaults() {
        let config = ClientConfig::from_toml("").unwrap();

        assert_eq!(config.service.api_prefix, "/api/v0");
        assert!(config.service.user_agent.starts_with("cryptograpi-rust/"));
        assert_eq!(config.http.connect_timeout_secs, 30);
        assert_eq!(config.encryption.default_uses, 1);
    }

    #[test]
    fn test_parse_partial_config() {
        let config = ClientConfig::from_toml(
            r#"
[http]
read_timeout_secs = 5

[encryption]
default_uses = 10
"#,
        )
        .unwrap();

        // Overridden
        assert_eq!(config.http.read_timeout_secs, 5);
        assert_eq!(config.encryption.default_uses, 10);
        // Defaults
        assert_eq!(config.http.connect_timeout_secs, 30);
        assert_eq!(config.service.api_prefix, "/api/v0");
    }

    #[test]
    fn test_rejects_relative_prefix() {
        let err = ClientConfig::from_toml("[service]\napi_prefix = \"api/v0\"\n").unwrap_err();
        assert!(matches!(err, CgpiError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_uses() {
        let err = ClientConfig::from_toml("[encryption]\ndefault_uses = 0\n").unwrap_err();
        assert!(matches!(err, CgpiError::Config(_)));
    }

    #[test]
    fn test_endpoint_joins_prefix() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint("encryption/key"), "/api/v0/encryption/key");
        assert_eq!(config.endpoint("/decryption/key"), "/api/v0/decryption/key");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[service]\nuser_agent = \"integration/1.0\"").unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.service.user_agent, "integration/1.0");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = ClientConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = ClientConfig::from_toml(&text).unwrap();

        assert_eq!(config.service.api_prefix, parsed.service.api_prefix);
        assert_eq!(config.http.read_timeout_secs, parsed.http.read_timeout_secs);
    }
}
