//! API credentials: explicit values, environment, or a profile file
//!
//! Profile file (default `~/.cryptograpi/credentials`), INI:
//! ```ini
//! [default]
//! ACCESS_KEY_ID = ...
//! SECRET_ACCESS_KEY = ...
//! SIGNING_KEY = ...
//! SERVER = api.cryptograpi.com
//!
//! [staging]
//! SERVER = https://staging.cryptograpi.com
//! ```
//! Keys present in the selected profile override the `[default]` section.
//! Values may be bare or quoted.

use ini::{Ini, ParseOption};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_HOST;
use crate::error::{CgpiError, CgpiResult};

pub const ENV_ACCESS_KEY_ID: &str = "CRYPTOGRAPI_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "CRYPTOGRAPI_SECRET_ACCESS_KEY";
pub const ENV_SIGNING_KEY: &str = "CRYPTOGRAPI_SIGNING_KEY";
pub const ENV_SERVER: &str = "CRYPTOGRAPI_SERVER";

const DEFAULT_PROFILE: &str = "default";

/// Key service credentials. Read-only once constructed.
pub struct Credentials {
    access_key_id: String,
    secret_access_key: SecretString,
    signing_key: SecretString,
    host: String,
}

impl Credentials {
    /// Build credentials from explicit values. Empty values fall back to the
    /// `CRYPTOGRAPI_*` environment variables.
    pub fn new(access_key_id: &str, secret_access_key: &str, signing_key: &str, host: &str) -> Self {
        Self::resolve_with(access_key_id, secret_access_key, signing_key, host, |name| {
            std::env::var(name).ok()
        })
    }

    /// Credentials taken entirely from the environment.
    pub fn from_env() -> Self {
        Self::new("", "", "", "")
    }

    fn resolve_with(
        access_key_id: &str,
        secret_access_key: &str,
        signing_key: &str,
        host: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let pick = |explicit: &str, var: &str| -> String {
            if explicit.is_empty() {
                env(var).unwrap_or_default()
            } else {
                explicit.to_string()
            }
        };

        Self::from_parts(
            pick(access_key_id, ENV_ACCESS_KEY_ID),
            pick(secret_access_key, ENV_SECRET_ACCESS_KEY),
            pick(signing_key, ENV_SIGNING_KEY),
            pick(host, ENV_SERVER),
        )
    }

    fn from_parts(
        access_key_id: String,
        secret_access_key: String,
        signing_key: String,
        host: String,
    ) -> Self {
        let host = if host.trim().is_empty() {
            DEFAULT_HOST.to_string()
        } else {
            normalize_host(host.trim())
        };

        Self {
            access_key_id,
            secret_access_key: SecretString::from(secret_access_key),
            signing_key: SecretString::from(signing_key),
            host,
        }
    }

    /// Load a profile from a credentials file.
    ///
    /// With `path == None` the default `~/.cryptograpi/credentials` is used.
    /// An explicitly named file that does not exist is an error.
    pub fn from_file(path: Option<&Path>, profile: &str) -> CgpiResult<Self> {
        let path = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(CgpiError::Config(format!(
                        "credentials file not found: {}",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => default_credentials_path(),
        };

        let text = std::fs::read_to_string(&path).map_err(|e| {
            CgpiError::Config(format!("reading credentials {}: {e}", path.display()))
        })?;
        let creds = Self::from_profile_ini(&text, profile)?;
        tracing::debug!(path = %path.display(), profile, "loaded credentials profile");
        Ok(creds)
    }

    fn from_profile_ini(text: &str, profile: &str) -> CgpiResult<Self> {
        // Secrets are opaque: no backslash escapes.
        let opts = ParseOption {
            enabled_escape: false,
            ..ParseOption::default()
        };
        let ini = Ini::load_from_str_opt(text, opts)
            .map_err(|e| CgpiError::Config(format!("parsing credentials file: {e}")))?;

        let default = ini.section(Some(DEFAULT_PROFILE));
        let selected = ini.section(Some(profile));
        let lookup = |key: &str| -> String {
            selected
                .and_then(|s| s.get(key))
                .or_else(|| default.and_then(|s| s.get(key)))
                .unwrap_or_default()
                .to_string()
        };

        Ok(Self::from_parts(
            lookup("ACCESS_KEY_ID"),
            lookup("SECRET_ACCESS_KEY"),
            lookup("SIGNING_KEY"),
            lookup("SERVER"),
        ))
    }

    /// Encryption and decryption require all three secrets.
    pub fn validate(&self) -> CgpiResult<()> {
        let missing = [
            ("access_key_id", self.access_key_id.is_empty()),
            (
                "secret_access_key",
                self.secret_access_key.expose_secret().is_empty(),
            ),
            ("signing_key", self.signing_key.expose_secret().is_empty()),
        ]
        .iter()
        .filter(|(_, empty)| *empty)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CgpiError::InvalidCredentials(format!(
                "missing {}",
                missing.join(", ")
            )))
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &SecretString {
        &self.secret_access_key
    }

    pub fn signing_key(&self) -> &SecretString {
        &self.signing_key
    }

    /// Host with scheme, e.g. `https://api.cryptograpi.com`.
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: SecretString::from(self.secret_access_key.expose_secret().to_owned()),
            signing_key: SecretString::from(self.signing_key.expose_secret().to_owned()),
            host: self.host.clone(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("signing_key", &"[REDACTED]")
            .field("host", &self.host)
            .finish()
    }
}

/// Prefix `https://` unless the host already names a scheme.
pub fn normalize_host(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", host.trim_end_matches('/'))
    }
}

fn default_credentials_path() -> PathBuf {
    home_dir().join(".cryptograpi/credentials")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
