use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Path of the SQLite database file, or `:memory:`.
    pub db_path: String,
    /// How often the expired token remover wakes up.
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub token_cleanup_interval: Duration,
    #[serde(default = "default_token_expiration", with = "humantime_serde")]
    pub default_token_expiration: Duration,
    #[serde(default = "min_token_expiration", with = "humantime_serde")]
    pub min_token_expiration: Duration,
    #[serde(default = "max_token_expiration", with = "humantime_serde")]
    pub max_token_expiration: Duration,
    /// Identifier of this installation, stamped on every token.
    #[serde(default)]
    pub instance_uuid: Option<Uuid>,
    /// Authentication backends to load, in registration order.
    #[serde(default = "default_enabled_backends")]
    pub enabled_backends: Vec<String>,
    /// Service accounts usable through the `service` backend.
    #[serde(default)]
    pub services: HashMap<String, ServiceAccount>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceAccount {
    pub secret: String,
    #[serde(default)]
    pub acls: Vec<String>,
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_token_expiration() -> Duration {
    Duration::from_secs(7200)
}

fn min_token_expiration() -> Duration {
    Duration::from_secs(60)
}

fn max_token_expiration() -> Duration {
    // 30 days
    Duration::from_secs(30 * 24 * 3600)
}

fn default_enabled_backends() -> Vec<String> {
    vec!["native".to_string(), "service".to_string()]
}

impl Config {
    #[must_use]
    pub fn using_inmemory_storage(&self) -> bool {
        self.db_path.contains(":memory:")
    }

    pub fn sanitize(&self) -> anyhow::Result<()> {
        if self.token_cleanup_interval.is_zero() {
            return Err(anyhow::Error::msg("token-cleanup-interval must not be zero"));
        }

        if self.min_token_expiration > self.max_token_expiration {
            return Err(anyhow::Error::msg(
                "min-token-expiration is greater than max-token-expiration",
            ));
        }

        if !self.using_inmemory_storage() {
            if let Some(parent) = std::path::Path::new(&self.db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.is_dir() {
                    return Err(anyhow::Error::msg(
                        "The parent directory of db-path does not exist",
                    ));
                }
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            token_cleanup_interval: default_cleanup_interval(),
            default_token_expiration: default_token_expiration(),
            min_token_expiration: min_token_expiration(),
            max_token_expiration: max_token_expiration(),
            instance_uuid: None,
            enabled_backends: default_enabled_backends(),
            services: HashMap::new(),
        }
    }
}
