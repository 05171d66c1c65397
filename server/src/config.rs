//! Configuration management for the server.

use fieldsync_engine::{ConflictPolicy, NodeRole};
use std::env;
use std::str::FromStr;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Shared secret peers present as a bearer token. Anonymous access when unset.
    pub auth_secret: Option<String>,
    pub sync: SyncSettings,
}

/// Tunables of the sync session manager.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Rows read per batch while snapshotting one type.
    pub snapshot_batch_size: i64,
    pub pull_page_default: i64,
    pub pull_page_max: i64,
    /// Sessions idle longer than this are closed by the reaper.
    pub lapsed_session_seconds: i64,
    pub lapsed_session_check_frequency_seconds: u64,
    pub conflict_policy: ConflictPolicy,
    pub node_role: NodeRole,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            snapshot_batch_size: 10_000,
            pull_page_default: 100,
            pull_page_max: 5_000,
            lapsed_session_seconds: 1_200,
            lapsed_session_check_frequency_seconds: 120,
            conflict_policy: ConflictPolicy::default(),
            node_role: NodeRole::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            sync: SyncSettings::from_env()?,
        })
    }
}

impl SyncSettings {
    /// Read overrides from the environment, keeping defaults for unset names.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let settings = Self {
            snapshot_batch_size: parse_or(&lookup, "SNAPSHOT_BATCH_SIZE", defaults.snapshot_batch_size)?,
            pull_page_default: parse_or(&lookup, "PULL_PAGE_DEFAULT", defaults.pull_page_default)?,
            pull_page_max: parse_or(&lookup, "PULL_PAGE_MAX", defaults.pull_page_max)?,
            lapsed_session_seconds: parse_or(&lookup, "LAPSED_SESSION_SECONDS", defaults.lapsed_session_seconds)?,
            lapsed_session_check_frequency_seconds: parse_or(
                &lookup,
                "LAPSED_SESSION_CHECK_FREQUENCY_SECONDS",
                defaults.lapsed_session_check_frequency_seconds,
            )?,
            conflict_policy: match lookup("CONFLICT_POLICY") {
                Some(value) => ConflictPolicy::parse(&value)
                    .ok_or_else(|| ConfigError::invalid("CONFLICT_POLICY", &value))?,
                None => defaults.conflict_policy,
            },
            node_role: match lookup("NODE_ROLE").as_deref() {
                Some("central") | None => NodeRole::Central,
                Some("facility") => NodeRole::Facility,
                Some(other) => return Err(ConfigError::invalid("NODE_ROLE", other)),
            },
        };

        if settings.snapshot_batch_size < 1 {
            return Err(ConfigError::invalid(
                "SNAPSHOT_BATCH_SIZE",
                &settings.snapshot_batch_size.to_string(),
            ));
        }
        if settings.pull_page_default < 1 || settings.pull_page_default > settings.pull_page_max {
            return Err(ConfigError::invalid(
                "PULL_PAGE_DEFAULT",
                &settings.pull_page_default.to_string(),
            ));
        }
        if settings.lapsed_session_check_frequency_seconds == 0 {
            return Err(ConfigError::invalid("LAPSED_SESSION_CHECK_FREQUENCY_SECONDS", "0"));
        }
        Ok(settings)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::invalid(name, &raw)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
}

impl ConfigError {
    fn invalid(name: &'static str, value: &str) -> Self {
        ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<SyncSettings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncSettings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(settings(&[]).unwrap(), SyncSettings::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let s = settings(&[
            ("SNAPSHOT_BATCH_SIZE", "250"),
            ("CONFLICT_POLICY", "incoming-wins"),
            ("NODE_ROLE", "facility"),
        ])
        .unwrap();
        assert_eq!(s.snapshot_batch_size, 250);
        assert_eq!(s.conflict_policy, ConflictPolicy::IncomingWins);
        assert_eq!(s.node_role, NodeRole::Facility);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            settings(&[("NODE_ROLE", "satellite")]),
            Err(ConfigError::InvalidValue { name: "NODE_ROLE", .. })
        ));
        assert!(settings(&[("SNAPSHOT_BATCH_SIZE", "0")]).is_err());
        assert!(settings(&[("PULL_PAGE_DEFAULT", "9000")]).is_err());
        assert!(settings(&[("CONFLICT_POLICY", "coin-flip")]).is_err());
    }
}
