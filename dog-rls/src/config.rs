use std::time::Duration;

use dog_core::DogConfigSnapshot;

use crate::error::ConfigError;
use crate::session::SessionKeys;

/// Tunables of the transaction manager itself.
#[derive(Debug, Clone)]
pub struct TenantTxConfig {
    /// How long an invocation waits for a pooled connection
    pub acquire_timeout: Duration,

    /// Names of the transaction-local RLS settings
    pub session_keys: SessionKeys,
}

impl Default for TenantTxConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            session_keys: SessionKeys::default(),
        }
    }
}

impl TenantTxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_session_keys(mut self, keys: SessionKeys) -> Self {
        self.session_keys = keys;
        self
    }
}

/// Connection pool bounds. Read once at process start by whoever builds the
/// pool; the manager never sees these values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub database_url: Option<String>,
    pub max_connections: usize,
    pub min_connections: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_millis(5_000),
            idle_timeout: Duration::from_millis(600_000),
        }
    }
}

impl PoolConfig {
    pub const URL: &'static str = "database.url";
    pub const MAX: &'static str = "database.pool.max";
    pub const MIN: &'static str = "database.pool.min";
    pub const ACQUIRE_TIMEOUT_MS: &'static str = "database.pool.acquire_timeout_ms";
    pub const IDLE_TIMEOUT_MS: &'static str = "database.pool.idle_timeout_ms";

    /// Read pool settings, falling back to defaults for absent keys.
    /// Present but unparsable values are errors.
    pub fn from_snapshot(snapshot: &DogConfigSnapshot) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_connections = read(snapshot, Self::MAX, DogConfigSnapshot::get_usize)?
            .unwrap_or(defaults.max_connections);
        let min_connections = read(snapshot, Self::MIN, DogConfigSnapshot::get_usize)?
            .unwrap_or(defaults.min_connections);
        let acquire_timeout = read(snapshot, Self::ACQUIRE_TIMEOUT_MS, DogConfigSnapshot::get_u64)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.acquire_timeout);
        let idle_timeout = read(snapshot, Self::IDLE_TIMEOUT_MS, DogConfigSnapshot::get_u64)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.idle_timeout);

        if max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: Self::MAX.to_string(),
                value: "0".to_string(),
            });
        }
        if min_connections > max_connections {
            return Err(ConfigError::InvalidValue {
                key: Self::MIN.to_string(),
                value: min_connections.to_string(),
            });
        }

        Ok(Self {
            database_url: snapshot.get_string(Self::URL),
            max_connections,
            min_connections,
            acquire_timeout,
            idle_timeout,
        })
    }

    pub fn require_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::Missing(Self::URL.to_string()))
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

fn read<T>(
    snapshot: &DogConfigSnapshot,
    key: &str,
    parse: fn(&DogConfigSnapshot, &str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    match snapshot.get(key) {
        None => Ok(None),
        Some(raw) => parse(snapshot, key).map(Some).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dog_core::DogConfig;

    #[test]
    fn absent_keys_use_defaults() {
        let config = PoolConfig::from_snapshot(&DogConfig::new().snapshot()).unwrap();
        assert_eq!(config, PoolConfig::default());
        assert!(config.require_url().is_err());
    }

    #[test]
    fn reads_env_style_settings() {
        let vars = vec![
            ("DOG__DATABASE__URL".to_string(), "postgres://app@db/support".to_string()),
            ("DOG__DATABASE__POOL__MAX".to_string(), "4".to_string()),
            ("DOG__DATABASE__POOL__ACQUIRE_TIMEOUT_MS".to_string(), "250".to_string()),
        ];
        let snapshot = DogConfig::from_vars(vars, "DOG").snapshot();

        let config = PoolConfig::from_snapshot(&snapshot).unwrap();

        assert_eq!(config.require_url().unwrap(), "postgres://app@db/support");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.idle_timeout, Duration::from_millis(600_000));
    }

    #[test]
    fn rejects_bad_bounds() {
        let mut raw = DogConfig::new();
        raw.set(PoolConfig::MAX, "2");
        raw.set(PoolConfig::MIN, "3");
        assert!(PoolConfig::from_snapshot(&raw.snapshot()).is_err());

        let mut raw = DogConfig::new();
        raw.set(PoolConfig::MAX, "lots");
        assert_eq!(
            PoolConfig::from_snapshot(&raw.snapshot()),
            Err(ConfigError::InvalidValue {
                key: PoolConfig::MAX.to_string(),
                value: "lots".to_string()
            })
        );
    }
}
