//! # DogRS Configuration
//!
//! A minimal, framework-agnostic string key/value store. Keys are dotted
//! paths (`database.pool.max`); typed reads happen on an immutable
//! [`DogConfigSnapshot`] handed to whoever builds infrastructure at
//! process start.
//!
//! ```rust
//! use dog_core::DogConfig;
//!
//! let mut config = DogConfig::new();
//! config.set("database.pool.max", "20");
//!
//! let snapshot = config.snapshot();
//! assert_eq!(snapshot.get_usize("database.pool.max"), Some(20));
//! ```
//!
//! ## Environment overrides
//!
//! [`DogConfig::from_env`] maps `PREFIX__A__B=value` onto `a.b = value`:
//!
//! ```bash
//! export DOG__DATABASE__POOL__MAX=25   # database.pool.max
//! ```

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct DogConfig {
    values: HashMap<String, String>,
}

impl DogConfig {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Load every environment variable starting with `prefix`.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_vars(std::env::vars(), prefix)
    }

    /// Same as [`DogConfig::from_env`] over an explicit variable list.
    pub fn from_vars<I>(vars: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::new();
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped
                    .trim_start_matches('_')
                    .to_lowercase()
                    .replace("__", ".");
                if !normalized.is_empty() {
                    config.set(normalized, value);
                }
            }
        }
        config
    }

    /// Set a configuration key to a string value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Get a configuration value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn snapshot(&self) -> DogConfigSnapshot {
        DogConfigSnapshot::new(self.values.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DogConfigSnapshot {
    map: HashMap<String, String>,
}

impl DogConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.trim().parse::<bool>().ok())
    }
}
