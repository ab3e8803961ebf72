//! The settings map every backend is constructed from.
//!
//! Loading the map from a file or environment is out of scope (spec.md
//! §1's "configuration loading" collaborator); this module only gives
//! backends typed access to whatever map the caller already built, with
//! the well-known keys from spec.md §6: `storage_type`,
//! `storage_addresses`, `app_name`, `namespace`, and the per-backend
//! options (`max_batch_bytes`, `scan_inner_limit`, `min_connections`,
//! `max_connections`, `scan_limit`, `protocol`, `filename`,
//! `copy_to_filename`, `redis_db_num`, ...).

use std::collections::HashMap;

use crate::error::{StorageError, StorageResult};

/// One configuration value. Lists are their own variant rather than a
/// nested `Value` enum since no backend option needs more than one level
/// of structure (spec.md §6's option list is all scalars or string lists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    StrList(Vec<String>),
}

/// A typed wrapper over a plain settings map.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig(HashMap<String, ConfigValue>);

impl StorageConfig {
    pub fn new() -> Self {
        StorageConfig(HashMap::new())
    }

    pub fn set_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), ConfigValue::Str(value.into()));
        self
    }

    pub fn set_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.0.insert(key.into(), ConfigValue::Int(value));
        self
    }

    pub fn set_str_list(mut self, key: impl Into<String>, value: Vec<String>) -> Self {
        self.0.insert(key.into(), ConfigValue::StrList(value));
        self
    }

    /// Required string setting. `BadConfig` if missing or the wrong type.
    pub fn get_str(&self, key: &str) -> StorageResult<&str> {
        match self.0.get(key) {
            Some(ConfigValue::Str(s)) => Ok(s.as_str()),
            Some(_) => Err(StorageError::bad_config(format!("'{key}' is not a string"))),
            None => Err(StorageError::bad_config(format!("missing required setting '{key}'"))),
        }
    }

    /// Optional string setting.
    pub fn get_str_opt(&self, key: &str) -> StorageResult<Option<&str>> {
        match self.0.get(key) {
            Some(ConfigValue::Str(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(StorageError::bad_config(format!("'{key}' is not a string"))),
            None => Ok(None),
        }
    }

    /// Required non-negative integer setting.
    pub fn get_u64(&self, key: &str) -> StorageResult<u64> {
        self.get_u64_opt(key)?
            .ok_or_else(|| StorageError::bad_config(format!("missing required setting '{key}'")))
    }

    /// Optional non-negative integer setting, with a default.
    pub fn get_u64_or(&self, key: &str, default: u64) -> StorageResult<u64> {
        Ok(self.get_u64_opt(key)?.unwrap_or(default))
    }

    fn get_u64_opt(&self, key: &str) -> StorageResult<Option<u64>> {
        match self.0.get(key) {
            Some(ConfigValue::Int(n)) if *n >= 0 => Ok(Some(*n as u64)),
            Some(ConfigValue::Int(_)) => {
                Err(StorageError::bad_config(format!("'{key}' must not be negative")))
            }
            Some(_) => Err(StorageError::bad_config(format!("'{key}' is not an integer"))),
            None => Ok(None),
        }
    }

    /// Required string-list setting (e.g. `storage_addresses`).
    pub fn get_str_list(&self, key: &str) -> StorageResult<&[String]> {
        match self.0.get(key) {
            Some(ConfigValue::StrList(v)) => Ok(v.as_slice()),
            Some(_) => Err(StorageError::bad_config(format!("'{key}' is not a list"))),
            None => Err(StorageError::bad_config(format!("missing required setting '{key}'"))),
        }
    }

    /// The first address in `storage_addresses`; later addresses are
    /// ignored by every backend that accepts this key (a known limitation
    /// carried forward from the source: only one connection per client).
    pub fn primary_address(&self) -> StorageResult<&str> {
        self.get_str_list("storage_addresses")?
            .first()
            .map(|s| s.as_str())
            .ok_or_else(|| StorageError::bad_config("'storage_addresses' is empty"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_string_is_bad_config() {
        let cfg = StorageConfig::new();
        assert!(matches!(cfg.get_str("app_name"), Err(StorageError::BadConfig(_))));
    }

    #[test]
    fn wrong_type_is_bad_config() {
        let cfg = StorageConfig::new().set_str("scan_limit", "100");
        assert!(matches!(cfg.get_u64("scan_limit"), Err(StorageError::BadConfig(_))));
    }

    #[test]
    fn default_is_used_when_absent() {
        let cfg = StorageConfig::new();
        assert_eq!(cfg.get_u64_or("scan_inner_limit", 1000).unwrap(), 1000);
    }

    #[test]
    fn primary_address_takes_first_of_list() {
        let cfg = StorageConfig::new()
            .set_str_list("storage_addresses", vec!["a:1".into(), "b:2".into()]);
        assert_eq!(cfg.primary_address().unwrap(), "a:1");
    }
}
