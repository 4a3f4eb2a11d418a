//! Warehouse configuration.
//!
//! A [`WarehouseConfig`] is built in code, read from a JSON file, or read from
//! environment variables. It is read once when a
//! [`Warehouse`](crate::Warehouse) is opened.
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{IcebergError, IcebergResult};

/// Environment variable holding the warehouse URL.
pub const ENV_WAREHOUSE: &str = "ICETABLE_WAREHOUSE";
/// Environment variable selecting the catalog, `memory` or `storage`.
pub const ENV_CATALOG: &str = "ICETABLE_CATALOG";
/// Environment variable holding the number of commit retries for new tables.
pub const ENV_COMMIT_RETRIES: &str = "ICETABLE_COMMIT_RETRIES";

/// Environment variables read into the storage options of S3 warehouses, and
/// the options they set.
const ENV_S3_OPTIONS: [(&str, &str); 3] = [
    ("AWS_DEFAULT_REGION", "aws_region"),
    ("AWS_ACCESS_KEY_ID", "aws_access_key_id"),
    ("AWS_SECRET_ACCESS_KEY", "aws_secret_access_key"),
];

/// Same for Azure Data Lake Storage warehouses, authenticated with a shared
/// account key.
const ENV_AZURE_OPTIONS: [(&str, &str); 2] = [
    ("AZURE_STORAGE_ACCOUNT_NAME", "azure_storage_account_name"),
    ("AZURE_STORAGE_ACCOUNT_KEY", "azure_storage_account_key"),
];

fn env_storage_options(warehouse: &str) -> &'static [(&'static str, &'static str)] {
    match warehouse.split_once("://").map(|(scheme, _)| scheme) {
        Some("s3") => &ENV_S3_OPTIONS,
        Some("abfss" | "az") => &ENV_AZURE_OPTIONS,
        _ => &[],
    }
}

/// Where a warehouse keeps its catalog pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    /// In process memory; tables are forgotten when the warehouse is dropped.
    #[default]
    Memory,
    /// In the warehouse storage, under `_catalog/`.
    Storage,
}

impl FromStr for CatalogKind {
    type Err = IcebergError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(CatalogKind::Memory),
            "storage" => Ok(CatalogKind::Storage),
            _ => Err(IcebergError::ConfigError(format!("unknown catalog kind '{s}'"))),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WarehouseConfig {
    /// URL of the warehouse root, e.g. `file:///data/warehouse`,
    /// `s3://bucket/warehouse` or
    /// `abfss://container@account.dfs.core.windows.net/warehouse`.
    pub warehouse: String,
    #[serde(default)]
    pub catalog: CatalogKind,
    /// Options of the object store, e.g. credentials. See
    /// [`IcebergStorage::from_url`](crate::storage::IcebergStorage::from_url).
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    /// Number of times a conflicting commit is retried, recorded as the
    /// `commit.retry.num-retries` property of tables created in the warehouse.
    #[serde(default)]
    pub commit_retries: Option<u32>,
}

impl WarehouseConfig {
    pub fn new(warehouse: &str) -> Self {
        Self {
            warehouse: warehouse.to_string(),
            catalog: CatalogKind::default(),
            storage_options: HashMap::new(),
            commit_retries: None,
        }
    }

    /// A process-local warehouse with an in-memory catalog, for tests.
    pub fn in_memory() -> Self {
        Self::new("memory://warehouse")
    }

    pub fn with_catalog(mut self, catalog: CatalogKind) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_storage_option(mut self, key: &str, value: &str) -> Self {
        self.storage_options.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_commit_retries(mut self, retries: u32) -> Self {
        self.commit_retries = Some(retries);
        self
    }

    pub fn from_json(json: &str) -> IcebergResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| IcebergError::ConfigError(format!("invalid warehouse config: {e}")))
    }

    /// Reads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> IcebergResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reads the configuration from `ICETABLE_*` environment variables, and the
    /// credentials of the warehouse's store from `AWS_*` (S3) or `AZURE_*`
    /// (Azure) variables.
    ///
    /// # Errors
    ///
    /// [`IcebergError::ConfigError`] if `ICETABLE_WAREHOUSE` is not set, or a
    /// variable can't be parsed.
    pub fn from_env() -> IcebergResult<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), looking variables up with `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> IcebergResult<Self> {
        let warehouse = var(ENV_WAREHOUSE).ok_or_else(|| {
            IcebergError::ConfigError(format!("{ENV_WAREHOUSE} is not set"))
        })?;
        let mut config = Self::new(&warehouse);

        if let Some(catalog) = var(ENV_CATALOG) {
            config.catalog = catalog.parse()?;
        }
        if let Some(retries) = var(ENV_COMMIT_RETRIES) {
            config.commit_retries = Some(retries.parse().map_err(|e| {
                IcebergError::ConfigError(format!("{ENV_COMMIT_RETRIES}='{retries}': {e}"))
            })?);
        }
        for &(name, option) in env_storage_options(&warehouse) {
            if let Some(value) = var(name) {
                config.storage_options.insert(option.to_string(), value);
            }
        }

        Ok(config)
    }
}

impl fmt::Debug for WarehouseConfig {
    // Storage options hold credentials; only their keys are shown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut option_keys: Vec<&String> = self.storage_options.keys().collect();
        option_keys.sort();

        f.debug_struct("WarehouseConfig")
            .field("warehouse", &self.warehouse)
            .field("catalog", &self.catalog)
            .field("storage_options", &option_keys)
            .field("commit_retries", &self.commit_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn config_from_vars() {
        let vars = HashMap::from([
            ("ICETABLE_WAREHOUSE", "s3://bucket/warehouse"),
            ("ICETABLE_CATALOG", "storage"),
            ("ICETABLE_COMMIT_RETRIES", "7"),
            ("AWS_DEFAULT_REGION", "eu-west-1"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
        ]);
        let config = WarehouseConfig::from_vars(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.warehouse, "s3://bucket/warehouse");
        assert_eq!(config.catalog, CatalogKind::Storage);
        assert_eq!(config.commit_retries, Some(7));
        assert_eq!(config.storage_options["aws_region"], "eu-west-1");
        assert!(!format!("{config:?}").contains("secret\""));

        assert!(WarehouseConfig::from_vars(|_| None).is_err());
        let local = WarehouseConfig::from_vars(|name| match name {
            "ICETABLE_WAREHOUSE" => Some("file:///tmp/warehouse".to_string()),
            _ => vars.get(name).map(|v| v.to_string()),
        }).unwrap();
        assert!(local.storage_options.is_empty());
        let bad = WarehouseConfig::from_vars(|name| match name {
            "ICETABLE_WAREHOUSE" => Some("memory://w".to_string()),
            "ICETABLE_CATALOG" => Some("hive".to_string()),
            _ => None,
        });
        assert!(matches!(bad, Err(IcebergError::ConfigError(_))));
    }

    #[test]
    fn azure_config_from_vars() {
        let vars = HashMap::from([
            ("ICETABLE_WAREHOUSE", "abfss://lake@account.dfs.core.windows.net/warehouse"),
            ("AZURE_STORAGE_ACCOUNT_NAME", "account"),
            ("AZURE_STORAGE_ACCOUNT_KEY", "a2V5"),
            ("AWS_DEFAULT_REGION", "eu-west-1"),
        ]);
        let config = WarehouseConfig::from_vars(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.storage_options.len(), 2);
        assert_eq!(config.storage_options["azure_storage_account_name"], "account");
        assert_eq!(config.storage_options["azure_storage_account_key"], "a2V5");
    }

    #[test]
    fn config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{
            "warehouse": "file:///tmp/warehouse",
            "catalog": "storage",
            "storage-options": {{"aws_region": "us-east-1"}}
        }}"#).unwrap();

        let config = WarehouseConfig::from_file(file.path()).unwrap();
        assert_eq!(config.catalog, CatalogKind::Storage);
        assert_eq!(config.commit_retries, None);
        assert_eq!(config.storage_options.len(), 1);

        assert!(WarehouseConfig::from_json(r#"{"warehouse": "x", "unknown": 1}"#).is_err());
    }
}
