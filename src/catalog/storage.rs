//! Catalog persisted in the warehouse's object storage.
//!
//! Every table owns a directory of pointer files under `_catalog/`:
//!
//! ```text
//! _catalog/<namespace>/<name>/0000000001.json
//! _catalog/<namespace>/<name>/0000000002.json
//! ```
//!
//! Each pointer file records the location of one metadata file. The pointer
//! with the highest version is current. Moving the pointer means writing the
//! next version with a create-only put, so of several writers racing from the
//! same version only one can succeed. Dropping a table writes a tombstone
//! version without a metadata location.
use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{IcebergError, IcebergResult};
use crate::storage::{IcebergPath, IcebergStorage};
use super::{Catalog, TableIdent};

const CATALOG_DIR: &str = "_catalog";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CatalogPointer {
    version: u64,
    /// `None` marks a dropped table.
    metadata_location: Option<String>,
}

/// Catalog storing table pointers next to the tables themselves.
///
/// Needs no external service: any store supporting create-only puts provides
/// the required compare-and-swap.
#[derive(Debug)]
pub struct StorageCatalog {
    storage: Arc<IcebergStorage>,
}

impl StorageCatalog {
    pub fn new(storage: Arc<IcebergStorage>) -> Self {
        Self { storage }
    }

    fn namespace_dir(namespace: &[String]) -> IcebergPath {
        IcebergPath::from(CATALOG_DIR).child(namespace.join("."))
    }

    fn table_dir(ident: &TableIdent) -> IcebergResult<IcebergPath> {
        if ident.namespace().is_empty() {
            return Err(IcebergError::ConfigError(format!(
                "table {ident} must have a namespace"
            )));
        }
        Ok(Self::namespace_dir(ident.namespace()).child(ident.name()))
    }

    fn pointer_version(path: &IcebergPath) -> Option<u64> {
        path.filename()?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    /// Reads the pointer with the highest version, if any was ever written.
    async fn latest(&self, table_dir: &IcebergPath) -> IcebergResult<Option<CatalogPointer>> {
        let latest = self.storage.list(table_dir).await?
            .iter()
            .filter_map(|obj| Self::pointer_version(&obj.location).map(|v| (v, obj.location.clone())))
            .max_by_key(|(version, _)| *version);

        let Some((_, path)) = latest else {
            return Ok(None);
        };

        let bytes = self.storage.read(&path).await?;
        let pointer = serde_json::from_slice(&bytes)
            .map_err(|e| IcebergError::InvalidMetadata { source: e })?;
        Ok(Some(pointer))
    }

    /// Writes pointer `version`. Returns `false` if another writer wrote that
    /// version first.
    async fn write_pointer(
        &self,
        table_dir: &IcebergPath,
        version: u64,
        metadata_location: Option<&str>
    ) -> IcebergResult<bool> {
        let pointer = CatalogPointer {
            version,
            metadata_location: metadata_location.map(str::to_string),
        };
        let bytes = serde_json::to_vec(&pointer)
            .map_err(|e| IcebergError::SerializeJson { source: e })?;

        let path = table_dir.child(format!("{version:010}.json"));
        match self.storage.write_once(&path, Bytes::from(bytes)).await {
            Ok(()) => Ok(true),
            Err(IcebergError::FileAlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns the version and metadata location of a live table.
    async fn live(&self, ident: &TableIdent) -> IcebergResult<(IcebergPath, u64, String)> {
        let table_dir = Self::table_dir(ident)?;
        match self.latest(&table_dir).await? {
            Some(CatalogPointer { version, metadata_location: Some(location) }) => {
                Ok((table_dir, version, location))
            },
            _ => Err(IcebergError::TableNotFound { table: ident.to_string() }),
        }
    }
}

#[async_trait]
impl Catalog for StorageCatalog {
    async fn create_table(&self, ident: &TableIdent, metadata_location: &str) -> IcebergResult<()> {
        let table_dir = Self::table_dir(ident)?;
        let version = match self.latest(&table_dir).await? {
            Some(CatalogPointer { metadata_location: Some(_), .. }) => {
                return Err(IcebergError::TableAlreadyExists { table: ident.to_string() });
            },
            // Recreating a dropped table continues its version sequence.
            Some(tombstone) => tombstone.version + 1,
            None => 1,
        };

        if self.write_pointer(&table_dir, version, Some(metadata_location)).await? {
            Ok(())
        } else {
            Err(IcebergError::TableAlreadyExists { table: ident.to_string() })
        }
    }

    async fn resolve_current(&self, ident: &TableIdent) -> IcebergResult<String> {
        self.live(ident).await.map(|(_, _, location)| location)
    }

    async fn compare_and_swap(
        &self,
        ident: &TableIdent,
        expected: &str,
        new: &str
    ) -> IcebergResult<bool> {
        let (table_dir, version, current) = self.live(ident).await?;
        if current != expected {
            debug!(table = %ident, expected, current, "pointer moved");
            return Ok(false);
        }

        let swapped = self.write_pointer(&table_dir, version + 1, Some(new)).await?;
        if !swapped {
            debug!(table = %ident, version = version + 1, "lost pointer race");
        }
        Ok(swapped)
    }

    async fn list_tables(&self, namespace: &[String]) -> IcebergResult<Vec<TableIdent>> {
        if namespace.is_empty() {
            return Ok(Vec::new());
        }

        let names: BTreeSet<String> = self.storage
            .list(&Self::namespace_dir(namespace)).await?
            .iter()
            .filter_map(|obj| {
                let mut parts = obj.location.as_ref().split('/');
                parts.nth(2).map(str::to_string)
            })
            .collect();

        let mut idents = Vec::new();
        for name in names {
            let ident = TableIdent::new(namespace.to_vec(), name);
            match self.live(&ident).await {
                Ok(_) => idents.push(ident),
                Err(IcebergError::TableNotFound { .. }) => {},
                Err(e) => return Err(e),
            }
        }
        Ok(idents)
    }

    async fn drop_table(&self, ident: &TableIdent) -> IcebergResult<()> {
        let (table_dir, version, _) = self.live(ident).await?;
        if self.write_pointer(&table_dir, version + 1, None).await? {
            Ok(())
        } else {
            // A concurrent commit won; the table is still live.
            Err(IcebergError::Conflict {
                table: ident.to_string(),
                current_location: self.resolve_current(ident).await?,
            })
        }
    }
}
