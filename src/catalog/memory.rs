//! In-memory catalog.
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{IcebergError, IcebergResult};
use super::{Catalog, TableIdent};

/// Catalog keeping table pointers in process memory.
///
/// Pointers are lost when the catalog is dropped, while the files they point to
/// remain in storage.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tables: RwLock<HashMap<TableIdent, String>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn create_table(&self, ident: &TableIdent, metadata_location: &str) -> IcebergResult<()> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(ident) {
            return Err(IcebergError::TableAlreadyExists { table: ident.to_string() });
        }
        tables.insert(ident.clone(), metadata_location.to_string());
        Ok(())
    }

    async fn resolve_current(&self, ident: &TableIdent) -> IcebergResult<String> {
        self.tables.read().await
            .get(ident)
            .cloned()
            .ok_or_else(|| IcebergError::TableNotFound { table: ident.to_string() })
    }

    async fn compare_and_swap(
        &self,
        ident: &TableIdent,
        expected: &str,
        new: &str
    ) -> IcebergResult<bool> {
        let mut tables = self.tables.write().await;
        let current = tables.get_mut(ident)
            .ok_or_else(|| IcebergError::TableNotFound { table: ident.to_string() })?;

        if current != expected {
            debug!(table = %ident, expected, current = %current, "pointer moved");
            return Ok(false);
        }

        *current = new.to_string();
        Ok(true)
    }

    async fn list_tables(&self, namespace: &[String]) -> IcebergResult<Vec<TableIdent>> {
        let mut idents: Vec<TableIdent> = self.tables.read().await
            .keys()
            .filter(|ident| ident.namespace() == namespace)
            .cloned()
            .collect();
        idents.sort();
        Ok(idents)
    }

    async fn drop_table(&self, ident: &TableIdent) -> IcebergResult<()> {
        self.tables.write().await
            .remove(ident)
            .map(|_| ())
            .ok_or_else(|| IcebergError::TableNotFound { table: ident.to_string() })
    }
}
