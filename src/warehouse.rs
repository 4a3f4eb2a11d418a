//! Entry point for working with the tables of a warehouse.
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::{IcebergError, IcebergResult, IcebergTable};
use crate::catalog::{Catalog, InMemoryCatalog, StorageCatalog, TableIdent};
use crate::config::{CatalogKind, WarehouseConfig};
use crate::metadata::COMMIT_NUM_RETRIES;
use crate::partition::PartitionSpec;
use crate::scan::TableScan;
use crate::schema::Schema;
use crate::storage::IcebergStorage;
use crate::store::TableMetadataStore;

/// A warehouse: object storage holding tables, and the catalog tracking them.
///
/// Tables are laid out as `<warehouse>/<namespace...>/<name>/`. A `Warehouse`
/// is cheap to clone and all clones share the same catalog.
///
/// # Examples
///
/// ```rust
/// use icetable::{Warehouse, WarehouseConfig, TableIdent, IcebergResult};
///
/// #[tokio::main]
/// async fn main() -> IcebergResult<()> {
///     let warehouse = Warehouse::open(WarehouseConfig::in_memory())?;
///
///     match warehouse.load_table(&TableIdent::of(["raw"], "users")).await {
///         Ok(_) => println!("Table loaded"),
///         Err(e) if e.is_not_found() => println!("Table does not exist"),
///         Err(e) => return Err(e),
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Warehouse {
    config: WarehouseConfig,
    store: TableMetadataStore,
}

impl Warehouse {
    /// Opens the warehouse described by `config`, with the catalog it selects.
    pub fn open(config: WarehouseConfig) -> IcebergResult<Self> {
        let storage = Arc::new(IcebergStorage::from_url(&config.warehouse, &config.storage_options)?);
        let catalog: Arc<dyn Catalog> = match config.catalog {
            CatalogKind::Memory => Arc::new(InMemoryCatalog::new()),
            CatalogKind::Storage => Arc::new(StorageCatalog::new(storage.clone())),
        };

        info!(warehouse = %storage.location(), catalog = ?config.catalog, "opened warehouse");
        Ok(Self { config, store: TableMetadataStore::new(storage, catalog) })
    }

    /// Opens the warehouse described by `config` with an existing catalog.
    pub fn with_catalog(config: WarehouseConfig, catalog: Arc<dyn Catalog>) -> IcebergResult<Self> {
        let storage = Arc::new(IcebergStorage::from_url(&config.warehouse, &config.storage_options)?);
        Ok(Self { config, store: TableMetadataStore::new(storage, catalog) })
    }

    /// URI of the warehouse root.
    pub fn location(&self) -> &str {
        self.store.storage().location()
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    pub fn store(&self) -> &TableMetadataStore {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        self.store.catalog()
    }

    /// Full URI of the location of a table.
    pub fn table_location(&self, ident: &TableIdent) -> String {
        let mut location = self.location().to_string();
        for part in ident.namespace() {
            location.push('/');
            location.push_str(part);
        }
        location.push('/');
        location.push_str(ident.name());
        location
    }

    /// Creates an unpartitioned table.
    ///
    /// # Errors
    ///
    /// [`IcebergError::TableAlreadyExists`] if the catalog already has the table,
    /// and [`IcebergError::SchemaError`] if the schema is empty or invalid.
    pub async fn create_table(&self, ident: &TableIdent, schema: Schema) -> IcebergResult<IcebergTable> {
        self.create_partitioned_table(ident, schema, PartitionSpec::unpartitioned()).await
    }

    /// Creates a table partitioned by `partition_spec`.
    pub async fn create_partitioned_table(
        &self,
        ident: &TableIdent,
        schema: Schema,
        partition_spec: PartitionSpec,
    ) -> IcebergResult<IcebergTable> {
        if ident.name().is_empty() {
            return Err(IcebergError::ConfigError("table name is empty".to_string()));
        }

        let mut properties = BTreeMap::new();
        if let Some(retries) = self.config.commit_retries {
            properties.insert(COMMIT_NUM_RETRIES.to_string(), retries.to_string());
        }

        let loaded = self.store.create(
            ident,
            &self.table_location(ident),
            schema,
            partition_spec,
            properties
        ).await?;

        Ok(IcebergTable::new(ident.clone(), self.store.clone(), loaded))
    }

    /// Loads the current state of a table.
    ///
    /// # Errors
    ///
    /// [`IcebergError::TableNotFound`] if the catalog has no such table.
    pub async fn load_table(&self, ident: &TableIdent) -> IcebergResult<IcebergTable> {
        IcebergTable::load(ident, self.store.clone()).await
    }

    /// Removes a table from the catalog. Its files are kept.
    pub async fn drop_table(&self, ident: &TableIdent) -> IcebergResult<()> {
        self.catalog().drop_table(ident).await?;
        info!(table = %ident, "dropped table");
        Ok(())
    }

    /// Lists the tables of a namespace.
    pub async fn list_tables<I, S>(&self, namespace: I) -> IcebergResult<Vec<TableIdent>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let namespace: Vec<String> = namespace.into_iter().map(Into::into).collect();
        self.catalog().list_tables(&namespace).await
    }

    /// Scans the current snapshot of a table, or the snapshot that was current at
    /// `as_of_timestamp_ms`.
    pub async fn scan(
        &self,
        ident: &TableIdent,
        as_of_timestamp_ms: Option<i64>,
    ) -> IcebergResult<TableScan> {
        let table = self.load_table(ident).await?;
        let mut builder = table.scan();
        if let Some(timestamp_ms) = as_of_timestamp_ms {
            builder = builder.as_of_timestamp(timestamp_ms);
        }
        builder.build()
    }
}
