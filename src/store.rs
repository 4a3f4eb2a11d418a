//! Loading and committing table metadata.
//!
//! A commit writes the candidate metadata to a new, uniquely named file and then
//! moves the catalog pointer from the base metadata file to the new one with a
//! single compare-and-swap. Nothing a reader can observe changes before the swap,
//! and metadata files are never replaced or deleted, so readers holding an older
//! metadata file keep a consistent view.
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{IcebergError, IcebergResult};
use crate::catalog::{Catalog, TableIdent};
use crate::metadata::{metadata_file_name, LoadedMetadata, TableMetadata};
use crate::partition::PartitionSpec;
use crate::schema::Schema;
use crate::snapshot::Snapshot;
use crate::storage::IcebergStorage;

/// Reads and publishes metadata files for the tables of one warehouse.
#[derive(Debug, Clone)]
pub struct TableMetadataStore {
    storage: Arc<IcebergStorage>,
    catalog: Arc<dyn Catalog>,
}

impl TableMetadataStore {
    pub fn new(storage: Arc<IcebergStorage>, catalog: Arc<dyn Catalog>) -> Self {
        Self { storage, catalog }
    }

    pub fn storage(&self) -> &Arc<IcebergStorage> {
        &self.storage
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Reads and validates the metadata file at `location`.
    ///
    /// # Errors
    ///
    /// [`IcebergError::MetadataNotFound`] if there is no file at `location`, and
    /// [`IcebergError::InvalidMetadata`] if it can't be parsed.
    pub async fn read_metadata(&self, location: &str) -> IcebergResult<TableMetadata> {
        let path = self.storage.create_path_from_url(location)?;
        let bytes = match self.storage.read(&path).await {
            Ok(bytes) => bytes,
            Err(IcebergError::ObjectStore { source: object_store::Error::NotFound { .. } }) => {
                return Err(IcebergError::MetadataNotFound(location.to_string()));
            },
            Err(e) => return Err(e),
        };

        TableMetadata::decode(&bytes)
    }

    /// Loads the current metadata of a table.
    pub async fn load(&self, ident: &TableIdent) -> IcebergResult<LoadedMetadata> {
        let location = self.catalog.resolve_current(ident).await?;
        let metadata = self.read_metadata(&location).await?;
        debug!(table = %ident, metadata = %location, "loaded table metadata");

        Ok(LoadedMetadata::new(location, metadata))
    }

    /// Creates a table at `location`: writes its first metadata file and
    /// registers it in the catalog.
    ///
    /// # Errors
    ///
    /// [`IcebergError::TableAlreadyExists`] if the identifier is taken. The
    /// metadata file written before registering is left behind.
    pub async fn create(
        &self,
        ident: &TableIdent,
        location: &str,
        schema: Schema,
        partition_spec: PartitionSpec,
        properties: BTreeMap<String, String>,
    ) -> IcebergResult<LoadedMetadata> {
        let metadata = TableMetadata::try_new(location, schema, partition_spec, properties)?;
        let metadata_location = self.write_metadata(&metadata, 0).await?;
        self.catalog.create_table(ident, &metadata_location).await?;

        info!(table = %ident, metadata = %metadata_location, "created table");
        Ok(LoadedMetadata::new(metadata_location, metadata))
    }

    async fn write_metadata(&self, metadata: &TableMetadata, version: u64) -> IcebergResult<String> {
        let location = format!("{}/metadata/{}", metadata.location, metadata_file_name(version));
        let json = metadata.encode()?;
        let path = self.storage.create_path_from_url(&location)?;
        self.storage.write_once(&path, Bytes::from(json)).await?;

        Ok(location)
    }

    /// Commits `snapshot` on top of `base`, making it the table's current
    /// snapshot.
    ///
    /// # Errors
    ///
    /// * [`IcebergError::ValidationError`] if the snapshot does not follow `base`.
    /// * [`IcebergError::CommitFailed`] if the new metadata file could not be
    ///   written. The table is unchanged.
    /// * [`IcebergError::Conflict`] if another writer committed after `base` was
    ///   loaded. The table is unchanged and the commit is not retried.
    pub async fn commit(
        &self,
        ident: &TableIdent,
        base: &LoadedMetadata,
        snapshot: Snapshot,
    ) -> IcebergResult<LoadedMetadata> {
        let snapshot_id = snapshot.snapshot_id;
        let candidate = base.metadata.clone().with_snapshot(snapshot)?;
        let committed = self.commit_metadata(ident, base, candidate).await?;

        info!(table = %ident, snapshot_id, metadata = %committed.location, "committed snapshot");
        Ok(committed)
    }

    /// Publishes `candidate` as the successor of `base`.
    ///
    /// `candidate` must have been derived from `base.metadata`. The errors are the
    /// same as for [`commit`](Self::commit).
    pub async fn commit_metadata(
        &self,
        ident: &TableIdent,
        base: &LoadedMetadata,
        candidate: TableMetadata,
    ) -> IcebergResult<LoadedMetadata> {
        if candidate.table_uuid != base.metadata.table_uuid {
            return Err(IcebergError::ValidationError {
                message: format!(
                    "metadata of table {} can't replace table {}",
                    candidate.table_uuid, base.metadata.table_uuid
                )
            });
        }

        let candidate = candidate
            .with_previous_metadata(&base.location, base.metadata.last_updated_ms);
        candidate.validate()?;

        let version = base.version().map_or(1, |version| version + 1);
        let location = self.write_metadata(&candidate, version).await
            .map_err(|e| IcebergError::CommitFailed {
                attempts: 1,
                message: format!("failed writing metadata file: {e}"),
            })?;

        if !self.catalog.compare_and_swap(ident, &base.location, &location).await? {
            let current_location = self.catalog.resolve_current(ident).await?;
            warn!(
                table = %ident,
                base = %base.location,
                current = %current_location,
                "commit lost to a concurrent writer"
            );
            return Err(IcebergError::Conflict { table: ident.to_string(), current_location });
        }

        debug!(table = %ident, metadata = %location, "swapped metadata pointer");
        Ok(LoadedMetadata::new(location, candidate))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::metadata::metadata_file_version;
    use crate::schema::{Field, PrimitiveType};
    use crate::snapshot::{SnapshotOperation, SnapshotProducer, SnapshotSummary};

    fn store() -> TableMetadataStore {
        let storage = IcebergStorage::from_url("memory://warehouse", &HashMap::new()).unwrap();
        TableMetadataStore::new(Arc::new(storage), Arc::new(InMemoryCatalog::new()))
    }

    fn schema() -> Schema {
        Schema::new(0, vec![
            Field::new_primitive(1, "name", true, PrimitiveType::String),
        ])
    }

    fn snapshot(base: &LoadedMetadata) -> Snapshot {
        let producer = SnapshotProducer::new(&base.metadata, SnapshotOperation::Append);
        producer.produce(
            &format!("{}/metadata/snap-{}.avro", base.metadata.location, producer.snapshot_id()),
            SnapshotSummary::builder(SnapshotOperation::Append).build(),
        ).unwrap()
    }

    #[tokio::test]
    async fn create_load_commit() {
        let store = store();
        let ident = TableIdent::of(["raw"], "users");
        let created = store.create(
            &ident,
            "memory://warehouse/raw/users",
            schema(),
            PartitionSpec::unpartitioned(),
            BTreeMap::new(),
        ).await.unwrap();

        assert_eq!(created.version(), Some(0));
        assert_eq!(store.load(&ident).await.unwrap(), created);

        let committed = store.commit(&ident, &created, snapshot(&created)).await.unwrap();
        assert_eq!(metadata_file_version(&committed.location), Some(1));
        assert_eq!(committed.metadata.metadata_log.len(), 1);
        assert_eq!(committed.metadata.metadata_log[0].metadata_file, created.location);
        assert_eq!(committed.metadata.last_sequence_number, 1);
        assert_eq!(store.load(&ident).await.unwrap(), committed);

        // The replaced metadata file is still readable.
        assert_eq!(store.read_metadata(&created.location).await.unwrap(), created.metadata);
    }

    #[tokio::test]
    async fn stale_base_conflicts() {
        let store = store();
        let ident = TableIdent::of(["raw"], "users");
        let base = store.create(
            &ident,
            "memory://warehouse/raw/users",
            schema(),
            PartitionSpec::unpartitioned(),
            BTreeMap::new(),
        ).await.unwrap();

        let winner = store.commit(&ident, &base, snapshot(&base)).await.unwrap();
        let err = store.commit(&ident, &base, snapshot(&base)).await.unwrap_err();

        match err {
            IcebergError::Conflict { table, current_location } => {
                assert_eq!(table, "raw.users");
                assert_eq!(current_location, winner.location);
            },
            e => panic!("unexpected error: {e}"),
        }
        assert_eq!(store.load(&ident).await.unwrap(), winner);
    }

    #[tokio::test]
    async fn failed_metadata_write_fails_the_commit() {
        use crate::storage::testing::FaultyStore;

        let storage = FaultyStore::failing_puts("/00001-").into_storage("memory://warehouse");
        let store = TableMetadataStore::new(Arc::new(storage), Arc::new(InMemoryCatalog::new()));
        let ident = TableIdent::of(["raw"], "users");
        let base = store.create(
            &ident,
            "memory://warehouse/raw/users",
            schema(),
            PartitionSpec::unpartitioned(),
            BTreeMap::new(),
        ).await.unwrap();

        let err = store.commit(&ident, &base, snapshot(&base)).await.unwrap_err();
        assert!(matches!(err, IcebergError::CommitFailed { attempts: 1, .. }));
        assert_eq!(store.load(&ident).await.unwrap(), base);
    }

    #[tokio::test]
    async fn missing_metadata_file() {
        let store = store();
        let err = store.read_metadata("memory://warehouse/raw/users/metadata/00001-x.metadata.json")
            .await
            .unwrap_err();
        assert!(matches!(err, IcebergError::MetadataNotFound(_)));
    }
}
