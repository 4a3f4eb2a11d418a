//! Interface to Iceberg table transactions.
//!
//! A [`Transaction`] commits a list of [`TableOperation`]s, one new metadata file
//! each. Every operation is applied to the metadata the table was loaded with;
//! when another writer commits first the operation is applied again to the new
//! metadata, up to the table's retry limit.
use std::collections::HashSet;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{IcebergError, IcebergResult, IcebergTable, TableMetadata};
use crate::manifest::{DataFile, ManifestBuilder, ManifestList, ManifestWriter};
use crate::partition::PartitionField;
use crate::schema::SchemaUpdate;
use crate::snapshot::{Snapshot, SnapshotOperation, SnapshotProducer, SnapshotSummary};

/// The result of applying an operation to table metadata.
#[derive(Debug)]
pub enum TableUpdate {
    /// A new snapshot to commit on top of the base metadata.
    Snapshot(Snapshot),
    /// New metadata derived from the base metadata.
    Metadata(TableMetadata),
}

#[async_trait]
pub trait TableOperation: Send + Sync {
    /// Applies the operation to `base`, writing any manifests it needs.
    ///
    /// `attempt` counts the commit attempts of the operation from 1, and is used
    /// to keep the names of files written by different attempts apart.
    async fn apply(
        &self,
        table: &IcebergTable,
        base: &TableMetadata,
        attempt: u32,
    ) -> IcebergResult<TableUpdate>;
}

/// Writes a manifest or manifest list of a snapshot being produced. A failed
/// write fails the commit.
async fn write_snapshot_file(
    table: &IcebergTable,
    location: &str,
    bytes: Bytes,
    attempt: u32,
) -> IcebergResult<()> {
    table.write_file(location, bytes).await.map_err(|e| IcebergError::CommitFailed {
        attempts: attempt,
        message: format!("failed writing {location}: {e}"),
    })
}

/// Writes the manifests and manifest list of a new snapshot that adds
/// `added` and removes the data files at the paths in `removed`.
///
/// Manifests of the base snapshot that don't track a removed file are reused
/// as is. The others are rewritten with the removed files marked as deleted.
async fn produce_snapshot(
    table: &IcebergTable,
    base: &TableMetadata,
    operation: SnapshotOperation,
    added: &[DataFile],
    removed: &HashSet<String>,
    attempt: u32,
) -> IcebergResult<Snapshot> {
    let producer = SnapshotProducer::new(base, operation);
    let writer = ManifestWriter::new(producer.sequence_number(), producer.snapshot_id());

    let mut summary = SnapshotSummary::builder(operation);
    let base_manifests = match base.current_snapshot() {
        Some(snapshot) => {
            summary.copy_totals(&snapshot.summary);
            table.read_manifest_list(snapshot).await?
        },
        None => ManifestList::new(),
    };

    let mut manifest_list = ManifestList::new();
    let mut found = HashSet::new();
    let mut manifest_count = 0;

    for manifest_file in base_manifests {
        if removed.is_empty() || !manifest_file.has_live_files() {
            manifest_list.push(manifest_file);
            continue;
        }

        let manifest = table.read_manifest(&manifest_file).await?;
        let touched = manifest.live_entries()
            .any(|entry| removed.contains(&entry.data_file().file_path));
        if !touched {
            manifest_list.push(manifest_file);
            continue;
        }

        let mut builder = ManifestBuilder::new(manifest.schema(), manifest.partition_spec());
        // Entries deleted by earlier snapshots are dropped.
        for entry in manifest.into_entries().filter(|entry| entry.is_live()) {
            if removed.contains(&entry.data_file().file_path) {
                found.insert(entry.data_file().file_path.clone());
                summary.removed_data_file(entry.data_file());
                builder.add_deleted(entry)?;
            } else {
                builder.add_existing(entry)?;
            }
        }

        let manifest = builder.build();
        let location = table.metadata_file_location(
            &format!("{}-m{}.avro", Uuid::new_v4(), manifest_count)
        );
        let (bytes, manifest_file) = writer.write(&location, &manifest)?;
        write_snapshot_file(table, &location, bytes, attempt).await?;
        manifest_list.push(manifest_file);
        manifest_count += 1;
    }

    if let Some(missing) = removed.iter().find(|path| !found.contains(*path)) {
        return Err(IcebergError::ValidationError {
            message: format!("data file {missing} is not part of the current snapshot")
        });
    }

    if !added.is_empty() {
        let mut builder = ManifestBuilder::new(base.current_schema()?, base.current_partition_spec()?);
        for data_file in added {
            summary.added_data_file(data_file);
            builder.add_file(data_file.clone())?;
        }

        let manifest = builder.build();
        let location = table.metadata_file_location(
            &format!("{}-m{}.avro", Uuid::new_v4(), manifest_count)
        );
        let (bytes, manifest_file) = writer.write(&location, &manifest)?;
        write_snapshot_file(table, &location, bytes, attempt).await?;
        manifest_list.push(manifest_file);
    }

    let manifest_list_location = table.metadata_file_location(&format!(
        "snap-{}-{}-{}.avro",
        producer.snapshot_id(),
        attempt,
        Uuid::new_v4()
    ));
    let bytes = Bytes::from(manifest_list.encode()?);
    write_snapshot_file(table, &manifest_list_location, bytes, attempt).await?;

    debug!(
        snapshot_id = producer.snapshot_id(),
        %operation,
        manifests = manifest_list.len(),
        manifest_list = %manifest_list_location,
        "produced snapshot"
    );
    producer.produce(&manifest_list_location, summary.build())
}

/// Used to append files to the table.
#[derive(Debug, Default)]
pub struct AppendFilesOperation {
    data_files: Vec<DataFile>,
}

impl AppendFilesOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_file(&mut self, file: DataFile) {
        self.data_files.push(file);
    }

    pub fn append_files(&mut self, files: impl IntoIterator<Item = DataFile>) {
        self.data_files.extend(files);
    }
}

#[async_trait]
impl TableOperation for AppendFilesOperation {
    async fn apply(
        &self,
        table: &IcebergTable,
        base: &TableMetadata,
        attempt: u32,
    ) -> IcebergResult<TableUpdate> {
        let snapshot = produce_snapshot(
            table,
            base,
            SnapshotOperation::Append,
            &self.data_files,
            &HashSet::new(),
            attempt
        ).await?;

        Ok(TableUpdate::Snapshot(snapshot))
    }
}

/// Replaces data files of the table with new ones in a single snapshot.
///
/// Every removed file must still be part of the table's current snapshot when
/// the operation is applied, including on retries.
#[derive(Debug, Default)]
pub struct OverwriteFilesOperation {
    added: Vec<DataFile>,
    removed: HashSet<String>,
}

impl OverwriteFilesOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, file: DataFile) {
        self.added.push(file);
    }

    /// Removes the data file at `file_path`, the full URI recorded in its
    /// [`DataFile`].
    pub fn delete_file(&mut self, file_path: &str) {
        self.removed.insert(file_path.to_string());
    }
}

#[async_trait]
impl TableOperation for OverwriteFilesOperation {
    async fn apply(
        &self,
        table: &IcebergTable,
        base: &TableMetadata,
        attempt: u32,
    ) -> IcebergResult<TableUpdate> {
        let snapshot = produce_snapshot(
            table,
            base,
            SnapshotOperation::Overwrite,
            &self.added,
            &self.removed,
            attempt
        ).await?;

        Ok(TableUpdate::Snapshot(snapshot))
    }
}

/// Removes data files from the table.
#[derive(Debug, Default)]
pub struct DeleteFilesOperation {
    removed: HashSet<String>,
}

impl DeleteFilesOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete_file(&mut self, file_path: &str) {
        self.removed.insert(file_path.to_string());
    }
}

#[async_trait]
impl TableOperation for DeleteFilesOperation {
    async fn apply(
        &self,
        table: &IcebergTable,
        base: &TableMetadata,
        attempt: u32,
    ) -> IcebergResult<TableUpdate> {
        let snapshot = produce_snapshot(
            table,
            base,
            SnapshotOperation::Delete,
            &[],
            &self.removed,
            attempt
        ).await?;

        Ok(TableUpdate::Snapshot(snapshot))
    }
}

/// Evolves the table's current schema.
#[derive(Debug)]
pub struct UpdateSchemaOperation {
    update: SchemaUpdate,
}

impl UpdateSchemaOperation {
    pub fn new(update: SchemaUpdate) -> Self {
        Self { update }
    }
}

#[async_trait]
impl TableOperation for UpdateSchemaOperation {
    async fn apply(
        &self,
        _table: &IcebergTable,
        base: &TableMetadata,
        _attempt: u32,
    ) -> IcebergResult<TableUpdate> {
        let schema_id = base.schemas.iter()
            .map(|schema| schema.id())
            .max()
            .map_or(0, |id| id + 1);

        let (schema, _) = self.update.apply(base.current_schema()?, base.last_column_id, schema_id)?;
        Ok(TableUpdate::Metadata(base.clone().with_schema(schema)?))
    }
}

/// Sets the partition spec used for new data files. Existing data files keep
/// the partition spec they were written with.
#[derive(Debug)]
pub struct UpdatePartitionSpecOperation {
    fields: Vec<PartitionField>,
}

impl UpdatePartitionSpecOperation {
    pub fn new(fields: Vec<PartitionField>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl TableOperation for UpdatePartitionSpecOperation {
    async fn apply(
        &self,
        _table: &IcebergTable,
        base: &TableMetadata,
        _attempt: u32,
    ) -> IcebergResult<TableUpdate> {
        Ok(TableUpdate::Metadata(base.clone().with_partition_spec(self.fields.clone())?))
    }
}

/// A list of operations committed to a table in order.
pub struct Transaction<'a> {
    table: &'a mut IcebergTable,
    operations: Vec<Box<dyn TableOperation>>,
    retries: Option<u32>,
}

impl<'a> Transaction<'a> {
    pub fn new(table: &'a mut IcebergTable) -> Self {
        Self {
            table,
            operations: Vec::new(),
            retries: None,
        }
    }

    pub fn add_operation(&mut self, operation: Box<dyn TableOperation>) {
        self.operations.push(operation);
    }

    /// Overrides the number of times a conflicting commit is retried, by default
    /// the table's `commit.retry.num-retries` property.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Commits all operations, each in its own metadata file.
    ///
    /// On success the table holds the committed metadata.
    ///
    /// # Errors
    ///
    /// * [`IcebergError::CommitFailed`] if an operation still conflicted after the
    ///   last retry, or one of its manifest, manifest list or metadata files could
    ///   not be written.
    /// * [`IcebergError::ValidationError`] if an operation no longer applies to the
    ///   table, e.g. a file to remove was removed by a concurrent commit.
    ///
    /// Operations committed before a failing one stay committed.
    pub async fn commit(self) -> IcebergResult<()> {
        let Transaction { table, operations, retries } = self;

        for operation in &operations {
            let max_attempts = retries.unwrap_or_else(|| table.metadata().commit_retries()) + 1;
            Self::commit_operation(table, operation.as_ref(), max_attempts).await?;
        }

        Ok(())
    }

    async fn commit_operation(
        table: &mut IcebergTable,
        operation: &dyn TableOperation,
        max_attempts: u32,
    ) -> IcebergResult<()> {
        let mut attempt = 1;
        loop {
            let base = table.loaded().clone();
            let update = operation.apply(table, &base.metadata, attempt).await?;

            let store = table.store();
            let result = match update {
                TableUpdate::Snapshot(snapshot) => store.commit(table.ident(), &base, snapshot).await,
                TableUpdate::Metadata(metadata) => store.commit_metadata(table.ident(), &base, metadata).await,
            };

            match result {
                Ok(committed) => {
                    table.set_loaded(committed);
                    return Ok(());
                },
                Err(e) if e.is_conflict() && attempt < max_attempts => {
                    warn!(table = %table.ident(), attempt, max_attempts, "retrying conflicting commit");
                    table.refresh().await?;
                    attempt += 1;
                },
                Err(IcebergError::Conflict { current_location, .. }) => {
                    return Err(IcebergError::CommitFailed {
                        attempts: attempt,
                        message: format!(
                            "table {} was concurrently updated to {current_location}",
                            table.ident()
                        )
                    });
                },
                Err(IcebergError::CommitFailed { message, .. }) => {
                    return Err(IcebergError::CommitFailed { attempts: attempt, message });
                },
                Err(e) => return Err(e),
            }
        }
    }
}
