//! Iceberg table handle.
use std::sync::Arc;

use bytes::Bytes;

use crate::IcebergResult;
use crate::catalog::TableIdent;
use crate::manifest::{DataFile, Manifest, ManifestFile, ManifestList, ManifestReader};
use crate::metadata::{LoadedMetadata, TableMetadata};
use crate::partition::{PartitionField, PartitionSpec};
use crate::scan::TableScanBuilder;
use crate::schema::{Schema, SchemaUpdate};
use crate::snapshot::Snapshot;
use crate::storage::{IcebergPath, IcebergStorage};
use crate::store::TableMetadataStore;
use crate::transaction::{
    AppendFilesOperation, DeleteFilesOperation, Transaction,
    UpdatePartitionSpecOperation, UpdateSchemaOperation,
};
use crate::writer::TableWriter;

/// The main interface for working with a single Iceberg table.
///
/// A table handle holds the metadata it was loaded or last committed with. It
/// does not observe commits made through other handles until
/// [`refresh`](IcebergTable::refresh) is called.
#[derive(Debug, Clone)]
pub struct IcebergTable {
    ident: TableIdent,
    store: TableMetadataStore,
    loaded: LoadedMetadata,
}

impl IcebergTable {
    pub fn new(ident: TableIdent, store: TableMetadataStore, loaded: LoadedMetadata) -> Self {
        Self { ident, store, loaded }
    }

    /// Loads the current state of a table from the catalog.
    pub async fn load(ident: &TableIdent, store: TableMetadataStore) -> IcebergResult<Self> {
        let loaded = store.load(ident).await?;
        Ok(Self::new(ident.clone(), store, loaded))
    }

    pub fn ident(&self) -> &TableIdent {
        &self.ident
    }

    /// Returns the full URI of the table's base location.
    pub fn location(&self) -> &str {
        &self.loaded.metadata.location
    }

    /// Returns the full URI of the metadata file this handle is based on.
    pub fn metadata_location(&self) -> &str {
        &self.loaded.location
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.loaded.metadata
    }

    pub fn loaded(&self) -> &LoadedMetadata {
        &self.loaded
    }

    pub(crate) fn set_loaded(&mut self, loaded: LoadedMetadata) {
        self.loaded = loaded;
    }

    pub fn store(&self) -> &TableMetadataStore {
        &self.store
    }

    pub fn storage(&self) -> &Arc<IcebergStorage> {
        self.store.storage()
    }

    /// Returns the table's location relative to the warehouse root.
    pub fn table_path(&self) -> IcebergResult<IcebergPath> {
        self.storage().create_path_from_url(self.location())
    }

    pub fn current_schema(&self) -> IcebergResult<&Schema> {
        self.loaded.metadata.current_schema()
    }

    pub fn current_partition_spec(&self) -> IcebergResult<&PartitionSpec> {
        self.loaded.metadata.current_partition_spec()
    }

    /// Returns the latest snapshot of the table, or `None` if the table has no
    /// snapshots.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.loaded.metadata.current_snapshot()
    }

    /// All snapshots of the table, in commit order.
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.loaded.metadata.snapshots
    }

    /// Reloads the table's current metadata from the catalog.
    pub async fn refresh(&mut self) -> IcebergResult<()> {
        self.loaded = self.store.load(&self.ident).await?;
        Ok(())
    }

    /// Reads the manifest list for the given snapshot.
    pub async fn read_manifest_list(&self, snapshot: &Snapshot) -> IcebergResult<ManifestList> {
        let path = self.storage().create_path_from_url(&snapshot.manifest_list)?;
        let bytes = self.storage().read(&path).await?;

        ManifestList::decode(bytes.as_ref())
    }

    /// Reads the manifest a manifest list entry points to, checking it against the
    /// entry's summary.
    pub async fn read_manifest(&self, manifest_file: &ManifestFile) -> IcebergResult<Manifest> {
        let path = self.storage().create_path_from_url(&manifest_file.manifest_path)?;
        let bytes = self.storage().read(&path).await?;

        ManifestReader::for_manifest_file(manifest_file).read_checked(&bytes, manifest_file)
    }

    /// Full URI of a file named `filename` in the table's metadata directory.
    pub fn metadata_file_location(&self, filename: &str) -> String {
        format!("{}/metadata/{}", self.location(), filename)
    }

    /// Writes a new file at the full URI `location`. Existing files are never
    /// replaced.
    pub async fn write_file(&self, location: &str, bytes: Bytes) -> IcebergResult<()> {
        let path = self.storage().create_path_from_url(location)?;
        self.storage().write_once(&path, bytes).await
    }

    /// Initiates a new transaction on this table.
    pub fn new_transaction(&mut self) -> Transaction {
        Transaction::new(self)
    }

    /// Creates a writer for rows of the table's current schema.
    pub fn new_writer(&self) -> IcebergResult<TableWriter> {
        TableWriter::for_table(self)
    }

    /// Starts a scan of the table's current snapshot.
    pub fn scan(&self) -> TableScanBuilder {
        TableScanBuilder::new(self.storage().clone(), self.loaded.metadata.clone())
    }

    /// Appends already written data files in a new snapshot.
    pub async fn append_files(&mut self, files: Vec<DataFile>) -> IcebergResult<()> {
        let mut operation = AppendFilesOperation::new();
        operation.append_files(files);

        let mut transaction = self.new_transaction();
        transaction.add_operation(Box::new(operation));
        transaction.commit().await
    }

    /// Removes data files, given by their full URI, in a new snapshot.
    pub async fn delete_files(&mut self, file_paths: &[&str]) -> IcebergResult<()> {
        let mut operation = DeleteFilesOperation::new();
        for path in file_paths {
            operation.delete_file(path);
        }

        let mut transaction = self.new_transaction();
        transaction.add_operation(Box::new(operation));
        transaction.commit().await
    }

    /// Evolves the table's schema.
    pub async fn update_schema(&mut self, update: SchemaUpdate) -> IcebergResult<()> {
        let mut transaction = self.new_transaction();
        transaction.add_operation(Box::new(UpdateSchemaOperation::new(update)));
        transaction.commit().await
    }

    /// Sets the partition spec for data files written from now on.
    pub async fn update_partition_spec(&mut self, fields: Vec<PartitionField>) -> IcebergResult<()> {
        let mut transaction = self.new_transaction();
        transaction.add_operation(Box::new(UpdatePartitionSpecOperation::new(fields)));
        transaction.commit().await
    }
}
