//! Reading rows from a table snapshot.
//!
//! A [`TableScan`] pins one snapshot when it is built and never observes later
//! commits. Columns are matched to the columns of the data files by field id, so
//! a renamed column is still read, and a column added after a file was written
//! reads as null for the rows of that file.
use std::sync::Arc;

use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use tracing::debug;

use crate::{IcebergError, IcebergResult, TableMetadata};
use crate::arrow::{array_value, field_id};
use crate::manifest::{DataFile, DataFileFormat, ManifestContentType, ManifestList, ManifestReader};
use crate::row::Row;
use crate::schema::{Field, PrimitiveType, Schema};
use crate::snapshot::Snapshot;
use crate::storage::IcebergStorage;

/// A stream of the rows of a scan.
pub type RowStream = BoxStream<'static, IcebergResult<Row>>;

/// Configures a [`TableScan`].
#[derive(Debug)]
pub struct TableScanBuilder {
    storage: Arc<IcebergStorage>,
    metadata: TableMetadata,
    snapshot_id: Option<i64>,
    as_of_timestamp_ms: Option<i64>,
    columns: Option<Vec<String>>,
}

impl TableScanBuilder {
    pub fn new(storage: Arc<IcebergStorage>, metadata: TableMetadata) -> Self {
        Self {
            storage,
            metadata,
            snapshot_id: None,
            as_of_timestamp_ms: None,
            columns: None,
        }
    }

    /// Reads the snapshot with this id instead of the current snapshot.
    pub fn snapshot_id(mut self, snapshot_id: i64) -> Self {
        self.snapshot_id = Some(snapshot_id);
        self
    }

    /// Reads the snapshot that was current at `timestamp_ms`. Ignored when a
    /// snapshot id is set.
    pub fn as_of_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.as_of_timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Reads only the named columns, in the given order.
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Pins the snapshot and the schema to read with.
    ///
    /// The current schema is used for the current snapshot, and the schema the
    /// snapshot was written with for an older one.
    ///
    /// # Errors
    ///
    /// * [`IcebergError::SnapshotNotFound`] if the snapshot id is unknown.
    /// * [`IcebergError::SchemaError`] if a selected column does not exist.
    pub fn build(self) -> IcebergResult<TableScan> {
        let metadata = &self.metadata;

        let (snapshot, schema) = match (self.snapshot_id, self.as_of_timestamp_ms) {
            (Some(snapshot_id), _) => {
                let snapshot = metadata.snapshot_by_id(snapshot_id)
                    .ok_or(IcebergError::SnapshotNotFound { snapshot_id })?;
                (Some(snapshot), Self::snapshot_schema(metadata, snapshot)?)
            },
            (None, Some(timestamp_ms)) => match metadata.snapshot_as_of(timestamp_ms) {
                Some(snapshot) => (Some(snapshot), Self::snapshot_schema(metadata, snapshot)?),
                // The table had no data yet.
                None => (None, metadata.current_schema()?),
            },
            (None, None) => (metadata.current_snapshot(), metadata.current_schema()?),
        };

        let fields = match &self.columns {
            Some(columns) => columns.iter()
                .map(|name| {
                    schema.field_by_name(name).cloned().ok_or_else(|| IcebergError::SchemaError {
                        message: format!("column '{name}' not found in schema {}", schema.id())
                    })
                })
                .collect::<IcebergResult<Vec<_>>>()?,
            None => schema.fields().to_vec(),
        };

        let columns = fields.into_iter()
            .map(|field| {
                let ptype = field.schema_type().as_primitive().cloned().ok_or_else(|| {
                    IcebergError::Unsupported(format!("reading nested column '{}'", field.name()))
                })?;
                Ok((field, ptype))
            })
            .collect::<IcebergResult<Vec<_>>>()?;

        Ok(TableScan {
            storage: self.storage,
            snapshot: snapshot.cloned(),
            columns: Arc::new(columns),
        })
    }

    fn snapshot_schema<'a>(metadata: &'a TableMetadata, snapshot: &Snapshot) -> IcebergResult<&'a Schema> {
        match snapshot.schema_id {
            Some(schema_id) => metadata.schema_by_id(schema_id)
                .ok_or(IcebergError::SchemaNotFound { schema_id }),
            None => metadata.current_schema(),
        }
    }
}

/// A scan of one snapshot of a table.
#[derive(Debug, Clone)]
pub struct TableScan {
    storage: Arc<IcebergStorage>,
    snapshot: Option<Snapshot>,
    columns: Arc<Vec<(Field, PrimitiveType)>>,
}

impl TableScan {
    /// The pinned snapshot, or `None` for a table without snapshots.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// The fields of the rows returned by the scan.
    pub fn fields(&self) -> Vec<&Field> {
        self.columns.iter().map(|(field, _)| field).collect()
    }

    /// Returns the data files of the snapshot, in manifest order and then in
    /// order within each manifest.
    pub async fn plan_files(&self) -> IcebergResult<Vec<DataFile>> {
        let snapshot = match &self.snapshot {
            Some(snapshot) => snapshot,
            None => return Ok(Vec::new()),
        };

        let path = self.storage.create_path_from_url(&snapshot.manifest_list)?;
        let manifest_list = ManifestList::decode(&self.storage.read(&path).await?)?;

        let mut data_files = Vec::new();
        for manifest_file in manifest_list.manifest_files() {
            if !manifest_file.has_live_files() {
                continue;
            }

            let path = self.storage.create_path_from_url(&manifest_file.manifest_path)?;
            let bytes = self.storage.read(&path).await?;
            let manifest = ManifestReader::for_manifest_file(manifest_file)
                .read_checked(&bytes, manifest_file)?;

            if manifest.content_type() != ManifestContentType::Data {
                return Err(IcebergError::Unsupported(format!(
                    "reading {} manifest {}",
                    manifest.content_type(), manifest_file.manifest_path
                )));
            }

            data_files.extend(manifest.live_entries().map(|entry| entry.data_file().clone()));
        }

        debug!(
            snapshot_id = snapshot.snapshot_id,
            manifests = manifest_list.len(),
            files = data_files.len(),
            "planned scan"
        );
        Ok(data_files)
    }

    /// Returns the rows of the snapshot.
    ///
    /// Data files are planned up front and opened one at a time as the stream is
    /// polled. A file is decoded one record batch at a time, and rows of a file
    /// are returned in the order they were written.
    pub async fn rows(&self) -> IcebergResult<RowStream> {
        let data_files = self.plan_files().await?;
        let storage = self.storage.clone();
        let columns = self.columns.clone();

        let rows = stream::iter(data_files)
            .then(move |data_file| open_data_file(storage.clone(), columns.clone(), data_file))
            .map_ok(batch_rows)
            .try_flatten()
            .boxed();

        Ok(rows)
    }
}

/// Finds the column of each field in a data file by field id. Files without
/// field ids are matched by name.
fn column_indices(
    arrow_schema: &arrow_schema::Schema,
    columns: &[(Field, PrimitiveType)],
) -> Vec<Option<usize>> {
    let has_ids = arrow_schema.fields().iter().any(|f| field_id(f).is_some());

    columns.iter()
        .map(|(field, _)| {
            arrow_schema.fields().iter().position(|f| {
                if has_ids {
                    field_id(f) == Some(field.id())
                } else {
                    f.name() == field.name()
                }
            })
        })
        .collect()
}

/// An opened data file and the column of each scanned field in it.
struct OpenDataFile {
    reader: ParquetRecordBatchReader,
    columns: Arc<Vec<(Field, PrimitiveType)>>,
    indices: Vec<Option<usize>>,
    path: String,
}

async fn open_data_file(
    storage: Arc<IcebergStorage>,
    columns: Arc<Vec<(Field, PrimitiveType)>>,
    data_file: DataFile,
) -> IcebergResult<OpenDataFile> {
    if data_file.file_format != DataFileFormat::Parquet {
        return Err(IcebergError::Unsupported(format!(
            "reading {} data file {}", data_file.file_format, data_file.file_path
        )));
    }

    let path = storage.create_path_from_url(&data_file.file_path)?;
    let bytes = storage.read(&path).await?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
    let indices = column_indices(builder.schema(), &columns);
    let reader = builder.build()?;

    debug!(path = %data_file.file_path, records = data_file.record_count, "opened data file");
    Ok(OpenDataFile { reader, columns, indices, path: data_file.file_path })
}

/// Streams the rows of an opened data file, decoding one record batch at a time.
fn batch_rows(file: OpenDataFile) -> impl Stream<Item = IcebergResult<Row>> + Send {
    let OpenDataFile { reader, columns, indices, path } = file;

    stream::iter(reader).flat_map(move |batch| {
        let rows: Vec<IcebergResult<Row>> = match batch {
            Ok(batch) => (0..batch.num_rows())
                .map(|row| {
                    columns.iter()
                        .zip(&indices)
                        .map(|((_, ptype), index)| match index {
                            Some(index) => array_value(batch.column(*index).as_ref(), row, ptype),
                            None => Ok(None),
                        })
                        .collect::<IcebergResult<Vec<_>>>()
                        .map(Row::new)
                })
                .collect(),
            Err(e) => vec![Err(IcebergError::ArrowError { source: e })],
        };
        debug!(path = %path, rows = rows.len(), "read record batch");
        stream::iter(rows)
    })
}
