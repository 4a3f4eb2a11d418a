//! Writers that turn rows into immutable Parquet data files.
//!
//! [`DataFileWriter`] writes exactly one data file, collecting the column
//! statistics recorded in manifests. [`TableWriter`] fans rows out to one
//! `DataFileWriter` per partition and commits the resulting files to a table.
use std::collections::BTreeMap;
use std::sync::Arc;

use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::SchemaRef as ArrowSchemaRef;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tracing::debug;
use uuid::Uuid;

use crate::{IcebergError, IcebergResult, IcebergTable};
use crate::arrow::{build_array, schema_to_arrow};
use crate::manifest::{DataFile, DataFileFormat};
use crate::partition::{PartitionSpec, PartitionValues};
use crate::row::Row;
use crate::schema::{PrimitiveType, Schema};
use crate::storage::{IcebergPath, IcebergStorage};
use crate::transaction::AppendFilesOperation;
use crate::utils;
use crate::value::Value;

/// Returns a new, unique path for a data file of the table at `table_path`:
/// `data/[<partition>/]<hash>/<timestamp>_<operation id>_<uuid>.parquet`.
pub fn new_data_file_path(
    table_path: &IcebergPath,
    partition_values: &PartitionValues,
    operation_id: &str,
) -> IcebergResult<IcebergPath> {
    let filename = format!(
        "{}_{}_{}.parquet",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        operation_id,
        Uuid::new_v4()
    );

    Ok(table_path
        .child("data")
        .join(&partition_values.to_path())
        .child(utils::hash_prefix(&filename)?)
        .child(filename))
}

/// Buffered values and running statistics of one column.
#[derive(Debug)]
struct ColumnBuffer {
    field_id: i32,
    ptype: PrimitiveType,
    values: Vec<Option<Value>>,
    lower: Option<Value>,
    upper: Option<Value>,
    null_count: i64,
    nan_count: i64,
}

impl ColumnBuffer {
    fn new(field_id: i32, ptype: PrimitiveType) -> Self {
        Self {
            field_id,
            ptype,
            values: Vec::new(),
            lower: None,
            upper: None,
            null_count: 0,
            nan_count: 0,
        }
    }

    fn push(&mut self, value: Option<Value>) {
        match &value {
            None => self.null_count += 1,
            Some(v) if v.is_nan() => self.nan_count += 1,
            Some(v) => {
                if self.lower.as_ref().map_or(true, |lower| v < lower) {
                    self.lower = Some(v.clone());
                }
                if self.upper.as_ref().map_or(true, |upper| v > upper) {
                    self.upper = Some(v.clone());
                }
            }
        }
        self.values.push(value);
    }

    fn is_floating(&self) -> bool {
        matches!(self.ptype, PrimitiveType::Float | PrimitiveType::Double)
    }
}

/// Writes rows of a single partition into one Parquet data file.
///
/// Rows are validated against the schema before they are buffered; a rejected
/// row leaves the writer unchanged. Nothing is written to storage before
/// [`close`](DataFileWriter::close).
#[derive(Debug)]
pub struct DataFileWriter {
    storage: Arc<IcebergStorage>,
    schema: Schema,
    arrow_schema: ArrowSchemaRef,
    partition_spec: PartitionSpec,
    partition_values: PartitionValues,
    path: IcebergPath,
    columns: Vec<ColumnBuffer>,
    record_count: i64,
    closed: Option<DataFile>,
}

impl DataFileWriter {
    /// Creates a writer for a data file at `path` holding rows of `schema` that
    /// belong to the partition `partition_values` of `partition_spec`.
    ///
    /// # Errors
    ///
    /// * [`IcebergError::Unsupported`] if the schema has nested columns.
    /// * [`IcebergError::PartitionError`] if the partition values don't match the
    ///   fields of the partition spec.
    pub fn new(
        storage: Arc<IcebergStorage>,
        schema: &Schema,
        partition_spec: &PartitionSpec,
        partition_values: PartitionValues,
        path: IcebergPath,
    ) -> IcebergResult<Self> {
        let arrow_schema = schema_to_arrow(schema)?;

        let spec_ids = partition_spec.fields().iter().map(|f| f.field_id);
        if !spec_ids.eq(partition_values.iter().map(|v| v.field_id)) {
            return Err(IcebergError::PartitionError {
                message: format!(
                    "partition values don't match the fields of partition spec {}",
                    partition_spec.spec_id()
                )
            });
        }

        let columns = schema.fields()
            .iter()
            .map(|field| {
                // Checked by schema_to_arrow.
                let ptype = field.schema_type().as_primitive().cloned().ok_or_else(|| {
                    IcebergError::Unsupported(format!("nested column '{}'", field.name()))
                })?;
                Ok(ColumnBuffer::new(field.id(), ptype))
            })
            .collect::<IcebergResult<Vec<_>>>()?;

        Ok(Self {
            storage,
            schema: schema.clone(),
            arrow_schema: Arc::new(arrow_schema),
            partition_spec: partition_spec.clone(),
            partition_values,
            path,
            columns,
            record_count: 0,
            closed: None,
        })
    }

    /// Location of the data file, relative to the warehouse.
    pub fn path(&self) -> &IcebergPath {
        &self.path
    }

    /// Number of rows buffered so far.
    pub fn record_count(&self) -> i64 {
        self.record_count
    }

    /// Buffers one row.
    ///
    /// # Errors
    ///
    /// * [`IcebergError::SchemaViolation`] if the row doesn't conform to the schema.
    /// * [`IcebergError::PartitionError`] if the row belongs to another partition.
    /// * [`IcebergError::CustomError`] if the writer is closed.
    pub fn write(&mut self, row: Row) -> IcebergResult<()> {
        if self.closed.is_some() {
            return Err(IcebergError::CustomError {
                message: format!("data file writer for {} is closed", self.path)
            });
        }

        row.conform(&self.schema)?;
        if !self.partition_spec.is_unpartitioned() {
            let values = self.partition_spec.partition_values(&self.schema, &row)?;
            if values != self.partition_values {
                return Err(IcebergError::PartitionError {
                    message: format!(
                        "row of partition {} written to a file of partition {}",
                        values.to_path(), self.partition_values.to_path()
                    )
                });
            }
        }

        for (column, value) in self.columns.iter_mut().zip(row.into_values()) {
            column.push(value);
        }
        self.record_count += 1;

        Ok(())
    }

    /// Buffers all rows, stopping at the first rejected row. Rows before it stay
    /// buffered.
    pub fn write_all(&mut self, rows: impl IntoIterator<Item = Row>) -> IcebergResult<()> {
        rows.into_iter().try_for_each(|row| self.write(row))
    }

    fn writer_properties() -> WriterProperties {
        WriterProperties::builder()
            .set_compression(parquet::basic::Compression::UNCOMPRESSED)
            .set_dictionary_enabled(false)
            .set_encoding(parquet::basic::Encoding::PLAIN)
            .build()
    }

    fn encode(&self) -> IcebergResult<(Vec<u8>, Vec<i64>, BTreeMap<i32, i64>)> {
        let arrays = self.columns.iter()
            .map(|column| build_array(&column.ptype, &column.values))
            .collect::<IcebergResult<Vec<ArrayRef>>>()?;
        let batch = RecordBatch::try_new(self.arrow_schema.clone(), arrays)?;

        let mut writer = ArrowWriter::try_new(
            Vec::new(),
            self.arrow_schema.clone(),
            Some(Self::writer_properties())
        )?;
        if batch.num_rows() > 0 {
            writer.write(&batch)?;
        }
        writer.flush()?;

        let mut split_offsets = Vec::new();
        let mut column_sizes = BTreeMap::new();
        for row_group in writer.flushed_row_groups() {
            if let Some(offset) = row_group.file_offset() {
                split_offsets.push(offset);
            }
            // Flat schemas have one Parquet leaf column per field.
            for (column, chunk) in self.columns.iter().zip(row_group.columns()) {
                *column_sizes.entry(column.field_id).or_insert(0) += chunk.compressed_size();
            }
        }
        split_offsets.sort_unstable();

        Ok((writer.into_inner()?, split_offsets, column_sizes))
    }

    /// Encodes the buffered rows as a Parquet file, writes it to storage and
    /// returns its descriptor.
    ///
    /// Closing again returns the same descriptor without writing.
    ///
    /// # Errors
    ///
    /// [`IcebergError::FileAlreadyExists`] if a file exists at the writer's path.
    pub async fn close(&mut self) -> IcebergResult<DataFile> {
        if let Some(data_file) = &self.closed {
            return Ok(data_file.clone());
        }

        let (data, split_offsets, column_sizes) = self.encode()?;
        let file_size = i64::try_from(data.len()).map_err(|_| {
            IcebergError::CustomError {
                message: format!("data file {} is too large", self.path)
            }
        })?;

        self.storage.write_once(&self.path, Bytes::from(data)).await?;

        let mut value_counts = BTreeMap::new();
        let mut null_value_counts = BTreeMap::new();
        let mut nan_value_counts = BTreeMap::new();
        let mut lower_bounds = BTreeMap::new();
        let mut upper_bounds = BTreeMap::new();
        for column in &self.columns {
            value_counts.insert(column.field_id, self.record_count);
            null_value_counts.insert(column.field_id, column.null_count);
            if column.is_floating() {
                nan_value_counts.insert(column.field_id, column.nan_count);
            }
            if let Some(lower) = &column.lower {
                lower_bounds.insert(column.field_id, lower.to_bytes());
            }
            if let Some(upper) = &column.upper {
                upper_bounds.insert(column.field_id, upper.to_bytes());
            }
        }

        let data_file = DataFile::builder(
            &self.storage.to_uri(&self.path),
            DataFileFormat::Parquet,
            self.record_count,
            file_size
        )
            .with_partition_values(self.partition_values.clone())
            .with_column_sizes(column_sizes)
            .with_value_counts(value_counts, null_value_counts, nan_value_counts)
            .with_bounds(lower_bounds, upper_bounds)
            .with_split_offsets(split_offsets)
            .build();

        debug!(
            path = %data_file.file_path,
            records = data_file.record_count,
            size = data_file.file_size_in_bytes,
            "closed data file"
        );

        // Buffers are no longer needed.
        for column in &mut self.columns {
            column.values = Vec::new();
        }
        self.closed = Some(data_file.clone());

        Ok(data_file)
    }
}

/// Partition values in binary form, used to group rows by partition.
type PartitionKey = Vec<Option<Vec<u8>>>;

fn partition_key(partition_values: &PartitionValues) -> PartitionKey {
    partition_values.iter()
        .map(|v| v.value.as_ref().map(Value::to_bytes))
        .collect()
}

/// Writes rows to a table, one data file per partition.
///
/// Uses the table's current schema and partition spec. Files are only visible
/// to readers after [`commit`](TableWriter::commit).
#[derive(Debug)]
pub struct TableWriter {
    storage: Arc<IcebergStorage>,
    schema: Schema,
    partition_spec: PartitionSpec,
    table_path: IcebergPath,
    // Shared by the file names of one write, to identify files written together.
    operation_id: String,
    writers: BTreeMap<PartitionKey, DataFileWriter>,
    closed_files: Vec<DataFile>,
}

impl TableWriter {
    /// Creates a new `TableWriter` for the given table, deriving the schema and
    /// partition spec from it.
    pub fn for_table(table: &IcebergTable) -> IcebergResult<Self> {
        let schema = table.current_schema()?.clone();
        // Fail early on schemas that can't be written.
        schema_to_arrow(&schema)?;

        Ok(Self {
            storage: table.storage().clone(),
            schema,
            partition_spec: table.current_partition_spec()?.clone(),
            table_path: table.table_path()?,
            operation_id: utils::new_operation_id(),
            writers: BTreeMap::new(),
            closed_files: Vec::new(),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Buffers one row in the writer of its partition.
    ///
    /// # Errors
    ///
    /// [`IcebergError::SchemaViolation`] if the row doesn't conform to the schema.
    /// Nothing is buffered in that case.
    pub fn write(&mut self, row: Row) -> IcebergResult<()> {
        row.conform(&self.schema)?;
        let partition_values = self.partition_spec.partition_values(&self.schema, &row)?;
        let key = partition_key(&partition_values);

        let writer = match self.writers.get_mut(&key) {
            Some(writer) => writer,
            None => {
                let path = new_data_file_path(&self.table_path, &partition_values, &self.operation_id)?;
                let writer = DataFileWriter::new(
                    self.storage.clone(),
                    &self.schema,
                    &self.partition_spec,
                    partition_values,
                    path
                )?;
                self.writers.entry(key).or_insert(writer)
            }
        };

        writer.write(row)
    }

    pub fn write_all(&mut self, rows: impl IntoIterator<Item = Row>) -> IcebergResult<()> {
        rows.into_iter().try_for_each(|row| self.write(row))
    }

    /// Writes all buffered rows to data files, but does not commit them.
    ///
    /// Returns the data files written by this writer since the last commit. In
    /// case of an error, orphan files may be left in the object store, and the
    /// partitions not yet written keep their rows.
    pub async fn close(&mut self) -> IcebergResult<Vec<DataFile>> {
        // A partition writer is dropped only after its file was written.
        while let Some(mut entry) = self.writers.first_entry() {
            let data_file = entry.get_mut().close().await?;
            entry.remove();
            self.closed_files.push(data_file);
        }

        Ok(self.closed_files.clone())
    }

    /// Writes all buffered rows and appends the data files to `table` in one
    /// snapshot.
    ///
    /// The writer can be reused afterwards.
    pub async fn commit(&mut self, table: &mut IcebergTable) -> IcebergResult<()> {
        let data_files = self.close().await?;

        let mut operation = AppendFilesOperation::new();
        operation.append_files(data_files);

        let mut transaction = table.new_transaction();
        transaction.add_operation(Box::new(operation));
        transaction.commit().await?;

        self.closed_files.clear();
        self.operation_id = utils::new_operation_id();
        Ok(())
    }
}
