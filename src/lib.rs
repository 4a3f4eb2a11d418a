//! Minimal Iceberg table client in Rust.
//!
//! [Apache Iceberg](https://iceberg.apache.org/) is an open table format for huge
//! analytic tables on data lakes. This crate implements the write and read paths of
//! a single table: rows are written to immutable Parquet data files, the files are
//! tracked by immutable Avro manifests, manifests are grouped into snapshots, and
//! snapshots are published by swapping a single catalog pointer to a new, immutable
//! metadata file.
//!
//! The only mutable cell in the whole model is the catalog pointer, and it is only
//! ever advanced with compare-and-swap. Readers pin one snapshot for their whole
//! lifetime and never observe a later commit; concurrent writers racing on the same
//! base metadata resolve to exactly one winner, while the others receive
//! [`IcebergError::Conflict`] and retry against the new metadata.
//!
//! The entry point is [`Warehouse`], which creates, loads and scans tables.
//!
//! ## Writing and reading a table
//!
//! ```rust
//! use futures::TryStreamExt;
//! use icetable::{Warehouse, WarehouseConfig, TableIdent, IcebergResult};
//! use icetable::schema::{Schema, Field, PrimitiveType};
//! use icetable::row::Row;
//! use icetable::value::Value;
//!
//! #[tokio::main]
//! async fn main() -> IcebergResult<()> {
//!     let warehouse = Warehouse::open(WarehouseConfig::in_memory())?;
//!
//!     let schema = Schema::new(0, vec![
//!         Field::new_primitive(1, "name", true, PrimitiveType::String),
//!         Field::new_primitive(2, "email", false, PrimitiveType::String),
//!     ]);
//!     let ident = TableIdent::of(["raw"], "users");
//!     let mut table = warehouse.create_table(&ident, schema).await?;
//!
//!     let mut writer = table.new_writer()?;
//!     writer.write(Row::new(vec![
//!         Some(Value::String("John Smith".to_string())),
//!         Some(Value::String("smith.john@gmail.com".to_string())),
//!     ]))?;
//!     writer.commit(&mut table).await?;
//!
//!     let rows: Vec<Row> = table.scan().build()?.rows().await?.try_collect().await?;
//!     assert_eq!(rows.len(), 1);
//!
//!     Ok(())
//! }
//! ```
use thiserror;
use object_store;
use serde_json;

mod utils;

pub mod config;
pub mod schema;
pub mod value;
pub mod row;
pub mod partition;
pub mod sort;
pub mod arrow;
pub mod manifest;
pub mod snapshot;
pub mod metadata;
pub mod storage;
pub mod catalog;
pub mod store;
pub mod transaction;
pub mod table;
pub mod writer;
pub mod scan;
pub mod warehouse;

pub use crate::config::{WarehouseConfig, CatalogKind};
pub use crate::catalog::{Catalog, TableIdent};
pub use crate::metadata::{TableMetadata, TableFormatVersion, LoadedMetadata};
pub use crate::store::TableMetadataStore;
pub use crate::table::IcebergTable;
pub use crate::warehouse::Warehouse;

/// A result type returned by functions in this crate.
pub type IcebergResult<T> = Result<T, IcebergError>;

/// An Iceberg table error.
#[derive(thiserror::Error, Debug)]
pub enum IcebergError {
    #[error("Iceberg error: {message}")]
    CustomError { message: String },

    /// A row does not conform to the schema it is written with: it has the wrong
    /// number of values, a null in a required field, or a value of the wrong type.
    /// Nothing of the rejected row is buffered.
    #[error("Schema violation: {message}")]
    SchemaViolation { message: String },

    /// Another writer advanced the table's catalog pointer after this writer read
    /// its base metadata. Recoverable: reload the table, rebuild and resubmit.
    #[error("Commit conflict on table {table}: current metadata is {current_location}")]
    Conflict { table: String, current_location: String },

    /// The commit could not be completed. The table's state is unchanged.
    #[error("Commit failed after {attempts} attempt(s): {message}")]
    CommitFailed { attempts: u32, message: String },

    /// The catalog has no table with this identifier.
    #[error("Table {table} not found")]
    TableNotFound { table: String },

    /// The catalog already has a table with this identifier.
    #[error("Table {table} already exists")]
    TableAlreadyExists { table: String },

    /// No snapshot with this id exists in the table's metadata.
    #[error("Snapshot {snapshot_id} not found")]
    SnapshotNotFound { snapshot_id: i64 },

    /// The operation can't be applied to the table's current state, e.g. removing
    /// a data file that is not part of the current snapshot.
    #[error("Validation failed: {message}")]
    ValidationError { message: String },

    /// The table's metadata file could not be located.
    #[error("Iceberg table metadata not found at {0}")]
    MetadataNotFound(String),

    /// Data, manifest and metadata files are write-once. Attempting to write to
    /// an existing path is a programming error and is never retried.
    #[error("File already exists: {path}")]
    FileAlreadyExists { path: String },

    /// The URL location specified for the warehouse or table is invalid.
    #[error("Invalid table location: {0}")]
    InvalidTableLocation(String),

    /// Attempted to use a schema id that is not in the table's schema list.
    #[error("Schema with schema id {schema_id} not found in schema list")]
    SchemaNotFound { schema_id: i32 },

    /// An invalid schema, or an illegal schema evolution.
    #[error("Schema error: {message}")]
    SchemaError { message: String },

    /// An invalid partition spec, or a transform that can't be applied.
    #[error("Partition error: {message}")]
    PartitionError { message: String },

    /// A manifest or manifest list is malformed or violates its summary counts.
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// A value can't be converted, serialized or compared.
    #[error("Value error: {0}")]
    ValueError(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Invalid warehouse configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Failed serializing the table's metadata to json.
    #[error("Error serializing table metadata to json: {source}")]
    SerializeMetadataJson { source: serde_json::Error },

    /// Attempted to parse an invalid metadata file.
    #[error("Error deserializing table metadata from json: {source}")]
    InvalidMetadata { source: serde_json::Error },

    /// Generic JSON serialization error.
    #[error("Error serializing json: {source}")]
    SerializeJson { source: serde_json::Error },

    /// Failed serializing or deserializing an Avro file
    /// (manifest or manifest list files).
    #[error("Error serializing or deserializing Avro: {source}")]
    AvroError {#[from] source: apache_avro::Error},

    /// A path to an object that is not in the warehouse was encountered.
    #[error("Invalid object store path: {source}")]
    InvalidPath {#[from] source: object_store::path::Error},

    /// An error from the underlying object storage.
    #[error("Object storage error: {source}")]
    ObjectStore {#[from] source: object_store::Error},

    /// An error related to the Parquet file format.
    #[error("Parquet error: {source}")]
    ParquetError {#[from] source: parquet::errors::ParquetError},

    /// A system I/O error
    #[error("I/O error: {source}")]
    IoError {#[from] source: std::io::Error},

    /// Apache Arrow error
    #[error("Error in Arrow library: {source}")]
    ArrowError {#[from] source: arrow_schema::ArrowError},
}

impl IcebergError {
    /// Returns `true` for errors that a caller may resolve by reloading the table
    /// and retrying the commit.
    pub fn is_conflict(&self) -> bool {
        matches!(self, IcebergError::Conflict { .. })
    }

    /// Returns `true` for the not-found family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            IcebergError::TableNotFound { .. }
            | IcebergError::SnapshotNotFound { .. }
            | IcebergError::SchemaNotFound { .. }
            | IcebergError::MetadataNotFound(..)
        )
    }
}
