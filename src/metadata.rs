//! Iceberg table metadata.
//!
//! [`TableMetadata`] is never edited in place: every change produces a new value,
//! which is written to a new, uniquely named metadata file and published by
//! swapping the table's catalog pointer.
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Serialize, Deserialize, Deserializer, Serializer};
use serde_repr::{Serialize_repr, Deserialize_repr};
use uuid::Uuid;

use crate::{IcebergError, IcebergResult};
use crate::utils;
use crate::schema::Schema;
use crate::partition::{PartitionField, PartitionSpec};
use crate::sort::SortOrder;
use crate::snapshot::{Snapshot, SnapshotLog, SnapshotReference, MAIN_BRANCH};

/// Table property holding the number of times a conflicting commit is retried.
pub const COMMIT_NUM_RETRIES: &str = "commit.retry.num-retries";
pub const COMMIT_NUM_RETRIES_DEFAULT: u32 = 4;

lazy_static! {
    static ref METADATA_FILE_REGEX: Regex = Regex::new(concat!(
        r#"(?:^|/)(?P<version>[0-9]+)-"#,
        r#"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"#,
        r#"\.metadata\.json$"#
    )).unwrap();
}

#[derive(Debug, Serialize_repr, Deserialize_repr, PartialEq, Eq, Clone, Copy)]
#[repr(i32)]
pub enum TableFormatVersion {
    V1 = 1,
    V2 = 2,
}

impl fmt::Display for TableFormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as i32)
    }
}

impl std::str::FromStr for TableFormatVersion {
    type Err = IcebergError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => Ok(TableFormatVersion::V1),
            "2" => Ok(TableFormatVersion::V2),
            _ => Err(IcebergError::Unsupported(format!("table format version {s}"))),
        }
    }
}

/// `current-snapshot-id` is written as -1 for tables without snapshots.
mod current_snapshot_id {
    use super::*;

    pub fn serialize<S: Serializer>(id: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(id.unwrap_or(-1))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        Ok(Option::<i64>::deserialize(deserializer)?.filter(|id| *id != -1))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct TableMetadata {
    /// An integer version number for the format.
    /// Always set to 2.
    pub format_version: TableFormatVersion,
    /// A UUID that identifies the table
    pub table_uuid: String,
    /// The table's base location
    pub location: String,
    /// The table's highest assigned sequence number, a monotonically increasing long
    /// that tracks the order of snapshots in a table.
    pub last_sequence_number: i64,
    /// Timestamp in milliseconds from the unix epoch when the table was last updated.
    pub last_updated_ms: i64,
    /// The highest assigned column ID for the table. This is used to ensure
    /// columns are always assigned an unused ID when evolving schemas.
    pub last_column_id: i32,
    pub schemas: Vec<Schema>,
    pub current_schema_id: i32,
    pub partition_specs: Vec<PartitionSpec>,
    /// ID of the "current" spec that writers should use by default.
    pub default_spec_id: i32,
    /// The highest assigned partition field ID across all partition specs
    /// for the table.
    pub last_partition_id: i32,
    /// A string to string map of table properties. This is used to control settings
    /// that affect reading and writing, e.g. `commit.retry.num-retries`.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// ID of the current table snapshot; must be the same as the current ID of
    /// the main branch in refs.
    #[serde(default, with = "current_snapshot_id")]
    pub current_snapshot_id: Option<i64>,
    /// A list of valid snapshots, in commit order.
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    /// Each time the current-snapshot-id is changed, a new entry is added with the
    /// new current-snapshot-id.
    #[serde(default)]
    pub snapshot_log: Vec<SnapshotLog>,
    /// Each time a new metadata file is created, an entry of the previous metadata
    /// file location is added to the list.
    #[serde(default)]
    pub metadata_log: Vec<MetadataLog>,
    pub sort_orders: Vec<SortOrder>,
    pub default_sort_order_id: i32,
    #[serde(default)]
    pub refs: BTreeMap<String, SnapshotReference>,
}

impl TableMetadata {
    /// Creates the metadata of a new table with no snapshots.
    ///
    /// # Errors
    ///
    /// [`IcebergError::SchemaError`] if the schema is empty or invalid, and
    /// [`IcebergError::PartitionError`] if the partition spec does not apply to it.
    pub fn try_new(
        location: &str,
        schema: Schema,
        partition_spec: PartitionSpec,
        properties: BTreeMap<String, String>,
    ) -> IcebergResult<Self> {
        if schema.fields().is_empty() {
            return Err(IcebergError::SchemaError {
                message: "schema is empty".to_string()
            });
        }
        schema.validate()?;
        partition_spec.partition_type(&schema)?;

        let sort_order = SortOrder::unsorted();

        Ok(Self {
            format_version: TableFormatVersion::V2,
            table_uuid: Uuid::new_v4().to_string(),
            location: location.trim_end_matches('/').to_string(),
            last_sequence_number: 0,
            last_updated_ms: utils::current_time_ms()?,
            last_column_id: schema.highest_field_id(),
            current_schema_id: schema.id(),
            schemas: vec![schema],
            default_spec_id: partition_spec.spec_id(),
            last_partition_id: partition_spec.last_assigned_field_id(),
            partition_specs: vec![partition_spec],
            properties,
            current_snapshot_id: None,
            snapshots: Vec::new(),
            snapshot_log: Vec::new(),
            metadata_log: Vec::new(),
            default_sort_order_id: sort_order.order_id,
            sort_orders: vec![sort_order],
            refs: BTreeMap::new(),
        })
    }

    pub fn schema_by_id(&self, schema_id: i32) -> Option<&Schema> {
        self.schemas.iter().find(|schema| schema.id() == schema_id)
    }

    pub fn current_schema(&self) -> IcebergResult<&Schema> {
        self.schema_by_id(self.current_schema_id)
            .ok_or(IcebergError::SchemaNotFound { schema_id: self.current_schema_id })
    }

    pub fn partition_spec_by_id(&self, spec_id: i32) -> Option<&PartitionSpec> {
        self.partition_specs.iter().find(|spec| spec.spec_id() == spec_id)
    }

    /// The partition spec that writers use by default.
    pub fn current_partition_spec(&self) -> IcebergResult<&PartitionSpec> {
        self.partition_spec_by_id(self.default_spec_id)
            .ok_or_else(|| IcebergError::PartitionError {
                message: format!("default partition spec {} not found", self.default_spec_id)
            })
    }

    pub fn snapshot_by_id(&self, snapshot_id: i64) -> Option<&Snapshot> {
        self.snapshots.iter().find(|snapshot| snapshot.snapshot_id == snapshot_id)
    }

    /// Returns the latest snapshot of the table, or `None` if the table has no
    /// snapshots.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.current_snapshot_id.and_then(|id| self.snapshot_by_id(id))
    }

    /// Returns the snapshot that was current at `timestamp_ms`, according to the
    /// snapshot log. `None` if the table had no snapshot at that time.
    pub fn snapshot_as_of(&self, timestamp_ms: i64) -> Option<&Snapshot> {
        self.snapshot_log.iter()
            .take_while(|entry| entry.timestamp_ms <= timestamp_ms)
            .last()
            .and_then(|entry| self.snapshot_by_id(entry.snapshot_id))
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Number of times a commit is retried after losing a race with another writer.
    pub fn commit_retries(&self) -> u32 {
        self.property(COMMIT_NUM_RETRIES)
            .and_then(|value| value.parse().ok())
            .unwrap_or(COMMIT_NUM_RETRIES_DEFAULT)
    }

    fn touch(&mut self, timestamp_ms: i64) -> IcebergResult<()> {
        self.last_updated_ms = utils::current_time_ms()?
            .max(timestamp_ms)
            .max(self.last_updated_ms);
        Ok(())
    }

    /// Returns new metadata with `snapshot` appended and made current.
    ///
    /// # Errors
    ///
    /// [`IcebergError::ValidationError`] if the snapshot does not directly follow
    /// the current snapshot, reuses an existing id or sequence number, or refers to
    /// an unknown schema.
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> IcebergResult<Self> {
        if snapshot.parent_snapshot_id != self.current_snapshot_id {
            return Err(IcebergError::ValidationError {
                message: format!(
                    "snapshot {} has parent {:?} but the current snapshot is {:?}",
                    snapshot.snapshot_id, snapshot.parent_snapshot_id, self.current_snapshot_id
                )
            });
        }
        if self.snapshot_by_id(snapshot.snapshot_id).is_some() {
            return Err(IcebergError::ValidationError {
                message: format!("snapshot id {} already exists", snapshot.snapshot_id)
            });
        }
        if snapshot.sequence_number != self.last_sequence_number + 1 {
            return Err(IcebergError::ValidationError {
                message: format!(
                    "snapshot sequence number {} does not follow {}",
                    snapshot.sequence_number, self.last_sequence_number
                )
            });
        }
        if let Some(schema_id) = snapshot.schema_id {
            if self.schema_by_id(schema_id).is_none() {
                return Err(IcebergError::ValidationError {
                    message: format!("snapshot refers to unknown schema {schema_id}")
                });
            }
        }

        self.touch(snapshot.timestamp_ms)?;
        self.last_sequence_number = snapshot.sequence_number;
        self.current_snapshot_id = Some(snapshot.snapshot_id);
        self.refs.insert(MAIN_BRANCH.to_string(), SnapshotReference::branch(snapshot.snapshot_id));
        self.snapshot_log.push(SnapshotLog::new(snapshot.snapshot_id, snapshot.timestamp_ms));
        self.snapshots.push(snapshot);

        Ok(self)
    }

    /// Returns new metadata with `schema` added and made current.
    ///
    /// The schema must have a new id, and the default partition spec must still
    /// apply to it. Evolution rules are enforced by
    /// [`SchemaUpdate`](crate::schema::SchemaUpdate).
    pub fn with_schema(mut self, schema: Schema) -> IcebergResult<Self> {
        if self.schema_by_id(schema.id()).is_some() {
            return Err(IcebergError::SchemaError {
                message: format!("schema id {} already exists", schema.id())
            });
        }
        schema.validate()?;
        self.current_partition_spec()?.partition_type(&schema)?;

        self.touch(0)?;
        self.last_column_id = self.last_column_id.max(schema.highest_field_id());
        self.current_schema_id = schema.id();
        self.schemas.push(schema);

        Ok(self)
    }

    /// Returns new metadata with a partition spec of `fields` as the default spec.
    ///
    /// Fields with an id not above `last-partition-id` must match a field of an
    /// existing spec. If an existing spec has the same fields it becomes the default
    /// again instead of adding a new spec.
    pub fn with_partition_spec(mut self, fields: Vec<PartitionField>) -> IcebergResult<Self> {
        for field in &fields {
            if field.field_id <= self.last_partition_id {
                let known = self.partition_specs.iter()
                    .flat_map(|spec| spec.fields())
                    .any(|existing| existing == field);
                if !known {
                    return Err(IcebergError::PartitionError {
                        message: format!(
                            "partition field id {} is already assigned", field.field_id
                        )
                    });
                }
            }
        }

        let existing = self.partition_specs.iter()
            .find(|spec| spec.fields() == fields.as_slice())
            .map(|spec| spec.spec_id());

        let spec_id = match existing {
            Some(spec_id) => spec_id,
            None => {
                let spec_id = self.partition_specs.iter()
                    .map(|spec| spec.spec_id())
                    .max()
                    .map_or(0, |id| id + 1);
                let spec = PartitionSpec::try_new(spec_id, fields, self.current_schema()?)?;
                self.last_partition_id = self.last_partition_id.max(spec.last_assigned_field_id());
                self.partition_specs.push(spec);
                spec_id
            }
        };

        self.touch(0)?;
        self.default_spec_id = spec_id;
        Ok(self)
    }

    /// Records `previous_location` as the metadata file this metadata replaces.
    pub(crate) fn with_previous_metadata(mut self, previous_location: &str, previous_updated_ms: i64) -> Self {
        self.metadata_log.push(MetadataLog::new(previous_location, previous_updated_ms));
        self
    }

    /// Checks the references between the parts of the metadata.
    pub fn validate(&self) -> IcebergResult<()> {
        let invalid = |message: String| Err(IcebergError::ValidationError { message });

        if self.format_version != TableFormatVersion::V2 {
            return Err(IcebergError::Unsupported(
                format!("table version {} not supported", self.format_version)
            ));
        }

        let mut schema_ids = HashSet::new();
        for schema in &self.schemas {
            if !schema_ids.insert(schema.id()) {
                return invalid(format!("duplicate schema id {}", schema.id()));
            }
            if schema.highest_field_id() > self.last_column_id {
                return invalid(format!(
                    "schema {} has field ids above last-column-id {}",
                    schema.id(), self.last_column_id
                ));
            }
        }
        self.current_schema()?;
        self.current_partition_spec()?;

        if let Some(id) = self.current_snapshot_id {
            if self.snapshot_by_id(id).is_none() {
                return Err(IcebergError::SnapshotNotFound { snapshot_id: id });
            }
        }
        let main = self.refs.get(MAIN_BRANCH).map(|r| r.snapshot_id);
        if main.is_some() && main != self.current_snapshot_id {
            return invalid("main branch does not point at the current snapshot".to_string());
        }

        Ok(())
    }

    pub fn encode(&self) -> IcebergResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| IcebergError::SerializeMetadataJson { source: e })
    }

    /// Parses and validates a metadata file.
    pub fn decode(bytes: &[u8]) -> IcebergResult<Self> {
        let metadata: Self = serde_json::from_slice(bytes)
            .map_err(|e| IcebergError::InvalidMetadata { source: e })?;
        metadata.validate()?;
        Ok(metadata)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
/// Encodes changes to the previous metadata files for the table
pub struct MetadataLog {
    /// The file for the log.
    pub metadata_file: String,
    /// Time new metadata was created
    pub timestamp_ms: i64,
}

impl MetadataLog {
    pub fn new(metadata_file: &str, timestamp_ms: i64) -> Self {
        Self {
            metadata_file: metadata_file.to_string(),
            timestamp_ms
        }
    }
}

/// Table metadata together with the location of the file it was read from or
/// written to. The location is what the catalog pointer holds.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedMetadata {
    pub location: String,
    pub metadata: TableMetadata,
}

impl LoadedMetadata {
    pub fn new(location: impl Into<String>, metadata: TableMetadata) -> Self {
        Self { location: location.into(), metadata }
    }

    /// The version number in the metadata file name.
    pub fn version(&self) -> Option<u64> {
        metadata_file_version(&self.location)
    }
}

/// Parses the version out of a `NNNNN-<uuid>.metadata.json` location.
pub fn metadata_file_version(location: &str) -> Option<u64> {
    METADATA_FILE_REGEX.captures(location)
        .and_then(|caps| caps["version"].parse().ok())
}

/// A new, unique metadata file name for `version`.
pub fn metadata_file_name(version: u64) -> String {
    format!("{:05}-{}.metadata.json", version, Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionTransform;
    use crate::schema::{Field, PrimitiveType};
    use crate::snapshot::{SnapshotOperation, SnapshotProducer, SnapshotSummary};

    fn schema() -> Schema {
        Schema::new(0, vec![
            Field::new_primitive(1, "name", true, PrimitiveType::String),
            Field::new_primitive(2, "email", false, PrimitiveType::String),
            Field::new_primitive(3, "dob", false, PrimitiveType::Date),
        ])
    }

    fn metadata() -> TableMetadata {
        TableMetadata::try_new(
            "memory://warehouse/raw/users/", schema(), PartitionSpec::unpartitioned(), BTreeMap::new()
        ).unwrap()
    }

    fn next_snapshot(base: &TableMetadata) -> Snapshot {
        SnapshotProducer::new(base, SnapshotOperation::Append)
            .produce("memory://warehouse/raw/users/metadata/snap.avro", SnapshotSummary::builder(SnapshotOperation::Append).build())
            .unwrap()
    }

    #[test]
    fn new_table_metadata() {
        let metadata = metadata();
        assert_eq!(metadata.location, "memory://warehouse/raw/users");
        assert_eq!(metadata.last_column_id, 3);
        assert_eq!(metadata.last_partition_id, 999);
        assert_eq!(metadata.current_snapshot(), None);
        assert_eq!(metadata.commit_retries(), 4);

        let json: serde_json::Value = serde_json::from_str(&metadata.encode().unwrap()).unwrap();
        assert_eq!(json["format-version"], 2);
        assert_eq!(json["current-snapshot-id"], -1);
        assert_eq!(json["default-spec-id"], 0);

        let decoded = TableMetadata::decode(metadata.encode().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded, metadata);

        let empty = TableMetadata::try_new("memory://w/t", Schema::new(0, vec![]),
            PartitionSpec::unpartitioned(), BTreeMap::new());
        assert!(matches!(empty, Err(IcebergError::SchemaError { .. })));
    }

    #[test]
    fn snapshots_and_time_travel() {
        let base = metadata();
        let first = next_snapshot(&base);
        let v1 = base.clone().with_snapshot(first.clone()).unwrap();

        assert_eq!(v1.current_snapshot(), Some(&first));
        assert_eq!(v1.last_sequence_number, 1);
        assert_eq!(v1.refs[MAIN_BRANCH].snapshot_id, first.snapshot_id);
        assert_eq!(v1.snapshot_log.len(), 1);

        let second = next_snapshot(&v1);
        let v2 = v1.clone().with_snapshot(second.clone()).unwrap();
        let first_logged = v2.snapshot_log[0].timestamp_ms;
        let second_logged = v2.snapshot_log[1].timestamp_ms;

        assert_eq!(v2.snapshot_as_of(first_logged - 1), None);
        assert!(v2.snapshot_as_of(second_logged).is_some());
        assert_eq!(v2.snapshot_as_of(second_logged).unwrap().snapshot_id, second.snapshot_id);
        if first_logged < second_logged {
            assert_eq!(v2.snapshot_as_of(first_logged).unwrap().snapshot_id, first.snapshot_id);
        }

        // A snapshot produced from a stale base no longer chains.
        let stale = next_snapshot(&v1);
        assert!(matches!(v2.clone().with_snapshot(stale), Err(IcebergError::ValidationError { .. })));
        assert!(matches!(v2.with_snapshot(second), Err(IcebergError::ValidationError { .. })));
    }

    #[test]
    fn partition_spec_evolution() {
        let v1 = metadata().with_partition_spec(vec![
            PartitionField::new(3, 1000, "dob_year", PartitionTransform::Year),
        ]).unwrap();
        assert_eq!(v1.default_spec_id, 1);
        assert_eq!(v1.last_partition_id, 1000);

        let reused = v1.clone().with_partition_spec(vec![]).unwrap();
        assert_eq!(reused.default_spec_id, 0);
        assert_eq!(reused.partition_specs.len(), 2);

        let clash = v1.with_partition_spec(vec![
            PartitionField::new(1, 1000, "name", PartitionTransform::Identity),
        ]);
        assert!(matches!(clash, Err(IcebergError::PartitionError { .. })));
    }

    #[test]
    fn metadata_file_names() {
        let name = metadata_file_name(7);
        assert!(name.starts_with("00007-"));
        assert_eq!(metadata_file_version(&format!("memory://w/t/metadata/{name}")), Some(7));
        assert_eq!(metadata_file_version("memory://w/t/metadata/v1.json"), None);

        let json = r#"{"format-version": 2, "table-uuid": "x", "location": "memory://w/t",
            "last-sequence-number": 0, "last-updated-ms": 1, "last-column-id": 1,
            "schemas": [{"schema-id": 0, "type": "struct", "fields": [
                {"id": 1, "name": "id", "required": true, "type": "long"}]}],
            "current-schema-id": 0,
            "partition-specs": [{"spec-id": 0, "fields": []}],
            "default-spec-id": 0, "last-partition-id": 999,
            "sort-orders": [{"order-id": 0, "fields": []}], "default-sort-order-id": 0}"#;
        let metadata = TableMetadata::decode(json.as_bytes()).unwrap();
        assert_eq!(metadata.current_snapshot_id, None);
        assert!(metadata.snapshots.is_empty());
    }
}
