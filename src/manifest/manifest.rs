//! Manifest files and manifest lists.
use std::fmt;

use serde::{Serialize, Deserialize};
use serde_repr::{Serialize_repr, Deserialize_repr};

use crate::{IcebergError, IcebergResult};
use crate::metadata::TableFormatVersion;
use crate::schema::Schema;
use crate::partition::PartitionSpec;
use super::datafile::DataFile;

/// Avro schema for the manifest_file struct
static MANIFEST_FILE_SCHEMA: &str = r#"
{
  "type": "record",
  "name": "manifest_file",
  "fields": [
    { "name": "manifest_path", "type": "string", "field-id": 500 },
    { "name": "manifest_length", "type": "long", "field-id": 501 },
    { "name": "partition_spec_id", "type": "int", "field-id": 502 },
    { "name": "content", "type": "int", "field-id": 517 },
    { "name": "sequence_number", "type": "long", "field-id": 515 },
    { "name": "min_sequence_number", "type": "long", "field-id": 516 },
    { "name": "added_snapshot_id", "type": "long", "field-id": 503 },
    { "name": "added_data_files_count", "type": "int", "field-id": 504 },
    { "name": "existing_data_files_count", "type": "int", "field-id": 505 },
    { "name": "deleted_data_files_count", "type": "int", "field-id": 506 },
    { "name": "added_rows_count", "type": "long", "field-id": 512 },
    { "name": "existing_rows_count", "type": "long", "field-id": 513 },
    { "name": "deleted_rows_count", "type": "long", "field-id": 514 }
  ]
}
"#;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(i32)]
pub enum ManifestEntryStatus {
    Existing = 0,
    Added = 1,
    Deleted = 2,
}

impl TryFrom<i32> for ManifestEntryStatus {
    type Error = IcebergError;

    fn try_from(status: i32) -> Result<Self, Self::Error> {
        match status {
            0 => Ok(ManifestEntryStatus::Existing),
            1 => Ok(ManifestEntryStatus::Added),
            2 => Ok(ManifestEntryStatus::Deleted),
            _ => Err(IcebergError::ManifestError(
                format!("invalid manifest entry status {status}")
            )),
        }
    }
}

/// Tracks a single data file in a manifest.
///
/// The `ManifestEntry` stores status, metrics and tracking information about the
/// data file.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    /// Used to track additions and deletions. Deletes are informational only and not
    /// used in scans.
    pub status: ManifestEntryStatus,
    /// Snapshot id where the file was added, or deleted if the status is deleted.
    /// Inherited when null.
    pub snapshot_id: Option<i64>,
    /// Data sequence number of the file. Inherited when null and the file was added.
    pub sequence_number: Option<i64>,
    /// File sequence number indicating when the file was added. Inherited when null
    /// and the file was added.
    pub file_sequence_number: Option<i64>,
    /// File path, partition tuple, metrics.
    pub data_file: DataFile,
}

impl ManifestEntry {
    /// An entry for a file added by the snapshot that writes the manifest. The
    /// snapshot id and sequence numbers are inherited when the manifest is read.
    pub fn added(data_file: DataFile) -> Self {
        Self {
            status: ManifestEntryStatus::Added,
            snapshot_id: None,
            sequence_number: None,
            file_sequence_number: None,
            data_file
        }
    }

    pub fn status(&self) -> ManifestEntryStatus {
        self.status
    }

    pub fn is_added(&self) -> bool {
        self.status == ManifestEntryStatus::Added
    }

    pub fn is_existing(&self) -> bool {
        self.status == ManifestEntryStatus::Existing
    }

    pub fn is_deleted(&self) -> bool {
        self.status == ManifestEntryStatus::Deleted
    }

    /// Added and existing entries point at files that are part of the table.
    pub fn is_live(&self) -> bool {
        !self.is_deleted()
    }

    pub fn snapshot_id(&self) -> Option<i64> {
        self.snapshot_id
    }

    pub fn data_file(&self) -> &DataFile {
        &self.data_file
    }

    pub fn with_status(mut self, status: ManifestEntryStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ManifestContentType {
    Data,
    Deletes,
}

impl fmt::Display for ManifestContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match *self {
            ManifestContentType::Data => "data",
            ManifestContentType::Deletes => "deletes"
        })
    }
}

impl std::str::FromStr for ManifestContentType {
    type Err = IcebergError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "data" => Ok(ManifestContentType::Data),
            "deletes" => Ok(ManifestContentType::Deletes),
            _ => Err(IcebergError::ManifestError(
                format!("invalid manifest content type '{s}'")
            ))
        }
    }
}

/// An Iceberg manifest stores a list of data files, along with each file's
/// partition tuple, metrics, and tracking information.
///
/// A manifest stores files for a single partition spec, and is never modified once
/// written. Use [`ManifestBuilder`](super::ManifestBuilder) to create one.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// The table schema at the time the manifest was written.
    schema: Schema,
    /// Partition spec of the data files within this manifest.
    partition_spec: PartitionSpec,
    format_version: TableFormatVersion,
    content_type: ManifestContentType,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub(crate) fn new(
        schema: Schema,
        partition_spec: PartitionSpec,
        content_type: ManifestContentType,
        entries: Vec<ManifestEntry>,
    ) -> Self {
        Self {
            schema,
            partition_spec,
            format_version: TableFormatVersion::V2,
            content_type,
            entries,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_id(&self) -> i32 {
        self.schema.id()
    }

    pub fn partition_spec(&self) -> &PartitionSpec {
        &self.partition_spec
    }

    pub fn format_version(&self) -> TableFormatVersion {
        self.format_version
    }

    pub fn content_type(&self) -> ManifestContentType {
        self.content_type
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Vec<ManifestEntry> {
        &mut self.entries
    }

    pub fn into_entries(self) -> impl Iterator<Item = ManifestEntry> {
        self.entries.into_iter()
    }

    /// Entries of files that are part of the table, in manifest order.
    pub fn live_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|entry| entry.is_live())
    }

    pub fn min_sequence_number(&self) -> Option<i64> {
        self.entries.iter()
            .filter_map(|entry| entry.sequence_number)
            .min()
    }

    fn files_count(&self, status: ManifestEntryStatus) -> i32 {
        let count = self.entries.iter()
            .filter(|entry| entry.status == status)
            .count();
        i32::try_from(count).unwrap_or(i32::MAX)
    }

    fn rows_count(&self, status: ManifestEntryStatus) -> i64 {
        self.entries.iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.data_file.record_count)
            .sum()
    }

    /// Returns the number of entries with status
    /// [`ManifestEntryStatus::Added`]
    pub fn added_data_files_count(&self) -> i32 {
        self.files_count(ManifestEntryStatus::Added)
    }

    pub fn existing_data_files_count(&self) -> i32 {
        self.files_count(ManifestEntryStatus::Existing)
    }

    pub fn deleted_data_files_count(&self) -> i32 {
        self.files_count(ManifestEntryStatus::Deleted)
    }

    /// Returns the number of rows in all of the files in the manifest that have
    /// status [`ManifestEntryStatus::Added`]
    pub fn added_rows_count(&self) -> i64 {
        self.rows_count(ManifestEntryStatus::Added)
    }

    pub fn existing_rows_count(&self) -> i64 {
        self.rows_count(ManifestEntryStatus::Existing)
    }

    pub fn deleted_rows_count(&self) -> i64 {
        self.rows_count(ManifestEntryStatus::Deleted)
    }

    /// Checks that the summary recorded in `manifest_file` matches the state of
    /// the entries of this manifest.
    pub fn check_summary(&self, manifest_file: &ManifestFile) -> IcebergResult<()> {
        let expected = [
            ("added files", self.added_data_files_count() as i64,
                manifest_file.added_data_files_count as i64),
            ("existing files", self.existing_data_files_count() as i64,
                manifest_file.existing_data_files_count as i64),
            ("deleted files", self.deleted_data_files_count() as i64,
                manifest_file.deleted_data_files_count as i64),
            ("added rows", self.added_rows_count(), manifest_file.added_rows_count),
            ("existing rows", self.existing_rows_count(), manifest_file.existing_rows_count),
            ("deleted rows", self.deleted_rows_count(), manifest_file.deleted_rows_count),
        ];

        for (what, actual, recorded) in expected {
            if actual != recorded {
                return Err(IcebergError::ManifestError(format!(
                    "manifest {} records {recorded} {what} but has {actual}",
                    manifest_file.manifest_path
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize_repr, Deserialize_repr)]
#[repr(i32)]
pub enum ManifestFileType {
    Data = 0,
    Delete = 1,
}

/// An entry of a manifest list, pointing at one manifest and summarizing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Location of the manifest file.
    pub manifest_path: String,
    /// Length of the manifest file in bytes.
    pub manifest_length: i64,
    /// ID of a partition spec used to write the manifest; must be listed in table
    /// metadata partition-specs.
    pub partition_spec_id: i32,
    /// The type of files tracked by the manifest.
    pub content: ManifestFileType,
    /// The sequence number when the manifest was added to the table.
    pub sequence_number: i64,
    /// The minimum data sequence number of all live data files in the manifest.
    pub min_sequence_number: i64,
    /// ID of the snapshot where the manifest file was added.
    pub added_snapshot_id: i64,
    pub added_data_files_count: i32,
    pub existing_data_files_count: i32,
    pub deleted_data_files_count: i32,
    pub added_rows_count: i64,
    pub existing_rows_count: i64,
    pub deleted_rows_count: i64,
}

impl ManifestFile {
    /// Whether the manifest still tracks files that are part of the table.
    pub fn has_live_files(&self) -> bool {
        self.added_data_files_count > 0 || self.existing_data_files_count > 0
    }
}

/// An Iceberg manifest list file contains entries of ManifestFile serialized
/// to Avro. Each ManifestFile points to the path of the actual manifest file on the
/// underlying storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestList {
    manifests: Vec<ManifestFile>,
}

impl ManifestList {
    pub fn new() -> Self {
        Self { manifests: Vec::new() }
    }

    pub fn push(&mut self, manifest: ManifestFile) {
        self.manifests.push(manifest);
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn manifest_files(&self) -> &[ManifestFile] {
        &self.manifests
    }

    /// Encodes the manifest list to an Avro manifest list file.
    pub fn encode(&self) -> IcebergResult<Vec<u8>> {
        let schema = apache_avro::Schema::parse_str(MANIFEST_FILE_SCHEMA)?;
        let mut writer = apache_avro::Writer::new(&schema, Vec::<u8>::new());
        writer.extend_ser(self.manifests.iter())?;
        Ok(writer.into_inner()?)
    }

    /// Decodes a ManifestList from an Avro-encoded manifest list file.
    pub fn decode(data: &[u8]) -> IcebergResult<Self> {
        let schema = apache_avro::Schema::parse_str(MANIFEST_FILE_SCHEMA)?;
        let reader = apache_avro::Reader::with_schema(&schema, data)?;

        let manifests: Result<Vec<ManifestFile>, _> = reader.into_iter().map(|res| {
            res.and_then(|value| apache_avro::from_value::<ManifestFile>(&value))
        }).collect();

        Ok(Self { manifests: manifests? })
    }
}

impl FromIterator<ManifestFile> for ManifestList {
    fn from_iter<T: IntoIterator<Item = ManifestFile>>(iter: T) -> Self {
        Self { manifests: iter.into_iter().collect() }
    }
}

impl IntoIterator for ManifestList {
    type Item = ManifestFile;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.manifests.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_file(path: &str, added: i32) -> ManifestFile {
        ManifestFile {
            manifest_path: path.to_string(),
            manifest_length: 1024,
            partition_spec_id: 0,
            content: ManifestFileType::Data,
            sequence_number: 3,
            min_sequence_number: 1,
            added_snapshot_id: 8_000_000_001,
            added_data_files_count: added,
            existing_data_files_count: 2,
            deleted_data_files_count: 0,
            added_rows_count: 10,
            existing_rows_count: 20,
            deleted_rows_count: 0,
        }
    }

    #[test]
    fn manifest_list_avro() {
        let list: ManifestList = vec![
            manifest_file("memory://warehouse/t/metadata/a-m0.avro", 1),
            manifest_file("memory://warehouse/t/metadata/b-m0.avro", 0),
        ].into_iter().collect();

        let encoded = list.encode().unwrap();
        let decoded = ManifestList::decode(&encoded).unwrap();

        assert_eq!(decoded, list);
        assert_eq!(decoded.len(), 2);
        assert!(decoded.manifest_files()[1].has_live_files());
        assert!(ManifestList::decode(b"not avro").is_err());
    }

    #[test]
    fn entry_status_codes() {
        assert_eq!(ManifestEntryStatus::try_from(2).unwrap(), ManifestEntryStatus::Deleted);
        assert_eq!(ManifestEntryStatus::Added as i32, 1);
        assert!(ManifestEntryStatus::try_from(3).is_err());
        assert_eq!("DATA".parse::<ManifestContentType>().unwrap(), ManifestContentType::Data);
    }
}
