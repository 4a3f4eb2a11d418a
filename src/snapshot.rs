//! Interface to Iceberg table snapshots.
use std::collections::BTreeMap;

use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::IcebergResult;
use crate::utils;
use crate::metadata::TableMetadata;
use crate::manifest::DataFile;

/// Name of the branch that tracks the current snapshot of a table.
pub const MAIN_BRANCH: &str = "main";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
/// The type of operations included in the snapshot, this allows
/// certain snapshots to be skipped during operation.
pub enum SnapshotOperation {
    /// Only data files were added and no files were removed.
    Append,
    /// Data files were added and removed in a logical overwrite operation.
    Overwrite,
    /// Data files were removed and their contents logically deleted.
    Delete,
}

impl std::fmt::Display for SnapshotOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            SnapshotOperation::Append => "append",
            SnapshotOperation::Overwrite => "overwrite",
            SnapshotOperation::Delete => "delete",
        })
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
/// Summarises the changes in the snapshot.
pub struct SnapshotSummary {
    /// The type of operation in the snapshot
    pub operation: SnapshotOperation,
    /// Other summary data.
    #[serde(flatten)]
    stats: BTreeMap<String, String>,
}

impl SnapshotSummary {
    pub fn builder(operation: SnapshotOperation) -> SnapshotSummaryBuilder {
        SnapshotSummaryBuilder::new(operation)
    }

    /// Returns a numeric statistic such as `total-records`.
    pub fn stat(&self, name: &str) -> Option<i64> {
        self.stats.get(name).and_then(|value| value.parse().ok())
    }

    pub fn stats(&self) -> &BTreeMap<String, String> {
        &self.stats
    }
}

const TOTAL_STATS: [&str; 3] = ["total-records", "total-files-size", "total-data-files"];

pub struct SnapshotSummaryBuilder {
    operation: SnapshotOperation,
    // In the SnapshotSummary, stats should be encoded as strings.
    // However, in practice, they are all integers.
    stats: BTreeMap<String, i64>,
}

impl SnapshotSummaryBuilder {
    pub fn new(operation: SnapshotOperation) -> Self {
        let stats = TOTAL_STATS.iter().map(|k| (k.to_string(), 0)).collect();
        Self { operation, stats }
    }

    /// Carries over the totals of the parent snapshot.
    pub fn copy_totals(&mut self, summary: &SnapshotSummary) -> &mut Self {
        for k in TOTAL_STATS {
            if let Some(value) = summary.stat(k) {
                self.stats.insert(k.to_string(), value);
            }
        }
        self
    }

    fn add_to_stat(&mut self, stat_name: &str, count: i64) {
        self.stats.entry(stat_name.to_string())
            .and_modify(|v| { *v += count })
            .or_insert(count);
    }

    pub fn added_data_file(&mut self, data_file: &DataFile) -> &mut Self {
        self.add_to_stat("added-data-files", 1);
        self.add_to_stat("total-data-files", 1);

        self.add_to_stat("added-records", data_file.record_count);
        self.add_to_stat("total-records", data_file.record_count);

        self.add_to_stat("added-files-size", data_file.file_size_in_bytes);
        self.add_to_stat("total-files-size", data_file.file_size_in_bytes);

        self
    }

    pub fn removed_data_file(&mut self, data_file: &DataFile) -> &mut Self {
        self.add_to_stat("deleted-data-files", 1);
        self.add_to_stat("total-data-files", -1);

        self.add_to_stat("deleted-records", data_file.record_count);
        self.add_to_stat("total-records", -data_file.record_count);

        self.add_to_stat("removed-files-size", data_file.file_size_in_bytes);
        self.add_to_stat("total-files-size", -data_file.file_size_in_bytes);

        self
    }

    pub fn build(&self) -> SnapshotSummary {
        SnapshotSummary {
            operation: self.operation,
            stats: self.stats.iter().map(|(k, v)| {
                (k.to_string(), v.to_string())
            }).collect()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
/// A V2 compliant snapshot.
pub struct Snapshot {
    /// A unique long ID
    pub snapshot_id: i64,
    /// The snapshot ID of the snapshot's parent.
    /// Omitted for any snapshot with no parent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    /// A monotonically increasing long that tracks the order of
    /// changes to a table.
    pub sequence_number: i64,
    /// A timestamp when the snapshot was created, used for garbage
    /// collection and table inspection
    pub timestamp_ms: i64,
    /// The location of a manifest list for this snapshot that
    /// tracks manifest files with additional metadata.
    pub manifest_list: String,
    /// A string map that summarizes the snapshot changes, including operation.
    pub summary: SnapshotSummary,
    /// ID of the table's current schema when the snapshot was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<i32>,
}

impl Snapshot {
    pub fn operation(&self) -> SnapshotOperation {
        self.summary.operation
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
/// A log of when each snapshot was made.
pub struct SnapshotLog {
    /// Id of the snapshot.
    pub snapshot_id: i64,
    /// Last updated timestamp
    pub timestamp_ms: i64,
}

impl SnapshotLog {
    pub fn new(snapshot_id: i64, timestamp_ms: i64) -> Self {
        Self { snapshot_id, timestamp_ms }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotReference {
    /// The snapshot the reference points to, the latest snapshot of a branch.
    pub snapshot_id: i64,
    /// Type of the reference.
    #[serde(flatten)]
    pub r#type: SnapshotReferenceType,
    /// For snapshot references except the main branch, a positive number for the max
    /// age of the snapshot reference to keep while expiring snapshots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ref_age_ms: Option<i64>,
}

impl SnapshotReference {
    pub fn branch(snapshot_id: i64) -> Self {
        Self {
            snapshot_id,
            r#type: SnapshotReferenceType::Branch {
                min_snapshots_to_keep: None,
                max_snapshot_age_ms: None
            },
            max_ref_age_ms: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "lowercase", tag = "type")]
/// Type and retention policy of a reference. Only branches are written.
pub enum SnapshotReferenceType {
    #[serde(rename_all = "kebab-case")]
    /// A branch reference
    Branch {
        /// A positive number for the minimum number of snapshots to keep in a
        /// branch while expiring snapshots.
        #[serde(skip_serializing_if = "Option::is_none")]
        min_snapshots_to_keep: Option<i32>,
        /// A positive number for the max age of snapshots to keep when expiring,
        /// including the latest snapshot.
        #[serde(skip_serializing_if = "Option::is_none")]
        max_snapshot_age_ms: Option<i64>,
    },
}

/// Produces the next snapshot of a table from the metadata it is based on.
///
/// The producer only builds the [`Snapshot`] value. The manifest list it points to
/// must already be written, and the snapshot becomes part of the table only once
/// it is committed through the catalog.
#[derive(Debug)]
pub struct SnapshotProducer {
    snapshot_id: i64,
    operation: SnapshotOperation,
    parent_snapshot_id: Option<i64>,
    sequence_number: i64,
    schema_id: i32,
    min_timestamp_ms: i64,
}

impl SnapshotProducer {
    pub fn new(base: &TableMetadata, operation: SnapshotOperation) -> Self {
        let mut rng = rand::thread_rng();
        let snapshot_id = loop {
            let id = rng.gen_range(1..i64::MAX);
            if base.snapshot_by_id(id).is_none() {
                break id;
            }
        };

        Self {
            snapshot_id,
            operation,
            parent_snapshot_id: base.current_snapshot_id,
            sequence_number: base.last_sequence_number + 1,
            schema_id: base.current_schema_id,
            min_timestamp_ms: base.last_updated_ms,
        }
    }

    /// The id of the snapshot to be produced, unique in the base's history.
    pub fn snapshot_id(&self) -> i64 {
        self.snapshot_id
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn operation(&self) -> SnapshotOperation {
        self.operation
    }

    /// Builds the snapshot pointing at the manifest list at
    /// `manifest_list_location`.
    pub fn produce(
        &self,
        manifest_list_location: &str,
        summary: SnapshotSummary
    ) -> IcebergResult<Snapshot> {
        Ok(Snapshot {
            snapshot_id: self.snapshot_id,
            parent_snapshot_id: self.parent_snapshot_id,
            sequence_number: self.sequence_number,
            // Never earlier than the base, so the snapshot log stays ordered.
            timestamp_ms: utils::current_time_ms()?.max(self.min_timestamp_ms),
            manifest_list: manifest_list_location.to_string(),
            summary: SnapshotSummary { operation: self.operation, ..summary },
            schema_id: Some(self.schema_id),
        })
    }
}
