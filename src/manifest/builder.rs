use crate::{IcebergError, IcebergResult};
use crate::schema::Schema;
use crate::partition::PartitionSpec;
use super::datafile::DataFile;
use super::manifest::{Manifest, ManifestContentType, ManifestEntry, ManifestEntryStatus};

/// Collects the entries of a new data manifest.
///
/// Files added by the snapshot being produced go through [`add_file`](Self::add_file)
/// and carry no snapshot id or sequence numbers: both are inherited from the
/// manifest list entry when the manifest is read. Files carried over from an
/// earlier manifest keep their tracking information.
#[derive(Debug)]
pub struct ManifestBuilder {
    schema: Schema,
    partition_spec: PartitionSpec,
    entries: Vec<ManifestEntry>,
}

impl ManifestBuilder {
    pub fn new(schema: &Schema, partition_spec: &PartitionSpec) -> Self {
        Self {
            schema: schema.clone(),
            partition_spec: partition_spec.clone(),
            entries: Vec::new(),
        }
    }

    fn check_partition(&self, data_file: &DataFile) -> IcebergResult<()> {
        let matches = data_file.partition.len() == self.partition_spec.fields().len()
            && data_file.partition.iter()
                .zip(self.partition_spec.fields())
                .all(|(value, field)| value.field_id == field.field_id);

        if matches {
            Ok(())
        } else {
            Err(IcebergError::ManifestError(format!(
                "partition of data file {} does not match partition spec {}",
                data_file.file_path, self.partition_spec.spec_id()
            )))
        }
    }

    /// Adds a newly written file.
    pub fn add_file(&mut self, data_file: DataFile) -> IcebergResult<&mut Self> {
        self.check_partition(&data_file)?;
        self.entries.push(ManifestEntry::added(data_file));
        Ok(self)
    }

    /// Carries over a live entry of an earlier manifest.
    pub fn add_existing(&mut self, entry: ManifestEntry) -> IcebergResult<&mut Self> {
        self.check_partition(&entry.data_file)?;
        self.entries.push(entry.with_status(ManifestEntryStatus::Existing));
        Ok(self)
    }

    /// Records the removal of a file by the snapshot being produced. The entry
    /// keeps its sequence numbers and inherits the id of the deleting snapshot.
    pub fn add_deleted(&mut self, entry: ManifestEntry) -> IcebergResult<&mut Self> {
        self.check_partition(&entry.data_file)?;
        self.entries.push(ManifestEntry {
            status: ManifestEntryStatus::Deleted,
            snapshot_id: None,
            ..entry
        });
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(self) -> Manifest {
        Manifest::new(self.schema, self.partition_spec, ManifestContentType::Data, self.entries)
    }
}
