use bytes::Bytes;

use crate::{IcebergError, IcebergResult};
use super::avro::serialize_manifest;
use super::manifest::{Manifest, ManifestContentType, ManifestFile, ManifestFileType};

/// Encodes manifests written by one snapshot.
pub struct ManifestWriter {
    sequence_number: i64,
    snapshot_id: i64,
}

impl ManifestWriter {
    pub fn new(sequence_number: i64, snapshot_id: i64) -> Self {
        Self { sequence_number, snapshot_id }
    }

    /// Serializes the manifest into Avro binary format.
    ///
    /// Returns the serialized bytes alongside with a corresponding ManifestFile object
    /// pointing to the manifest. The ManifestFile summary is derived from the
    /// manifest's entries. The function encodes the manifest but does not write it
    /// to storage.
    pub fn write(
        &self,
        manifest_path: &str,
        manifest: &Manifest
    ) -> IcebergResult<(Bytes, ManifestFile)> {
        if let Some(entry) = manifest.entries().iter()
            .find(|entry| entry.data_file.record_count < 0 || entry.data_file.file_size_in_bytes < 0)
        {
            return Err(IcebergError::ManifestError(format!(
                "data file {} has negative record count or size",
                entry.data_file.file_path
            )));
        }

        let encoded = serialize_manifest(manifest)?;

        let manifest_file = ManifestFile {
            manifest_path: manifest_path.to_string(),
            manifest_length: i64::try_from(encoded.len()).map_err(|_| {
                IcebergError::ManifestError(format!("manifest {manifest_path} is too large"))
            })?,
            partition_spec_id: manifest.partition_spec().spec_id(),
            content: match manifest.content_type() {
                ManifestContentType::Data => ManifestFileType::Data,
                ManifestContentType::Deletes => ManifestFileType::Delete
            },
            sequence_number: self.sequence_number,
            min_sequence_number: manifest.min_sequence_number()
                .unwrap_or(self.sequence_number),
            added_snapshot_id: self.snapshot_id,
            added_data_files_count: manifest.added_data_files_count(),
            existing_data_files_count: manifest.existing_data_files_count(),
            deleted_data_files_count: manifest.deleted_data_files_count(),
            added_rows_count: manifest.added_rows_count(),
            existing_rows_count: manifest.existing_rows_count(),
            deleted_rows_count: manifest.deleted_rows_count(),
        };

        Ok((Bytes::from(encoded), manifest_file))
    }
}
