//! Interface to Iceberg table manifest lists and manifest files.
//!
//! A [`Manifest`] tracks data files together with their partition tuple, metrics
//! and status. Manifests are created with a [`ManifestBuilder`], encoded with a
//! [`ManifestWriter`] and decoded with a [`ManifestReader`]. A [`ManifestList`]
//! groups the manifests of one snapshot.

mod avro;
mod builder;
mod reader;
mod writer;

pub mod datafile;
#[allow(clippy::module_inception)]
pub mod manifest;

pub use crate::manifest::builder::ManifestBuilder;
pub use crate::manifest::datafile::{DataFile, DataFileBuilder, DataFileContent, DataFileFormat};
pub use crate::manifest::manifest::{
    ManifestEntry, ManifestEntryStatus,
    Manifest, ManifestFile, ManifestFileType, ManifestContentType,
    ManifestList
};
pub use crate::manifest::reader::ManifestReader;
pub use crate::manifest::writer::ManifestWriter;

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;

    use super::*;
    use crate::IcebergError;
    use crate::partition::{PartitionField, PartitionSpec, PartitionTransform, PartitionValue, PartitionValues};
    use crate::schema::{Field, PrimitiveType, Schema};
    use crate::value::Value;

    fn schema() -> Schema {
        Schema::new(3, vec![
            Field::new_primitive(1, "id", true, PrimitiveType::Long),
            Field::new_primitive(2, "dob", false, PrimitiveType::Date),
            Field::new_primitive(3, "score", false, PrimitiveType::Double),
        ])
    }

    fn spec(schema: &Schema) -> PartitionSpec {
        PartitionSpec::try_new(1, vec![
            PartitionField::new(2, 1000, "dob_year", PartitionTransform::Year),
            PartitionField::new(1, 1001, "id_bucket", PartitionTransform::Bucket(4)),
        ], schema).unwrap()
    }

    fn data_file(path: &str, year: Option<i32>) -> DataFile {
        DataFile::builder(path, DataFileFormat::Parquet, 7, 2048)
            .with_partition_values(PartitionValues::new(vec![
                PartitionValue { field_id: 1000, name: "dob_year".to_string(), value: year.map(Value::Int) },
                PartitionValue { field_id: 1001, name: "id_bucket".to_string(), value: Some(Value::Int(3)) },
            ]))
            .with_column_sizes(BTreeMap::from([(1, 64), (2, 32)]))
            .with_value_counts(
                BTreeMap::from([(1, 7), (2, 7), (3, 7)]),
                BTreeMap::from([(1, 0), (2, 2), (3, 0)]),
                BTreeMap::from([(3, 1)]),
            )
            .with_bounds(
                BTreeMap::from([
                    (1, Value::Long(1).to_bytes()),
                    (2, Value::Date(NaiveDate::from_ymd_opt(1990, 1, 1).unwrap()).to_bytes()),
                ]),
                BTreeMap::from([
                    (1, Value::Long(7).to_bytes()),
                    (2, Value::Date(NaiveDate::from_ymd_opt(2001, 6, 30).unwrap()).to_bytes()),
                ]),
            )
            .with_split_offsets(vec![4])
            .build()
    }

    #[test]
    fn manifest_avro() {
        let schema = schema();
        let spec = spec(&schema);

        let mut builder = ManifestBuilder::new(&schema, &spec);
        builder.add_file(data_file("memory://w/t/data/a.parquet", Some(20))).unwrap();
        builder.add_file(data_file("memory://w/t/data/b.parquet", None)).unwrap();
        let manifest = builder.build();

        let writer = ManifestWriter::new(4, 1234);
        let (bytes, manifest_file) = writer.write("memory://w/t/metadata/x-m0.avro", &manifest).unwrap();
        assert_eq!(manifest_file.manifest_length, bytes.len() as i64);
        assert_eq!(manifest_file.added_data_files_count, 2);
        assert_eq!(manifest_file.added_rows_count, 14);
        assert_eq!(manifest_file.min_sequence_number, 4);

        let decoded = ManifestReader::for_manifest_file(&manifest_file)
            .read_checked(&bytes, &manifest_file)
            .unwrap();

        assert_eq!(decoded.schema(), &schema);
        assert_eq!(decoded.partition_spec(), &spec);
        assert_eq!(decoded.content_type(), ManifestContentType::Data);
        assert_eq!(decoded.entries().len(), 2);

        let entry = &decoded.entries()[0];
        assert_eq!(entry.snapshot_id, Some(1234));
        assert_eq!(entry.sequence_number, Some(4));
        assert_eq!(entry.file_sequence_number, Some(4));
        assert_eq!(entry.data_file, manifest.entries()[0].data_file);
        assert_eq!(decoded.entries()[1].data_file.partition.get("dob_year"), None);
    }

    #[test]
    fn summary_mismatch_is_detected() {
        let schema = schema();
        let spec = spec(&schema);

        let mut builder = ManifestBuilder::new(&schema, &spec);
        builder.add_file(data_file("memory://w/t/data/a.parquet", Some(20))).unwrap();
        let (bytes, mut manifest_file) = ManifestWriter::new(1, 1)
            .write("memory://w/t/metadata/y-m0.avro", &builder.build())
            .unwrap();

        manifest_file.added_rows_count += 1;
        let result = ManifestReader::for_manifest_file(&manifest_file).read_checked(&bytes, &manifest_file);
        assert!(matches!(result, Err(IcebergError::ManifestError(_))));
    }
}
