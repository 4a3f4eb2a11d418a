//! Serialization and deserialization of manifests to Avro format.
//!
//! Manifest entries are written with a fixed Avro schema. Partition tuples are
//! stored as a list of `{field_id, name, value}` records whose values use the
//! binary single-value serialization, and are typed again on read from the schema
//! and partition spec kept in the file's metadata.
use std::collections::{BTreeMap, HashMap};

use apache_avro::{
    self,
    Reader as AvroReader,
    Writer as AvroWriter,
    types::Value as AvroValue
};
use serde::Deserialize;

use crate::{IcebergResult, IcebergError};
use crate::metadata::TableFormatVersion;
use crate::schema::{Schema, PrimitiveType};
use crate::value::Value;
use crate::partition::{PartitionSpec, PartitionField, PartitionValue, PartitionValues};
use super::manifest::{Manifest, ManifestEntry, ManifestEntryStatus, ManifestContentType};
use super::datafile::{DataFile, DataFileContent};

/// Avro schema for the manifest_entry struct
static MANIFEST_ENTRY_SCHEMA: &str = r#"
{
  "type": "record",
  "name": "manifest_entry",
  "fields": [
    { "name": "status", "type": "int", "field-id": 0 },
    { "name": "snapshot_id", "type": [ "null", "long" ], "default": null, "field-id": 1 },
    { "name": "sequence_number", "type": [ "null", "long" ], "default": null, "field-id": 3 },
    { "name": "file_sequence_number", "type": [ "null", "long" ], "default": null, "field-id": 4 },
    {
      "name": "data_file",
      "field-id": 2,
      "type": {
        "type": "record",
        "name": "r2",
        "fields": [
          { "name": "content", "type": "int", "field-id": 134 },
          { "name": "file_path", "type": "string", "field-id": 100 },
          { "name": "file_format", "type": "string", "field-id": 101 },
          {
            "name": "partition",
            "field-id": 102,
            "type": {
              "type": "array",
              "items": {
                "type": "record",
                "name": "r102",
                "fields": [
                  { "name": "field_id", "type": "int" },
                  { "name": "name", "type": "string" },
                  { "name": "value", "type": [ "null", "bytes" ], "default": null }
                ]
              }
            }
          },
          { "name": "record_count", "type": "long", "field-id": 103 },
          { "name": "file_size_in_bytes", "type": "long", "field-id": 104 },
          {
            "name": "column_sizes",
            "field-id": 108,
            "default": null,
            "type": [ "null", {
              "type": "array",
              "items": {
                "type": "record",
                "name": "k117_v118",
                "fields": [
                  { "name": "key", "type": "int", "field-id": 117 },
                  { "name": "value", "type": "long", "field-id": 118 }
                ]
              }
            } ]
          },
          {
            "name": "value_counts",
            "field-id": 109,
            "default": null,
            "type": [ "null", {
              "type": "array",
              "items": {
                "type": "record",
                "name": "k119_v120",
                "fields": [
                  { "name": "key", "type": "int", "field-id": 119 },
                  { "name": "value", "type": "long", "field-id": 120 }
                ]
              }
            } ]
          },
          {
            "name": "null_value_counts",
            "field-id": 110,
            "default": null,
            "type": [ "null", {
              "type": "array",
              "items": {
                "type": "record",
                "name": "k121_v122",
                "fields": [
                  { "name": "key", "type": "int", "field-id": 121 },
                  { "name": "value", "type": "long", "field-id": 122 }
                ]
              }
            } ]
          },
          {
            "name": "nan_value_counts",
            "field-id": 137,
            "default": null,
            "type": [ "null", {
              "type": "array",
              "items": {
                "type": "record",
                "name": "k138_v139",
                "fields": [
                  { "name": "key", "type": "int", "field-id": 138 },
                  { "name": "value", "type": "long", "field-id": 139 }
                ]
              }
            } ]
          },
          {
            "name": "lower_bounds",
            "field-id": 125,
            "default": null,
            "type": [ "null", {
              "type": "array",
              "items": {
                "type": "record",
                "name": "k126_v127",
                "fields": [
                  { "name": "key", "type": "int", "field-id": 126 },
                  { "name": "value", "type": "bytes", "field-id": 127 }
                ]
              }
            } ]
          },
          {
            "name": "upper_bounds",
            "field-id": 128,
            "default": null,
            "type": [ "null", {
              "type": "array",
              "items": {
                "type": "record",
                "name": "k129_v130",
                "fields": [
                  { "name": "key", "type": "int", "field-id": 129 },
                  { "name": "value", "type": "bytes", "field-id": 130 }
                ]
              }
            } ]
          },
          {
            "name": "split_offsets",
            "field-id": 132,
            "default": null,
            "type": [ "null", { "type": "array", "items": "long", "element-id": 133 } ]
          },
          { "name": "sort_order_id", "type": [ "null", "int" ], "default": null, "field-id": 140 }
        ]
      }
    }
  ]
}
"#;

/// Serializes an optional value. An optional value is encoded as a union
/// of null type and the real type. This assumes that the Avro schema has
/// a type of the form: `[ "null", inner_type ]`, i.e. the null must come first.
fn serialize_opt<V>(value: Option<V>) -> AvroValue
where
    V: Into<AvroValue>
{
    match value {
        Some(value) => AvroValue::Union(1, Box::new(value.into())),
        None => AvroValue::Union(0, Box::new(AvroValue::Null)),
    }
}

/// Serialize a map into Avro as a list of structs of the form
/// `{"key": k, "value": v}`.
fn serialize_map<V>(map: &BTreeMap<i32, V>) -> AvroValue
where
    V: Into<AvroValue> + Clone
{
    AvroValue::Array(
        map.iter().map(|(k, v)| {
            AvroValue::Record(vec![
                ("key".to_string(), AvroValue::Int(*k)),
                ("value".to_string(), v.clone().into())
            ])
        }).collect()
    )
}

fn serialize_partition(partition: &PartitionValues) -> AvroValue {
    AvroValue::Array(
        partition.iter().map(|v| {
            AvroValue::Record(vec![
                ("field_id".to_string(), AvroValue::Int(v.field_id)),
                ("name".to_string(), AvroValue::String(v.name.clone())),
                ("value".to_string(), serialize_opt(v.value.as_ref().map(|value| {
                    AvroValue::Bytes(value.to_bytes())
                }))),
            ])
        }).collect()
    )
}

/// Manually serializes a DataFile, in the field order of the Avro schema.
fn serialize_data_file(data_file: &DataFile) -> AvroValue {
    AvroValue::Record(vec![
        ("content".to_string(), AvroValue::Int(data_file.content.code())),
        ("file_path".to_string(), AvroValue::String(data_file.file_path.clone())),
        ("file_format".to_string(), AvroValue::String(data_file.file_format.to_string())),
        ("partition".to_string(), serialize_partition(&data_file.partition)),
        ("record_count".to_string(), AvroValue::Long(data_file.record_count)),
        ("file_size_in_bytes".to_string(), AvroValue::Long(data_file.file_size_in_bytes)),
        ("column_sizes".to_string(), serialize_opt(data_file.column_sizes.as_ref().map(serialize_map))),
        ("value_counts".to_string(), serialize_opt(Some(serialize_map(&data_file.value_counts)))),
        ("null_value_counts".to_string(), serialize_opt(Some(serialize_map(&data_file.null_value_counts)))),
        ("nan_value_counts".to_string(), serialize_opt(Some(serialize_map(&data_file.nan_value_counts)))),
        ("lower_bounds".to_string(), serialize_opt(Some(serialize_map(&data_file.lower_bounds)))),
        ("upper_bounds".to_string(), serialize_opt(Some(serialize_map(&data_file.upper_bounds)))),
        ("split_offsets".to_string(), serialize_opt(data_file.split_offsets.as_ref().map(|offsets| {
            AvroValue::Array(offsets.iter().map(|offset| AvroValue::Long(*offset)).collect())
        }))),
        ("sort_order_id".to_string(), serialize_opt(data_file.sort_order_id)),
    ])
}

fn serialize_entry(entry: &ManifestEntry) -> AvroValue {
    AvroValue::Record(vec![
        ("status".to_string(), AvroValue::Int(entry.status as i32)),
        ("snapshot_id".to_string(), serialize_opt(entry.snapshot_id)),
        ("sequence_number".to_string(), serialize_opt(entry.sequence_number)),
        ("file_sequence_number".to_string(), serialize_opt(entry.file_sequence_number)),
        ("data_file".to_string(), serialize_data_file(&entry.data_file)),
    ])
}

/// Serializes a manifest into binary Avro format.
pub(super) fn serialize_manifest(manifest: &Manifest) -> IcebergResult<Vec<u8>> {
    let schema = apache_avro::Schema::parse_str(MANIFEST_ENTRY_SCHEMA)?;
    let mut writer = AvroWriter::new(&schema, Vec::new());

    // The Avro file's key-value metadata contains the schema of the table
    // and the partition spec for the files in the manifest.
    let mut metadata = HashMap::<String, String>::new();
    metadata.insert("schema".to_string(), manifest.schema().encode()?);
    metadata.insert("schema-id".to_string(), manifest.schema_id().to_string());
    metadata.insert(
        "partition-spec".to_string(),
        serde_json::to_string(manifest.partition_spec().fields())
            .map_err(|e| IcebergError::SerializeJson { source: e })?
    );
    metadata.insert(
        "partition-spec-id".to_string(),
        manifest.partition_spec().spec_id().to_string()
    );
    metadata.insert(
        "format-version".to_string(),
        manifest.format_version().to_string()
    );
    metadata.insert("content".to_string(), manifest.content_type().to_string());
    for (key, value) in metadata {
        writer.add_user_metadata(key, value)?;
    }

    for entry in manifest.entries() {
        writer.append(serialize_entry(entry))?;
    }

    Ok(writer.into_inner()?)
}

fn metadata_item<'a, R>(reader: &'a AvroReader<R>, key: &str) -> IcebergResult<&'a [u8]>
where
    R: std::io::Read,
{
    reader.user_metadata().get(key)
        .map(|bytes| bytes.as_slice())
        .ok_or_else(|| {
            IcebergError::ManifestError(format!("manifest's metadata has no key '{key}'"))
        })
}

fn parse_metadata_item<T, R>(reader: &AvroReader<R>, key: &str) -> IcebergResult<T>
where
    T: std::str::FromStr,
    R: std::io::Read,
{
    let bytes = metadata_item(reader, key)?;
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .ok_or_else(|| {
            IcebergError::ManifestError(format!(
                "manifest's metadata does not contain a valid value for key '{key}'"
            ))
        })
}

fn deserialize_manifest_header<R>(
    reader: &AvroReader<R>
) -> IcebergResult<(Schema, PartitionSpec, ManifestContentType)>
where
    R: std::io::Read
{
    let schema = std::str::from_utf8(metadata_item(reader, "schema")?)
        .map_err(|e| IcebergError::ManifestError(
            format!("invalid schema in manifest's metadata: {e}")
        ))
        .and_then(|json| Schema::decode(json).map_err(|e| IcebergError::ManifestError(
            format!("invalid schema in manifest's metadata: {e}")
        )))?;

    let partition_fields = serde_json::from_slice::<Vec<PartitionField>>(
        metadata_item(reader, "partition-spec")?
    ).map_err(|e| {
        IcebergError::ManifestError(format!(
            "manifest's metadata does not contain valid partition fields: {e}"
        ))
    })?;

    let partition_spec_id: i32 = parse_metadata_item(reader, "partition-spec-id")?;
    let format_version: TableFormatVersion = parse_metadata_item(reader, "format-version")?;
    let content_type: ManifestContentType = parse_metadata_item(reader, "content")?;

    if format_version != TableFormatVersion::V2 {
        return Err(IcebergError::Unsupported(
            format!("table version {format_version} not supported")
        ));
    }

    let partition_spec = PartitionSpec::try_new(partition_spec_id, partition_fields, &schema)?;
    Ok((schema, partition_spec, content_type))
}

fn as_record(value: AvroValue) -> IcebergResult<Vec<(String, AvroValue)>> {
    match value {
        AvroValue::Record(record) => Ok(record),
        _ => Err(IcebergError::ManifestError(format!("expected record, got {value:?}")))
    }
}

fn take_key(record: &mut Vec<(String, AvroValue)>, key: &str) -> IcebergResult<AvroValue> {
    let index = record.iter().position(|(k, _v)| k == key)
        .ok_or_else(|| IcebergError::ManifestError(format!("missing key '{key}'")))?;

    Ok(record.swap_remove(index).1)
}

fn deserialize_key<T>(record: &mut Vec<(String, AvroValue)>, key: &str) -> IcebergResult<T>
where
    T: for<'de> Deserialize<'de>
{
    let value = take_key(record, key)?;
    Ok(apache_avro::from_value::<T>(&value)?)
}

/// Unwraps a `[null, T]` union, returning `None` for null.
fn deserialize_opt(value: AvroValue) -> Option<AvroValue> {
    match value {
        AvroValue::Null => None,
        AvroValue::Union(_i, inner) => match *inner {
            AvroValue::Null => None,
            inner => Some(inner),
        },
        value => Some(value),
    }
}

fn deserialize_array(value: AvroValue) -> IcebergResult<Vec<AvroValue>> {
    match value {
        AvroValue::Array(values) => Ok(values),
        _ => Err(IcebergError::ManifestError(format!("expected array, got {value:?}")))
    }
}

fn deserialize_bytes(value: AvroValue) -> IcebergResult<Vec<u8>> {
    match value {
        AvroValue::Bytes(bytes) => Ok(bytes),
        _ => Err(IcebergError::ManifestError(
            format!("expected byte array, found: {value:?}")
        ))
    }
}

/// Deserializes an optional Avro list of `{"key": k, "value": v}` records.
fn deserialize_opt_map<V, F>(
    record: &mut Vec<(String, AvroValue)>,
    key: &str,
    value_fn: F
) -> IcebergResult<Option<BTreeMap<i32, V>>>
where
    F: Fn(AvroValue) -> IcebergResult<V>
{
    let value = match record.iter().position(|(k, _v)| k == key) {
        Some(index) => record.swap_remove(index).1,
        None => return Ok(None),
    };

    deserialize_opt(value)
        .map(|array| {
            deserialize_array(array)?
                .into_iter()
                .map(|entry| {
                    let mut entry = as_record(entry)?;
                    let k = deserialize_key::<i32>(&mut entry, "key")?;
                    let v = value_fn(take_key(&mut entry, "value")?)?;
                    Ok((k, v))
                })
                .collect::<IcebergResult<BTreeMap<_, _>>>()
        })
        .transpose()
}

fn deserialize_long(value: AvroValue) -> IcebergResult<i64> {
    Ok(apache_avro::from_value::<i64>(&value)?)
}

fn deserialize_partition(
    value: AvroValue,
    partition_types: &HashMap<i32, PrimitiveType>
) -> IcebergResult<PartitionValues> {
    let values = deserialize_array(value)?
        .into_iter()
        .map(|item| {
            let mut item = as_record(item)?;
            let field_id: i32 = deserialize_key(&mut item, "field_id")?;
            let name: String = deserialize_key(&mut item, "name")?;
            let ptype = partition_types.get(&field_id).ok_or_else(|| {
                IcebergError::ManifestError(format!(
                    "partition field id {field_id} is not in the manifest's partition spec"
                ))
            })?;
            let value = deserialize_opt(take_key(&mut item, "value")?)
                .map(|bytes| Value::from_bytes(ptype, &deserialize_bytes(bytes)?))
                .transpose()?;

            Ok(PartitionValue { field_id, name, value })
        })
        .collect::<IcebergResult<Vec<_>>>()?;

    Ok(PartitionValues::new(values))
}

fn deserialize_data_file(
    value: AvroValue,
    partition_types: &HashMap<i32, PrimitiveType>
) -> IcebergResult<DataFile> {
    let mut record = as_record(value)?;

    Ok(DataFile {
        content: DataFileContent::from_code(deserialize_key(&mut record, "content")?)?,
        file_path: deserialize_key(&mut record, "file_path")?,
        file_format: deserialize_key::<String>(&mut record, "file_format")?.parse()?,
        partition: deserialize_partition(take_key(&mut record, "partition")?, partition_types)?,
        record_count: deserialize_key(&mut record, "record_count")?,
        file_size_in_bytes: deserialize_key(&mut record, "file_size_in_bytes")?,
        column_sizes: deserialize_opt_map(&mut record, "column_sizes", deserialize_long)?,
        value_counts: deserialize_opt_map(&mut record, "value_counts", deserialize_long)?
            .unwrap_or_default(),
        null_value_counts: deserialize_opt_map(&mut record, "null_value_counts", deserialize_long)?
            .unwrap_or_default(),
        nan_value_counts: deserialize_opt_map(&mut record, "nan_value_counts", deserialize_long)?
            .unwrap_or_default(),
        lower_bounds: deserialize_opt_map(&mut record, "lower_bounds", deserialize_bytes)?
            .unwrap_or_default(),
        upper_bounds: deserialize_opt_map(&mut record, "upper_bounds", deserialize_bytes)?
            .unwrap_or_default(),
        split_offsets: deserialize_key(&mut record, "split_offsets")?,
        sort_order_id: deserialize_key(&mut record, "sort_order_id")?,
    })
}

fn deserialize_manifest_entry(
    value: AvroValue,
    partition_types: &HashMap<i32, PrimitiveType>
) -> IcebergResult<ManifestEntry> {
    let mut record = as_record(value)?;

    let status = ManifestEntryStatus::try_from(deserialize_key::<i32>(&mut record, "status")?)?;
    let snapshot_id = deserialize_key(&mut record, "snapshot_id")?;
    let sequence_number = deserialize_key(&mut record, "sequence_number")?;
    let file_sequence_number = deserialize_key(&mut record, "file_sequence_number")?;
    let data_file = deserialize_data_file(take_key(&mut record, "data_file")?, partition_types)?;

    Ok(ManifestEntry {
        status,
        snapshot_id,
        sequence_number,
        file_sequence_number,
        data_file
    })
}

/// Deserializes a manifest from binary Avro format. Inherited fields are left
/// empty.
pub(super) fn deserialize_manifest(input: &[u8]) -> IcebergResult<Manifest> {
    let reader = AvroReader::new(input)?;

    let (schema, partition_spec, content_type) = deserialize_manifest_header(&reader)?;
    let partition_types = partition_spec.partition_type(&schema)?
        .into_iter()
        .filter_map(|field| {
            field.schema_type().as_primitive().map(|ptype| (field.id(), ptype.clone()))
        })
        .collect::<HashMap<_, _>>();

    let entries = reader
        .map(|value| {
            value.map_err(|e| IcebergError::AvroError { source: e })
                .and_then(|v| deserialize_manifest_entry(v, &partition_types))
        })
        .collect::<IcebergResult<Vec<ManifestEntry>>>()?;

    Ok(Manifest::new(schema, partition_spec, content_type, entries))
}
