//! Interface to Iceberg table partitions.
use std::collections::HashSet;
use std::io::Cursor;

use chrono::{Datelike, NaiveDateTime};
use lazy_static::lazy_static;
use murmur3::murmur3_32;
use regex::Regex;
use serde::{
    de::{self, IntoDeserializer},
    Deserialize, Deserializer, Serialize,
};

use crate::{IcebergResult, IcebergError};
use crate::schema::{Schema, Field, PrimitiveType};
use crate::row::Row;
use crate::value::{self, Value};

lazy_static! {
    static ref BUCKET_REGEX: Regex = Regex::new(r#"^bucket\[(?P<n>\d+)\]$"#).unwrap();
    static ref TRUNCATE_REGEX: Regex = Regex::new(r#"^truncate\[(?P<w>\d+)\]$"#).unwrap();
}

const MICROS_PER_HOUR: i64 = 3_600_000_000;

/// Partition field ids of a table start after this id.
pub const UNPARTITIONED_LAST_ASSIGNED_FIELD_ID: i32 = 999;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Hash)]
#[serde(rename_all = "lowercase", remote = "Self")]
/// A Transformation applied to a source column to produce a partition value.
pub enum PartitionTransform {
    /// Always produces `null`
    Void,
    /// Source value, unmodified
    Identity,
    /// Extract a date or timestamp year as years from 1970
    Year,
    /// Extract a date or timestamp month as months from 1970-01-01
    Month,
    /// Extract a date or timestamp day as days from 1970-01-01
    Day,
    /// Extract a timestamp hour as hours from 1970-01-01 00:00:00
    Hour,
    /// Hash of value, mod N
    Bucket(u32),
    /// Value truncated to width
    Truncate(u32),
}

impl PartitionTransform {
    fn unsupported(&self, ptype: &PrimitiveType) -> IcebergError {
        IcebergError::PartitionError {
            message: format!("can't apply transform {self} to field of type {ptype}")
        }
    }

    /// Returns the type of the partition values produced by applying this
    /// transform to a source column of type `source`.
    ///
    /// # Errors
    ///
    /// [`IcebergError::PartitionError`] if the transform can't be applied to the
    /// source type, e.g. `year` on a string column.
    pub fn result_type(&self, source: &PrimitiveType) -> IcebergResult<PrimitiveType> {
        use PrimitiveType::*;

        match (self, source) {
            (PartitionTransform::Void, _) | (PartitionTransform::Identity, _) => {
                Ok(source.clone())
            },
            (PartitionTransform::Year | PartitionTransform::Month | PartitionTransform::Day,
                Date | Timestamp | Timestamptz) => Ok(Int),
            (PartitionTransform::Hour, Timestamp | Timestamptz) => Ok(Int),
            (PartitionTransform::Bucket(_),
                Int | Long | Decimal { .. } | Date | Time | Timestamp | Timestamptz
                | String | Uuid | Fixed(_) | Binary) => Ok(Int),
            (PartitionTransform::Truncate(_), Int | Long | Decimal { .. } | String | Binary) => {
                Ok(source.clone())
            },
            _ => Err(self.unsupported(source)),
        }
    }

    /// Applies this transform to a source value. A null input is always
    /// transformed to null.
    pub fn apply(&self, value: Option<&Value>) -> IcebergResult<Option<Value>> {
        let value = match value {
            Some(value) => value,
            None => return Ok(None),
        };

        let result = match self {
            PartitionTransform::Void => return Ok(None),
            PartitionTransform::Identity => value.clone(),
            PartitionTransform::Year => {
                Value::Int(Self::datetime(value, self)?.year() - 1970)
            },
            PartitionTransform::Month => {
                let datetime = Self::datetime(value, self)?;
                Value::Int((datetime.year() - 1970) * 12 + datetime.month0() as i32)
            },
            PartitionTransform::Day => {
                let days = match value {
                    Value::Date(date) => value::date_to_days(date),
                    _ => value::date_to_days(&Self::datetime(value, self)?.date()),
                };
                Value::Int(days)
            },
            PartitionTransform::Hour => {
                let micros = match value {
                    Value::Timestamp(ts) => value::timestamp_to_micros(ts),
                    Value::Timestamptz(ts) => ts.timestamp_micros(),
                    _ => return Err(self.unsupported(&value.primitive_type())),
                };
                Value::Int(micros.div_euclid(MICROS_PER_HOUR) as i32)
            },
            PartitionTransform::Bucket(n) => {
                if *n == 0 {
                    return Err(IcebergError::PartitionError {
                        message: "bucket transform needs at least one bucket".to_string()
                    });
                }
                let hash = Self::bucket_hash(value)?;
                Value::Int((hash & i32::MAX) % (*n as i32))
            },
            PartitionTransform::Truncate(w) => {
                if *w == 0 {
                    return Err(IcebergError::PartitionError {
                        message: "truncate width must be positive".to_string()
                    });
                }
                let w = *w;
                match value {
                    Value::Int(v) => Value::Int(v - v.rem_euclid(w as i32)),
                    Value::Long(v) => Value::Long(v - v.rem_euclid(w as i64)),
                    Value::Decimal { unscaled, scale } => Value::Decimal {
                        unscaled: unscaled - unscaled.rem_euclid(w as i128),
                        scale: *scale,
                    },
                    Value::String(s) => Value::String(s.chars().take(w as usize).collect()),
                    Value::Binary(b) => Value::Binary(b.iter().take(w as usize).copied().collect()),
                    _ => return Err(self.unsupported(&value.primitive_type())),
                }
            }
        };

        Ok(Some(result))
    }

    fn datetime(value: &Value, transform: &PartitionTransform) -> IcebergResult<NaiveDateTime> {
        match value {
            Value::Date(date) => Ok(date.and_time(chrono::NaiveTime::MIN)),
            Value::Timestamp(ts) => Ok(*ts),
            Value::Timestamptz(ts) => Ok(ts.naive_utc()),
            _ => Err(transform.unsupported(&value.primitive_type())),
        }
    }

    /// 32-bit Murmur3 hash (x86 variant, seed 0) over the Iceberg hash
    /// representation of the value.
    fn bucket_hash(value: &Value) -> IcebergResult<i32> {
        let bytes = match value {
            Value::Int(v) => (*v as i64).to_le_bytes().to_vec(),
            Value::Long(v) => v.to_le_bytes().to_vec(),
            Value::Date(date) => (value::date_to_days(date) as i64).to_le_bytes().to_vec(),
            Value::Time(time) => value::time_to_micros(time).to_le_bytes().to_vec(),
            Value::Timestamp(ts) => value::timestamp_to_micros(ts).to_le_bytes().to_vec(),
            Value::Timestamptz(ts) => ts.timestamp_micros().to_le_bytes().to_vec(),
            Value::Decimal { .. } | Value::String(_) | Value::Uuid(_)
            | Value::Fixed(_) | Value::Binary(_) => value.to_bytes(),
            Value::Boolean(_) | Value::Float(_) | Value::Double(_) => {
                return Err(PartitionTransform::Bucket(0).unsupported(&value.primitive_type()));
            }
        };

        Ok(murmur3_32(&mut Cursor::new(bytes), 0)? as i32)
    }
}

impl std::fmt::Display for PartitionTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionTransform::Void => write!(f, "void"),
            PartitionTransform::Identity => write!(f, "identity"),
            PartitionTransform::Year => write!(f, "year"),
            PartitionTransform::Month => write!(f, "month"),
            PartitionTransform::Day => write!(f, "day"),
            PartitionTransform::Hour => write!(f, "hour"),
            PartitionTransform::Bucket(n) => write!(f, "bucket[{n}]"),
            PartitionTransform::Truncate(w) => write!(f, "truncate[{w}]"),
        }
    }
}

impl Serialize for PartitionTransform {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            PartitionTransform::Bucket(_) | PartitionTransform::Truncate(_) => {
                serializer.serialize_str(&self.to_string())
            },
            _ => PartitionTransform::serialize(self, serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PartitionTransform {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Some(caps) = BUCKET_REGEX.captures(&s) {
            let n = caps["n"].parse::<u32>()
                .map_err(|_| de::Error::custom(format!("invalid bucket count in {s}")))?;
            Ok(PartitionTransform::Bucket(n))
        } else if let Some(caps) = TRUNCATE_REGEX.captures(&s) {
            let w = caps["w"].parse::<u32>()
                .map_err(|_| de::Error::custom(format!("invalid truncate width in {s}")))?;
            Ok(PartitionTransform::Truncate(w))
        } else if s.starts_with("bucket") || s.starts_with("truncate") {
            Err(de::Error::custom(format!("invalid partition transform {s}")))
        } else {
            PartitionTransform::deserialize(s.into_deserializer())
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
/// Specification of a single partition field within a `PartitionSpec`.
pub struct PartitionField {
    /// A source column id from the table’s schema.
    pub source_id: i32,
    /// Unique within the table's partition specs.
    pub field_id: i32,
    pub name: String,
    pub transform: PartitionTransform,
}

impl PartitionField {
    pub fn new(
        source_id: i32,
        field_id: i32,
        name: &str,
        transform: PartitionTransform
    ) -> Self {
        Self {
            source_id,
            field_id,
            name: name.to_string(),
            transform
        }
    }
}

/// Specification of table-level partitioning.
///
/// Defines how partition values are derived from the data fields of the table.
/// A spec is immutable once recorded in the table metadata; repartitioning adds
/// a new spec with a new id.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionSpec {
    spec_id: i32,
    fields: Vec<PartitionField>,
}

impl PartitionSpec {
    /// Creates a new partition spec for the given schema.
    ///
    /// # Errors
    ///
    /// [`IcebergError::PartitionError`] is returned if the list of fields is invalid,
    /// or if it's not applicable for the given schema:
    /// * duplicate partition field ids or names, or an empty name,
    /// * a source field that is not a top-level primitive column of the schema,
    /// * a transform that can't be applied to its source column.
    pub fn try_new(
        spec_id: i32,
        fields: Vec<PartitionField>,
        schema: &Schema
    ) -> IcebergResult<Self> {
        let mut uniq_id = HashSet::new();
        let mut uniq_name = HashSet::new();

        for field in &fields {
            if !uniq_id.insert(field.field_id) {
                return Err(IcebergError::PartitionError {
                    message: format!("duplicate partition field id {}", field.field_id)
                });
            }
            if field.name.is_empty() {
                return Err(IcebergError::PartitionError {
                    message: "partition field has empty name".to_string()
                });
            }
            if !uniq_name.insert(field.name.as_str()) {
                return Err(IcebergError::PartitionError {
                    message: format!("duplicate partition field name '{}'", field.name)
                });
            }
        }

        let spec = Self { spec_id, fields };
        // Fails if a source is missing or a transform can't be applied.
        spec.partition_type(schema)?;

        Ok(spec)
    }

    /// Creates an empty PartitionSpec for unpartitioned tables.
    pub fn unpartitioned() -> Self {
        Self {
            spec_id: 0,
            fields: Vec::new()
        }
    }

    pub fn spec_id(&self) -> i32 {
        self.spec_id
    }

    pub fn fields(&self) -> &[PartitionField] {
        &self.fields
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.fields.is_empty()
    }

    /// Obtains the highest assigned `field_id` of the fields in the partition.
    ///
    /// If this `PartitionSpec` has no fields (unpartitioned), then the constant
    /// [`UNPARTITIONED_LAST_ASSIGNED_FIELD_ID`] is returned.
    pub fn last_assigned_field_id(&self) -> i32 {
        self.fields.iter().map(|field| field.field_id).max()
            .unwrap_or(UNPARTITIONED_LAST_ASSIGNED_FIELD_ID)
    }

    fn source_field<'a>(
        &self,
        field: &PartitionField,
        schema: &'a Schema
    ) -> IcebergResult<(usize, &'a Field, PrimitiveType)> {
        let position = schema.position_of(field.source_id).ok_or_else(|| {
            IcebergError::PartitionError {
                message: format!(
                    "source field id {} of partition field '{}' not found in schema",
                    field.source_id, field.name
                )
            }
        })?;
        let source = &schema.fields()[position];
        let ptype = source.schema_type().as_primitive().ok_or_else(|| {
            IcebergError::PartitionError {
                message: format!("source field '{}' is not primitive", source.name())
            }
        })?;

        Ok((position, source, field.transform.result_type(ptype)?))
    }

    /// Returns the partition fields of this spec as optional schema fields, with
    /// their types derived by applying each transform to its source column.
    pub fn partition_type(&self, schema: &Schema) -> IcebergResult<Vec<Field>> {
        self.fields.iter()
            .map(|field| {
                let (_, _, result_type) = self.source_field(field, schema)?;
                Ok(Field::new_primitive(field.field_id, &field.name, false, result_type))
            })
            .collect()
    }

    /// Computes the partition values of a row written with `schema`.
    pub fn partition_values(&self, schema: &Schema, row: &Row) -> IcebergResult<PartitionValues> {
        let values = self.fields.iter()
            .map(|field| {
                let (position, _, _) = self.source_field(field, schema)?;
                Ok(PartitionValue {
                    field_id: field.field_id,
                    name: field.name.clone(),
                    value: field.transform.apply(row.get(position))?,
                })
            })
            .collect::<IcebergResult<Vec<_>>>()?;

        Ok(PartitionValues(values))
    }
}

/// The value of one partition field for a data file.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionValue {
    pub field_id: i32,
    pub name: String,
    pub value: Option<Value>,
}

/// The partition tuple of a data file, in partition spec order. Empty for
/// unpartitioned tables.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartitionValues(Vec<PartitionValue>);

impl PartitionValues {
    pub fn new(values: Vec<PartitionValue>) -> Self {
        Self(values)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionValue> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter()
            .find(|v| v.name == name)
            .and_then(|v| v.value.as_ref())
    }

    /// Hive-style relative path of the partition, e.g. `year=53/bucket=7`.
    /// Names and values are form-urlencoded; nulls are written as `null`.
    pub fn to_path(&self) -> String {
        self.0.iter()
            .map(|v| {
                let value = v.value.as_ref()
                    .map_or_else(|| "null".to_string(), |value| value.to_string());
                format!(
                    "{}={}",
                    url::form_urlencoded::byte_serialize(v.name.as_bytes()).collect::<String>(),
                    url::form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>()
                )
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};
    use uuid::Uuid;

    use super::*;

    fn create_schema() -> Schema {
        Schema::new(0, vec![
            Field::new_primitive(1, "id", true, PrimitiveType::Long),
            Field::new_primitive(2, "user_id", true, PrimitiveType::String),
            Field::new_primitive(3, "ts", false, PrimitiveType::Timestamp),
        ])
    }

    fn create_partition_fields() -> Vec<PartitionField> {
        vec![
            PartitionField::new(2, 1000, "user_id", PartitionTransform::Identity),
            PartitionField::new(3, 1001, "year", PartitionTransform::Year),
            PartitionField::new(3, 1002, "month", PartitionTransform::Month),
            PartitionField::new(3, 1003, "day", PartitionTransform::Day),
        ]
    }

    #[test]
    fn valid_partition_spec() {
        let schema = create_schema();
        let spec = PartitionSpec::try_new(0, create_partition_fields(), &schema).unwrap();

        assert_eq!(spec.spec_id(), 0);
        assert_eq!(spec.last_assigned_field_id(), 1003);
        assert_eq!(
            spec.partition_type(&schema).unwrap(),
            vec![
                Field::new_primitive(1000, "user_id", false, PrimitiveType::String),
                Field::new_primitive(1001, "year", false, PrimitiveType::Int),
                Field::new_primitive(1002, "month", false, PrimitiveType::Int),
                Field::new_primitive(1003, "day", false, PrimitiveType::Int),
            ]
        );

        let unpartitioned = PartitionSpec::unpartitioned();
        assert_eq!(unpartitioned.last_assigned_field_id(), 999);
        assert!(unpartitioned.is_unpartitioned());
    }

    #[test]
    fn invalid_partition_spec() {
        let schema = create_schema();

        let duplicate_id = PartitionSpec::try_new(0, vec![
            PartitionField::new(3, 1001, "year", PartitionTransform::Year),
            PartitionField::new(3, 1001, "month", PartitionTransform::Month),
        ], &schema);
        assert!(matches!(duplicate_id, Err(IcebergError::PartitionError { .. })));

        let missing_source = PartitionSpec::try_new(0, vec![
            PartitionField::new(9, 1000, "x", PartitionTransform::Identity),
        ], &schema);
        assert!(matches!(missing_source, Err(IcebergError::PartitionError { .. })));

        let bad_transform = PartitionSpec::try_new(0, vec![
            PartitionField::new(2, 1000, "year", PartitionTransform::Year),
        ], &schema);
        assert!(matches!(bad_transform, Err(IcebergError::PartitionError { .. })));
    }

    #[test]
    fn transform_json() {
        let spec = PartitionSpec::try_new(1, vec![
            PartitionField::new(1, 1000, "id_bucket", PartitionTransform::Bucket(16)),
            PartitionField::new(2, 1001, "user_trunc", PartitionTransform::Truncate(4)),
        ], &create_schema()).unwrap();

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json, serde_json::json!({
            "spec-id": 1,
            "fields": [
                {"source-id": 1, "field-id": 1000, "name": "id_bucket", "transform": "bucket[16]"},
                {"source-id": 2, "field-id": 1001, "name": "user_trunc", "transform": "truncate[4]"}
            ]
        }));
        assert_eq!(serde_json::from_value::<PartitionSpec>(json).unwrap(), spec);
        assert!(serde_json::from_str::<PartitionTransform>("\"bucket[x]\"").is_err());
    }

    #[test]
    fn bucket_hashes() {
        let hash = |v: Value| PartitionTransform::bucket_hash(&v).unwrap();

        assert_eq!(hash(Value::Int(34)), 2017239379);
        assert_eq!(hash(Value::Long(34)), 2017239379);
        assert_eq!(hash(Value::from("iceberg")), 1210000089);
        assert_eq!(hash(Value::Date(NaiveDate::from_ymd_opt(2017, 11, 16).unwrap())), -653330422);
        assert_eq!(hash(Value::Binary(vec![0x00, 0x01, 0x02, 0x03])), -188683207);
        assert_eq!(
            hash(Value::Uuid(Uuid::parse_str("f79c3e09-677c-4bbd-a479-3f349cb785e7").unwrap())),
            1488055340
        );

        assert_eq!(
            PartitionTransform::Bucket(16).apply(Some(&Value::Int(34))).unwrap(),
            Some(Value::Int(2017239379 % 16))
        );
        assert!(PartitionTransform::Bucket(16).apply(Some(&Value::Boolean(true))).is_err());
    }

    #[test]
    fn truncate_and_time_transforms() {
        let truncate = PartitionTransform::Truncate(10);
        assert_eq!(truncate.apply(Some(&Value::Int(1))).unwrap(), Some(Value::Int(0)));
        assert_eq!(truncate.apply(Some(&Value::Int(-1))).unwrap(), Some(Value::Int(-10)));
        assert_eq!(truncate.apply(Some(&Value::Long(25))).unwrap(), Some(Value::Long(20)));
        assert_eq!(
            PartitionTransform::Truncate(3).apply(Some(&Value::from("iceberg"))).unwrap(),
            Some(Value::from("ice"))
        );

        let ts = Value::Timestamp(
            NaiveDate::from_ymd_opt(2023, 3, 15).unwrap().and_time(NaiveTime::from_hms_opt(5, 0, 0).unwrap())
        );
        assert_eq!(PartitionTransform::Year.apply(Some(&ts)).unwrap(), Some(Value::Int(53)));
        assert_eq!(PartitionTransform::Month.apply(Some(&ts)).unwrap(), Some(Value::Int(53 * 12 + 2)));
        assert_eq!(PartitionTransform::Day.apply(Some(&ts)).unwrap(), Some(Value::Int(19431)));
        assert_eq!(PartitionTransform::Hour.apply(Some(&ts)).unwrap(), Some(Value::Int(19431 * 24 + 5)));

        let before_epoch = Value::Date(NaiveDate::from_ymd_opt(1969, 12, 31).unwrap());
        assert_eq!(PartitionTransform::Day.apply(Some(&before_epoch)).unwrap(), Some(Value::Int(-1)));
        assert_eq!(PartitionTransform::Year.apply(Some(&before_epoch)).unwrap(), Some(Value::Int(-1)));

        assert_eq!(PartitionTransform::Void.apply(Some(&ts)).unwrap(), None);
        assert_eq!(PartitionTransform::Year.apply(None).unwrap(), None);
    }

    #[test]
    fn partition_path() {
        let schema = create_schema();
        let spec = PartitionSpec::try_new(0, vec![
            PartitionField::new(2, 1000, "user", PartitionTransform::Identity),
            PartitionField::new(3, 1001, "ts_year", PartitionTransform::Year),
        ], &schema).unwrap();

        let row = Row::new(vec![
            Some(Value::Long(1)),
            Some(Value::from("a b/c")),
            None,
        ]);
        let values = spec.partition_values(&schema, &row).unwrap();

        assert_eq!(values.get("user"), Some(&Value::from("a b/c")));
        assert_eq!(values.to_path(), "user=a+b%2Fc/ts_year=null");
    }
}
