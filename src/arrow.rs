//! Conversion between Iceberg schemas and values and their Apache Arrow
//! representation, used to encode and decode Parquet data files.
use std::sync::Arc;
use std::collections::HashMap;

use arrow_array::{
    Array, ArrayRef,
    BooleanArray, Int32Array, Int64Array, Float32Array, Float64Array,
    Decimal128Array, Date32Array, Time64MicrosecondArray, TimestampMicrosecondArray,
    StringArray, BinaryArray, FixedSizeBinaryArray,
    cast::AsArray,
    types::{
        Int32Type, Int64Type, Float32Type, Float64Type, Decimal128Type,
        Date32Type, Time64MicrosecondType, TimestampMicrosecondType,
    },
};
use arrow_schema::{
    Schema as ArrowSchema, Field as ArrowField,
    DataType as ArrowDataType, TimeUnit as ArrowTimeUnit,
};
use uuid::Uuid;

use crate::{IcebergResult, IcebergError};
use crate::schema::{Schema, Field, PrimitiveType};
use crate::value::{self, Value};

/// Metadata key of the Iceberg field id of a column, read and written by the
/// Parquet Arrow reader and writer.
pub const PARQUET_FIELD_ID_KEY: &str = "PARQUET:field_id";

const UTC: &str = "UTC";

/// Converts a primitive Iceberg type to its Arrow data type.
pub fn primitive_to_arrow(ptype: &PrimitiveType) -> IcebergResult<ArrowDataType> {
    Ok(match ptype {
        PrimitiveType::Boolean => ArrowDataType::Boolean,
        PrimitiveType::Int => ArrowDataType::Int32,
        PrimitiveType::Long => ArrowDataType::Int64,
        PrimitiveType::Float => ArrowDataType::Float32,
        PrimitiveType::Double => ArrowDataType::Float64,
        PrimitiveType::Decimal { precision, scale } => {
            let scale = i8::try_from(*scale).map_err(|_| {
                IcebergError::Unsupported(format!("decimal with scale {scale}"))
            })?;
            ArrowDataType::Decimal128(*precision, scale)
        },
        PrimitiveType::Date => ArrowDataType::Date32,
        PrimitiveType::Time => ArrowDataType::Time64(ArrowTimeUnit::Microsecond),
        PrimitiveType::Timestamp => ArrowDataType::Timestamp(ArrowTimeUnit::Microsecond, None),
        PrimitiveType::Timestamptz => {
            ArrowDataType::Timestamp(ArrowTimeUnit::Microsecond, Some(Arc::from(UTC)))
        },
        PrimitiveType::String => ArrowDataType::Utf8,
        PrimitiveType::Uuid => ArrowDataType::FixedSizeBinary(16),
        PrimitiveType::Fixed(size) => {
            ArrowDataType::FixedSizeBinary(i32::try_from(*size).map_err(|_| {
                IcebergError::Unsupported(format!("fixed size binary with size {size}"))
            })?)
        },
        PrimitiveType::Binary => ArrowDataType::Binary,
    })
}

fn field_to_arrow(field: &Field) -> IcebergResult<ArrowField> {
    let ptype = field.schema_type().as_primitive().ok_or_else(|| {
        IcebergError::Unsupported(format!(
            "column '{}' has a {} type; only primitive columns can be written",
            field.name(), field.schema_type()
        ))
    })?;

    Ok(ArrowField::new(field.name(), primitive_to_arrow(ptype)?, !field.required())
        .with_metadata(HashMap::from([
            (PARQUET_FIELD_ID_KEY.to_string(), field.id().to_string())
        ])))
}

/// Converts a flat Iceberg schema to an Arrow schema carrying the field ids.
///
/// # Errors
///
/// [`IcebergError::Unsupported`] if the schema has struct, list or map columns.
pub fn schema_to_arrow(schema: &Schema) -> IcebergResult<ArrowSchema> {
    let fields = schema.fields()
        .iter()
        .map(field_to_arrow)
        .collect::<IcebergResult<Vec<_>>>()?;

    Ok(ArrowSchema::new(fields))
}

/// Returns the Iceberg field id stored in the metadata of an Arrow field.
pub fn field_id(field: &ArrowField) -> Option<i32> {
    field.metadata()
        .get(PARQUET_FIELD_ID_KEY)
        .and_then(|id| id.parse().ok())
}

fn typed<'a, T>(
    values: &'a [Option<Value>],
    ptype: &'a PrimitiveType,
    extract: impl Fn(&'a Value) -> Option<T> + 'a,
) -> impl Iterator<Item = IcebergResult<Option<T>>> + 'a {
    values.iter().map(move |value| match value {
        None => Ok(None),
        Some(v) => extract(v).map(Some).ok_or_else(|| {
            IcebergError::ValueError(format!("value {v:?} is not of type {ptype}"))
        }),
    })
}

/// Builds an Arrow array of type `ptype` from a column of values.
pub fn build_array(ptype: &PrimitiveType, values: &[Option<Value>]) -> IcebergResult<ArrayRef> {
    let array: ArrayRef = match ptype {
        PrimitiveType::Boolean => Arc::new(BooleanArray::from(
            typed(values, ptype, |v| match v { Value::Boolean(b) => Some(*b), _ => None })
                .collect::<IcebergResult<Vec<_>>>()?
        )),
        PrimitiveType::Int => Arc::new(Int32Array::from(
            typed(values, ptype, |v| match v { Value::Int(i) => Some(*i), _ => None })
                .collect::<IcebergResult<Vec<_>>>()?
        )),
        PrimitiveType::Long => Arc::new(Int64Array::from(
            typed(values, ptype, |v| match v { Value::Long(l) => Some(*l), _ => None })
                .collect::<IcebergResult<Vec<_>>>()?
        )),
        PrimitiveType::Float => Arc::new(Float32Array::from(
            typed(values, ptype, |v| match v { Value::Float(f) => Some(*f), _ => None })
                .collect::<IcebergResult<Vec<_>>>()?
        )),
        PrimitiveType::Double => Arc::new(Float64Array::from(
            typed(values, ptype, |v| match v { Value::Double(d) => Some(*d), _ => None })
                .collect::<IcebergResult<Vec<_>>>()?
        )),
        PrimitiveType::Decimal { precision, scale } => {
            let unscaled = typed(values, ptype, |v| match v {
                Value::Decimal { unscaled, .. } => Some(*unscaled),
                _ => None
            }).collect::<IcebergResult<Vec<_>>>()?;
            Arc::new(
                Decimal128Array::from(unscaled)
                    .with_precision_and_scale(*precision, *scale as i8)?
            )
        },
        PrimitiveType::Date => Arc::new(Date32Array::from(
            typed(values, ptype, |v| match v {
                Value::Date(d) => Some(value::date_to_days(d)),
                _ => None
            }).collect::<IcebergResult<Vec<_>>>()?
        )),
        PrimitiveType::Time => Arc::new(Time64MicrosecondArray::from(
            typed(values, ptype, |v| match v {
                Value::Time(t) => Some(value::time_to_micros(t)),
                _ => None
            }).collect::<IcebergResult<Vec<_>>>()?
        )),
        PrimitiveType::Timestamp => Arc::new(TimestampMicrosecondArray::from(
            typed(values, ptype, |v| match v {
                Value::Timestamp(ts) => Some(value::timestamp_to_micros(ts)),
                _ => None
            }).collect::<IcebergResult<Vec<_>>>()?
        )),
        PrimitiveType::Timestamptz => Arc::new(
            TimestampMicrosecondArray::from(
                typed(values, ptype, |v| match v {
                    Value::Timestamptz(ts) => Some(ts.timestamp_micros()),
                    _ => None
                }).collect::<IcebergResult<Vec<_>>>()?
            ).with_timezone(UTC)
        ),
        PrimitiveType::String => Arc::new(StringArray::from(
            typed(values, ptype, |v| match v { Value::String(s) => Some(s.as_str()), _ => None })
                .collect::<IcebergResult<Vec<_>>>()?
        )),
        PrimitiveType::Uuid => Arc::new(FixedSizeBinaryArray::try_from_sparse_iter_with_size(
            typed(values, ptype, |v| match v { Value::Uuid(u) => Some(u.as_bytes().as_slice()), _ => None })
                .collect::<IcebergResult<Vec<_>>>()?
                .into_iter(),
            16
        )?),
        PrimitiveType::Fixed(size) => Arc::new(FixedSizeBinaryArray::try_from_sparse_iter_with_size(
            typed(values, ptype, |v| match v { Value::Fixed(b) => Some(b.as_slice()), _ => None })
                .collect::<IcebergResult<Vec<_>>>()?
                .into_iter(),
            *size as i32
        )?),
        PrimitiveType::Binary => Arc::new(BinaryArray::from(
            typed(values, ptype, |v| match v { Value::Binary(b) => Some(b.as_slice()), _ => None })
                .collect::<IcebergResult<Vec<_>>>()?
        )),
    };

    Ok(array)
}

fn type_mismatch(array: &dyn Array, target: &PrimitiveType) -> IcebergError {
    IcebergError::ValueError(format!(
        "column of arrow type {} can't be read as {}", array.data_type(), target
    ))
}

/// Reads the value at `row` of an Arrow array as a value of type `target`.
///
/// The array may hold an older type of the column, e.g. `Int32` for a column
/// since promoted to long; the value is promoted accordingly.
pub fn array_value(
    array: &dyn Array,
    row: usize,
    target: &PrimitiveType
) -> IcebergResult<Option<Value>> {
    if array.is_null(row) {
        return Ok(None);
    }

    let mismatch = || type_mismatch(array, target);

    let value = match array.data_type() {
        ArrowDataType::Boolean => {
            Value::Boolean(array.as_boolean_opt().ok_or_else(mismatch)?.value(row))
        },
        ArrowDataType::Int32 => {
            Value::Int(array.as_primitive_opt::<Int32Type>().ok_or_else(mismatch)?.value(row))
        },
        ArrowDataType::Int64 => {
            Value::Long(array.as_primitive_opt::<Int64Type>().ok_or_else(mismatch)?.value(row))
        },
        ArrowDataType::Float32 => {
            Value::Float(array.as_primitive_opt::<Float32Type>().ok_or_else(mismatch)?.value(row))
        },
        ArrowDataType::Float64 => {
            Value::Double(array.as_primitive_opt::<Float64Type>().ok_or_else(mismatch)?.value(row))
        },
        ArrowDataType::Decimal128(_, scale) => {
            Value::Decimal {
                unscaled: array.as_primitive_opt::<Decimal128Type>().ok_or_else(mismatch)?.value(row),
                scale: u8::try_from(*scale).map_err(|_| mismatch())?,
            }
        },
        ArrowDataType::Date32 => {
            let days = array.as_primitive_opt::<Date32Type>().ok_or_else(mismatch)?.value(row);
            Value::Date(value::days_to_date(days)?)
        },
        ArrowDataType::Time64(ArrowTimeUnit::Microsecond) => {
            let micros = array.as_primitive_opt::<Time64MicrosecondType>().ok_or_else(mismatch)?.value(row);
            Value::Time(value::micros_to_time(micros)?)
        },
        ArrowDataType::Timestamp(ArrowTimeUnit::Microsecond, tz) => {
            let micros = array.as_primitive_opt::<TimestampMicrosecondType>().ok_or_else(mismatch)?.value(row);
            let timestamp = value::micros_to_timestamp(micros)?;
            match tz {
                Some(_) => Value::Timestamptz(timestamp.and_utc()),
                None => Value::Timestamp(timestamp),
            }
        },
        ArrowDataType::Utf8 => {
            Value::String(array.as_string_opt::<i32>().ok_or_else(mismatch)?.value(row).to_string())
        },
        ArrowDataType::Binary => {
            Value::Binary(array.as_binary_opt::<i32>().ok_or_else(mismatch)?.value(row).to_vec())
        },
        ArrowDataType::FixedSizeBinary(_) => {
            let bytes = array.as_fixed_size_binary_opt().ok_or_else(mismatch)?.value(row);
            match target {
                PrimitiveType::Uuid => {
                    Value::Uuid(Uuid::from_slice(bytes).map_err(|_| mismatch())?)
                },
                _ => Value::Fixed(bytes.to_vec()),
            }
        },
        _ => return Err(mismatch()),
    };

    value.promote(target).map(Some)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn arrow_schema_carries_field_ids() {
        let schema = Schema::new(0, vec![
            Field::new_primitive(1, "name", true, PrimitiveType::String),
            Field::new_primitive(2, "dob", false, PrimitiveType::Date),
            Field::new_primitive(3, "ts", false, PrimitiveType::Timestamptz),
        ]);

        let arrow_schema = schema_to_arrow(&schema).unwrap();
        let name = arrow_schema.field(0);
        assert_eq!(name.data_type(), &ArrowDataType::Utf8);
        assert!(!name.is_nullable());
        assert_eq!(field_id(name), Some(1));
        assert_eq!(field_id(arrow_schema.field(2)), Some(3));
        assert_eq!(
            arrow_schema.field(2).data_type(),
            &ArrowDataType::Timestamp(ArrowTimeUnit::Microsecond, Some(Arc::from("UTC")))
        );
    }

    #[test]
    fn nested_columns_are_unsupported() {
        let schema = Schema::new(0, vec![
            Field::new_struct(1, "address", false, vec![
                Field::new_primitive(2, "city", false, PrimitiveType::String),
            ]),
        ]);
        assert!(matches!(schema_to_arrow(&schema), Err(IcebergError::Unsupported(_))));
    }

    #[test]
    fn arrays_hold_values() {
        let dates = vec![
            Some(Value::Date(NaiveDate::from_ymd_opt(1996, 12, 5).unwrap())),
            None,
        ];
        let array = build_array(&PrimitiveType::Date, &dates).unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array_value(array.as_ref(), 0, &PrimitiveType::Date).unwrap(), dates[0]);
        assert_eq!(array_value(array.as_ref(), 1, &PrimitiveType::Date).unwrap(), None);

        let uuid = Uuid::new_v4();
        let array = build_array(&PrimitiveType::Uuid, &[Some(Value::Uuid(uuid))]).unwrap();
        assert_eq!(
            array_value(array.as_ref(), 0, &PrimitiveType::Uuid).unwrap(),
            Some(Value::Uuid(uuid))
        );

        // Old int files are read as long after promotion.
        let ints = build_array(&PrimitiveType::Int, &[Some(Value::Int(3))]).unwrap();
        assert_eq!(
            array_value(ints.as_ref(), 0, &PrimitiveType::Long).unwrap(),
            Some(Value::Long(3))
        );

        assert!(build_array(&PrimitiveType::Int, &[Some(Value::from("x"))]).is_err());
    }
}
