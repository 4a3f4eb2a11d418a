//! Table rows.
use crate::{IcebergResult, IcebergError};
use crate::schema::{Schema, SchemaType};
use crate::value::Value;

/// A single table row: one optional value per top-level schema field, in schema
/// order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<Option<Value>>,
}

impl Row {
    pub fn new(values: Vec<Option<Value>>) -> Self {
        Self { values }
    }

    /// Starts building a row for `schema` by field name. Fields that are not set
    /// are null.
    pub fn builder(schema: &Schema) -> RowBuilder<'_> {
        RowBuilder {
            schema,
            values: vec![None; schema.fields().len()],
        }
    }

    pub fn values(&self) -> &[Option<Value>] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(|v| v.as_ref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Option<Value>> {
        self.values
    }

    /// Checks that this row can be written with `schema`.
    ///
    /// # Errors
    ///
    /// [`IcebergError::SchemaViolation`] if the row has a different number of
    /// values than the schema has top-level fields, a required field is null, or a
    /// value doesn't match its field's type.
    pub fn conform(&self, schema: &Schema) -> IcebergResult<()> {
        let fields = schema.fields();
        if self.values.len() != fields.len() {
            return Err(IcebergError::SchemaViolation {
                message: format!(
                    "row has {} values but schema {} has {} fields",
                    self.values.len(), schema.id(), fields.len()
                )
            });
        }

        for (field, value) in fields.iter().zip(&self.values) {
            match (value, field.schema_type()) {
                (None, _) if field.required() => {
                    return Err(IcebergError::SchemaViolation {
                        message: format!("required field '{}' is null", field.name())
                    });
                },
                (None, _) => {},
                (Some(value), SchemaType::Primitive(ptype)) => {
                    if !value.matches_type(ptype) {
                        return Err(IcebergError::SchemaViolation {
                            message: format!(
                                "field '{}' of type {} can't hold value {:?}",
                                field.name(), ptype, value
                            )
                        });
                    }
                },
                (Some(_), other) => {
                    return Err(IcebergError::SchemaViolation {
                        message: format!(
                            "field '{}' has {} type; only primitive values are supported",
                            field.name(), other.kind()
                        )
                    });
                }
            }
        }

        Ok(())
    }
}

impl From<Vec<Option<Value>>> for Row {
    fn from(values: Vec<Option<Value>>) -> Self {
        Self::new(values)
    }
}

/// Builds a [`Row`] by setting values by field name.
pub struct RowBuilder<'a> {
    schema: &'a Schema,
    values: Vec<Option<Value>>,
}

impl<'a> RowBuilder<'a> {
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> IcebergResult<Self> {
        let index = self.schema.fields()
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| IcebergError::SchemaViolation {
                message: format!("field '{name}' not found in schema {}", self.schema.id())
            })?;
        self.values[index] = Some(value.into());
        Ok(self)
    }

    pub fn build(self) -> Row {
        Row::new(self.values)
    }
}
