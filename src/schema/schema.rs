//! The Iceberg table schema.

use std::collections::HashSet;

use serde::{Serialize, Deserialize};

use crate::{IcebergResult, IcebergError};
use super::types::{Field, SchemaType, StructType};

/// An Iceberg table schema.
///
/// A schema is immutable once it has been assigned an id and recorded in the
/// table metadata. Evolving the schema produces a new `Schema` with a new id.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Schema {
    schema_id: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    identifier_field_ids: Vec<i32>,
    /// Embedded as a struct object, as in the Iceberg table spec.
    #[serde(flatten)]
    schema: StructType,
}

impl Schema {
    /// Creates a schema without validating it. Use [`Schema::try_new`] for
    /// schemas built from untrusted input.
    pub fn new(schema_id: i32, fields: Vec<Field>) -> Self {
        Self {
            schema_id,
            identifier_field_ids: Vec::new(),
            schema: StructType::new(fields),
        }
    }

    /// Creates a schema, checking that field ids are unique across all nesting
    /// levels and that top-level names are unique and non-empty.
    pub fn try_new(schema_id: i32, fields: Vec<Field>) -> IcebergResult<Self> {
        let schema = Self::new(schema_id, fields);
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> IcebergResult<()> {
        let mut ids = HashSet::new();
        for field in self.all_fields() {
            if !ids.insert(field.id()) {
                return Err(IcebergError::SchemaError {
                    message: format!("duplicate field id {} in schema", field.id())
                });
            }
        }

        let mut names = HashSet::new();
        for field in self.fields() {
            if field.name().is_empty() {
                return Err(IcebergError::SchemaError {
                    message: format!("field {} has an empty name", field.id())
                });
            }
            if !names.insert(field.name()) {
                return Err(IcebergError::SchemaError {
                    message: format!("duplicate field name '{}' in schema", field.name())
                });
            }
        }

        for id in &self.identifier_field_ids {
            if !ids.contains(id) {
                return Err(IcebergError::SchemaError {
                    message: format!("identifier field {id} is not in the schema")
                });
            }
        }

        Ok(())
    }

    pub fn id(&self) -> i32 {
        self.schema_id
    }

    /// Returns a copy of this schema with a different schema id.
    pub fn with_id(mut self, schema_id: i32) -> Self {
        self.schema_id = schema_id;
        self
    }

    pub fn with_identifier_field_ids(mut self, ids: impl IntoIterator<Item = i32>) -> Self {
        self.identifier_field_ids = ids.into_iter().collect();
        self
    }

    pub fn identifier_field_ids(&self) -> &[i32] {
        &self.identifier_field_ids
    }

    /// Returns the top-level fields in the schema.
    pub fn fields(&self) -> &[Field] {
        self.schema.fields()
    }

    /// Returns an iterator on all recursively nested fields in the schema in a
    /// depth-first order.
    pub fn all_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields().iter().flat_map(|field| field.all_fields())
    }

    /// Finds a field at any nesting level by its id.
    pub fn field_by_id(&self, id: i32) -> Option<&Field> {
        self.all_fields().find(|field| field.id() == id)
    }

    /// Finds a top-level field by its name.
    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields().iter().find(|field| field.name() == name)
    }

    /// Position of a top-level field in the schema.
    pub fn position_of(&self, id: i32) -> Option<usize> {
        self.fields().iter().position(|field| field.id() == id)
    }

    /// The highest field id in the schema, 0 for an empty schema.
    pub fn highest_field_id(&self) -> i32 {
        self.all_fields().map(|f| f.id()).max().unwrap_or(0)
    }

    /// Returns `true` if all top-level fields are primitive.
    pub fn is_flat(&self) -> bool {
        self.fields().iter().all(|f| f.schema_type().is_primitive())
    }

    pub(crate) fn as_struct(&self) -> SchemaType {
        SchemaType::Struct(self.schema.clone())
    }

    pub fn encode(&self) -> IcebergResult<String> {
        serde_json::to_string(self).map_err(|e| IcebergError::SchemaError {
            message: format!("error serializing table schema to json: {e}")
        })
    }

    pub fn decode(json: &str) -> IcebergResult<Self> {
        let schema: Schema = serde_json::from_str(json).map_err(|e| {
            IcebergError::SchemaError {
                message: format!("error deserializing table schema from json: {e}")
            }
        })?;
        schema.validate()?;
        Ok(schema)
    }
}
