//! Schema evolution.
//!
//! Columns are tracked by id, never by name or position, so a column can be
//! renamed or dropped without rewriting data files. The rules enforced here:
//!
//! * new columns are optional and receive ids above the table's `last-column-id`,
//! * ids of dropped columns are never reused,
//! * a required column may become optional but never the reverse,
//! * primitive types may only be promoted: int to long, float to double, and
//!   decimal to a higher precision with the same scale.

use std::collections::HashMap;

use crate::{IcebergResult, IcebergError};
use super::types::{Field, SchemaType, PrimitiveType};
use super::schema::Schema;

/// A single change applied to the top-level columns of a schema.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    /// Appends a new optional column. Ids of the column and any nested fields are
    /// assigned from the table's `last-column-id`.
    AddColumn {
        name: String,
        field_type: SchemaType,
        doc: Option<String>,
    },
    RenameColumn {
        name: String,
        new_name: String,
    },
    MakeOptional {
        name: String,
    },
    PromoteType {
        name: String,
        to: PrimitiveType,
    },
    DeleteColumn {
        name: String,
    },
}

impl SchemaChange {
    pub fn add_column(name: &str, field_type: impl Into<SchemaType>) -> Self {
        Self::AddColumn {
            name: name.to_string(),
            field_type: field_type.into(),
            doc: None,
        }
    }

    pub fn rename_column(name: &str, new_name: &str) -> Self {
        Self::RenameColumn { name: name.to_string(), new_name: new_name.to_string() }
    }

    pub fn make_optional(name: &str) -> Self {
        Self::MakeOptional { name: name.to_string() }
    }

    pub fn promote_type(name: &str, to: PrimitiveType) -> Self {
        Self::PromoteType { name: name.to_string(), to }
    }

    pub fn delete_column(name: &str) -> Self {
        Self::DeleteColumn { name: name.to_string() }
    }
}

fn column_not_found(name: &str) -> IcebergError {
    IcebergError::SchemaError {
        message: format!("column '{name}' not found in schema")
    }
}

/// An ordered list of [`SchemaChange`]s applied together to produce a new schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaUpdate {
    changes: Vec<SchemaChange>,
}

impl SchemaUpdate {
    pub fn new(changes: impl IntoIterator<Item = SchemaChange>) -> Self {
        Self { changes: changes.into_iter().collect() }
    }

    pub fn changes(&self) -> &[SchemaChange] {
        &self.changes
    }

    /// Applies the changes to `base`, returning the new schema with id
    /// `new_schema_id` and the table's new `last-column-id`.
    ///
    /// The result is checked against `base` with [`check_compatible`].
    pub fn apply(
        &self,
        base: &Schema,
        last_column_id: i32,
        new_schema_id: i32,
    ) -> IcebergResult<(Schema, i32)> {
        let mut fields = base.fields().to_vec();
        let mut last_column_id = last_column_id.max(base.highest_field_id());

        for change in &self.changes {
            match change {
                SchemaChange::AddColumn { name, field_type, doc } => {
                    if fields.iter().any(|f| f.name() == name) {
                        return Err(IcebergError::SchemaError {
                            message: format!("column '{name}' already exists")
                        });
                    }
                    let mut next_id = || { last_column_id += 1; last_column_id };
                    let mut field = Field::new(0, name, false, field_type.clone())
                        .with_fresh_ids(&mut next_id);
                    field.doc = doc.clone();
                    fields.push(field);
                },
                SchemaChange::RenameColumn { name, new_name } => {
                    if fields.iter().any(|f| f.name() == new_name) {
                        return Err(IcebergError::SchemaError {
                            message: format!("can't rename '{name}': column '{new_name}' already exists")
                        });
                    }
                    let field = fields.iter_mut()
                        .find(|f| f.name() == name)
                        .ok_or_else(|| column_not_found(name))?;
                    field.name = new_name.clone();
                },
                SchemaChange::MakeOptional { name } => {
                    let field = fields.iter_mut()
                        .find(|f| f.name() == name)
                        .ok_or_else(|| column_not_found(name))?;
                    field.required = false;
                },
                SchemaChange::PromoteType { name, to } => {
                    let field = fields.iter_mut()
                        .find(|f| f.name() == name)
                        .ok_or_else(|| column_not_found(name))?;
                    field.r#type = SchemaType::Primitive(to.clone());
                },
                SchemaChange::DeleteColumn { name } => {
                    let position = fields.iter()
                        .position(|f| f.name() == name)
                        .ok_or_else(|| column_not_found(name))?;
                    if base.identifier_field_ids().contains(&fields[position].id()) {
                        return Err(IcebergError::SchemaError {
                            message: format!("can't delete identifier column '{name}'")
                        });
                    }
                    fields.remove(position);
                },
            }
        }

        let schema = Schema::try_new(new_schema_id, fields)?
            .with_identifier_field_ids(base.identifier_field_ids().iter().copied());
        check_compatible(base, &schema, last_column_id)?;

        Ok((schema, last_column_id))
    }
}

/// Checks that `target` is a legal evolution of `base` for a table whose
/// `last-column-id` is `last_column_id`.
///
/// # Errors
///
/// Returns [`IcebergError::SchemaError`] describing the first rule violated.
pub fn check_compatible(
    base: &Schema,
    target: &Schema,
    last_column_id: i32
) -> IcebergResult<()> {
    target.validate()?;
    check_field_lists(base.fields(), target.fields(), last_column_id)
}

fn check_field_lists(
    base: &[Field],
    target: &[Field],
    last_column_id: i32
) -> IcebergResult<()> {
    let base_fields: HashMap<i32, &Field> = base
        .iter()
        .map(|field| (field.id(), field))
        .collect();

    for target_field in target {
        match base_fields.get(&target_field.id()) {
            Some(base_field) => check_field(base_field, target_field, last_column_id)?,
            None => check_new_field(target_field, last_column_id)?,
        }
    }

    Ok(())
}

fn check_new_field(field: &Field, last_column_id: i32) -> IcebergResult<()> {
    if field.required() {
        return Err(IcebergError::SchemaError {
            message: format!("new column '{}' must be optional", field.name())
        });
    }

    for nested in field.all_fields() {
        if nested.id() <= last_column_id {
            return Err(IcebergError::SchemaError {
                message: format!(
                    "new field '{}' reuses field id {} (last column id is {})",
                    nested.name(), nested.id(), last_column_id
                )
            });
        }
    }

    Ok(())
}

fn check_field(base: &Field, target: &Field, last_column_id: i32) -> IcebergResult<()> {
    if !base.required() && target.required() {
        return Err(IcebergError::SchemaError {
            message: format!(
                "can't evolve field '{}' from optional to required",
                base.name()
            )
        });
    }

    match (base.schema_type(), target.schema_type()) {
        (SchemaType::Primitive(pb), SchemaType::Primitive(pt)) => {
            if pb.is_promotable_to(pt) {
                Ok(())
            } else {
                Err(IcebergError::SchemaError {
                    message: format!(
                        "can't evolve field '{}' from type {} to type {}",
                        base.name(), pb, pt
                    )
                })
            }
        },
        (SchemaType::Struct(sb), SchemaType::Struct(st)) => {
            check_field_lists(sb.fields(), st.fields(), last_column_id)
        },
        (SchemaType::List(lb), SchemaType::List(lt)) => {
            check_nested(lb.field(), lt.field(), last_column_id)
        },
        (SchemaType::Map(mb), SchemaType::Map(mt)) => {
            check_nested(mb.key(), mt.key(), last_column_id)?;
            check_nested(mb.value(), mt.value(), last_column_id)
        },
        (tb, tt) => {
            Err(IcebergError::SchemaError {
                message: format!(
                    "can't evolve {} field '{}' to {} field",
                    tb.kind(), base.name(), tt.kind()
                )
            })
        }
    }
}

/// List elements and map keys and values keep their ids for the life of the
/// column.
fn check_nested(base: &Field, target: &Field, last_column_id: i32) -> IcebergResult<()> {
    if base.id() != target.id() {
        return Err(IcebergError::SchemaError {
            message: format!(
                "nested field id changed from {} to {}",
                base.id(), target.id()
            )
        });
    }
    check_field(base, target, last_column_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Schema {
        Schema::new(0, vec![
            Field::new_primitive(1, "name", true, PrimitiveType::String),
            Field::new_primitive(2, "email", false, PrimitiveType::String),
            Field::new_primitive(3, "age", false, PrimitiveType::Int),
        ])
    }

    #[test]
    fn add_column_takes_next_id() {
        let update = SchemaUpdate::new([
            SchemaChange::add_column("dob", PrimitiveType::Date),
        ]);
        let (schema, last_column_id) = update.apply(&base(), 3, 1).unwrap();

        assert_eq!(schema.id(), 1);
        assert_eq!(last_column_id, 4);
        let dob = schema.field_by_name("dob").unwrap();
        assert_eq!(dob.id(), 4);
        assert!(!dob.required());
    }

    #[test]
    fn dropped_ids_are_not_reused() {
        let (dropped, last_column_id) = SchemaUpdate::new([
            SchemaChange::delete_column("age"),
        ]).apply(&base(), 3, 1).unwrap();
        assert_eq!(last_column_id, 3);
        assert!(dropped.field_by_id(3).is_none());

        let (readded, last_column_id) = SchemaUpdate::new([
            SchemaChange::add_column("age", PrimitiveType::Long),
        ]).apply(&dropped, last_column_id, 2).unwrap();
        assert_eq!(readded.field_by_name("age").unwrap().id(), 4);
        assert_eq!(last_column_id, 4);

        // Reintroducing id 3 by hand is rejected.
        let reused = Schema::new(3, vec![
            Field::new_primitive(1, "name", true, PrimitiveType::String),
            Field::new_primitive(2, "email", false, PrimitiveType::String),
            Field::new_primitive(3, "age", false, PrimitiveType::Int),
        ]);
        assert!(check_compatible(&dropped, &reused, 3).is_err());
    }

    #[test]
    fn rename_promote_and_relax() {
        let (schema, _) = SchemaUpdate::new([
            SchemaChange::rename_column("email", "contact"),
            SchemaChange::promote_type("age", PrimitiveType::Long),
            SchemaChange::make_optional("name"),
        ]).apply(&base(), 3, 1).unwrap();

        let contact = schema.field_by_name("contact").unwrap();
        assert_eq!(contact.id(), 2);
        assert_eq!(
            schema.field_by_id(3).unwrap().schema_type(),
            &SchemaType::Primitive(PrimitiveType::Long)
        );
        assert!(!schema.field_by_id(1).unwrap().required());
    }

    #[test]
    fn illegal_changes() {
        let narrowing = SchemaUpdate::new([
            SchemaChange::promote_type("age", PrimitiveType::String),
        ]).apply(&base(), 3, 1);
        assert!(matches!(narrowing, Err(IcebergError::SchemaError { .. })));

        let missing = SchemaUpdate::new([
            SchemaChange::rename_column("phone", "mobile"),
        ]).apply(&base(), 3, 1);
        assert!(matches!(missing, Err(IcebergError::SchemaError { .. })));

        let duplicate = SchemaUpdate::new([
            SchemaChange::add_column("email", PrimitiveType::String),
        ]).apply(&base(), 3, 1);
        assert!(matches!(duplicate, Err(IcebergError::SchemaError { .. })));

        let required = Schema::new(1, vec![
            Field::new_primitive(1, "name", true, PrimitiveType::String),
            Field::new_primitive(2, "email", true, PrimitiveType::String),
            Field::new_primitive(3, "age", false, PrimitiveType::Int),
        ]);
        assert!(check_compatible(&base(), &required, 3).is_err());

        let new_required = Schema::new(1, vec![
            Field::new_primitive(1, "name", true, PrimitiveType::String),
            Field::new_primitive(4, "dob", true, PrimitiveType::Date),
        ]);
        assert!(check_compatible(&base(), &new_required, 3).is_err());
    }

    #[test]
    fn nested_add_gets_fresh_ids() {
        let address = SchemaType::Struct(crate::schema::StructType::new(vec![
            Field::new_primitive(0, "city", false, PrimitiveType::String),
            Field::new_primitive(0, "zip", false, PrimitiveType::String),
        ]));
        let (schema, last_column_id) = SchemaUpdate::new([
            SchemaChange::add_column("address", address),
        ]).apply(&base(), 3, 1).unwrap();

        let ids: Vec<i32> = schema.field_by_name("address").unwrap()
            .all_fields()
            .map(|f| f.id())
            .collect();
        assert_eq!(ids, vec![4, 5, 6]);
        assert_eq!(last_column_id, 6);
    }
}
