//! Iceberg table schemas.
//!
//! A [`Schema`] is an id plus a list of [`Field`]s. Every field, including fields
//! nested inside structs, lists and maps, carries an integer id that is unique in
//! the schema and stable for the life of the table: data files identify their
//! columns by these ids, which is what lets a column be renamed, dropped or
//! promoted without rewriting data.
//!
//! ## Creating a schema
//!
//! ```rust
//! use icetable::schema::{Schema, Field, PrimitiveType};
//!
//! let schema = Schema::try_new(0, vec![
//!     Field::new_primitive(1, "name", true, PrimitiveType::String),
//!     Field::new_primitive(2, "email", false, PrimitiveType::String),
//!     Field::new_struct(3, "address", false, vec![
//!         Field::new_primitive(4, "city", false, PrimitiveType::String),
//!         Field::new_primitive(5, "zip", false, PrimitiveType::String),
//!     ]),
//! ]).unwrap();
//!
//! assert_eq!(schema.highest_field_id(), 5);
//! ```
//!
//! Schemas are evolved with [`SchemaUpdate`], which enforces the evolution rules
//! and assigns ids to new columns.
mod types;
#[allow(clippy::module_inception)]
mod schema;
mod evolution;

pub use self::types::{
    PrimitiveType, SchemaType, StructType, ListType, MapType, Field
};
pub use self::schema::Schema;
pub use self::evolution::{SchemaChange, SchemaUpdate, check_compatible};
