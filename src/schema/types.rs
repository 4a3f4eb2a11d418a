//! Iceberg field types and schema fields.
use std::borrow::Cow;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{
    de::{self, IntoDeserializer},
    Serialize, Serializer, Deserialize, Deserializer
};

static STRUCT_TAG: &str = "struct";
static LIST_TAG: &str = "list";
static MAP_TAG: &str = "map";

lazy_static! {
    static ref DECIMAL_REGEX: Regex =
        Regex::new(r#"^decimal\(\s*(?P<p>\d+)\s*,\s*(?P<s>\d+)\s*\)$"#).unwrap();
    static ref FIXED_REGEX: Regex =
        Regex::new(r#"^fixed\[(?P<l>\d+)\]$"#).unwrap();
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Hash)]
#[serde(rename_all = "lowercase")]
#[serde(remote = "Self")]
/// An enum of possible primitive field types.
pub enum PrimitiveType {
    /// True or False
    Boolean,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    Long,
    /// 32-bit IEEE 754 floating point.
    Float,
    /// 64-bit IEEE 754 floating point.
    Double,
    /// Fixed point decimal
    Decimal {
        /// The number of digits in the number.
        precision: u8,
        /// The number of digits to the right of the decimal point.
        scale: u8,
    },
    /// Calendar date without timezone or time.
    Date,
    /// Time of day without date or timezone, microsecond precision.
    Time,
    /// Timestamp without timezone, microsecond precision.
    Timestamp,
    /// Timestamp with timezone, stored as UTC with microsecond precision.
    Timestamptz,
    /// Arbitrary-length character sequences
    String,
    /// Universally Unique Identifiers
    Uuid,
    /// Fixed length byte array
    Fixed(u64),
    /// Arbitrary-length byte array.
    Binary,
}

impl PrimitiveType {
    /// Returns `true` if a column of this type may be evolved to `target`.
    ///
    /// Allowed promotions are int to long, float to double and widening the
    /// precision of a decimal while keeping its scale. Every type may "evolve" to
    /// itself.
    pub fn is_promotable_to(&self, target: &PrimitiveType) -> bool {
        match (self, target) {
            (PrimitiveType::Int, PrimitiveType::Long) => true,
            (PrimitiveType::Float, PrimitiveType::Double) => true,
            (
                PrimitiveType::Decimal { precision: pb, scale: sb },
                PrimitiveType::Decimal { precision: pt, scale: st }
            ) => sb == st && pt >= pb,
            (base, target) => base == target,
        }
    }
}

impl std::fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimitiveType::Boolean => write!(f, "boolean"),
            PrimitiveType::Int => write!(f, "int"),
            PrimitiveType::Long => write!(f, "long"),
            PrimitiveType::Float => write!(f, "float"),
            PrimitiveType::Double => write!(f, "double"),
            PrimitiveType::Decimal { precision: p, scale: s } =>
                write!(f, "decimal({},{})", p, s),
            PrimitiveType::Date => write!(f, "date"),
            PrimitiveType::Time => write!(f, "time"),
            PrimitiveType::Timestamp => write!(f, "timestamp"),
            PrimitiveType::Timestamptz => write!(f, "timestamptz"),
            PrimitiveType::String => write!(f, "string"),
            PrimitiveType::Uuid => write!(f, "uuid"),
            PrimitiveType::Fixed(size) => write!(f, "fixed[{}]", size),
            PrimitiveType::Binary => write!(f, "binary"),
        }
    }
}

/// Decimal and fixed types carry their parameters inside the type string,
/// e.g. `"decimal(9,2)"` or `"fixed[16]"`.
impl Serialize for PrimitiveType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            PrimitiveType::Decimal { .. } | PrimitiveType::Fixed(_) => {
                serializer.serialize_str(&self.to_string())
            },
            _ => PrimitiveType::serialize(self, serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PrimitiveType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(caps) = DECIMAL_REGEX.captures(&s) {
            let precision = caps["p"].parse::<u8>()
                .map_err(|_| de::Error::custom(format!("invalid decimal precision in {s}")))?;
            let scale = caps["s"].parse::<u8>()
                .map_err(|_| de::Error::custom(format!("invalid decimal scale in {s}")))?;
            Ok(PrimitiveType::Decimal { precision, scale })
        } else if let Some(caps) = FIXED_REGEX.captures(&s) {
            let length = caps["l"].parse::<u64>()
                .map_err(|_| de::Error::custom(format!("invalid fixed length in {s}")))?;
            Ok(PrimitiveType::Fixed(length))
        } else if s.starts_with("decimal") || s.starts_with("fixed") {
            Err(de::Error::custom(format!("invalid primitive type {s}")))
        } else {
            PrimitiveType::deserialize(s.into_deserializer())
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
/// A complex field type that contains a tuple of nested fields.
///
/// Each nested field in the struct is named and has an integer id that is unique in
/// the table schema.
pub struct StructType {
    /// Always set to "struct".
    pub r#type: Cow<'static, str>,
    /// The fields of the struct.
    pub fields: Vec<Field>,
}

impl StructType {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { r#type: Cow::Borrowed(STRUCT_TAG), fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(from = "ListTypeModel", into = "ListTypeModel")]
/// A field type that represents a list of identical elements.
pub struct ListType {
    element: Box<Field>,
}

impl ListType {
    pub fn new(element_id: i32, element_required: bool, element: SchemaType) -> Self {
        Self {
            element: Box::new(Field::new(element_id, "element", element_required, element))
        }
    }

    /// Returns the nested element field.
    pub fn field(&self) -> &Field {
        &self.element
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
struct ListTypeModel {
    r#type: Cow<'static, str>,
    element_id: i32,
    element_required: bool,
    element: SchemaType,
}

impl From<ListType> for ListTypeModel {
    fn from(l: ListType) -> Self {
        let element = *l.element;
        Self {
            r#type: Cow::Borrowed(LIST_TAG),
            element_id: element.id,
            element_required: element.required,
            element: element.r#type,
        }
    }
}

impl From<ListTypeModel> for ListType {
    fn from(l: ListTypeModel) -> Self {
        Self::new(l.element_id, l.element_required, l.element)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(from = "MapTypeModel", into = "MapTypeModel")]
/// A complex field type that contains key-value pairs. Keys are always required.
pub struct MapType {
    key: Box<Field>,
    value: Box<Field>,
}

impl MapType {
    pub fn new(
        key_id: i32,
        key_type: SchemaType,
        value_id: i32,
        value_required: bool,
        value_type: SchemaType
    ) -> Self {
        Self {
            key: Box::new(Field::new(key_id, "key", true, key_type)),
            value: Box::new(Field::new(value_id, "value", value_required, value_type)),
        }
    }

    pub fn key(&self) -> &Field {
        &self.key
    }

    pub fn value(&self) -> &Field {
        &self.value
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
struct MapTypeModel {
    r#type: Cow<'static, str>,
    key_id: i32,
    key: SchemaType,
    value_id: i32,
    value_required: bool,
    value: SchemaType,
}

impl From<MapType> for MapTypeModel {
    fn from(m: MapType) -> Self {
        let (key, value) = (*m.key, *m.value);
        Self {
            r#type: Cow::Borrowed(MAP_TAG),
            key_id: key.id,
            key: key.r#type,
            value_id: value.id,
            value_required: value.required,
            value: value.r#type,
        }
    }
}

impl From<MapTypeModel> for MapType {
    fn from(m: MapTypeModel) -> Self {
        Self::new(m.key_id, m.key, m.value_id, m.value_required, m.value)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(untagged)]
/// Represents the type of a field in an Iceberg table schema.
pub enum SchemaType {
    Primitive(PrimitiveType),
    Struct(StructType),
    List(ListType),
    Map(MapType),
}

impl SchemaType {
    pub fn is_primitive(&self) -> bool {
        matches!(self, Self::Primitive(_))
    }

    /// Returns the primitive type, or `None` for nested types.
    pub fn as_primitive(&self) -> Option<&PrimitiveType> {
        match self {
            SchemaType::Primitive(p) => Some(p),
            _ => None,
        }
    }

    /// A short name for the kind of the type, used in error messages.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            SchemaType::Primitive(_) => "primitive",
            SchemaType::Struct(_) => STRUCT_TAG,
            SchemaType::List(_) => LIST_TAG,
            SchemaType::Map(_) => MAP_TAG,
        }
    }

    fn with_fresh_ids<F>(self, next_id: &mut F) -> Self
    where
        F: FnMut() -> i32
    {
        match self {
            SchemaType::Primitive(p) => SchemaType::Primitive(p),
            SchemaType::Struct(s) => {
                SchemaType::Struct(StructType::new(
                    s.fields
                        .into_iter()
                        .map(|field| field.with_fresh_ids(next_id))
                        .collect()
                ))
            },
            SchemaType::List(l) => {
                let element = *l.element;
                let element_id = next_id();
                SchemaType::List(ListType::new(
                    element_id,
                    element.required,
                    element.r#type.with_fresh_ids(next_id)
                ))
            },
            SchemaType::Map(m) => {
                let (key, value) = (*m.key, *m.value);
                let key_id = next_id();
                let key_type = key.r#type.with_fresh_ids(next_id);
                let value_id = next_id();
                SchemaType::Map(MapType::new(
                    key_id,
                    key_type,
                    value_id,
                    value.required,
                    value.r#type.with_fresh_ids(next_id)
                ))
            },
        }
    }
}

impl From<PrimitiveType> for SchemaType {
    fn from(p: PrimitiveType) -> Self {
        SchemaType::Primitive(p)
    }
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SchemaType::Primitive(p) => write!(f, "{p}"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
/// An Iceberg schema field.
pub struct Field {
    /// Unique id, stable across schema versions and never reused.
    pub id: i32,
    pub name: String,
    /// Required fields can't hold null values.
    pub required: bool,
    pub r#type: SchemaType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl Field {
    pub fn new(
        id: i32,
        name: &str,
        required: bool,
        r#type: SchemaType
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            required,
            r#type,
            doc: None,
        }
    }

    /// Creates a new `Field` with type [`SchemaType::Primitive`]
    pub fn new_primitive(
        id: i32,
        name: &str,
        required: bool,
        primitive: PrimitiveType
    ) -> Self {
        Self::new(id, name, required, SchemaType::Primitive(primitive))
    }

    /// Creates a new `Field` with type [`SchemaType::Struct`]
    pub fn new_struct(
        id: i32,
        name: &str,
        required: bool,
        fields: impl IntoIterator<Item = Field>
    ) -> Self {
        Self::new(
            id, name, required,
            SchemaType::Struct(StructType::new(fields.into_iter().collect()))
        )
    }

    /// Creates a new `Field` with type [`SchemaType::List`]
    pub fn new_list(id: i32, name: &str, required: bool, element: Field) -> Self {
        Self::new(
            id, name, required,
            SchemaType::List(ListType::new(element.id, element.required, element.r#type))
        )
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn schema_type(&self) -> &SchemaType {
        &self.r#type
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_doc(mut self, doc: &str) -> Self {
        self.doc = Some(doc.to_string());
        self
    }

    /// Assigns new ids from `next_id` to this field and all nested fields.
    pub fn with_fresh_ids<F>(mut self, next_id: &mut F) -> Self
    where
        F: FnMut() -> i32
    {
        self.id = next_id();
        self.r#type = self.r#type.with_fresh_ids(next_id);
        self
    }

    /// Returns an iterator on this field and all recursively nested fields,
    /// depth-first.
    pub fn all_fields(&self) -> Box<dyn Iterator<Item = &Self> + '_> {
        let this = std::iter::once(self);

        match self.schema_type() {
            SchemaType::Primitive(_) => Box::new(this),
            SchemaType::Struct(s) => {
                Box::new(this.chain(s.fields().iter().flat_map(|f| f.all_fields())))
            },
            SchemaType::List(l) => Box::new(this.chain(l.field().all_fields())),
            SchemaType::Map(m) => {
                Box::new(this.chain(m.key().all_fields()).chain(m.value().all_fields()))
            },
        }
    }
}
