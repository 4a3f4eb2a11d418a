//! Table sort orders.
//!
//! Only the metadata model is provided: sort orders are recorded in the table
//! metadata and carried through commits, and data files reference the order they
//! were written with. Writers in this crate produce unsorted files.
use serde::{Deserialize, Serialize};

use crate::partition::PartitionTransform;

/// Id of the unsorted order, present in every table.
pub const UNSORTED_ORDER_ID: i32 = 0;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub enum SortDirection {
    #[serde(rename = "asc")]
    Ascending,
    #[serde(rename = "desc")]
    Descending,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub enum NullOrder {
    #[serde(rename = "nulls-first")]
    First,
    #[serde(rename = "nulls-last")]
    Last,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
/// One key of a sort order: a transformed source column, a direction and a
/// null placement.
pub struct SortField {
    pub source_id: i32,
    pub transform: PartitionTransform,
    pub direction: SortDirection,
    pub null_order: NullOrder,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
/// An ordered list of sort keys. The first field is the most significant.
pub struct SortOrder {
    pub order_id: i32,
    pub fields: Vec<SortField>,
}

impl SortOrder {
    pub fn unsorted() -> Self {
        Self { order_id: UNSORTED_ORDER_ID, fields: Vec::new() }
    }

    pub fn is_unsorted(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::unsorted()
    }
}
