//! Catalogs map table identifiers to the location of their current metadata file.
//!
//! The catalog pointer is the only mutable state of a table. It is advanced with
//! [`Catalog::compare_and_swap`], which succeeds for exactly one of several
//! writers racing from the same base. Catalogs never retry: retry policy belongs
//! to the caller, see [`Transaction`](crate::transaction::Transaction).
//!
//! Two implementations are provided:
//! - [`InMemoryCatalog`] keeps pointers in process memory, for tests and
//!   single-process use.
//! - [`StorageCatalog`] persists pointers in the warehouse itself, using
//!   create-only writes of versioned pointer files.
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::{IcebergError, IcebergResult};

pub mod memory;
pub mod storage;

pub use memory::InMemoryCatalog;
pub use storage::StorageCatalog;

/// Identifies a table in a catalog by its namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableIdent {
    namespace: Vec<String>,
    name: String,
}

impl TableIdent {
    pub fn new(namespace: Vec<String>, name: impl Into<String>) -> Self {
        Self { namespace, name: name.into() }
    }

    /// Shorthand for `TableIdent::new`, e.g. `TableIdent::of(["raw"], "users")`.
    pub fn of<I, S>(namespace: I, name: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(namespace.into_iter().map(Into::into).collect(), name)
    }

    pub fn namespace(&self) -> &[String] {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.namespace {
            write!(f, "{part}.")?;
        }
        write!(f, "{}", self.name)
    }
}

impl FromStr for TableIdent {
    type Err = IcebergError;

    /// Parses `ns1.ns2.name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<String> = s.split('.').map(str::to_string).collect();
        if parts.iter().any(String::is_empty) {
            return Err(IcebergError::ConfigError(format!("invalid table identifier '{s}'")));
        }

        // split() always yields at least one part.
        let name = parts.pop().unwrap_or_default();
        Ok(Self::new(parts, name))
    }
}

/// Maps table identifiers to metadata file locations.
///
/// All methods are safe to call concurrently from several tasks, and an
/// implementation is shared as `Arc<dyn Catalog>`.
#[async_trait]
pub trait Catalog: fmt::Debug + Send + Sync {
    /// Registers a new table pointing at its first metadata file.
    ///
    /// # Errors
    ///
    /// [`IcebergError::TableAlreadyExists`] if the identifier is taken.
    async fn create_table(&self, ident: &TableIdent, metadata_location: &str) -> IcebergResult<()>;

    /// Returns the location of the table's current metadata file.
    ///
    /// # Errors
    ///
    /// [`IcebergError::TableNotFound`] if the table is not registered.
    async fn resolve_current(&self, ident: &TableIdent) -> IcebergResult<String>;

    /// Atomically replaces the table's pointer with `new` if it still equals
    /// `expected`. Returns `false`, leaving the pointer unchanged, if another
    /// writer moved it first.
    ///
    /// # Errors
    ///
    /// [`IcebergError::TableNotFound`] if the table is not registered.
    async fn compare_and_swap(
        &self,
        ident: &TableIdent,
        expected: &str,
        new: &str
    ) -> IcebergResult<bool>;

    /// Lists the tables registered directly under `namespace`, sorted.
    async fn list_tables(&self, namespace: &[String]) -> IcebergResult<Vec<TableIdent>>;

    /// Unregisters a table. Its files are left in storage.
    async fn drop_table(&self, ident: &TableIdent) -> IcebergResult<()>;
}
