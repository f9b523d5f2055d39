use std::fmt;
use serde::{Deserialize, Serialize};

/// Transaction ID type
pub type TxnId = u32;

/// Logical timestamp handed out by the lock table when a request arrives
pub type RequestSeq = u64;

/// Commit version of a stored value (0 = never committed)
pub type Version = u64;

/// Address of a single stored value: a key inside a table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub table: String,
    pub key: String,
}

impl RowKey {
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

/// A lockable unit: a whole table or a single row of a table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resource {
    Table(String),
    Row { table: String, key: String },
}

impl Resource {
    pub fn table(name: impl Into<String>) -> Self {
        Resource::Table(name.into())
    }

    pub fn row(table: impl Into<String>, key: impl Into<String>) -> Self {
        Resource::Row {
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Resource::Table(_))
    }

    /// Name of the table this resource lives in
    pub fn table_name(&self) -> &str {
        match self {
            Resource::Table(name) => name,
            Resource::Row { table, .. } => table,
        }
    }
}

impl From<&RowKey> for Resource {
    fn from(key: &RowKey) -> Self {
        Resource::row(key.table.clone(), key.key.clone())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Table(name) => write!(f, "table {}", name),
            Resource::Row { table, key } => write!(f, "row {}/{}", table, key),
        }
    }
}
