pub mod types;
pub mod value;

pub use types::{RequestSeq, Resource, RowKey, TxnId, Version};
pub use value::{Value, ValueParseError};
