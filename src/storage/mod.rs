pub mod versioned;

pub use versioned::{PendingWrite, StoreError, VersionedEntry, VersionedStore};
