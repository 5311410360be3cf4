//! Remote CRM directory primitives: canonical contact types, field normalization,
//! and the function-style RPC client used by the sync engine.

pub mod client;
pub mod memory;
pub mod normalize;
pub mod types;

pub use client::{
    DirectoryError, DirectoryErrorClass, DirectoryPage, HttpDirectoryClient,
    HttpDirectoryClientConfig, RemoteDirectory,
};
pub use memory::{DirectoryCallCounts, InMemoryDirectory};
pub use normalize::{NormalizeError, normalize_contact, raw_contact_id};
pub use types::{ContactAddress, ContactRecord, SyncStatus, is_temporary_id, new_temporary_id};
