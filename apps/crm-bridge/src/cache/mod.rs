pub mod store;
pub mod types;

pub use store::{CacheStoreError, ContactCache};
pub use types::{CacheFreshness, CacheHealth, ContactQuery};
