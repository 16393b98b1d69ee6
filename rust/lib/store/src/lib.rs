//! Storage and REST surface for guarded models.
//!
//! [`RecordStore`] keeps every model's records as JSON documents in one redb
//! file and answers the enforcer's instance lookups. [`rest_router`] exposes
//! the write entry points over HTTP and runs the bound hooks before each write.
//!
//! ```ignore
//! let store = Arc::new(RecordStore::open(&db_path)?);
//! let enforcer = Arc::new(Enforcer::new(registry, store.clone()));
//! let app = rest_router(store, Arc::new(HookTable::bind(enforcer)));
//! ```

pub mod record;
pub mod rest;

pub use record::{RecordStore, matches_filter};
pub use rest::rest_router;
