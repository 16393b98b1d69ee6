pub mod error;
pub mod types;

pub use error::ServiceError;
pub use types::{CountResult, Record, id_string, merge_patch, new_id};
