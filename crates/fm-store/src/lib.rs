pub mod error;
pub mod persistence;
pub mod project;
pub mod schema;
pub mod store;

pub use error::{Result, StoreError};
pub use persistence::SqlitePersistence;
pub use project::{ProjectStore, default_base_dir, sanitize_name};
pub use store::NodeStore;
