pub mod database;
pub mod error;
pub mod identity;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use identity::{IdentityCache, MemoryIdentityCache, SqliteIdentityCache};
