pub mod pool;
pub mod schema;
pub mod messages;

// Re-export the pool type so callers can do `use crate::adapters::sqlite::DbPool`
// instead of `use crate::adapters::sqlite::pool::DbPool`
pub use pool::{open, DbPool};
