mod feed_cache;
mod results;
mod schema;
mod types;

pub use feed_cache::DEFAULT_CACHE_TTL_SECONDS;
pub use schema::Database;
pub use types::{CacheEntry, CacheStats, CachedResult, DatabaseError, StoredResult};
