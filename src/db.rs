//! Shared SQLite pool setup for the catalog and registry tables.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// Open a pool for `url`.
///
/// An in-memory database exists per connection, so memory URLs get a single
/// connection that is never recycled.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await
    } else {
        SqlitePoolOptions::new().max_connections(4).connect(url).await
    }
}
