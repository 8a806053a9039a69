use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

use crate::error::MirrorError;

/// Shared by the preflight workers, the writer and the consistency steps.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Creates the database directory, connection pool, and initializes the schema.
pub fn open(db_path: &Path) -> Result<DbPool, MirrorError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MirrorError::Database(format!("Failed to create db dir: {e}")))?;
        }
    }

    let pool = create_pool(db_path)?;

    let conn = pool.get()?;
    super::schema::initialize_schema(&conn)?;

    Ok(pool)
}

pub fn create_pool(db_path: &Path) -> Result<DbPool, MirrorError> {
    // Per-connection settings; the writer and preflight readers overlap.
    let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
        c.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
    });

    let pool = Pool::builder()
        .max_size(8)
        .build(manager)?;

    let conn = pool.get()?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;"
    )?;

    Ok(pool)
}
