//! Repository functions, one function per database operation.
//!
//! Single-statement functions accept any SQLite executor, so they run equally
//! against `&DbPool` or inside a transaction (`&mut *tx`). No business logic,
//! no domain types, pure SQL.

pub mod workflows;
pub mod dags;
pub mod results;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::pool::{create_pool, run_migrations};
    use crate::DbPool;

    /// A migrated pool backed by a file inside `dir`.
    pub async fn pool_in(dir: &tempfile::TempDir) -> DbPool {
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let pool = create_pool(&url, 4).await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }
}
