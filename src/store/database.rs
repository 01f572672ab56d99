use sqlx::{
    Sqlite, SqlitePool,
    migrate::{MigrateDatabase, Migrator},
    sqlite::SqlitePoolOptions,
};
use std::{path::PathBuf, sync::LazyLock, time::Duration};
use thiserror::Error;

pub static MIGRATOR: LazyLock<Migrator> = LazyLock::new(|| sqlx::migrate!("./db_migrations"));

const DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// SQLite connection pool behind all four record families. `path` is `None`
/// for the in-memory fallback, which shares read/write/query semantics with
/// the on-disk store.
#[derive(Clone, Debug)]
pub struct Database {
    pub pool: SqlitePool,
    pub path: Option<PathBuf>,
}

impl Database {
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.display());

        match Sqlite::database_exists(&db_url).await {
            Ok(true) => {
                tracing::debug!(target: "threadstr::store::database", "DB exists");
            }
            Ok(false) => {
                tracing::debug!(target: "threadstr::store::database", "DB does not exist, creating...");
                Sqlite::create_database(&db_url).await?;
            }
            Err(e) => {
                tracing::warn!(
                    target: "threadstr::store::database",
                    "Could not check if database exists: {:?}, attempting to create",
                    e
                );
                Sqlite::create_database(&db_url).await?;
            }
        }

        let pool = Self::create_connection_pool(&db_url).await?;
        MIGRATOR.run(&pool).await?;

        Ok(Self {
            pool,
            path: Some(db_path),
        })
    }

    /// Storage-unavailable fallback: same schema and semantics, process
    /// lifetime only. A single connection keeps every query on the one
    /// in-memory database.
    pub async fn new_in_memory() -> Result<Self, DatabaseError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool, path: None })
    }

    async fn create_connection_pool(db_url: &str) -> Result<SqlitePool, DatabaseError> {
        let pool = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS))
            .max_connections(DB_MAX_CONNECTIONS)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    let conn = &mut *conn;
                    sqlx::query("PRAGMA journal_mode=WAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA busy_timeout=5000")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA foreign_keys = ON;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("{}?mode=rwc", db_url))
            .await?;
        Ok(pool)
    }

    /// Wipes every record family.
    pub async fn delete_all_data(&self) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        for table in ["messages", "aggregates", "profiles", "sync_cursors"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
