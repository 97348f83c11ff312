//! Pooled SQLite connection

use crate::config::AppConfig;
use di::{Ref, inject, injectable};
use sqlx::SqlitePool;
use sqlx::migrate::MigrateError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

/// Pool handed to every `DatabaseConnection` created while it is set.
static TEST_POOL: Mutex<Option<SqlitePool>> = Mutex::new(None);

pub struct DatabaseConnection {
    connection: SqlitePool,
}

#[injectable]
impl DatabaseConnection {
    #[inject]
    pub fn create(config: Ref<AppConfig>) -> DatabaseConnection {
        if let Some(pool) = TEST_POOL.lock().ok().and_then(|pool| pool.clone()) {
            return DatabaseConnection { connection: pool };
        }

        // AppConfig rejects urls that do not parse
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .expect("DATABASE_URL must be a valid sqlite url")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_lazy_with(options);

        DatabaseConnection { connection: pool }
    }
}

impl DatabaseConnection {
    pub fn set_test_pool(pool: SqlitePool) {
        if let Ok(mut slot) = TEST_POOL.lock() {
            *slot = Some(pool);
        }
    }

    pub fn clear_test_pool() {
        if let Ok(mut slot) = TEST_POOL.lock() {
            *slot = None;
        }
    }

    /// Applies the embedded migrations.
    pub async fn migrate(&self) -> Result<(), MigrateError> {
        sqlx::migrate!().run(&self.connection).await
    }
}

/// Creates the directory holding a file backed database, so that a fresh
/// checkout can start without preparing `data/` by hand.
pub fn ensure_database_dir(database_url: &str) -> io::Result<()> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    match options.get_filename().parent() {
        Some(parent) if parent != Path::new("") => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

impl Deref for DatabaseConnection {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for DatabaseConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}
