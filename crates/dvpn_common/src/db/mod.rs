use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

use chrono::{NaiveDateTime, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tokio::sync::Mutex;

pub mod models;

pub use models::{QuotaExceeded, Session, SessionFilter, SessionUpdate};

// helper for easier migration handling with a custom `migration` folder location
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens (creating if missing) and migrates the session database.
pub async fn init_db(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    info!("Initializing DB pool at {}", path.display());
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new().connect_with(opts).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

// In-memory database for tests. A single connection that never expires,
// otherwise every new connection would see an empty database.
pub async fn setup_pool() -> SqlitePool {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("Invalid in-memory database URL");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await
        .expect("Database connection failed");
    MIGRATOR
        .run(&pool)
        .await
        .expect("Cannot run database migrations.");
    pool
}

/// Concurrency safe access to session records.
///
/// Read-modify-write operations are serialized through a shared write gate so
/// that concurrent workers never interleave inside one record update.
#[derive(Clone, Debug)]
pub struct SessionStore {
    pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
}

impl SessionStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_gate: Arc::default(),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fails with a unique constraint violation if `id` or `peer_id` is taken.
    pub async fn insert_one(&self, session: &Session) -> Result<(), sqlx::Error> {
        let _guard = self.write_gate.lock().await;
        session.insert(&self.pool).await
    }

    pub async fn find_one(&self, filter: &SessionFilter) -> Result<Option<Session>, sqlx::Error> {
        Session::find_one(&self.pool, filter).await
    }

    pub async fn find(&self, filter: &SessionFilter) -> Result<Vec<Session>, sqlx::Error> {
        Session::find(&self.pool, filter).await
    }

    /// Atomically applies `update` to the first matching record.
    ///
    /// Returns the updated record, or `None` if nothing matched.
    pub async fn find_one_and_update(
        &self,
        filter: &SessionFilter,
        update: &SessionUpdate,
    ) -> Result<Option<Session>, sqlx::Error> {
        self.find_one_and_update_at(filter, update, Utc::now().naive_utc())
            .await
    }

    pub(crate) async fn find_one_and_update_at(
        &self,
        filter: &SessionFilter,
        update: &SessionUpdate,
        now: NaiveDateTime,
    ) -> Result<Option<Session>, sqlx::Error> {
        let _guard = self.write_gate.lock().await;
        let mut transaction = self.pool.begin().await?;
        let Some(mut session) = Session::find_one(&mut *transaction, filter).await? else {
            return Ok(None);
        };
        if session.apply_update(update, now) {
            session.save(&mut *transaction).await?;
        }
        transaction.commit().await?;
        Ok(Some(session))
    }

    /// Atomically removes the first matching record and returns it.
    pub async fn find_one_and_delete(
        &self,
        filter: &SessionFilter,
    ) -> Result<Option<Session>, sqlx::Error> {
        let _guard = self.write_gate.lock().await;
        let mut transaction = self.pool.begin().await?;
        let Some(session) = Session::find_one(&mut *transaction, filter).await? else {
            return Ok(None);
        };
        session.delete(&mut *transaction).await?;
        transaction.commit().await?;
        Ok(Some(session))
    }

    /// Returns the number of deleted records.
    pub async fn delete_many(&self, filter: &SessionFilter) -> Result<u64, sqlx::Error> {
        let _guard = self.write_gate.lock().await;
        Session::delete_many(&self.pool, filter).await
    }
}

/// Whether the error is a `UNIQUE` or `PRIMARY KEY` constraint violation.
#[must_use]
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}
