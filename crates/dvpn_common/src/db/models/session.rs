use std::{fmt, time::Duration};

use chrono::{NaiveDateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Row, Sqlite, SqliteExecutor, query, sqlite::SqliteRow};

use crate::types::{ByteCount, ServiceType};

const SELECT_SESSION: &str = "SELECT id, acc_addr, node_addr, peer_id, service_type, \
    rx_bytes, tx_bytes, duration, max_bytes, max_duration, signature, created_at, updated_at \
    FROM session";

/// Local bookkeeping for a single admitted ledger session.
///
/// Each field has exactly one writer: the admission handler creates the record,
/// the usage collector updates counters, the reconciler deletes it.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    /// Ledger session id, assigned by the ledger and never reused.
    pub id: u64,
    pub acc_addr: String,
    pub node_addr: String,
    /// Backend specific peer identifier, unique across all records.
    pub peer_id: String,
    pub service_type: ServiceType,
    pub rx_bytes: ByteCount,
    pub tx_bytes: ByteCount,
    /// Active usage time, only advanced when counters change.
    pub duration: Duration,
    // zero means unlimited
    pub max_bytes: ByteCount,
    // zero means unlimited
    pub max_duration: Duration,
    pub signature: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Reason for which a session is no longer allowed to keep its peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuotaExceeded {
    Bytes { total: ByteCount, max: ByteCount },
    Duration { duration: Duration, max: Duration },
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes { total, max } => write!(f, "byte quota exceeded ({total} of {max})"),
            Self::Duration { duration, max } => write!(
                f,
                "duration quota exceeded ({}s of {}s)",
                duration.as_secs(),
                max.as_secs()
            ),
        }
    }
}

/// Attribute equality filter used by all session lookups.
///
/// Unset attributes are ignored, an empty filter matches every record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionFilter {
    pub id: Option<u64>,
    pub acc_addr: Option<String>,
    pub node_addr: Option<String>,
    pub peer_id: Option<String>,
    pub service_type: Option<ServiceType>,
}

/// Partial update applied by [`crate::db::SessionStore::find_one_and_update`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionUpdate {
    pub rx_bytes: Option<ByteCount>,
    pub tx_bytes: Option<ByteCount>,
    pub signature: Option<Option<String>>,
}

enum FilterValue {
    Int(i64),
    Text(String),
}

impl SessionFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn acc_addr<S: Into<String>>(mut self, acc_addr: S) -> Self {
        self.acc_addr = Some(acc_addr.into());
        self
    }

    #[must_use]
    pub fn node_addr<S: Into<String>>(mut self, node_addr: S) -> Self {
        self.node_addr = Some(node_addr.into());
        self
    }

    #[must_use]
    pub fn peer_id<S: Into<String>>(mut self, peer_id: S) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    #[must_use]
    pub fn service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = Some(service_type);
        self
    }

    fn conditions(&self) -> Result<Vec<(&'static str, FilterValue)>, sqlx::Error> {
        let mut conditions = Vec::new();
        if let Some(id) = self.id {
            conditions.push(("id", FilterValue::Int(to_db_id(id)?)));
        }
        if let Some(acc_addr) = &self.acc_addr {
            conditions.push(("acc_addr", FilterValue::Text(acc_addr.clone())));
        }
        if let Some(node_addr) = &self.node_addr {
            conditions.push(("node_addr", FilterValue::Text(node_addr.clone())));
        }
        if let Some(peer_id) = &self.peer_id {
            conditions.push(("peer_id", FilterValue::Text(peer_id.clone())));
        }
        if let Some(service_type) = self.service_type {
            conditions.push(("service_type", FilterValue::Text(service_type.to_string())));
        }
        Ok(conditions)
    }

    fn push_where(&self, builder: &mut QueryBuilder<'_, Sqlite>) -> Result<(), sqlx::Error> {
        for (index, (column, value)) in self.conditions()?.into_iter().enumerate() {
            builder.push(if index == 0 { " WHERE " } else { " AND " });
            builder.push(column).push(" = ");
            match value {
                FilterValue::Int(value) => builder.push_bind(value),
                FilterValue::Text(value) => builder.push_bind(value),
            };
        }
        Ok(())
    }
}

impl SessionUpdate {
    #[must_use]
    pub fn counters(rx_bytes: ByteCount, tx_bytes: ByteCount) -> Self {
        Self {
            rx_bytes: Some(rx_bytes),
            tx_bytes: Some(tx_bytes),
            signature: None,
        }
    }
}

impl Session {
    #[must_use]
    pub fn new<S: Into<String>>(
        id: u64,
        acc_addr: S,
        node_addr: S,
        peer_id: S,
        service_type: ServiceType,
        max_bytes: ByteCount,
        max_duration: Duration,
    ) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id,
            acc_addr: acc_addr.into(),
            node_addr: node_addr.into(),
            peer_id: peer_id.into(),
            service_type,
            rx_bytes: ByteCount::ZERO,
            tx_bytes: ByteCount::ZERO,
            duration: Duration::ZERO,
            max_bytes,
            max_duration,
            signature: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn total_bytes(&self) -> ByteCount {
        self.rx_bytes + self.tx_bytes
    }

    /// Checks configured ceilings, byte quota is reported first if both are exceeded.
    #[must_use]
    pub fn quota_exceeded(&self) -> Option<QuotaExceeded> {
        let total = self.total_bytes();
        if !self.max_bytes.is_zero() && total >= self.max_bytes {
            return Some(QuotaExceeded::Bytes {
                total,
                max: self.max_bytes,
            });
        }
        if !self.max_duration.is_zero() && self.duration >= self.max_duration {
            return Some(QuotaExceeded::Duration {
                duration: self.duration,
                max: self.max_duration,
            });
        }
        None
    }

    /// Apply a partial update in memory.
    ///
    /// `duration` is recomputed as time elapsed since `created_at` only when
    /// one of the counters actually changes, and never moves backwards.
    /// Returns `true` if any field was modified.
    pub fn apply_update(&mut self, update: &SessionUpdate, now: NaiveDateTime) -> bool {
        let mut counters_changed = false;
        if let Some(rx_bytes) = update.rx_bytes {
            counters_changed |= rx_bytes != self.rx_bytes;
            self.rx_bytes = rx_bytes;
        }
        if let Some(tx_bytes) = update.tx_bytes {
            counters_changed |= tx_bytes != self.tx_bytes;
            self.tx_bytes = tx_bytes;
        }
        let mut changed = counters_changed;
        if let Some(signature) = &update.signature {
            changed |= *signature != self.signature;
            self.signature.clone_from(signature);
        }

        if counters_changed {
            let elapsed = (now - self.created_at).to_std().unwrap_or_default();
            self.duration = self.duration.max(elapsed);
        }
        if changed {
            self.updated_at = now;
        }
        changed
    }

    pub async fn insert<'e, E>(&self, executor: E) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        query(
            "INSERT INTO session (id, acc_addr, node_addr, peer_id, service_type, rx_bytes, \
            tx_bytes, duration, max_bytes, max_duration, signature, created_at, updated_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(to_db_id(self.id)?)
        .bind(&self.acc_addr)
        .bind(&self.node_addr)
        .bind(&self.peer_id)
        .bind(self.service_type.to_string())
        .bind(self.rx_bytes.to_string())
        .bind(self.tx_bytes.to_string())
        .bind(to_nanos(self.duration)?)
        .bind(self.max_bytes.to_string())
        .bind(to_nanos(self.max_duration)?)
        .bind(&self.signature)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Persist mutable fields of an existing record.
    pub async fn save<'e, E>(&self, executor: E) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        query(
            "UPDATE session SET rx_bytes = $1, tx_bytes = $2, duration = $3, signature = $4, \
            updated_at = $5 WHERE id = $6",
        )
        .bind(self.rx_bytes.to_string())
        .bind(self.tx_bytes.to_string())
        .bind(to_nanos(self.duration)?)
        .bind(&self.signature)
        .bind(self.updated_at)
        .bind(to_db_id(self.id)?)
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn delete<'e, E>(&self, executor: E) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        query("DELETE FROM session WHERE id = $1")
            .bind(to_db_id(self.id)?)
            .execute(executor)
            .await?;

        Ok(())
    }

    pub async fn find_one<'e, E>(
        executor: E,
        filter: &SessionFilter,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let mut builder = QueryBuilder::new(SELECT_SESSION);
        filter.push_where(&mut builder)?;
        builder.push(" ORDER BY id LIMIT 1");
        builder
            .build_query_as::<Self>()
            .fetch_optional(executor)
            .await
    }

    pub async fn find<'e, E>(executor: E, filter: &SessionFilter) -> Result<Vec<Self>, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let mut builder = QueryBuilder::new(SELECT_SESSION);
        filter.push_where(&mut builder)?;
        builder.push(" ORDER BY id");
        builder.build_query_as::<Self>().fetch_all(executor).await
    }

    pub async fn delete_many<'e, E>(executor: E, filter: &SessionFilter) -> Result<u64, sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let mut builder = QueryBuilder::new("DELETE FROM session");
        filter.push_where(&mut builder)?;
        let result = builder.build().execute(executor).await?;
        Ok(result.rows_affected())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Session {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let service_type: String = row.try_get("service_type")?;
        let rx_bytes: String = row.try_get("rx_bytes")?;
        let tx_bytes: String = row.try_get("tx_bytes")?;
        let duration: i64 = row.try_get("duration")?;
        let max_bytes: String = row.try_get("max_bytes")?;
        let max_duration: i64 = row.try_get("max_duration")?;

        Ok(Self {
            id: u64::try_from(id).map_err(|err| decode_error("id", err))?,
            acc_addr: row.try_get("acc_addr")?,
            node_addr: row.try_get("node_addr")?,
            peer_id: row.try_get("peer_id")?,
            service_type: service_type
                .parse()
                .map_err(|err| decode_error("service_type", err))?,
            rx_bytes: rx_bytes
                .parse()
                .map_err(|err| decode_error("rx_bytes", err))?,
            tx_bytes: tx_bytes
                .parse()
                .map_err(|err| decode_error("tx_bytes", err))?,
            duration: from_nanos(duration).map_err(|err| decode_error("duration", err))?,
            max_bytes: max_bytes
                .parse()
                .map_err(|err| decode_error("max_bytes", err))?,
            max_duration: from_nanos(max_duration)
                .map_err(|err| decode_error("max_duration", err))?,
            signature: row.try_get("signature")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn decode_error<E>(column: &str, err: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    }
}

// SQLite integers are signed 64-bit
fn to_db_id(id: u64) -> Result<i64, sqlx::Error> {
    i64::try_from(id).map_err(|err| sqlx::Error::Encode(Box::new(err)))
}

fn to_nanos(duration: Duration) -> Result<i64, sqlx::Error> {
    i64::try_from(duration.as_nanos()).map_err(|err| sqlx::Error::Encode(Box::new(err)))
}

fn from_nanos(nanos: i64) -> Result<Duration, std::num::TryFromIntError> {
    u64::try_from(nanos).map(Duration::from_nanos)
}
