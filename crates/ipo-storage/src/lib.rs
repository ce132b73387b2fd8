//! Offering record store and snapshot cache backends for IPO Watch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use ipo_core::{
    CachePublishError, CacheReadError, CacheSnapshot, Offering, OfferingKey, PersistenceError,
    RawOffering, UpsertOutcome,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub const CRATE_NAME: &str = "ipo-storage";

pub const DEFAULT_CACHE_KEY: &str = "ipo_list";

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Keyed offering table.
///
/// `upsert` must be atomic per `(name, group)`: two concurrent upserts of the same key
/// produce one row and exactly one `was_created = true`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, raw: &RawOffering) -> Result<UpsertOutcome, PersistenceError>;

    /// Every stored record, ordered by observed date then name.
    async fn list_all(&self) -> Result<Vec<Offering>, PersistenceError>;

    /// Administrative wipe. Returns the number of deleted records.
    async fn clear(&self) -> Result<u64, PersistenceError>;
}

/// Single-key snapshot cache with expiry.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    fn key(&self) -> &str;

    /// Overwrites the key and resets its expiry.
    async fn publish_raw(&self, payload: String, ttl: Duration) -> Result<(), CachePublishError>;

    /// Raw payload if present and not expired.
    async fn read_raw(&self) -> Result<Option<String>, CacheReadError>;

    async fn publish(&self, snapshot: &CacheSnapshot, ttl: Duration) -> Result<(), CachePublishError> {
        let payload = snapshot.to_json()?;
        self.publish_raw(payload, ttl).await
    }

    async fn read(&self) -> Result<Option<CacheSnapshot>, CacheReadError> {
        match self.read_raw().await? {
            Some(payload) => Ok(Some(CacheSnapshot::from_json(&payload)?)),
            None => Ok(None),
        }
    }
}

pub type DateSource = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

fn sort_for_listing(records: &mut [Offering]) {
    records.sort_by(|a, b| {
        a.observed_date
            .cmp(&b.observed_date)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.group.cmp(&b.group))
    });
}

/// Process-local record store. One lock covers the whole read-modify-write.
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<OfferingKey, Offering>>,
    today: DateSource,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::with_date_source(Arc::new(today_utc))
    }

    pub fn with_date_source(today: DateSource) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            today,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn get(&self, key: &OfferingKey) -> Option<Offering> {
        self.records.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert(&self, raw: &RawOffering) -> Result<UpsertOutcome, PersistenceError> {
        let mut records = self.records.lock().await;
        let key = raw.key();
        if let Some(existing) = records.get_mut(&key) {
            existing.kind = raw.kind.clone();
            return Ok(UpsertOutcome {
                offering: existing.clone(),
                was_created: false,
            });
        }

        let offering = Offering {
            name: raw.name.clone(),
            kind: raw.kind.clone(),
            group: raw.group.clone(),
            observed_date: (self.today)(),
        };
        records.insert(key, offering.clone());
        Ok(UpsertOutcome {
            offering,
            was_created: true,
        })
    }

    async fn list_all(&self) -> Result<Vec<Offering>, PersistenceError> {
        let mut out = self.records.lock().await.values().cloned().collect::<Vec<_>>();
        sort_for_listing(&mut out);
        Ok(out)
    }

    async fn clear(&self) -> Result<u64, PersistenceError> {
        let mut records = self.records.lock().await;
        let count = records.len() as u64;
        records.clear();
        Ok(count)
    }
}

/// Postgres-backed record store. Upsert is one `INSERT .. ON CONFLICT` statement, so the
/// unique constraint on `(company_name, share_group)` arbitrates concurrent writers.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn offering_from_row(row: &PgRow) -> Result<Offering, sqlx::Error> {
    Ok(Offering {
        name: row.try_get("company_name")?,
        kind: row.try_get("share_type")?,
        group: row.try_get("share_group")?,
        observed_date: row.try_get("issue_date")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert(&self, raw: &RawOffering) -> Result<UpsertOutcome, PersistenceError> {
        // xmax is zero only for a freshly inserted tuple.
        let row = sqlx::query(
            r#"
            INSERT INTO offerings (company_name, share_group, share_type, issue_date)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (company_name, share_group)
            DO UPDATE SET share_type = EXCLUDED.share_type
            RETURNING company_name, share_type, share_group, issue_date,
                      (xmax = 0) AS inserted
            "#,
        )
        .bind(&raw.name)
        .bind(&raw.group)
        .bind(&raw.kind)
        .bind(today_utc())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| PersistenceError::Write(err.to_string()))?;

        let offering = offering_from_row(&row).map_err(|err| PersistenceError::Write(err.to_string()))?;
        let was_created: bool = row
            .try_get("inserted")
            .map_err(|err| PersistenceError::Write(err.to_string()))?;
        debug!(name = %offering.name, group = %offering.group, was_created, "upserted offering");
        Ok(UpsertOutcome {
            offering,
            was_created,
        })
    }

    async fn list_all(&self) -> Result<Vec<Offering>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT company_name, share_type, share_group, issue_date
              FROM offerings
             ORDER BY issue_date, company_name, share_group
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| PersistenceError::Read(err.to_string()))?;

        rows.iter()
            .map(offering_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| PersistenceError::Read(err.to_string()))
    }

    async fn clear(&self) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM offerings")
            .execute(&self.pool)
            .await
            .map_err(|err| PersistenceError::Write(err.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    payload: String,
    expires_at: Instant,
}

/// Process-local snapshot cache. Expiry follows the tokio clock.
pub struct InMemorySnapshotCache {
    key: String,
    entry: Mutex<Option<CachedEntry>>,
}

impl Default for InMemorySnapshotCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_KEY)
    }
}

impl InMemorySnapshotCache {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            entry: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SnapshotCache for InMemorySnapshotCache {
    fn key(&self) -> &str {
        &self.key
    }

    async fn publish_raw(&self, payload: String, ttl: Duration) -> Result<(), CachePublishError> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| CachePublishError::Backend(format!("ttl {ttl:?} overflows the clock")))?;
        let mut entry = self.entry.lock().await;
        *entry = Some(CachedEntry { payload, expires_at });
        Ok(())
    }

    async fn read_raw(&self) -> Result<Option<String>, CacheReadError> {
        let mut entry = self.entry.lock().await;
        match entry.as_ref() {
            Some(cached) if Instant::now() < cached.expires_at => Ok(Some(cached.payload.clone())),
            Some(_) => {
                *entry = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Snapshot cache stored in the `snapshot_cache` table, one row per key.
#[derive(Debug, Clone)]
pub struct PgSnapshotCache {
    pool: PgPool,
    key: String,
}

impl PgSnapshotCache {
    pub fn new(pool: PgPool, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: key.into(),
        }
    }
}

#[async_trait]
impl SnapshotCache for PgSnapshotCache {
    fn key(&self) -> &str {
        &self.key
    }

    async fn publish_raw(&self, payload: String, ttl: Duration) -> Result<(), CachePublishError> {
        sqlx::query(
            r#"
            INSERT INTO snapshot_cache (cache_key, payload, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (cache_key)
            DO UPDATE SET payload = EXCLUDED.payload,
                          expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&self.key)
        .bind(payload)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|err| CachePublishError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn read_raw(&self) -> Result<Option<String>, CacheReadError> {
        let row = sqlx::query(
            r#"
            SELECT payload
              FROM snapshot_cache
             WHERE cache_key = $1
               AND expires_at > NOW()
            "#,
        )
        .bind(&self.key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| CacheReadError::Backend(err.to_string()))?;

        row.map(|r| r.try_get::<String, _>("payload"))
            .transpose()
            .map_err(|err| CacheReadError::Backend(err.to_string()))
    }
}
