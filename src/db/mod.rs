//! Database module

mod dimension;
mod hit;
mod schema;
mod session;
mod site;
mod write_buffer;

pub use dimension::{DimensionResolver, Path, UserAgent};
pub use hit::{clean_path, Hit, RefScheme, HIT_COLUMNS};
pub use session::{SessionId, Sessions};
pub use site::{Site, SiteSettings, SiteState};
pub use write_buffer::Memstore;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use dimension::TitleTracker;

/// Format of `day` columns.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Format of `hour` and `created_at` columns.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn format_datetime(t: DateTime<Utc>) -> String {
    t.format(DATETIME_FORMAT).to_string()
}

pub(crate) fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

/// Truncate to the hour, as stored in `hour` columns.
pub(crate) fn format_hour(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:00:00").to_string()
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .map_err(|e| Error::invalid(format!("timestamp {:?}: {}", s, e)))?;
    Ok(Utc.from_utc_datetime(&naive))
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| Error::invalid(format!("date {:?}: {}", s, e)))
}

/// Day and hour-of-day of a stored `hour` value.
pub(crate) fn split_hour(s: &str) -> Result<(NaiveDate, usize)> {
    let t = parse_datetime(s)?;
    Ok((t.date_naive(), t.hour() as usize))
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    titles: Arc<TitleTracker>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            // Negative cache_size is in KiB.
            .pragma("cache_size", format!("-{}", config.cache_size_mb * 1024));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Ok(Self::from_pool(pool))
    }

    /// Private in-memory database on a single connection; used by tests and
    /// one-off tooling.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self::from_pool(pool);
        db.run_migrations().await?;
        Ok(db)
    }

    fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            titles: Arc::new(TitleTracker::new()),
        }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        for statement in schema::MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!(statements = schema::MIGRATIONS.len(), "Schema up to date");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::cron;

    /// Fresh database with one active site using default settings.
    pub async fn setup() -> (Database, Site) {
        setup_with(SiteSettings::default()).await
    }

    pub async fn setup_with(settings: SiteSettings) -> (Database, Site) {
        let db = Database::in_memory().await.unwrap();
        let site = db.create_site("gctest", settings).await.unwrap();
        (db, site)
    }

    /// Push hits through the memstore and aggregate them, the same way the
    /// periodic persist task does.
    pub async fn store_hits(db: &Database, hits: Vec<Hit>) -> Vec<Hit> {
        let memstore = Memstore::with_seed(0x0011223344556677, 0x8899aabbccddef00);
        memstore.append(hits);
        cron::persist_and_stat(db, &memstore).await.unwrap()
    }

    pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_truncation() {
        let t = testutil::utc(2019, 8, 31, 14, 42);
        assert_eq!(format_hour(t), "2019-08-31 14:00:00");
        assert_eq!(format_datetime(t), "2019-08-31 14:42:00");

        let (day, hour) = split_hour("2019-08-31 14:00:00").unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2019, 8, 31).unwrap());
        assert_eq!(hour, 14);
    }

    #[tokio::test]
    async fn test_migrations_are_repeatable() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();

        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE '%_stats'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(row.0, 5);
    }
}
