//! Data retention and rebuilding rollups from raw hits.

use chrono::{Duration, NaiveDate, Utc};
use sqlx::QueryBuilder;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db::{format_date, format_datetime, format_hour, Database, Hit, Site, SiteState};
use crate::error::{Error, Result};
use crate::stats::StatsTable;

/// Every table keyed by `path_id`, raw hits first.
const PATH_TABLES: [&str; 8] = [
    "hits",
    "hit_counts",
    "ref_counts",
    "hit_stats",
    "browser_stats",
    "system_stats",
    "location_stats",
    "size_stats",
];

impl Database {
    /// Remove hits and rollup buckets of `site` from before `days` days ago.
    /// Rollup buckets are only removed once they end before the cutoff.
    pub async fn delete_older_than(&self, site: i64, days: i64) -> Result<()> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut tx = self.pool().begin().await?;

        let deleted = sqlx::query("DELETE FROM hits WHERE site_id = ? AND created_at < ?")
            .bind(site)
            .bind(format_datetime(cutoff))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for table in StatsTable::ALL {
            let bound = match table.time_column() {
                "hour" => format_hour(cutoff),
                _ => format_date(cutoff.date_naive()),
            };
            sqlx::query(&format!(
                "DELETE FROM {} WHERE site_id = ? AND {} < ?",
                table,
                table.time_column()
            ))
            .bind(site)
            .bind(bound)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(site, days, hits = deleted, "Deleted old data");
        Ok(())
    }

    /// Remove the rollup buckets of `days` from `tables`.
    async fn clear_days(&self, site: i64, tables: &[StatsTable], days: &BTreeSet<NaiveDate>) -> Result<()> {
        if days.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        for table in tables {
            for day in days {
                let day = format_date(*day);
                let mut builder = QueryBuilder::new(format!("DELETE FROM {} WHERE site_id = ", table));
                builder.push_bind(site);
                if table.time_column() == "hour" {
                    builder
                        .push(" AND hour >= ")
                        .push_bind(format!("{} 00:00:00", day))
                        .push(" AND hour <= ")
                        .push_bind(format!("{} 23:00:00", day));
                } else {
                    builder.push(" AND day = ").push_bind(day);
                }
                builder.build().execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete all data for the given paths, including the paths themselves.
    pub async fn purge_paths(&self, site: i64, path_ids: &[i64]) -> Result<()> {
        if path_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;
        for table in PATH_TABLES.iter().chain(["paths"].iter()) {
            let mut builder = QueryBuilder::new(format!("DELETE FROM {} WHERE site_id = ", table));
            builder.push_bind(site).push(" AND path_id IN (");
            let mut ids = builder.separated(", ");
            for id in path_ids {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(site, paths = path_ids.len(), "Purged paths");
        Ok(())
    }
}

/// Apply every site's retention setting, deleted sites included. A failing
/// site is logged and the sweep continues.
pub async fn data_retention(db: &Database) -> Result<()> {
    let sites = db.list_sites().await?;
    for site in sites {
        if site.settings.data_retention <= 0 {
            continue;
        }
        let days = i64::from(site.settings.data_retention);
        if let Err(e) = db.delete_older_than(site.id, days).await {
            error!(site = site.id, error = %e, "Data retention failed");
        }
    }
    Ok(())
}

/// Rebuild `tables` (or `"all"`) for the days covered by `hits`.
///
/// The buckets of those days are cleared first and then aggregated without
/// merging, so `hits` must be every hit of those days. Running it twice gives
/// the same rows. Does nothing for inactive sites or an empty batch.
pub async fn reindex(db: &Database, site: &mut Site, hits: &[Hit], tables: &[&str]) -> Result<()> {
    let tables = StatsTable::parse_list(tables)?;
    if site.state != SiteState::Active || hits.is_empty() {
        return Ok(());
    }

    let days: BTreeSet<NaiveDate> = hits.iter().map(|h| h.created_at.date_naive()).collect();
    rebuild(db, site, hits, &tables, &days).await
}

async fn rebuild(
    db: &Database,
    site: &mut Site,
    hits: &[Hit],
    tables: &[StatsTable],
    days: &BTreeSet<NaiveDate>,
) -> Result<()> {
    db.clear_days(site.id, tables, days).await?;
    if hits.is_empty() {
        return Ok(());
    }

    if tables.len() == StatsTable::ALL.len() {
        return db.update_stats(site, hits, true).await;
    }
    for table in tables {
        db.update_table(site.id, *table, hits, true)
            .await
            .map_err(|e| Error::aggregate(site.id, table.name(), e))?;
    }
    Ok(())
}

/// Where a [`Reindexer`] run stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReindexProgress {
    /// Last day fully rebuilt; resume from the day after.
    pub last_day: Option<NaiveDate>,
    pub hits: usize,
    pub cancelled: bool,
}

/// Rebuilds rollups from the `hits` table one UTC day at a time.
pub struct Reindexer {
    db: Database,
    cancel: CancellationToken,
}

impl Reindexer {
    pub fn new(db: Database, cancel: CancellationToken) -> Self {
        Self { db, cancel }
    }

    /// Rebuild `tables` for every day in `[from, to]`. Cancellation is
    /// checked between days; the returned progress says how far it got.
    pub async fn run(&self, site: &mut Site, tables: &[&str], from: NaiveDate, to: NaiveDate) -> Result<ReindexProgress> {
        let tables = StatsTable::parse_list(tables)?;
        let mut progress = ReindexProgress::default();
        if site.state != SiteState::Active {
            return Ok(progress);
        }

        info!(site = site.id, %from, %to, tables = tables.len(), "Starting reindex");
        let mut day = from;
        while day <= to {
            if self.cancel.is_cancelled() {
                progress.cancelled = true;
                info!(site = site.id, last_day = ?progress.last_day, "Reindex cancelled");
                return Ok(progress);
            }

            let start = day.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
            let (Some(start), Some(next)) = (start, day.succ_opt()) else {
                break;
            };
            let hits = self.db.hits_between(site.id, start, start + Duration::days(1)).await?;
            rebuild(&self.db, site, &hits, &tables, &BTreeSet::from([day])).await?;

            debug!(site = site.id, %day, hits = hits.len(), "Reindexed day");
            progress.hits += hits.len();
            progress.last_day = Some(day);
            day = next;
        }

        info!(site = site.id, hits = progress.hits, "Reindex finished");
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{testutil, SiteSettings};

    fn pageview(site: &Site, path: &str, first_visit: bool, created_at: chrono::DateTime<Utc>) -> Hit {
        Hit {
            site: site.id,
            path: path.to_string(),
            first_visit,
            created_at,
            ..Default::default()
        }
    }

    /// Every rollup row as text, sorted.
    async fn snapshot(db: &Database) -> Vec<String> {
        let mut rows = Vec::new();
        for table in StatsTable::ALL {
            let values = match table {
                StatsTable::HitCounts => "hour, path_id, total, total_unique",
                StatsTable::RefCounts => "hour, path_id, ref, ref_scheme, total, total_unique",
                StatsTable::HitStats => "day, path_id, CAST(stats AS TEXT), CAST(stats_unique AS TEXT)",
                StatsTable::BrowserStats => "day, path_id, browser_id, count, count_unique",
                StatsTable::SystemStats => "day, path_id, system_id, count, count_unique",
                StatsTable::LocationStats => "day, path_id, location, count, count_unique",
                StatsTable::SizeStats => "day, path_id, width, count, count_unique",
            };
            let sql = format!(
                "SELECT '{}|' || {} FROM {} ORDER BY 1",
                table,
                values.replace(", ", " || '|' || "),
                table
            );
            let table_rows: Vec<(String,)> = sqlx::query_as(&sql).fetch_all(db.pool()).await.unwrap();
            rows.extend(table_rows.into_iter().map(|(r,)| r));
        }
        rows
    }

    async fn all_hits(db: &Database, site: &Site) -> Vec<Hit> {
        db.list_hits(site.id, 0, 0).await.unwrap().0
    }

    #[tokio::test]
    async fn test_retention_scenario() {
        let settings = SiteSettings {
            data_retention: 30,
            ..Default::default()
        };
        let (db, site) = testutil::setup_with(settings).await;
        let now = Utc::now();
        let past = now - Duration::days(40);

        testutil::store_hits(
            &db,
            vec![
                pageview(&site, "/a", true, now),
                pageview(&site, "/a", false, now),
                pageview(&site, "/a", true, past),
                pageview(&site, "/b", true, past),
            ],
        )
        .await;
        assert_eq!(all_hits(&db, &site).await.len(), 4);

        data_retention(&db).await.unwrap();

        let remaining = all_hits(&db, &site).await;
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|h| h.created_at > past));

        let list = db
            .list(&site, past - Duration::hours(1), now + Duration::hours(1), "", &[], false)
            .await
            .unwrap();
        assert_eq!((list.total, list.total_unique, list.more), (2, 1, false));
    }

    #[tokio::test]
    async fn test_retention_skips_sites_without_setting() {
        let (db, site) = testutil::setup().await;
        let past = Utc::now() - Duration::days(400);
        testutil::store_hits(&db, vec![pageview(&site, "/a", true, past)]).await;

        data_retention(&db).await.unwrap();
        assert_eq!(all_hits(&db, &site).await.len(), 1);
    }

    #[tokio::test]
    async fn test_retention_covers_deleted_sites() {
        let settings = SiteSettings {
            data_retention: 30,
            ..Default::default()
        };
        let (db, mut site) = testutil::setup_with(settings).await;
        let now = Utc::now();
        testutil::store_hits(
            &db,
            vec![
                pageview(&site, "/a", true, now),
                pageview(&site, "/a", true, now - Duration::days(40)),
            ],
        )
        .await;

        db.update_site_state(&mut site, SiteState::Deleted).await.unwrap();
        data_retention(&db).await.unwrap();

        let remaining = all_hits(&db, &site).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(db.count_hits(site.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent() {
        let (db, mut site) = testutil::setup().await;
        let day = testutil::utc(2020, 2, 1, 9, 0);
        testutil::store_hits(
            &db,
            vec![
                Hit {
                    referrer: "https://example.com".to_string(),
                    size: vec![1280.0, 800.0, 1.0],
                    location: "NL".to_string(),
                    ..pageview(&site, "/a", true, day)
                },
                pageview(&site, "/a", false, day + Duration::minutes(30)),
                pageview(&site, "/b", true, day + Duration::hours(20)),
                pageview(&site, "/b", true, day + Duration::days(1)),
            ],
        )
        .await;
        let incremental = snapshot(&db).await;
        assert!(!incremental.is_empty());

        let hits = all_hits(&db, &site).await;
        reindex(&db, &mut site, &hits, &["all"]).await.unwrap();
        let first = snapshot(&db).await;
        reindex(&db, &mut site, &hits, &["all"]).await.unwrap();
        let second = snapshot(&db).await;

        assert_eq!(first, incremental);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_reindex_single_table() {
        let (db, mut site) = testutil::setup().await;
        let day = testutil::utc(2020, 2, 1, 9, 0);
        testutil::store_hits(&db, vec![pageview(&site, "/a", true, day)]).await;
        let before = snapshot(&db).await;

        sqlx::query("UPDATE hit_counts SET total = 99")
            .execute(db.pool())
            .await
            .unwrap();
        let hits = all_hits(&db, &site).await;
        reindex(&db, &mut site, &hits, &["hit_counts"]).await.unwrap();
        assert_eq!(snapshot(&db).await, before);

        assert!(matches!(
            reindex(&db, &mut site, &hits, &["bogus"]).await,
            Err(Error::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn test_reindex_noops() {
        let (db, mut site) = testutil::setup().await;
        let day = testutil::utc(2020, 2, 1, 9, 0);
        testutil::store_hits(&db, vec![pageview(&site, "/a", true, day)]).await;
        let before = snapshot(&db).await;
        let hits = all_hits(&db, &site).await;

        reindex(&db, &mut site, &[], &["all"]).await.unwrap();
        assert_eq!(snapshot(&db).await, before);

        db.update_site_state(&mut site, SiteState::Deleted).await.unwrap();
        sqlx::query("DELETE FROM hit_counts").execute(db.pool()).await.unwrap();
        reindex(&db, &mut site, &hits, &["all"]).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hit_counts")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_reindexer_rebuilds_and_cancels() {
        let (db, mut site) = testutil::setup().await;
        let first = testutil::utc(2020, 2, 1, 9, 0);
        testutil::store_hits(
            &db,
            vec![
                pageview(&site, "/a", true, first),
                pageview(&site, "/a", true, first + Duration::days(1)),
                pageview(&site, "/a", true, first + Duration::days(2)),
            ],
        )
        .await;
        let before = snapshot(&db).await;
        sqlx::query("DELETE FROM hit_stats").execute(db.pool()).await.unwrap();

        let from = first.date_naive();
        let to = from + Duration::days(2);
        let reindexer = Reindexer::new(db.clone(), CancellationToken::new());
        let progress = reindexer.run(&mut site, &["all"], from, to).await.unwrap();
        assert_eq!(
            progress,
            ReindexProgress {
                last_day: Some(to),
                hits: 3,
                cancelled: false
            }
        );
        assert_eq!(snapshot(&db).await, before);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let progress = Reindexer::new(db.clone(), cancel)
            .run(&mut site, &["all"], from, to)
            .await
            .unwrap();
        assert!(progress.cancelled);
        assert_eq!(progress.last_day, None);
    }

    #[tokio::test]
    async fn test_purge_paths() {
        let (db, site) = testutil::setup().await;
        let day = testutil::utc(2020, 2, 1, 9, 0);
        let stored = testutil::store_hits(
            &db,
            vec![pageview(&site, "/a", true, day), pageview(&site, "/b", true, day)],
        )
        .await;

        db.purge_paths(site.id, &[stored[0].path_id]).await.unwrap();

        let hits = all_hits(&db, &site).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/b");
        assert_eq!(db.count_hits(site.id).await.unwrap(), 1);
        assert!(db.path_filter(site.id, "/a", false).await.unwrap().is_empty());
    }
}
