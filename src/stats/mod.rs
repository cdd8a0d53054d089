//! Rollup aggregation.
//!
//! Every persisted batch is folded into seven rollup tables, always in the
//! same order. Each table is updated in its own transaction: a failure stops
//! the remaining tables for that batch but leaves earlier ones committed.

mod counts;
mod hit_stats;

pub(crate) use hit_stats::{decode_hours, Hours};

use std::fmt;
use std::str::FromStr;

use crate::db::{Database, Hit, Site};
use crate::error::{Error, Result};

/// Rows per upsert statement.
const UPSERT_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsTable {
    HitCounts,
    RefCounts,
    HitStats,
    BrowserStats,
    SystemStats,
    LocationStats,
    SizeStats,
}

impl StatsTable {
    /// All tables in aggregation order.
    pub const ALL: [StatsTable; 7] = [
        Self::HitCounts,
        Self::RefCounts,
        Self::HitStats,
        Self::BrowserStats,
        Self::SystemStats,
        Self::LocationStats,
        Self::SizeStats,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::HitCounts => "hit_counts",
            Self::RefCounts => "ref_counts",
            Self::HitStats => "hit_stats",
            Self::BrowserStats => "browser_stats",
            Self::SystemStats => "system_stats",
            Self::LocationStats => "location_stats",
            Self::SizeStats => "size_stats",
        }
    }

    /// Name of the time-bucket column.
    pub fn time_column(&self) -> &'static str {
        match self {
            Self::HitCounts | Self::RefCounts => "hour",
            _ => "day",
        }
    }

    /// Parse table names; `"all"` expands to every table. Duplicates are
    /// dropped and the result is in aggregation order.
    pub fn parse_list(names: &[&str]) -> Result<Vec<StatsTable>> {
        let mut wanted = Vec::new();
        for name in names {
            if name.trim() == "all" {
                return Ok(Self::ALL.to_vec());
            }
            wanted.push(name.parse::<StatsTable>()?);
        }
        Ok(Self::ALL.into_iter().filter(|t| wanted.contains(t)).collect())
    }
}

impl fmt::Display for StatsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StatsTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| Error::UnknownTable(s.to_string()))
    }
}

impl Database {
    /// Fold a batch of persisted hits for one site into every rollup.
    pub async fn update_stats(&self, site: &mut Site, hits: &[Hit], is_reindex: bool) -> Result<()> {
        for table in StatsTable::ALL {
            self.update_table(site.id, table, hits, is_reindex)
                .await
                .map_err(|e| Error::aggregate(site.id, table.name(), e))?;
        }

        if !site.received_data && !hits.is_empty() {
            self.update_received_data(site).await?;
        }
        Ok(())
    }

    /// Fold a batch into a single rollup table.
    pub async fn update_table(&self, site: i64, table: StatsTable, hits: &[Hit], is_reindex: bool) -> Result<()> {
        match table {
            StatsTable::HitCounts => counts::HIT_COUNTS.update(self, site, hits, is_reindex).await,
            StatsTable::RefCounts => counts::REF_COUNTS.update(self, site, hits, is_reindex).await,
            StatsTable::HitStats => hit_stats::update(self, site, hits, is_reindex).await,
            StatsTable::BrowserStats => counts::BROWSER_STATS.update(self, site, hits, is_reindex).await,
            StatsTable::SystemStats => counts::SYSTEM_STATS.update(self, site, hits, is_reindex).await,
            StatsTable::LocationStats => counts::LOCATION_STATS.update(self, site, hits, is_reindex).await,
            StatsTable::SizeStats => counts::SIZE_STATS.update(self, site, hits, is_reindex).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil;

    #[test]
    fn test_parse_list() {
        assert_eq!(StatsTable::parse_list(&["all"]).unwrap(), StatsTable::ALL.to_vec());
        assert_eq!(
            StatsTable::parse_list(&["size_stats", "hit_counts", "size_stats"]).unwrap(),
            vec![StatsTable::HitCounts, StatsTable::SizeStats]
        );
        assert!(matches!(
            StatsTable::parse_list(&["hit_counts", "nope"]),
            Err(Error::UnknownTable(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn test_update_stats_sets_received_data() {
        let (db, mut site) = testutil::setup().await;
        assert!(!site.received_data);

        let mut hit = Hit {
            path: "/x".to_string(),
            first_visit: true,
            created_at: testutil::utc(2020, 1, 1, 0, 0),
            ..Default::default()
        };
        hit.defaults(&db, &site).await.unwrap();

        db.update_stats(&mut site, &[hit], false).await.unwrap();
        assert!(site.received_data);
        assert!(db.site_by_id(site.id).await.unwrap().received_data);

        for table in StatsTable::ALL {
            let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(db.pool())
                .await
                .unwrap();
            assert_eq!(row.0, 1, "{}", table);
        }
    }

    #[tokio::test]
    async fn test_aggregate_errors_name_the_table() {
        let (db, mut site) = testutil::setup().await;
        sqlx::query("DROP TABLE ref_counts").execute(db.pool()).await.unwrap();

        let hit = Hit {
            site: site.id,
            path_id: 1,
            user_agent_id: 1,
            created_at: testutil::utc(2020, 1, 1, 0, 0),
            ..Default::default()
        };
        let err = db.update_stats(&mut site, &[hit], false).await.unwrap_err();
        assert!(matches!(err, Error::Aggregate { table: "ref_counts", .. }));
        assert!(!site.received_data);

        // hit_counts ran first and kept its rows.
        assert_eq!(db.count_hits(site.id).await.unwrap(), 1);
    }
}
