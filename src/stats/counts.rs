//! Rollups that keep a (count, unique) pair per bucket and dimension key.
//!
//! Six of the seven rollup tables share this shape and differ only in their
//! time bucket and key columns, so each is described by a [`CountTable`].

use sqlx::QueryBuilder;
use std::collections::BTreeMap;
use tracing::debug;

use super::UPSERT_CHUNK;
use crate::db::{format_date, format_hour, Database, Hit};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bucket {
    Hour,
    Day,
}

impl Bucket {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    fn key(&self, hit: &Hit) -> String {
        match self {
            Self::Hour => format_hour(hit.created_at),
            Self::Day => format_date(hit.created_at.date_naive()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum KeyPart {
    Int(i64),
    Text(String),
}

pub(crate) struct CountTable {
    pub name: &'static str,
    pub bucket: Bucket,
    pub key_columns: &'static [&'static str],
    pub count_columns: [&'static str; 2],
    key: fn(&Hit) -> Vec<KeyPart>,
}

fn path_key(hit: &Hit) -> Vec<KeyPart> {
    vec![KeyPart::Int(hit.path_id)]
}

fn ref_key(hit: &Hit) -> Vec<KeyPart> {
    vec![
        KeyPart::Int(hit.path_id),
        KeyPart::Text(hit.referrer.clone()),
        KeyPart::Text(hit.ref_scheme.map(|s| s.as_str()).unwrap_or_default().to_string()),
    ]
}

fn browser_key(hit: &Hit) -> Vec<KeyPart> {
    vec![KeyPart::Int(hit.path_id), KeyPart::Int(hit.browser_id)]
}

fn system_key(hit: &Hit) -> Vec<KeyPart> {
    vec![KeyPart::Int(hit.path_id), KeyPart::Int(hit.system_id)]
}

fn location_key(hit: &Hit) -> Vec<KeyPart> {
    vec![KeyPart::Int(hit.path_id), KeyPart::Text(hit.location.clone())]
}

fn size_key(hit: &Hit) -> Vec<KeyPart> {
    vec![KeyPart::Int(hit.path_id), KeyPart::Int(hit.width())]
}

pub(crate) const HIT_COUNTS: CountTable = CountTable {
    name: "hit_counts",
    bucket: Bucket::Hour,
    key_columns: &["path_id"],
    count_columns: ["total", "total_unique"],
    key: path_key,
};

pub(crate) const REF_COUNTS: CountTable = CountTable {
    name: "ref_counts",
    bucket: Bucket::Hour,
    key_columns: &["path_id", "ref", "ref_scheme"],
    count_columns: ["total", "total_unique"],
    key: ref_key,
};

pub(crate) const BROWSER_STATS: CountTable = CountTable {
    name: "browser_stats",
    bucket: Bucket::Day,
    key_columns: &["path_id", "browser_id"],
    count_columns: ["count", "count_unique"],
    key: browser_key,
};

pub(crate) const SYSTEM_STATS: CountTable = CountTable {
    name: "system_stats",
    bucket: Bucket::Day,
    key_columns: &["path_id", "system_id"],
    count_columns: ["count", "count_unique"],
    key: system_key,
};

pub(crate) const LOCATION_STATS: CountTable = CountTable {
    name: "location_stats",
    bucket: Bucket::Day,
    key_columns: &["path_id", "location"],
    count_columns: ["count", "count_unique"],
    key: location_key,
};

pub(crate) const SIZE_STATS: CountTable = CountTable {
    name: "size_stats",
    bucket: Bucket::Day,
    key_columns: &["path_id", "width"],
    count_columns: ["count", "count_unique"],
    key: size_key,
};

type Groups = BTreeMap<(String, Vec<KeyPart>), (i64, i64)>;

impl CountTable {
    /// Count non-bot hits per (bucket, key).
    fn group(&self, hits: &[Hit]) -> Groups {
        let mut groups = Groups::new();
        for hit in hits.iter().filter(|h| h.bot == 0) {
            let counts = groups
                .entry((self.bucket.key(hit), (self.key)(hit)))
                .or_default();
            counts.0 += 1;
            if hit.first_visit {
                counts.1 += 1;
            }
        }
        groups
    }

    /// Fold `hits` into the table. Unless reindexing, existing rows are read
    /// and added to before being written back.
    pub(crate) async fn update(&self, db: &Database, site: i64, hits: &[Hit], is_reindex: bool) -> Result<()> {
        let mut groups = self.group(hits);
        if groups.is_empty() {
            return Ok(());
        }

        let [count_col, unique_col] = self.count_columns;
        let mut tx = db.pool().begin().await?;

        if !is_reindex {
            let select = format!(
                "SELECT {}, {} FROM {} WHERE site_id = ? AND {} = ? AND {}",
                count_col,
                unique_col,
                self.name,
                self.bucket.column(),
                self.key_columns
                    .iter()
                    .map(|c| format!("{} = ?", c))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            );
            for ((bucket, key), counts) in groups.iter_mut() {
                let mut query = sqlx::query_as::<_, (i64, i64)>(&select).bind(site).bind(bucket.as_str());
                for part in key.iter() {
                    query = match part {
                        KeyPart::Int(i) => query.bind(*i),
                        KeyPart::Text(s) => query.bind(s.as_str()),
                    };
                }
                if let Some((count, unique)) = query.fetch_optional(&mut *tx).await? {
                    counts.0 += count;
                    counts.1 += unique;
                }
            }
        }

        let conflict = format!(
            " ON CONFLICT (site_id, {}, {}) DO UPDATE SET {c} = excluded.{c}, {u} = excluded.{u}",
            self.bucket.column(),
            self.key_columns.join(", "),
            c = count_col,
            u = unique_col,
        );
        let rows: Vec<_> = groups.into_iter().collect();
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut builder = QueryBuilder::new(format!(
                "INSERT INTO {} (site_id, {}, {}, {}, {}) ",
                self.name,
                self.bucket.column(),
                self.key_columns.join(", "),
                count_col,
                unique_col,
            ));
            builder.push_values(chunk, |mut row, ((bucket, key), (count, unique))| {
                row.push_bind(site).push_bind(bucket.clone());
                for part in key {
                    match part {
                        KeyPart::Int(i) => {
                            row.push_bind(*i);
                        }
                        KeyPart::Text(s) => {
                            row.push_bind(s.clone());
                        }
                    }
                }
                row.push_bind(*count).push_bind(*unique);
            });
            builder.push(&conflict);
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(site, table = self.name, rows = rows.len(), is_reindex, "Updated rollup");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{testutil, RefScheme};

    fn stored(path_id: i64, first_visit: bool) -> Hit {
        Hit {
            site: 1,
            path_id,
            user_agent_id: 1,
            browser_id: 3,
            system_id: 4,
            first_visit,
            created_at: testutil::utc(2020, 1, 1, 10, 15),
            ..Default::default()
        }
    }

    #[test]
    fn test_group_skips_bots() {
        let hits = vec![
            stored(1, true),
            stored(1, false),
            Hit { bot: 3, ..stored(1, true) },
            stored(2, false),
        ];
        let groups = HIT_COUNTS.group(&hits);
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[&("2020-01-01 10:00:00".to_string(), vec![KeyPart::Int(1)])],
            (2, 1)
        );
    }

    #[test]
    fn test_ref_key() {
        let hit = Hit {
            referrer: "example.com".to_string(),
            ref_scheme: Some(RefScheme::Http),
            ..stored(1, true)
        };
        assert_eq!(
            ref_key(&hit),
            vec![
                KeyPart::Int(1),
                KeyPart::Text("example.com".to_string()),
                KeyPart::Text("h".to_string())
            ]
        );
        assert_eq!(ref_key(&stored(1, true))[2], KeyPart::Text(String::new()));
    }

    #[tokio::test]
    async fn test_merge_and_reindex() {
        let db = Database::in_memory().await.unwrap();
        let batch = vec![stored(1, true), stored(1, false)];

        BROWSER_STATS.update(&db, 1, &batch, false).await.unwrap();
        BROWSER_STATS.update(&db, 1, &batch, false).await.unwrap();

        let row: (i64, i64) = sqlx::query_as(
            "SELECT count, count_unique FROM browser_stats WHERE site_id = 1 AND day = '2020-01-01' AND browser_id = 3",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(row, (4, 2));

        // Reindex mode writes the batch as-is over the existing row.
        BROWSER_STATS.update(&db, 1, &batch, true).await.unwrap();
        let row: (i64, i64) = sqlx::query_as("SELECT count, count_unique FROM browser_stats")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row, (2, 1));
    }

    #[tokio::test]
    async fn test_size_stats_width() {
        let db = Database::in_memory().await.unwrap();
        let batch = vec![
            Hit { size: vec![1920.0, 1080.0, 2.0], ..stored(1, true) },
            Hit { size: vec![1920.0, 1200.0, 1.0], ..stored(1, false) },
            stored(1, true),
        ];
        SIZE_STATS.update(&db, 1, &batch, false).await.unwrap();

        let rows: Vec<(i64, i64, i64)> =
            sqlx::query_as("SELECT width, count, count_unique FROM size_stats ORDER BY width")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert_eq!(rows, vec![(0, 1, 1), (1920, 2, 1)]);
    }
}
