//! Per-day hourly arrays for each path.

use chrono::Timelike;
use sqlx::QueryBuilder;
use std::collections::BTreeMap;
use tracing::debug;

use super::UPSERT_CHUNK;
use crate::db::{format_date, Database, Hit};
use crate::error::Result;

pub(crate) type Hours = [i64; 24];

/// Decode a stored hour array. Shorter arrays are zero-padded.
pub(crate) fn decode_hours(bytes: &[u8]) -> Result<Hours> {
    let values: Vec<i64> = serde_json::from_slice(bytes)?;
    let mut hours = [0; 24];
    for (slot, v) in hours.iter_mut().zip(values) {
        *slot = v;
    }
    Ok(hours)
}

pub(crate) fn encode_hours(hours: &Hours) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&hours[..])?)
}

type Groups = BTreeMap<(String, i64), (Hours, Hours)>;

fn group(hits: &[Hit]) -> Groups {
    let mut groups = Groups::new();
    for hit in hits.iter().filter(|h| h.bot == 0) {
        let day = format_date(hit.created_at.date_naive());
        let hour = hit.created_at.hour() as usize;
        let (total, unique) = groups.entry((day, hit.path_id)).or_insert(([0; 24], [0; 24]));
        total[hour] += 1;
        if hit.first_visit {
            unique[hour] += 1;
        }
    }
    groups
}

pub(crate) async fn update(db: &Database, site: i64, hits: &[Hit], is_reindex: bool) -> Result<()> {
    let mut groups = group(hits);
    if groups.is_empty() {
        return Ok(());
    }

    let mut tx = db.pool().begin().await?;

    if !is_reindex {
        for ((day, path_id), (total, unique)) in groups.iter_mut() {
            let existing: Option<(Vec<u8>, Vec<u8>)> = sqlx::query_as(
                "SELECT stats, stats_unique FROM hit_stats WHERE site_id = ? AND day = ? AND path_id = ?",
            )
            .bind(site)
            .bind(day.as_str())
            .bind(*path_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((stats, stats_unique)) = existing {
                let (stats, stats_unique) = (decode_hours(&stats)?, decode_hours(&stats_unique)?);
                for h in 0..24 {
                    total[h] += stats[h];
                    unique[h] += stats_unique[h];
                }
            }
        }
    }

    let mut rows = Vec::with_capacity(groups.len());
    for ((day, path_id), (total, unique)) in groups {
        rows.push((day, path_id, encode_hours(&total)?, encode_hours(&unique)?));
    }

    for chunk in rows.chunks(UPSERT_CHUNK) {
        let mut builder = QueryBuilder::new("INSERT INTO hit_stats (site_id, day, path_id, stats, stats_unique) ");
        builder.push_values(chunk, |mut row, (day, path_id, stats, stats_unique)| {
            row.push_bind(site)
                .push_bind(day.clone())
                .push_bind(*path_id)
                .push_bind(stats.clone())
                .push_bind(stats_unique.clone());
        });
        builder.push(
            " ON CONFLICT (site_id, day, path_id) DO UPDATE SET stats = excluded.stats, stats_unique = excluded.stats_unique",
        );
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    debug!(site, table = "hit_stats", rows = rows.len(), is_reindex, "Updated rollup");
    Ok(())
}
