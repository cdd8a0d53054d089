//! Dashboard queries over the rollup tables.
//!
//! Ranges are given as UTC timestamps and interpreted as the local calendar
//! days they fall on for the site's timezone offset. Results are shifted
//! into local time before they are returned.

mod timeline;

pub use timeline::{add_totals, apply_offset, fill_blank_days, HitStat, Stat, PATH_TOTALS};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::{BTreeMap, HashMap};

use crate::db::{format_date, format_hour, split_hour, Database, Site};
use crate::error::Result;
use crate::stats::decode_hours;

/// Lowest `max` returned, so charts for quiet sites keep a sane scale.
const MIN_MAX: i64 = 10;

/// Top paths for a time range.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HitList {
    pub stats: Vec<HitStat>,
    pub total: i64,
    pub total_unique: i64,
    /// Largest per-path max on this page, for chart scaling; at least 10.
    pub max: i64,
    pub more: bool,
}

impl HitList {
    fn empty() -> Self {
        Self {
            max: MIN_MAX,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct PathCount {
    pub path: String,
    pub title: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct RefStat {
    pub name: String,
    pub count: i64,
    pub count_unique: i64,
}

/// Local days covered by a query and the UTC days that must be loaded to
/// build them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    offset: i64,
    first: NaiveDate,
    last: NaiveDate,
    load_first: NaiveDate,
    load_last: NaiveDate,
}

impl Window {
    fn new(site: &Site, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        if start > end {
            return None;
        }
        let offset = site.settings.offset_hours();
        let first = (start + Duration::hours(offset)).date_naive();
        let last = (end + Duration::hours(offset)).date_naive();

        let load_first = if offset > 0 { first.pred_opt()? } else { first };
        let load_last = if offset < 0 { last.succ_opt()? } else { last };
        Some(Self {
            offset,
            first,
            last,
            load_first,
            load_last,
        })
    }

    /// First and last stored hour keys of the loaded UTC days.
    fn hours(&self) -> (String, String) {
        (
            format!("{} 00:00:00", format_date(self.load_first)),
            format!("{} 23:00:00", format_date(self.load_last)),
        )
    }

    /// UTC hour keys of exactly the local days.
    fn local_hours(&self) -> (String, String) {
        let start = self.first.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        let end = self.last.and_hms_opt(23, 0, 0).map(|t| t.and_utc());
        match (start, end) {
            (Some(start), Some(end)) => (
                format_hour(start - Duration::hours(self.offset)),
                format_hour(end - Duration::hours(self.offset)),
            ),
            _ => self.hours(),
        }
    }

    /// Turn loaded UTC days into local days.
    fn localize(&self, stats: &mut Vec<Stat>) {
        fill_blank_days(stats, self.load_first, self.load_last);
        apply_offset(stats, self.offset);
    }
}

fn like_pattern(filter: &str) -> Option<String> {
    if filter.is_empty() {
        None
    } else {
        Some(format!("%{}%", filter.to_lowercase()))
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &Option<String>) {
    if let Some(like) = filter {
        builder
            .push(" AND (lower(paths.path) LIKE ")
            .push_bind(like.clone())
            .push(" OR lower(paths.title) LIKE ")
            .push_bind(like.clone())
            .push(")");
    }
}

fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

#[derive(sqlx::FromRow)]
struct RankedPath {
    path_id: i64,
    path: String,
    title: String,
    event: bool,
}

impl Database {
    /// Top paths by unique visits between `start` and `end`, one page of
    /// `page_limit` entries, skipping `exclude`.
    pub async fn list(
        &self,
        site: &Site,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &str,
        exclude: &[i64],
        daily: bool,
    ) -> Result<HitList> {
        let Some(window) = Window::new(site, start, end) else {
            return Ok(HitList::empty());
        };
        // Rank over the local days only; the extra loaded day is just for shifting.
        let (hour_start, hour_end) = window.local_hours();
        let filter = like_pattern(filter);
        let limit = site.settings.page_limit.max(1);

        let mut builder = QueryBuilder::new(
            "SELECT hit_counts.path_id, paths.path, paths.title, paths.event \
             FROM hit_counts JOIN paths USING (path_id) WHERE hit_counts.site_id = ",
        );
        builder
            .push_bind(site.id)
            .push(" AND hit_counts.hour >= ")
            .push_bind(hour_start)
            .push(" AND hit_counts.hour <= ")
            .push_bind(hour_end);
        if !exclude.is_empty() {
            builder.push(" AND hit_counts.path_id NOT IN ");
            push_id_list(&mut builder, exclude);
        }
        push_filter(&mut builder, &filter);
        builder
            .push(" GROUP BY hit_counts.path_id ORDER BY sum(hit_counts.total_unique) DESC, hit_counts.path_id DESC LIMIT ")
            .push_bind(limit + 1);

        let mut ranked: Vec<RankedPath> = builder.build_query_as().fetch_all(self.pool()).await?;
        let more = ranked.len() as i64 > limit;
        ranked.truncate(limit as usize);
        if ranked.is_empty() {
            return Ok(HitList::empty());
        }

        let ids: Vec<i64> = ranked.iter().map(|p| p.path_id).collect();
        let mut builder = QueryBuilder::new(
            "SELECT path_id, day, stats, stats_unique FROM hit_stats WHERE site_id = ",
        );
        builder
            .push_bind(site.id)
            .push(" AND day >= ")
            .push_bind(format_date(window.load_first))
            .push(" AND day <= ")
            .push_bind(format_date(window.load_last))
            .push(" AND path_id IN ");
        push_id_list(&mut builder, &ids);
        builder.push(" ORDER BY day");

        let rows: Vec<(i64, String, Vec<u8>, Vec<u8>)> = builder.build_query_as().fetch_all(self.pool()).await?;
        let mut days: HashMap<i64, Vec<Stat>> = HashMap::new();
        for (path_id, day, stats, stats_unique) in rows {
            let mut stat = Stat::empty(crate::db::parse_date(&day)?);
            stat.hourly = decode_hours(&stats)?;
            stat.hourly_unique = decode_hours(&stats_unique)?;
            days.entry(path_id).or_default().push(stat);
        }

        let mut stats: Vec<HitStat> = ranked
            .into_iter()
            .map(|p| {
                let mut stats = days.remove(&p.path_id).unwrap_or_default();
                window.localize(&mut stats);
                HitStat {
                    path_id: p.path_id,
                    path: p.path,
                    title: p.title,
                    event: p.event,
                    stats,
                    ..Default::default()
                }
            })
            .collect();

        let (total, total_unique) = add_totals(&mut stats, daily);
        let max = stats.iter().map(|s| s.max).max().unwrap_or(0).max(MIN_MAX);
        Ok(HitList {
            stats,
            total,
            total_unique,
            max,
            more,
        })
    }

    /// All paths combined into one [`PATH_TOTALS`] entry, and the chart
    /// maximum.
    pub async fn totals(
        &self,
        site: &Site,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &str,
        daily: bool,
    ) -> Result<(HitStat, i64)> {
        let mut total = HitStat {
            path: PATH_TOTALS.to_string(),
            ..Default::default()
        };
        let Some(window) = Window::new(site, start, end) else {
            return Ok((total, MIN_MAX));
        };
        let (hour_start, hour_end) = window.hours();
        let filter = like_pattern(filter);

        let mut builder = QueryBuilder::new(
            "SELECT hit_counts.hour, hit_counts.total, hit_counts.total_unique \
             FROM hit_counts JOIN paths USING (path_id) WHERE hit_counts.site_id = ",
        );
        builder
            .push_bind(site.id)
            .push(" AND hit_counts.hour >= ")
            .push_bind(hour_start)
            .push(" AND hit_counts.hour <= ")
            .push_bind(hour_end);
        push_filter(&mut builder, &filter);
        builder.push(" ORDER BY hit_counts.hour");

        let rows: Vec<(String, i64, i64)> = builder.build_query_as().fetch_all(self.pool()).await?;
        let mut days: BTreeMap<NaiveDate, Stat> = BTreeMap::new();
        for (hour, count, unique) in rows {
            let (day, h) = split_hour(&hour)?;
            let stat = days.entry(day).or_insert_with(|| Stat::empty(day));
            stat.hourly[h] += count;
            stat.hourly_unique[h] += unique;
        }

        total.stats = days.into_values().collect();
        window.localize(&mut total.stats);
        let mut entries = [total];
        add_totals(&mut entries, daily);
        let [total] = entries;

        let max = total.max.max(MIN_MAX);
        Ok((total, max))
    }

    /// Total and unique pageviews over the local days of the range.
    pub async fn total_count(
        &self,
        site: &Site,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &str,
    ) -> Result<(i64, i64)> {
        let Some(window) = Window::new(site, start, end) else {
            return Ok((0, 0));
        };
        let (hour_start, hour_end) = window.local_hours();
        self.sum_hit_counts(site.id, &hour_start, &hour_end, filter).await
    }

    /// Total and unique pageviews over the exact UTC hours of the range.
    pub async fn total_count_utc(
        &self,
        site: &Site,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &str,
    ) -> Result<(i64, i64)> {
        if start > end {
            return Ok((0, 0));
        }
        self.sum_hit_counts(site.id, &format_hour(start), &format_hour(end), filter)
            .await
    }

    async fn sum_hit_counts(&self, site: i64, hour_start: &str, hour_end: &str, filter: &str) -> Result<(i64, i64)> {
        let filter = like_pattern(filter);
        let mut builder = QueryBuilder::new(
            "SELECT COALESCE(SUM(hit_counts.total), 0), COALESCE(SUM(hit_counts.total_unique), 0) \
             FROM hit_counts JOIN paths USING (path_id) WHERE hit_counts.site_id = ",
        );
        builder
            .push_bind(site)
            .push(" AND hit_counts.hour >= ")
            .push_bind(hour_start.to_string())
            .push(" AND hit_counts.hour <= ")
            .push_bind(hour_end.to_string());
        push_filter(&mut builder, &filter);

        let row: (i64, i64) = builder.build_query_as().fetch_one(self.pool()).await?;
        Ok(row)
    }

    /// Highest hourly (or, with `daily`, local-day) count of any single path.
    pub async fn max(
        &self,
        site: &Site,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &str,
        daily: bool,
    ) -> Result<i64> {
        let Some(window) = Window::new(site, start, end) else {
            return Ok(MIN_MAX);
        };
        let (hour_start, hour_end) = window.local_hours();
        let filter = like_pattern(filter);

        let mut builder = if daily {
            QueryBuilder::new("SELECT COALESCE(SUM(hit_counts.total), 0) AS t")
        } else {
            QueryBuilder::new("SELECT COALESCE(MAX(hit_counts.total), 0) AS t")
        };
        builder
            .push(" FROM hit_counts JOIN paths USING (path_id) WHERE hit_counts.site_id = ")
            .push_bind(site.id)
            .push(" AND hit_counts.hour >= ")
            .push_bind(hour_start)
            .push(" AND hit_counts.hour <= ")
            .push_bind(hour_end);
        push_filter(&mut builder, &filter);
        if daily {
            builder
                .push(" GROUP BY hit_counts.path_id, date(hit_counts.hour, ")
                .push_bind(format!("{:+} hours", window.offset))
                .push(") ORDER BY t DESC LIMIT 1");
        }

        let max: Option<(i64,)> = builder.build_query_as().fetch_optional(self.pool()).await?;
        Ok(max.map(|(m,)| m).unwrap_or(0).max(MIN_MAX))
    }

    /// Paths (or titles, if `match_title`) containing `search`, with their
    /// all-time pageviews, most viewed first.
    pub async fn list_paths_like(&self, site: i64, search: &str, match_title: bool) -> Result<Vec<PathCount>> {
        let like = format!("%{}%", search.to_lowercase());
        let query = if match_title {
            "SELECT paths.path, paths.title, SUM(hit_counts.total) AS count \
             FROM hit_counts JOIN paths USING (path_id) \
             WHERE hit_counts.site_id = ?1 AND (lower(paths.path) LIKE ?2 OR lower(paths.title) LIKE ?2) \
             GROUP BY paths.path, paths.title ORDER BY count DESC"
        } else {
            "SELECT paths.path, paths.title, SUM(hit_counts.total) AS count \
             FROM hit_counts JOIN paths USING (path_id) \
             WHERE hit_counts.site_id = ?1 AND lower(paths.path) LIKE ?2 \
             GROUP BY paths.path, paths.title ORDER BY count DESC"
        };
        let paths = sqlx::query_as(query)
            .bind(site)
            .bind(like)
            .fetch_all(self.pool())
            .await?;
        Ok(paths)
    }

    /// Top ten paths visited from `referrer`, optionally limited to
    /// `path_ids`.
    pub async fn by_ref(
        &self,
        site: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        path_ids: &[i64],
        referrer: &str,
    ) -> Result<Vec<RefStat>> {
        let mut builder = QueryBuilder::new(
            "SELECT paths.path AS name, SUM(ref_counts.total) AS count, SUM(ref_counts.total_unique) AS count_unique \
             FROM ref_counts JOIN paths USING (path_id) WHERE ref_counts.site_id = ",
        );
        builder
            .push_bind(site)
            .push(" AND ref_counts.hour >= ")
            .push_bind(format_hour(start))
            .push(" AND ref_counts.hour <= ")
            .push_bind(format_hour(end))
            .push(" AND ref_counts.ref = ")
            .push_bind(referrer.to_string());
        if !path_ids.is_empty() {
            builder.push(" AND ref_counts.path_id IN ");
            push_id_list(&mut builder, path_ids);
        }
        builder.push(" GROUP BY ref_counts.path_id ORDER BY count DESC, ref_counts.path_id DESC LIMIT 10");

        let stats = builder.build_query_as().fetch_all(self.pool()).await?;
        Ok(stats)
    }
}
