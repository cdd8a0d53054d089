//! Day-by-day hour arrays: blank-day filling, timezone shifting and totals.
//!
//! Rollups are bucketed by UTC hour. Queries load whole UTC days and shift
//! them into the site's local time here; see [`apply_offset`].

use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::stats::Hours;

/// Path of the synthetic entry returned by `totals`. Paths are trimmed on
/// ingestion, so the trailing space never collides with a real path.
pub const PATH_TOTALS: &str = "TOTAL ";

/// One local day of a timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub day: NaiveDate,
    pub hourly: Hours,
    pub hourly_unique: Hours,
    pub daily: i64,
    pub daily_unique: i64,
}

impl Stat {
    pub fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            hourly: [0; 24],
            hourly_unique: [0; 24],
            daily: 0,
            daily_unique: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HitStat {
    pub path_id: i64,
    pub path: String,
    pub title: String,
    pub event: bool,
    pub count: i64,
    pub count_unique: i64,
    pub max: i64,
    pub stats: Vec<Stat>,
}

/// One entry per day in `[start, end]`, taking existing entries where present.
/// Does nothing if `start > end`.
pub fn fill_blank_days(stats: &mut Vec<Stat>, start: NaiveDate, end: NaiveDate) {
    if start > end {
        return;
    }

    let mut existing: BTreeMap<NaiveDate, Stat> = stats.drain(..).map(|s| (s.day, s)).collect();
    let mut day = start;
    loop {
        stats.push(existing.remove(&day).unwrap_or_else(|| Stat::empty(day)));
        match day.succ_opt() {
            Some(next) if next <= end => day = next,
            _ => break,
        }
    }
}

/// Shift UTC hour arrays by `offset` hours into local time.
///
/// With a positive offset every day's first hours come from the previous
/// day's last hours, and the first day is dropped because its head lies
/// before the loaded range. A negative offset mirrors this with the next day
/// and drops the last day. `stats` must be consecutive days.
///
/// ```text
/// UTC+2, in:  05 → [.. 4 7 (h11,12) .. 1 (h22) 0]
///             06 → [.. 4 7 (h11,12) .. 1 (h22) 0]
///        out: 06 → [1 (h0) .. 4 7 (h13,14) ..]
/// ```
pub fn apply_offset(stats: &mut Vec<Stat>, offset: i64) {
    if stats.is_empty() {
        return;
    }
    let n = offset.unsigned_abs() as usize;
    if n == 0 || n >= 24 {
        return;
    }

    match offset.cmp(&0) {
        Ordering::Greater => {
            let (mut prev, mut prev_unique) = ([0; 24], [0; 24]);
            for s in stats.iter_mut() {
                let (cur, cur_unique) = (s.hourly, s.hourly_unique);
                for h in 0..24 {
                    if h < n {
                        s.hourly[h] = prev[24 - n + h];
                        s.hourly_unique[h] = prev_unique[24 - n + h];
                    } else {
                        s.hourly[h] = cur[h - n];
                        s.hourly_unique[h] = cur_unique[h - n];
                    }
                }
                prev = cur;
                prev_unique = cur_unique;
            }
            stats.remove(0);
        }
        Ordering::Less => {
            let (mut next, mut next_unique) = ([0; 24], [0; 24]);
            for s in stats.iter_mut().rev() {
                let (cur, cur_unique) = (s.hourly, s.hourly_unique);
                for h in 0..24 {
                    if h + n < 24 {
                        s.hourly[h] = cur[h + n];
                        s.hourly_unique[h] = cur_unique[h + n];
                    } else {
                        s.hourly[h] = next[h + n - 24];
                        s.hourly_unique[h] = next_unique[h + n - 24];
                    }
                }
                next = cur;
                next_unique = cur_unique;
            }
            stats.pop();
        }
        Ordering::Equal => {}
    }
}

/// Fill in daily sums, per-path counts and max, then order by unique count.
/// Returns the total and unique total over all entries.
///
/// The query ranks paths before the offset is applied, so the top entries
/// after shifting can differ slightly from what a local-time ranking would
/// give; the re-sort here only fixes the order within the page.
pub fn add_totals(hits: &mut [HitStat], daily: bool) -> (i64, i64) {
    let (mut total, mut total_unique) = (0, 0);
    for hit in hits.iter_mut() {
        hit.count = 0;
        hit.count_unique = 0;
        hit.max = 0;
        for s in hit.stats.iter_mut() {
            s.daily = s.hourly.iter().sum();
            s.daily_unique = s.hourly_unique.iter().sum();

            let peak = if daily {
                s.daily
            } else {
                s.hourly.iter().copied().max().unwrap_or(0)
            };
            hit.max = hit.max.max(peak);
            hit.count += s.daily;
            hit.count_unique += s.daily_unique;
        }
        total += hit.count;
        total_unique += hit.count_unique;
    }

    hits.sort_by(|a, b| b.count_unique.cmp(&a.count_unique));
    (total, total_unique)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2019, 12, d).unwrap()
    }

    fn stat(d: u32, hours: &[(usize, i64)]) -> Stat {
        let mut s = Stat::empty(day(d));
        for &(h, n) in hours {
            s.hourly[h] = n;
            s.hourly_unique[h] = n;
        }
        s
    }

    #[test]
    fn test_fill_blank_days() {
        let mut stats = vec![stat(6, &[(3, 1)])];
        fill_blank_days(&mut stats, day(5), day(8));
        let days: Vec<_> = stats.iter().map(|s| s.day).collect();
        assert_eq!(days, vec![day(5), day(6), day(7), day(8)]);
        assert_eq!(stats[1].hourly[3], 1);
        assert_eq!(stats[2], Stat::empty(day(7)));
    }

    #[test]
    fn test_fill_blank_days_reversed_range() {
        let mut stats = vec![stat(6, &[(3, 1)])];
        fill_blank_days(&mut stats, day(8), day(5));
        assert_eq!(stats, vec![stat(6, &[(3, 1)])]);

        let mut empty = Vec::new();
        fill_blank_days(&mut empty, day(5), day(5));
        assert_eq!(empty, vec![Stat::empty(day(5))]);
    }

    #[test]
    fn test_apply_positive_offset() {
        let mut stats = vec![
            stat(5, &[(11, 4), (12, 7), (22, 1)]),
            stat(6, &[(11, 4), (12, 7), (22, 1)]),
            stat(7, &[]),
        ];
        apply_offset(&mut stats, 2);

        assert_eq!(stats, vec![stat(6, &[(0, 1), (13, 4), (14, 7)]), stat(7, &[(0, 1)])]);
    }

    #[test]
    fn test_apply_negative_offset() {
        let mut stats = vec![
            stat(4, &[]),
            stat(5, &[(11, 4), (12, 7), (22, 1)]),
            stat(6, &[(1, 3)]),
        ];
        apply_offset(&mut stats, -2);

        assert_eq!(stats, vec![stat(4, &[]), stat(5, &[(9, 4), (10, 7), (20, 1), (23, 3)])]);
    }

    #[test]
    fn test_zero_offset_is_noop() {
        let mut stats = vec![stat(5, &[(1, 1)])];
        apply_offset(&mut stats, 0);
        assert_eq!(stats, vec![stat(5, &[(1, 1)])]);

        let mut empty = Vec::new();
        apply_offset(&mut empty, 5);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_offset_round_trip() {
        let middle: Vec<(usize, i64)> = (0..24).map(|h| (h, h as i64 + 1)).collect();
        for offset in (-12..=12).filter(|o| *o != 0) {
            let mut stats = vec![stat(4, &[(0, 9), (23, 8)]), stat(5, &middle), stat(6, &[(0, 7), (23, 6)])];
            apply_offset(&mut stats, offset);
            apply_offset(&mut stats, -offset);

            assert_eq!(stats.len(), 1, "offset {}", offset);
            assert_eq!(stats[0].day, day(5), "offset {}", offset);
            assert_eq!(stats[0].hourly, stat(5, &middle).hourly, "offset {}", offset);
        }
    }

    #[test]
    fn test_add_totals() {
        let mut hits = vec![
            HitStat {
                path_id: 1,
                stats: vec![stat(5, &[(1, 2)]), stat(6, &[(3, 1)])],
                ..Default::default()
            },
            HitStat {
                path_id: 2,
                stats: vec![stat(5, &[(1, 4), (2, 4)])],
                ..Default::default()
            },
        ];

        assert_eq!(add_totals(&mut hits, false), (11, 11));
        assert_eq!(hits[0].path_id, 2);
        assert_eq!(hits[0].max, 4);
        assert_eq!(hits[1].count, 3);
        assert_eq!(hits[1].stats[0].daily, 2);

        assert_eq!(add_totals(&mut hits, true), (11, 11));
        assert_eq!(hits[0].max, 8);
    }
}
