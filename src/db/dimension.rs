//! Path and user-agent dimensions.
//!
//! Both are get-or-insert lookups guarded by unique indexes: the insert uses
//! `ON CONFLICT DO NOTHING` and the row is selected afterwards, so two
//! concurrent first inserts of the same key resolve to the same ID.

use async_trait::async_trait;
use cached::{Cached, TimedCache};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, error};
use validator::Validate;
use woothee::parser::Parser;

use super::Database;
use crate::error::Result;

/// How long observed title changes are remembered.
const TITLE_CHANGES_TTL_SECS: u64 = 48 * 3600;

/// A new title must be seen more often than this before it replaces the
/// stored one.
const TITLE_CHANGE_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow, Validate)]
pub struct Path {
    #[sqlx(rename = "path_id")]
    pub id: i64,
    #[sqlx(rename = "site_id")]
    pub site: i64,
    #[validate(length(min = 1, max = 2048))]
    pub path: String,
    #[validate(length(max = 1024))]
    pub title: String,
    pub event: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct UserAgent {
    #[sqlx(rename = "user_agent_id")]
    pub id: i64,
    pub user_agent: String,
    pub browser_id: i64,
    pub system_id: i64,
    pub bot: bool,
}

/// Resolves raw dimension values to stable IDs.
#[async_trait]
pub trait DimensionResolver: Send + Sync {
    async fn path(&self, site: i64, path: &str, title: &str, event: bool) -> Result<Path>;
    async fn user_agent(&self, user_agent: &str) -> Result<UserAgent>;
}

/// Titles seen for existing paths that differ from the stored title.
pub(crate) struct TitleTracker {
    changed: Mutex<TimedCache<i64, Vec<String>>>,
}

impl TitleTracker {
    pub(crate) fn new() -> Self {
        Self {
            changed: Mutex::new(TimedCache::with_lifespan(TITLE_CHANGES_TTL_SECS)),
        }
    }

    /// Record a changed title; returns the title to store once one has been
    /// seen often enough.
    pub(crate) fn record(&self, path_id: i64, title: &str) -> Option<String> {
        let mut changed = self.changed.lock();
        let titles = changed.cache_get_or_set_with(path_id, Vec::new);
        titles.push(title.to_string());

        let mut grouped: HashMap<&str, usize> = HashMap::new();
        for t in titles.iter() {
            *grouped.entry(t.as_str()).or_default() += 1;
        }
        let winner = grouped
            .into_iter()
            .find(|(_, n)| *n > TITLE_CHANGE_THRESHOLD)
            .map(|(t, _)| t.to_string())?;

        changed.cache_remove(&path_id);
        Some(winner)
    }
}

impl Database {
    async fn select_path(&self, site: i64, path: &str) -> Result<Option<Path>> {
        let row = sqlx::query_as::<_, Path>(
            "SELECT path_id, site_id, path, title, event FROM paths WHERE site_id = ? AND lower(path) = lower(?) LIMIT 1",
        )
        .bind(site)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_title(&self, current: &Path, title: &str) -> Result<()> {
        if title.is_empty() || current.title == title {
            return Ok(());
        }
        if let Some(new_title) = self.titles.record(current.id, title) {
            debug!(path_id = current.id, title = %new_title, "Updating path title");
            sqlx::query("UPDATE paths SET title = ? WHERE path_id = ?")
                .bind(new_title)
                .bind(current.id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Get or insert a (name, version) row in `browsers` or `systems`.
    async fn named_dimension(&self, table: &'static str, name: &str, version: &str) -> Result<i64> {
        let id_column = match table {
            "browsers" => "browser_id",
            _ => "system_id",
        };

        sqlx::query(&format!(
            "INSERT INTO {} (name, version) VALUES (?, ?) ON CONFLICT DO NOTHING",
            table
        ))
        .bind(name)
        .bind(version)
        .execute(&self.pool)
        .await?;

        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE name = ? AND version = ?",
            id_column, table
        ))
        .bind(name)
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// IDs of paths whose path (or title, if `match_title`) contains `filter`.
    pub async fn path_filter(&self, site: i64, filter: &str, match_title: bool) -> Result<Vec<i64>> {
        let like = format!("%{}%", filter.to_lowercase());
        let query = if match_title {
            "SELECT path_id FROM paths WHERE site_id = ?1 AND (lower(path) LIKE ?2 OR lower(title) LIKE ?2)"
        } else {
            "SELECT path_id FROM paths WHERE site_id = ?1 AND lower(path) LIKE ?2"
        };
        let ids: Vec<(i64,)> = sqlx::query_as(query)
            .bind(site)
            .bind(like)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl DimensionResolver for Database {
    async fn path(&self, site: i64, path: &str, title: &str, event: bool) -> Result<Path> {
        let candidate = Path {
            id: 0,
            site,
            path: path.to_string(),
            title: title.to_string(),
            event,
        };
        candidate.validate()?;

        if let Some(existing) = self.select_path(site, path).await? {
            if let Err(e) = self.update_title(&existing, title).await {
                error!(path_id = existing.id, title = title, error = %e, "Failed to update title");
            }
            return Ok(existing);
        }

        sqlx::query("INSERT INTO paths (site_id, path, title, event) VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING")
            .bind(site)
            .bind(path)
            .bind(title)
            .bind(event)
            .execute(&self.pool)
            .await?;

        let inserted = self.select_path(site, path).await?;
        inserted.ok_or_else(|| sqlx::Error::RowNotFound.into())
    }

    async fn user_agent(&self, user_agent: &str) -> Result<UserAgent> {
        let select = "SELECT user_agent_id, user_agent, browser_id, system_id, bot FROM user_agents WHERE user_agent = ?";
        if let Some(existing) = sqlx::query_as::<_, UserAgent>(select)
            .bind(user_agent)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(existing);
        }

        let parsed = parse_user_agent(user_agent);
        let browser_id = self
            .named_dimension("browsers", &parsed.browser, &parsed.browser_version)
            .await?;
        let system_id = self
            .named_dimension("systems", &parsed.system, &parsed.system_version)
            .await?;

        sqlx::query(
            "INSERT INTO user_agents (user_agent, browser_id, system_id, bot) VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(user_agent)
        .bind(browser_id)
        .bind(system_id)
        .bind(parsed.bot)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, UserAgent>(select)
            .bind(user_agent)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }
}

#[derive(Debug, Default, PartialEq)]
struct ParsedUserAgent {
    browser: String,
    browser_version: String,
    system: String,
    system_version: String,
    bot: bool,
}

fn known(value: &str) -> String {
    if value.is_empty() || value == "UNKNOWN" {
        String::new()
    } else {
        value.to_string()
    }
}

/// Browser and system for a user-agent string; unknown parts are empty.
fn parse_user_agent(user_agent: &str) -> ParsedUserAgent {
    if user_agent.is_empty() {
        return ParsedUserAgent::default();
    }
    match Parser::new().parse(user_agent) {
        Some(result) => ParsedUserAgent {
            browser: known(result.name),
            browser_version: known(result.version),
            system: known(result.os),
            system_version: known(&result.os_version),
            bot: result.category == "crawler",
        },
        None => ParsedUserAgent::default(),
    }
}
