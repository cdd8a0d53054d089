//! Raw hits: normalization, validation and storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, QueryBuilder, Row, Sqlite};
use url::{form_urlencoded, Url};
use validator::Validate;

use super::{format_datetime, parse_datetime, Database, DimensionResolver, SessionId, Site};
use crate::error::{Error, Result};

/// Columns written for every hit, in bind order.
pub const HIT_COLUMNS: [&str; 11] = [
    "site_id",
    "path_id",
    "user_agent_id",
    "session",
    "bot",
    "ref",
    "ref_scheme",
    "size",
    "location",
    "first_visit",
    "created_at",
];

/// Rows per insert statement; keeps well under sqlite's bind limit.
const INSERT_CHUNK: usize = 500;

const SELECT_HITS: &str = "SELECT hits.hit_id, hits.site_id, hits.path_id, hits.user_agent_id, \
    hits.session, hits.bot, hits.ref, hits.ref_scheme, hits.size, hits.location, \
    hits.first_visit, hits.created_at, paths.path, paths.title, paths.event, \
    user_agents.user_agent, user_agents.browser_id, user_agents.system_id \
    FROM hits \
    JOIN paths USING (path_id) \
    JOIN user_agents USING (user_agent_id)";

/// Offline reader apps that save pages under their own storage path.
const OFFLINE_READER_PREFIX: &str = "/storage/emulated/0/Android/data/jonas.tool.saveForOffline/files/";

/// Android apps that send an `android-app://` referrer, with display names.
const GENERATED_REFERRERS: &[(&str, &str)] = &[
    ("com.google.android.gm", "Gmail"),
    ("com.google.android.googlequicksearchbox", "Google"),
    ("com.google.android.apps.searchlite", "Google"),
    ("org.telegram.messenger", "Telegram"),
    ("com.slack", "Slack"),
    ("com.Slack", "Slack"),
    ("com.twitter.android", "Twitter"),
    ("com.linkedin.android", "LinkedIn"),
    ("com.reddit.frontpage", "Reddit"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RefScheme {
    Http,
    Other,
    Generated,
    Campaign,
}

impl RefScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "h",
            Self::Other => "o",
            Self::Generated => "g",
            Self::Campaign => "c",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "h" => Some(Self::Http),
            "o" => Some(Self::Other),
            "g" => Some(Self::Generated),
            "c" => Some(Self::Campaign),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Validate)]
pub struct Hit {
    pub id: i64,
    pub site: i64,
    pub path_id: i64,
    pub user_agent_id: i64,
    pub session: SessionId,

    #[validate(length(min = 1, max = 2048))]
    pub path: String,
    #[validate(length(max = 1024))]
    pub title: String,
    pub event: bool,
    pub query: String,
    #[validate(length(max = 2048))]
    pub referrer: String,
    pub ref_scheme: Option<RefScheme>,
    pub size: Vec<f64>,
    pub bot: i32,
    pub location: String,
    pub first_visit: bool,
    /// Left at the epoch to mean "now".
    pub created_at: DateTime<Utc>,

    // Carried from ingestion to persist only.
    #[validate(length(max = 512))]
    pub user_agent: String,
    pub user_session: Option<String>,
    pub browser_id: i64,
    pub system_id: i64,
}

impl Hit {
    /// Fill derived fields and resolve the path and user-agent dimensions.
    pub async fn defaults(&mut self, resolver: &dyn DimensionResolver, site: &Site) -> Result<()> {
        self.site = site.id;
        if self.created_at.timestamp() == 0 {
            self.created_at = Utc::now();
        }

        self.path = clean_path(&self.path, self.event);

        let mut campaign = false;
        if !self.event && !self.query.is_empty() {
            let query = self.query.trim_start_matches('?');
            let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            for name in &site.settings.campaigns {
                if let Some((_, value)) = pairs.iter().find(|(k, _)| k == name) {
                    self.referrer = value.clone();
                    self.ref_scheme = Some(RefScheme::Campaign);
                    campaign = true;
                    break;
                }
            }
        }

        if !campaign && !self.referrer.is_empty() {
            if let Ok(url) = Url::parse(&self.referrer) {
                let (cleaned, scheme) = clean_referrer(&url);
                self.referrer = cleaned;
                self.ref_scheme = Some(scheme);
            }
        }
        self.referrer = self.referrer.trim_end_matches('/').to_string();

        // Raw field limits, before anything is written to the dimensions.
        self.validate()?;

        let path = resolver
            .path(self.site, &self.path, &self.title, self.event)
            .await?;
        self.path_id = path.id;

        let ua = resolver.user_agent(&self.user_agent).await?;
        self.user_agent_id = ua.id;
        self.browser_id = ua.browser_id;
        self.system_id = ua.system_id;
        if ua.bot && self.bot == 0 {
            self.bot = 1;
        }
        Ok(())
    }

    /// Checks that only hold after `defaults`.
    pub fn validate_resolved(&self) -> Result<()> {
        self.validate()?;
        if self.site == 0 {
            return Err(Error::invalid("hit without site"));
        }
        if self.path_id == 0 {
            return Err(Error::invalid("hit without path_id"));
        }
        if self.user_agent_id == 0 {
            return Err(Error::invalid("hit without user_agent_id"));
        }
        Ok(())
    }

    /// Screen width, or 0 if unknown.
    pub fn width(&self) -> i64 {
        self.size.first().map(|w| *w as i64).unwrap_or(0)
    }

    fn size_column(&self) -> String {
        self.size
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn session_column(&self) -> Option<Vec<u8>> {
        if self.session.is_nil() {
            None
        } else {
            Some(self.session.to_bytes().to_vec())
        }
    }
}

impl<'r> FromRow<'r, SqliteRow> for Hit {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let session: Option<Vec<u8>> = row.try_get("session")?;
        let session = match session {
            Some(bytes) => {
                let bytes: [u8; 16] = bytes.as_slice().try_into().map_err(|_| sqlx::Error::ColumnDecode {
                    index: "session".to_string(),
                    source: "session must be 16 bytes".into(),
                })?;
                SessionId::from_bytes(bytes)
            }
            None => SessionId::NIL,
        };

        let ref_scheme: Option<String> = row.try_get("ref_scheme")?;
        let size: String = row.try_get("size")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Self {
            id: row.try_get("hit_id")?,
            site: row.try_get("site_id")?,
            path_id: row.try_get("path_id")?,
            user_agent_id: row.try_get("user_agent_id")?,
            session,
            path: row.try_get("path")?,
            title: row.try_get("title")?,
            event: row.try_get("event")?,
            query: String::new(),
            referrer: row.try_get("ref")?,
            ref_scheme: ref_scheme.as_deref().and_then(RefScheme::parse),
            size: size.split(',').filter_map(|s| s.parse().ok()).collect(),
            bot: row.try_get("bot")?,
            location: row.try_get("location")?,
            first_visit: row.try_get("first_visit")?,
            created_at: parse_datetime(&created_at).map_err(|e| sqlx::Error::ColumnDecode {
                index: "created_at".to_string(),
                source: Box::new(e),
            })?,
            user_agent: row.try_get("user_agent")?,
            user_session: None,
            browser_id: row.try_get("browser_id")?,
            system_id: row.try_get("system_id")?,
        })
    }
}

/// Normalize a path: trim slashes, unwrap archive and offline-reader prefixes
/// and drop tracking query parameters. Events only lose leading slashes.
pub fn clean_path(path: &str, event: bool) -> String {
    let path = path.trim();
    if event {
        return path.trim_start_matches('/').to_string();
    }
    if path.is_empty() {
        return String::new();
    }

    let mut path = format!("/{}", path.trim_matches('/'));

    if let Some(rest) = path.strip_prefix(OFFLINE_READER_PREFIX) {
        path = match rest.find('/') {
            Some(i) => rest[i..].to_string(),
            None => rest.to_string(),
        };
    }

    // /web/20200104233523/https://example.com/page.html
    if path.starts_with("/web/20") {
        if let Some(Ok(url)) = path.get(20..).map(Url::parse) {
            let mut unwrapped = url.path().to_string();
            if unwrapped.is_empty() {
                unwrapped.push('/');
            }
            if let Some(q) = url.query().filter(|q| !q.is_empty()) {
                unwrapped.push('?');
                unwrapped.push_str(q);
            }
            path = unwrapped;
        }
    }

    let path = path.trim_end_matches(['?', '&']);
    let Some((base, query)) = path.split_once('?') else {
        return path.to_string();
    };

    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .filter(|(k, v)| !is_tracking_param(k, v))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        return base.to_string();
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{}?{}", base, query)
}

fn is_tracking_param(key: &str, value: &str) -> bool {
    match key {
        "fbclid" | "ref" | "mc_cid" | "mc_eid" | "nsukey" | "isappinstalled" => true,
        "from" => value == "singlemessage" || value == "groupmessage",
        _ => key.starts_with("utm_"),
    }
}

/// Reduce a referrer URL to what is stored, and its scheme.
fn clean_referrer(url: &Url) -> (String, RefScheme) {
    if url.scheme() == "android-app" {
        if let Some(host) = url.host_str() {
            if let Some((_, name)) = GENERATED_REFERRERS.iter().find(|(id, _)| *id == host) {
                return (name.to_string(), RefScheme::Generated);
            }
            return (host.to_string(), RefScheme::Other);
        }
    }

    match (url.scheme(), url.host_str()) {
        ("http" | "https", Some(host)) => (format!("{}{}", host, url.path()), RefScheme::Http),
        _ => (url.to_string(), RefScheme::Other),
    }
}

fn push_hit_values(builder: &mut QueryBuilder<'_, Sqlite>, hits: &[Hit]) {
    builder.push("INSERT INTO hits (");
    builder.push(HIT_COLUMNS.join(", "));
    builder.push(") ");
    builder.push_values(hits, |mut b, hit| {
        b.push_bind(hit.site)
            .push_bind(hit.path_id)
            .push_bind(hit.user_agent_id)
            .push_bind(hit.session_column())
            .push_bind(hit.bot)
            .push_bind(hit.referrer.clone())
            .push_bind(hit.ref_scheme.map(|s| s.as_str()))
            .push_bind(hit.size_column())
            .push_bind(hit.location.clone())
            .push_bind(hit.first_visit)
            .push_bind(format_datetime(hit.created_at));
    });
}

impl Database {
    /// Bulk insert resolved hits in one transaction.
    pub async fn insert_hits(&self, hits: &[Hit]) -> Result<()> {
        if hits.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in hits.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::new("");
            push_hit_values(&mut builder, chunk);
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Hits for a site after `after_id`, oldest first, including bots.
    /// Returns the hits and the ID to continue from.
    pub async fn list_hits(&self, site: i64, limit: i64, after_id: i64) -> Result<(Vec<Hit>, i64)> {
        let limit = if limit <= 0 || limit > 5000 { 5000 } else { limit };
        let hits: Vec<Hit> = sqlx::query_as(&format!(
            "{} WHERE hits.site_id = ? AND hits.hit_id > ? ORDER BY hits.hit_id ASC LIMIT ?",
            SELECT_HITS
        ))
        .bind(site)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let last = hits.last().map(|h| h.id).unwrap_or(after_id);
        Ok((hits, last))
    }

    /// Hits created in `[start, end)`, oldest first.
    pub async fn hits_between(&self, site: i64, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Hit>> {
        let hits = sqlx::query_as(&format!(
            "{} WHERE hits.site_id = ? AND hits.created_at >= ? AND hits.created_at < ? ORDER BY hits.hit_id ASC",
            SELECT_HITS
        ))
        .bind(site)
        .bind(format_datetime(start))
        .bind(format_datetime(end))
        .fetch_all(&self.pool)
        .await?;
        Ok(hits)
    }

    /// Total pageviews recorded for a site.
    pub async fn count_hits(&self, site: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(SUM(total), 0) FROM hit_counts WHERE site_id = ?")
            .bind(site)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
