//! Sites and their settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use validator::Validate;

use super::{format_datetime, parse_datetime, Database};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteState {
    Active,
    Deleted,
}

impl SiteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "a",
            Self::Deleted => "d",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "a" => Ok(Self::Active),
            "d" => Ok(Self::Deleted),
            _ => Err(Error::invalid(format!("site state {:?}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SiteSettings {
    /// Fixed offset from UTC in minutes.
    #[validate(range(min = -720, max = 840))]
    pub timezone_offset: i32,
    /// Days of raw data to keep; 0 keeps everything.
    #[validate(range(min = 0))]
    pub data_retention: i32,
    /// Paths per page in `list`.
    #[validate(range(min = 1, max = 500))]
    pub page_limit: i64,
    /// Query parameters that mark a campaign, in order of preference.
    pub campaigns: Vec<String>,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            timezone_offset: 0,
            data_retention: 0,
            page_limit: 10,
            campaigns: vec![
                "utm_campaign".to_string(),
                "utm_source".to_string(),
                "ref".to_string(),
            ],
        }
    }
}

impl SiteSettings {
    /// Timezone offset rounded to the nearest whole hour, exact half hours
    /// towards positive: -5:30 gives -5 and +5:30 gives 6. -5:45 gives -6,
    /// it is not truncated to -5.
    pub fn offset_hours(&self) -> i64 {
        let minutes = i64::from(self.timezone_offset);
        (minutes + 30).div_euclid(60).clamp(-23, 23)
    }
}

#[derive(Debug, Clone)]
pub struct Site {
    pub id: i64,
    pub code: String,
    pub state: SiteState,
    pub received_data: bool,
    pub settings: SiteSettings,
    pub created_at: DateTime<Utc>,
}

impl Site {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let state: String = row.try_get("state")?;
        let settings: String = row.try_get("settings")?;
        let created_at: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("site_id")?,
            code: row.try_get("code")?,
            state: SiteState::parse(&state)?,
            received_data: row.try_get("received_data")?,
            settings: serde_json::from_str(&settings)?,
            created_at: parse_datetime(&created_at)?,
        })
    }
}

impl Database {
    pub async fn create_site(&self, code: &str, settings: SiteSettings) -> Result<Site> {
        settings.validate()?;
        let created_at = Utc::now();

        let result = sqlx::query(
            "INSERT INTO sites (code, state, received_data, settings, created_at) VALUES (?, ?, 0, ?, ?)",
        )
        .bind(code)
        .bind(SiteState::Active.as_str())
        .bind(serde_json::to_string(&settings)?)
        .bind(format_datetime(created_at))
        .execute(&self.pool)
        .await?;

        self.site_by_id(result.last_insert_rowid()).await
    }

    pub async fn site_by_id(&self, id: i64) -> Result<Site> {
        let row = sqlx::query("SELECT * FROM sites WHERE site_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::SiteNotFound(id))?;
        Site::from_row(&row)
    }

    /// All sites regardless of state.
    pub async fn list_sites(&self) -> Result<Vec<Site>> {
        let rows = sqlx::query("SELECT * FROM sites ORDER BY site_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Site::from_row).collect()
    }

    pub async fn update_site_settings(&self, site: &mut Site, settings: SiteSettings) -> Result<()> {
        settings.validate()?;
        sqlx::query("UPDATE sites SET settings = ? WHERE site_id = ?")
            .bind(serde_json::to_string(&settings)?)
            .bind(site.id)
            .execute(&self.pool)
            .await?;
        site.settings = settings;
        Ok(())
    }

    pub async fn update_site_state(&self, site: &mut Site, state: SiteState) -> Result<()> {
        sqlx::query("UPDATE sites SET state = ? WHERE site_id = ?")
            .bind(state.as_str())
            .bind(site.id)
            .execute(&self.pool)
            .await?;
        site.state = state;
        Ok(())
    }

    /// Set the one-way "received data" flag.
    pub async fn update_received_data(&self, site: &mut Site) -> Result<()> {
        sqlx::query("UPDATE sites SET received_data = 1 WHERE site_id = ?")
            .bind(site.id)
            .execute(&self.pool)
            .await?;
        site.received_data = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_hours() {
        let offset = |minutes| SiteSettings {
            timezone_offset: minutes,
            ..Default::default()
        }
        .offset_hours();

        assert_eq!(offset(0), 0);
        assert_eq!(offset(120), 2);
        assert_eq!(offset(330), 6);
        assert_eq!(offset(-330), -5);
        assert_eq!(offset(-120), -2);
        assert_eq!(offset(345), 6);
        assert_eq!(offset(-345), -6);
    }

    #[tokio::test]
    async fn test_create_and_load_site() {
        let db = Database::in_memory().await.unwrap();
        let settings = SiteSettings {
            timezone_offset: 120,
            data_retention: 30,
            ..Default::default()
        };

        let mut site = db.create_site("example", settings.clone()).await.unwrap();
        assert_eq!(site.state, SiteState::Active);
        assert!(!site.received_data);
        assert_eq!(site.settings, settings);

        db.update_received_data(&mut site).await.unwrap();
        let loaded = db.site_by_id(site.id).await.unwrap();
        assert!(loaded.received_data);

        let changed = SiteSettings {
            page_limit: 50,
            ..settings
        };
        db.update_site_settings(&mut site, changed.clone()).await.unwrap();
        assert_eq!(db.site_by_id(site.id).await.unwrap().settings, changed);
        assert_eq!(db.list_sites().await.unwrap().len(), 1);

        assert!(matches!(
            db.site_by_id(site.id + 1).await,
            Err(Error::SiteNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_invalid_settings() {
        let db = Database::in_memory().await.unwrap();
        let settings = SiteSettings {
            page_limit: 0,
            ..Default::default()
        };
        assert!(matches!(
            db.create_site("bad", settings).await,
            Err(Error::Validation(_))
        ));
    }
}
