//! In-memory write buffer for incoming hits.
//!
//! Producers append hits; the periodic persist task drains the buffer,
//! resolves dimensions and sessions, and inserts the batch in one go. Locks
//! are only held for the in-memory push or swap, never across a query.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Database, DimensionResolver, Hit, SessionId, Sessions, Site, SiteState};
use crate::config::MemstoreConfig;
use crate::error::{Error, Result};

/// Attempts for each store call during persist on transient errors.
const STORE_ATTEMPTS: u32 = 3;

pub struct Memstore {
    hits: Mutex<Vec<Hit>>,
    sessions: Sessions,
}

impl Memstore {
    pub fn new(config: &MemstoreConfig) -> Self {
        Self {
            hits: Mutex::new(Vec::new()),
            sessions: Sessions::new(config.session_max_age(), config.salt_rotation()),
        }
    }

    /// Memstore with a fixed session salt and counter start.
    pub fn with_seed(salt: u64, counter: u64) -> Self {
        let config = MemstoreConfig::default();
        Self {
            hits: Mutex::new(Vec::new()),
            sessions: Sessions::with_seed(salt, counter, config.session_max_age(), config.salt_rotation()),
        }
    }

    pub fn append(&self, hits: impl IntoIterator<Item = Hit>) {
        self.hits.lock().extend(hits);
    }

    pub fn len(&self) -> usize {
        self.hits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything buffered so far, leaving the buffer empty.
    pub fn drain(&self) -> Vec<Hit> {
        std::mem::take(&mut *self.hits.lock())
    }

    pub fn session_id(&self) -> SessionId {
        self.sessions.next_id()
    }

    pub fn refresh_salt(&self) -> bool {
        self.sessions.refresh_salt(Utc::now())
    }

    /// New salt and no tracked sessions.
    pub fn reset(&self) {
        self.sessions.reset();
    }

    pub fn evict_sessions(&self) -> usize {
        self.sessions.evict(Utc::now())
    }

    /// Drain the buffer and insert the hits that survive defaults and
    /// validation. Hits that fail either are logged and dropped. Transient
    /// store errors are retried a few times; if they persist the drained
    /// batch is lost.
    pub async fn persist(&self, db: &Database) -> Result<Vec<Hit>> {
        self.persist_with(db, db).await
    }

    /// [`persist`](Self::persist) with a separate dimension resolver.
    pub async fn persist_with(&self, db: &Database, resolver: &dyn DimensionResolver) -> Result<Vec<Hit>> {
        let drained = self.drain();
        if drained.is_empty() {
            return Ok(Vec::new());
        }
        let drained_count = drained.len();

        let mut sites: HashMap<i64, Option<Site>> = HashMap::new();
        let mut ready = Vec::with_capacity(drained_count);

        for hit in drained {
            if !sites.contains_key(&hit.site) {
                let site = match retry("load site", || db.site_by_id(hit.site)).await {
                    Ok(site) => Some(site),
                    Err(Error::SiteNotFound(_)) => None,
                    Err(e) => return Err(e),
                };
                sites.insert(hit.site, site);
            }
            let site = match sites.get(&hit.site) {
                Some(Some(site)) if site.state == SiteState::Active => site,
                _ => {
                    warn!(site = hit.site, path = %hit.path, "Dropping hit for unknown or deleted site");
                    continue;
                }
            };

            let resolved = retry("resolve hit", || {
                let mut attempt = hit.clone();
                async move {
                    attempt.defaults(resolver, site).await?;
                    Ok::<_, Error>(attempt)
                }
            })
            .await;
            let mut hit = match resolved {
                Ok(hit) => hit,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(site = site.id, path = %hit.path, error = %e, "Dropping hit");
                    continue;
                }
            };

            if hit.session.is_nil() {
                if let Some(key) = &hit.user_session {
                    let (session, first_visit) = self.sessions.assign(key, hit.path_id, Utc::now());
                    hit.session = session;
                    hit.first_visit = first_visit;
                }
            }

            if let Err(e) = hit.validate_resolved() {
                warn!(site = site.id, path = %hit.path, error = %e, "Dropping invalid hit");
                continue;
            }
            ready.push(hit);
        }

        retry("insert hits", || db.insert_hits(&ready)).await?;

        debug!(drained = drained_count, persisted = ready.len(), "Persisted hits");
        Ok(ready)
    }
}

/// Run `op` until it succeeds, fails permanently, or has failed transiently
/// [`STORE_ATTEMPTS`] times.
async fn retry<T, F, Fut>(what: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < STORE_ATTEMPTS => {
                warn!(attempt, op = what, error = %e, "Store error, retrying");
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
