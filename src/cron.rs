//! Periodic background tasks.
//!
//! The scheduler runs three loops until its cancellation token fires:
//! persisting and aggregating buffered hits, session housekeeping, and data
//! retention.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::db::{Database, Hit, Memstore};
use crate::error::Result;
use crate::retention;

/// Persist everything buffered and fold it into the rollups, one site at a
/// time. An aggregation failure for one site is logged and the others still
/// run. Returns the persisted hits.
pub async fn persist_and_stat(db: &Database, memstore: &Memstore) -> Result<Vec<Hit>> {
    let hits = memstore.persist(db).await?;
    if hits.is_empty() {
        return Ok(hits);
    }

    let mut grouped: BTreeMap<i64, Vec<Hit>> = BTreeMap::new();
    for hit in hits.iter().filter(|h| h.bot == 0) {
        grouped.entry(hit.site).or_default().push(hit.clone());
    }

    for (site_id, site_hits) in grouped {
        let mut site = match db.site_by_id(site_id).await {
            Ok(site) => site,
            Err(e) => {
                error!(site = site_id, hits = site_hits.len(), error = %e, "Failed to load site");
                continue;
            }
        };
        if let Err(e) = db.update_stats(&mut site, &site_hits, false).await {
            error!(site = site_id, hits = site_hits.len(), error = %e, "Failed to update stats");
        }
    }

    debug!(hits = hits.len(), "Persisted and aggregated");
    Ok(hits)
}

/// Runs the periodic tasks for one database and memstore.
pub struct Scheduler {
    db: Database,
    memstore: Arc<Memstore>,
    config: Config,
    cancel: CancellationToken,
    last_persist: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Scheduler {
    pub fn new(db: Database, memstore: Arc<Memstore>, config: Config, cancel: CancellationToken) -> Self {
        Self {
            db,
            memstore,
            config,
            cancel,
            last_persist: Arc::new(Mutex::new(None)),
        }
    }

    /// When buffered hits were last persisted successfully.
    pub fn last_persist(&self) -> Option<DateTime<Utc>> {
        *self.last_persist.lock()
    }

    /// Spawn all loops. They stop when the token is cancelled.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let (db, memstore, last_persist) = (self.db.clone(), self.memstore.clone(), self.last_persist.clone());
        handles.push(self.every("persist", self.config.memstore.persist_interval(), move || {
            let (db, memstore, last_persist) = (db.clone(), memstore.clone(), last_persist.clone());
            async move {
                match persist_and_stat(&db, &memstore).await {
                    Ok(_) => *last_persist.lock() = Some(Utc::now()),
                    Err(e) => error!(error = %e, "Persisting hits failed"),
                }
            }
        }));

        let memstore = self.memstore.clone();
        handles.push(self.every("sessions", self.config.memstore.session_interval(), move || {
            let memstore = memstore.clone();
            async move {
                let evicted = memstore.evict_sessions();
                if memstore.refresh_salt() {
                    info!("Rotated session salt");
                }
                if evicted > 0 {
                    debug!(evicted, "Evicted stale sessions");
                }
            }
        }));

        let db = self.db.clone();
        handles.push(self.every("retention", self.config.retention.interval(), move || {
            let db = db.clone();
            async move {
                if let Err(e) = retention::data_retention(&db).await {
                    error!(error = %e, "Data retention failed");
                }
            }
        }));

        handles
    }

    fn every<F, Fut>(&self, name: &'static str, period: Duration, mut task: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(task = name, period_secs = period.as_secs(), "Background task started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(task = name, "Background task shutting down");
                        break;
                    }
                    _ = interval.tick() => task().await,
                }
            }
        })
    }

    /// Wait for the loops to stop, then persist whatever is still buffered.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) -> Result<()> {
        self.cancel.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task panicked");
            }
        }

        let hits = persist_and_stat(&self.db, &self.memstore).await?;
        info!(hits = hits.len(), "Final persist done");
        Ok(())
    }
}
