use super::config::RetentionConfig;
use super::store::ArtifactStore;
use super::types::ArtifactRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweeperState {
    Idle,
    Scanning,
}

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub evicted: usize,
    pub failed: usize,
}

/// Periodically evicts artifacts older than the TTL.
///
/// How often the sweeper wakes up and how old an artifact must be to go
/// are independent settings.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<ArtifactStore>,
    ttl: Duration,
    interval: Duration,
    scanning: Arc<AtomicBool>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<ArtifactStore>, ttl: Duration, interval: Duration) -> Self {
        Self {
            store,
            ttl,
            interval,
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(store: Arc<ArtifactStore>, config: &RetentionConfig) -> Self {
        Self::new(store, config.ttl(), config.sweep_interval())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn state(&self) -> SweeperState {
        if self.scanning.load(Ordering::SeqCst) {
            SweeperState::Scanning
        } else {
            SweeperState::Idle
        }
    }

    /// Sweep using the current time
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Evict every artifact whose age at `now` exceeds the TTL
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        self.scanning.store(true, Ordering::SeqCst);
        let snapshot = self.store.list_all().await;
        let report = self.evict(now, snapshot).await;
        self.scanning.store(false, Ordering::SeqCst);
        report
    }

    async fn evict(&self, now: DateTime<Utc>, snapshot: Vec<ArtifactRecord>) -> SweepReport {
        let mut report = SweepReport {
            scanned: snapshot.len(),
            ..Default::default()
        };
        let Some(cutoff) = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
        else {
            return report;
        };

        // The snapshot may be stale; the store re-checks each record under its lock.
        for record in snapshot.iter().filter(|r| r.created_at < cutoff) {
            match self.store.remove_expired(&record.id, cutoff).await {
                Ok(Some(_)) => {
                    tracing::info!("Evicted expired artifact {}", record.id);
                    report.evicted += 1;
                },
                Ok(None) => {
                    tracing::debug!("Artifact {} was stored again since the scan, keeping it", record.id);
                },
                Err(e) => {
                    tracing::warn!("Failed to evict {}: {}", record.id, e);
                    report.failed += 1;
                },
            }
        }
        report
    }

    /// Run the sweeper on its own task until the handle is shut down
    pub fn start(self) -> SweeperHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        tracing::info!(
            "Retention sweeper started (ttl {:?}, every {:?})",
            self.ttl,
            self.interval
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = self.sweep().await;
                        if report.evicted > 0 || report.failed > 0 {
                            tracing::info!(
                                "Sweep finished: {} scanned, {} evicted, {} failed",
                                report.scanned,
                                report.evicted,
                                report.failed
                            );
                        } else {
                            tracing::debug!("Sweep finished: {} scanned, nothing expired", report.scanned);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::info!("Retention sweeper stopped");
        });

        SweeperHandle { shutdown, task }
    }
}

/// Owns a running sweeper task
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for its current sweep to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Retention sweeper task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
