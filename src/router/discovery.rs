//! Bucket discovery.
//!
//! A sweep asks every replicaset for the buckets it stores and folds the
//! answers into the resolution cache. In [`DiscoveryMode::On`] a background
//! task repeats the sweep on a fixed interval until the router shuts down.
//!
//! [`DiscoveryMode::On`]: crate::config::DiscoveryMode::On

use futures::future::join_all;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::RouterInner;
use crate::error::Error;

/// Outcome of one discovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    /// Replicasets asked.
    pub replicasets: usize,
    /// Replicasets that failed to answer within the sweep timeout.
    pub failed: usize,
    /// Buckets reported across all replicasets.
    pub buckets: usize,
    /// Cache entries added, moved or dropped.
    pub changed: usize,
}

impl DiscoverySummary {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

impl RouterInner {
    /// Run one sweep over the current topology.
    pub(crate) async fn discovery_sweep(&self) -> DiscoverySummary {
        let started = Instant::now();
        let topology = self.topology.snapshot();
        let timeout = self.config.discovery_timeout;

        let queries = topology.values().map(|replicaset| async move {
            let result = match tokio::time::timeout(timeout, replicaset.buckets_discovery(None)).await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };
            (replicaset, result)
        });

        let mut summary = DiscoverySummary {
            replicasets: topology.len(),
            ..Default::default()
        };

        for (replicaset, result) in join_all(queries).await {
            match result {
                Ok(buckets) => {
                    // Skip replicasets removed while the sweep was in flight.
                    if !self.topology.contains(&replicaset.id()) {
                        continue;
                    }
                    summary.buckets += buckets.len();
                    summary.changed += self.cache.merge_owned(replicaset.id(), &buckets);
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        replicaset = %replicaset.info(),
                        error = %e,
                        "Bucket discovery failed, keeping cached buckets"
                    );
                }
            }
        }

        self.metrics
            .record_discovery(summary.is_complete(), summary.failed);
        self.metrics.known_buckets.set(self.cache.known_count() as i64);

        tracing::debug!(
            replicasets = summary.replicasets,
            failed = summary.failed,
            buckets = summary.buckets,
            changed = summary.changed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Discovery sweep finished"
        );

        summary
    }
}

/// Handle to the background discovery task.
#[derive(Debug)]
pub(crate) struct DiscoveryTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl DiscoveryTask {
    /// Spawn the periodic sweep.
    ///
    /// The task holds only a weak reference to the router, so it also ends
    /// once the router is dropped.
    pub(crate) fn spawn(router: Weak<RouterInner>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut interval_timer = tokio::time::interval_at(start, interval);
            interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            tracing::info!(interval_ms = interval.as_millis() as u64, "Bucket discovery started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Bucket discovery shutting down");
                        break;
                    }
                    _ = interval_timer.tick() => {
                        let Some(router) = router.upgrade() else {
                            tracing::debug!("Router dropped, stopping bucket discovery");
                            break;
                        };
                        router.discovery_sweep().await;
                    }
                }
            }

            tracing::info!("Bucket discovery stopped");
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal the task and wait for the current sweep to finish.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "Bucket discovery task failed");
            }
        }
    }
}
