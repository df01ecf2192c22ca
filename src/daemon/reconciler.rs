use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::lifecycle::Lifecycle;
use crate::locks::LockMap;

/// Periodically folds supervisor state into the registry and trips the
/// restart circuit breaker.
pub struct Reconciler {
    lifecycle: Arc<Lifecycle>,
    locks: Arc<LockMap>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(lifecycle: Arc<Lifecycle>, locks: Arc<LockMap>) -> Self {
        Self {
            lifecycle,
            locks,
            interval: Duration::from_secs(10),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until `shutdown` flips to `true` or its sender goes away.
    ///
    /// This should be spawned as a background task.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "Reconciler started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let reconciled = self.lifecycle.reconcile_all(&self.locks).await;
                    debug!(reconciled, "Reconcile pass finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reconciler stopped");
    }
}
