//! Background removal of expired pending requests and sessions

use crate::store::{OAuthStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Periodically sweeps expired rows out of an [`OAuthStore`]
pub struct Sweeper<S: OAuthStore + ?Sized> {
    store: Arc<S>,
    interval: Duration,
}

impl<S: OAuthStore + ?Sized> Sweeper<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweep on every tick until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                debug!("sweeper stopping");
                return;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("sweeper stopping, shutdown sender dropped");
                        return;
                    }
                }
                _ = timer.tick() => {
                    // Failures are already logged; keep going.
                    let _ = self.sweep_once().await;
                }
            }
        }
    }

    /// Run both sweeps once, returning (requests, sessions) removed
    pub async fn sweep_once(&self) -> Result<(u64, u64), StoreError> {
        let requests = self.store.sweep_expired_requests().await;
        match &requests {
            Ok(count) if *count > 0 => info!(count, "swept expired oauth requests"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to sweep expired oauth requests"),
        }

        let sessions = self.store.sweep_expired_sessions().await;
        match &sessions {
            Ok(count) if *count > 0 => info!(count, "swept expired oauth sessions"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to sweep expired oauth sessions"),
        }

        Ok((requests?, sessions?))
    }
}
