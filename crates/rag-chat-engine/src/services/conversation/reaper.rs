use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::manager::SessionMemoryManager;

/// Background task running `reap_idle` on a fixed interval.
pub struct SessionReaper {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SessionReaper {
    pub fn start(manager: Arc<SessionMemoryManager>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!("Session reaper started (interval {:?})", interval);
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = manager.reap_idle().await;
                        debug!(evicted, active = manager.active_count(), "Reaper tick");
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Session reaper stopped");
        });

        Self { stop_tx, handle }
    }

    /// Signal the task and wait for it to finish its current pass.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}
