//! Periodic driver for [`Deployer::tick`] and release polling.

use crate::config::SchedulerConfig;
use crate::service::Deployer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the current tick finishes.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Scheduler task ended abnormally: {}", e);
        }
    }
}

pub struct Scheduler;

impl Scheduler {
    pub fn start(deployer: Arc<Deployer>, config: SchedulerConfig) -> SchedulerHandle {
        let (shutdown, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_millis(config.tick_interval_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let refresh_every = (config.refresh_interval_secs > 0)
                .then(|| Duration::from_secs(config.refresh_interval_secs));
            let mut next_refresh = Instant::now();

            tracing::info!(
                "Scheduler started (tick {}ms, refresh {:?})",
                config.tick_interval_ms,
                refresh_every
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(every) = refresh_every {
                            if Instant::now() >= next_refresh {
                                next_refresh = Instant::now() + every;
                                match deployer.refresh_releases().await {
                                    Ok(summary) => {
                                        tracing::debug!("Release refresh: {:?}", summary)
                                    }
                                    Err(e) => tracing::warn!("Release refresh failed: {}", e),
                                }
                            }
                        }
                        deployer.tick().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Scheduler stopped");
        });

        SchedulerHandle { shutdown, task }
    }
}
