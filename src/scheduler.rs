// Fixed-cadence scheduler. Ticks are aligned to wall-clock multiples of the
// poll interval (a 60s interval fires at the top of every minute) and each
// tick spawns one cycle. At most one cycle runs at a time: a tick that finds
// the previous cycle still running is skipped.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::cloud::{CloudClient, Credentials};
use crate::config::Config;
use crate::cycle;
use crate::mqtt::{Broker, MqttBroker};

/// Non-blocking guard ensuring cycles never overlap.
#[derive(Debug, Clone, Default)]
pub struct CycleGuard(Arc<Mutex<()>>);

impl CycleGuard {
    /// Take the guard if no cycle is running. The returned permit releases it
    /// when dropped.
    pub fn try_begin(&self) -> Option<OwnedMutexGuard<()>> {
        self.0.clone().try_lock_owned().ok()
    }

    /// Wait for a running cycle to finish.
    pub async fn wait_idle(&self) {
        let _permit = self.0.lock().await;
    }
}

/// Time left until the next multiple of `period` since the Unix epoch.
pub fn until_next_boundary(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1) as i64;
    let into_period = now.timestamp_millis().rem_euclid(period_ms);
    Duration::from_millis((period_ms - into_period) as u64)
}

/// Run cycles until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let credentials = Credentials {
        key: config.app_key.clone(),
        secret: config.app_secret.clone(),
    };
    let cloud = Arc::new(CloudClient::new(&config.cloud, credentials)?);
    let broker = Arc::new(MqttBroker::new(&config.mqtt, config.cloud.request_timeout));
    let guard = CycleGuard::default();

    let period = config.poll_interval;
    let first = until_next_boundary(Utc::now(), period);
    let mut ticker = time::interval_at(Instant::now() + first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("job start done, first cycle in {first:?}");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(permit) = guard.try_begin() else {
                    warn!("previous cycle still running, skipping tick");
                    continue;
                };
                tokio::spawn(tick(
                    permit,
                    cloud.clone(),
                    broker.clone(),
                    config.clone(),
                ));
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }

    if time::timeout(config.cycle_deadline(), guard.wait_idle())
        .await
        .is_err()
    {
        warn!("running cycle did not finish before shutdown");
    }

    Ok(())
}

async fn tick<B: Broker>(
    _permit: OwnedMutexGuard<()>,
    cloud: Arc<CloudClient>,
    broker: Arc<B>,
    config: Arc<Config>,
) {
    let deadline = config.cycle_deadline();
    let res = time::timeout(
        deadline,
        cycle::run(&cloud, broker.as_ref(), &config.mqtt.topic_prefix),
    )
    .await;

    match res {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("cycle failed: {e:#}"),
        Err(_) => error!("cycle cancelled after exceeding {deadline:?}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
