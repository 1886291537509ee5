// One fetch-transform-publish cycle: token, device readings, then one MQTT
// message per device. Failures before publishing abort the cycle; a failure
// to publish one device is logged and the next device is still published.
use anyhow::{Context as _, Result};
use tracing::{debug, error, info};

use crate::cloud::CloudClient;
use crate::mqtt::{Broker, Session, topic_for};
use crate::reading::Readings;

/// Outcome of the publish phase of a cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub published: usize,
    pub failed: usize,
}

pub async fn run<B: Broker>(cloud: &CloudClient, broker: &B, topic_prefix: &str) -> Result<CycleReport> {
    info!("fetch data begin");

    let token = cloud
        .access_token()
        .await
        .context("failed to fetch access token")?;
    info!("access token acquired ({} chars)", token.len());

    let readings = cloud
        .devices(&token)
        .await
        .context("failed to fetch device data")?;
    info!("fetched {} device readings", readings.len());
    debug!("device data: {readings:?}");

    let mut session = broker
        .connect()
        .await
        .context("failed to connect to MQTT broker")?;
    info!("mqtt connect done");

    let report = publish_readings(&mut session, topic_prefix, &readings).await;
    session.close().await;

    info!(
        "fetch data end, published: {}, failed: {}",
        report.published, report.failed
    );
    Ok(report)
}

/// Publish every reading on its device topic. Never stops early.
pub async fn publish_readings<S: Session>(
    session: &mut S,
    topic_prefix: &str,
    readings: &Readings,
) -> CycleReport {
    let mut report = CycleReport::default();

    for (mac, reading) in readings {
        let payload = match serde_json::to_vec(reading) {
            Ok(p) => p,
            Err(e) => {
                error!("payload json encode error mac:{mac}: {e}");
                report.failed += 1;
                continue;
            }
        };

        let topic = topic_for(topic_prefix, mac);
        match session.publish(&topic, payload).await {
            Ok(()) => {
                info!("mqtt publish done topic:{topic}");
                report.published += 1;
            }
            Err(e) => {
                error!("mqtt publish error mac:{mac}: {e}");
                report.failed += 1;
            }
        }
    }

    report
}
