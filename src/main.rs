// `main.rs` only sets up logging and configuration, then hands over to
// `scheduler::run()`. The bridge itself lives in `cloud` (Qingping API),
// `reading` (payload model), `mqtt` (broker session) and `cycle`.
mod cloud;
mod config;
mod cycle;
mod mqtt;
mod reading;
mod scheduler;

use anyhow::Result;
use clap::Parser;
use config::Config;
use tracing::{debug, info};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse()?)
                    .add_directive("rumqttc=warn".parse()?)
                    .add_directive("reqwest=warn".parse()?)
                    .add_directive("hyper=warn".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false)),
        )
        .init();

    // A missing .env file is fine, the environment may already be set
    if let Err(e) = dotenvy::dotenv() {
        debug!("no .env file loaded: {e}");
    }

    let config = Config::parse();
    info!(
        "polling {} every {:?}, publishing to {}:{} under {}/data/",
        config.cloud.api_endpoint,
        config.poll_interval,
        config.mqtt.host,
        config.mqtt.port,
        config.mqtt.topic_prefix
    );

    scheduler::run(config).await
}
