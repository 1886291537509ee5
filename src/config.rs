// Process configuration. Everything is read once at startup from flags or
// the environment (a `.env` file is loaded first by `main`) and then shared
// read-only with every cycle.
use clap::{Args, Parser};
use reqwest::Url;
use std::num::{NonZeroU64, ParseIntError};
use std::time::Duration;

// A zero interval would stall the ticker and a zero timeout fails every
// request, so both are rejected at startup.
fn parse_duration_secs(s: &str) -> Result<Duration, ParseIntError> {
    let secs: NonZeroU64 = s.parse()?;
    Ok(Duration::from_secs(secs.get()))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Qingping open API application key
    #[arg(env = "APP_KEY", long = "app-key", value_name = "key")]
    pub app_key: String,

    /// Qingping open API application secret
    #[arg(
        env = "APP_SECRET",
        long = "app-secret",
        value_name = "secret",
        hide_env_values = true
    )]
    pub app_secret: String,

    #[command(flatten)]
    pub cloud: CloudConfig,

    #[command(flatten)]
    pub mqtt: MqttConfig,

    /// Seconds between two cycles
    #[arg(
        env = "POLL_INTERVAL_SECS",
        long = "poll-interval-secs",
        value_name = "secs",
        default_value = "60",
        value_parser = parse_duration_secs
    )]
    pub poll_interval: Duration,
}

#[derive(Clone, Debug, Args)]
pub struct CloudConfig {
    /// Base URI of the OAuth2 token service
    #[arg(
        env = "QINGPING_OAUTH_ENDPOINT",
        long = "oauth-endpoint",
        value_name = "uri",
        default_value = "https://oauth.cleargrass.com"
    )]
    pub oauth_endpoint: Url,

    /// Base URI of the device data API
    #[arg(
        env = "QINGPING_API_ENDPOINT",
        long = "api-endpoint",
        value_name = "uri",
        default_value = "https://apis.cleargrass.com"
    )]
    pub api_endpoint: Url,

    /// Timeout applied to every HTTP request and MQTT operation
    #[arg(
        env = "REQUEST_TIMEOUT_SECS",
        long = "request-timeout-secs",
        value_name = "secs",
        default_value = "10",
        value_parser = parse_duration_secs
    )]
    pub request_timeout: Duration,
}

#[derive(Clone, Debug, Args)]
pub struct MqttConfig {
    #[arg(
        env = "MQTT_HOST",
        long = "mqtt-host",
        value_name = "host",
        default_value = "localhost"
    )]
    pub host: String,

    #[arg(
        env = "MQTT_PORT",
        long = "mqtt-port",
        value_name = "port",
        default_value_t = 1883
    )]
    pub port: u16,

    #[arg(env = "MQTT_USERNAME", long = "mqtt-username", value_name = "user")]
    pub username: Option<String>,

    #[arg(
        env = "MQTT_PASSWORD",
        long = "mqtt-password",
        value_name = "password",
        hide_env_values = true
    )]
    pub password: Option<String>,

    /// Namespace readings are published under, as `<prefix>/data/<mac>`
    #[arg(
        env = "MQTT_TOPIC_PREFIX",
        long = "mqtt-topic-prefix",
        value_name = "prefix",
        default_value = "qingping"
    )]
    pub topic_prefix: String,
}

impl Config {
    /// Upper bound for a single cycle. A cycle still running when the next
    /// one is due gets cancelled.
    pub fn cycle_deadline(&self) -> Duration {
        self.poll_interval
    }
}
