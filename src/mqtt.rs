// MQTT side of the bridge. Every cycle opens its own session with a fresh
// client id, publishes each reading at QoS 1 while driving the `rumqttc`
// event loop until the broker acknowledges it, then disconnects.
//
// `Broker` and `Session` are the seam the cycle is written against so the
// publish loop can run without a real broker in tests.
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS,
};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MqttConfig;

const CLIENT_ID_PREFIX: &str = "qcm";
const KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("no CONNACK within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to queue publish: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("no PUBACK within {0:?}")]
    Timeout(Duration),

    #[error("broker rejected publish: {0}")]
    Rejected(String),
}

/// Topic a device reading is published on.
pub fn topic_for(prefix: &str, mac: &str) -> String {
    format!("{prefix}/data/{mac}")
}

pub trait Broker: Send + Sync {
    type Session: Session;

    fn connect(&self) -> impl Future<Output = Result<Self::Session, ConnectError>> + Send;
}

pub trait Session: Send {
    /// Publish at QoS 1 and wait for the broker acknowledgement.
    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    /// Disconnect from the broker. Errors are logged, never returned.
    fn close(self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone)]
pub struct MqttBroker {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    op_timeout: Duration,
}

impl MqttBroker {
    pub fn new(config: &MqttConfig, op_timeout: Duration) -> Self {
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            (Some(user), None) => Some((user.clone(), String::new())),
            (None, Some(_)) => {
                warn!("MQTT_PASSWORD set without MQTT_USERNAME; connecting without authentication");
                None
            }
            (None, None) => None,
        };

        Self {
            host: config.host.clone(),
            port: config.port,
            credentials,
            op_timeout,
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!("{CLIENT_ID_PREFIX}-{}", Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some((user, pass)) = &self.credentials {
            options.set_credentials(user, pass);
        }
        options
    }
}

impl Broker for MqttBroker {
    type Session = MqttSession;

    async fn connect(&self) -> Result<MqttSession, ConnectError> {
        let options = self.options();
        debug!(
            "connecting to MQTT broker at {}:{} as {}",
            self.host,
            self.port,
            options.client_id()
        );

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        timeout(self.op_timeout, wait_connack(&mut eventloop))
            .await
            .map_err(|_| ConnectError::Timeout(self.op_timeout))??;

        Ok(MqttSession {
            client,
            eventloop,
            op_timeout: self.op_timeout,
        })
    }
}

async fn wait_connack(eventloop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(ConnectError::Refused(ack.code));
            }
            Ok(ev) => debug!("mqtt event = {ev:?}"),
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectError::Refused(code));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A connected broker session. Dropping it closes the network connection;
/// `close` sends a DISCONNECT first.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    op_timeout: Duration,
}

impl MqttSession {
    async fn wait_puback(&mut self) -> Result<(), PublishError> {
        let mut pkid = None;
        loop {
            match self.eventloop.poll().await? {
                Event::Outgoing(Outgoing::Publish(id)) => pkid = Some(id),
                Event::Incoming(Incoming::PubAck(ack)) if Some(ack.pkid) == pkid => {
                    return Ok(());
                }
                Event::Incoming(Incoming::Disconnect) => {
                    return Err(PublishError::Rejected(
                        "broker closed the session".to_string(),
                    ));
                }
                ev => debug!("mqtt event = {ev:?}"),
            }
        }
    }
}

impl Session for MqttSession {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;

        let op_timeout = self.op_timeout;
        timeout(op_timeout, self.wait_puback())
            .await
            .map_err(|_| PublishError::Timeout(op_timeout))?
    }

    async fn close(mut self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("mqtt disconnect error: {e}");
            return;
        }

        let flushed = timeout(self.op_timeout, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(ev) => debug!("mqtt event = {ev:?}"),
                    Err(e) => {
                        debug!("mqtt event loop closed: {e}");
                        break;
                    }
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("mqtt disconnect did not complete in {:?}", self.op_timeout);
        }
    }
}
