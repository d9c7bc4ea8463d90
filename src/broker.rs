use crate::config::BrokerConfig;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming,
    MqttOptions, Outgoing, Publish, SubscribeReasonCode,
};
use std::future::Future;
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            received_at: Utc::now(),
        }
    }
}

/// Receives each delivered message in broker order. The event loop is not
/// polled while `handle` runs.
pub trait MessageHandler {
    fn handle(&mut self, message: InboundMessage) -> impl Future<Output = ()>;
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to MQTT broker: {0}")]
    Connect(#[source] ConnectionError),
    #[error("MQTT broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("MQTT broker rejected subscription to {topic}")]
    SubscribeRejected { topic: String },
    #[error("in-place reconnect to MQTT broker failed: {0}")]
    Reconnect(#[source] ConnectionError),
    #[error("MQTT client request failed: {0}")]
    Client(#[from] ClientError),
}

#[derive(Debug)]
enum Step {
    Idle,
    Subscribe,
    Subscribed,
    Deliver(Publish),
    SubscribeRejected,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    reached_subscribed: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            reached_subscribed: false,
        }
    }

    fn observe(&mut self, event: Event) -> Step {
        match event {
            // The event loop only surfaces accepted CONNACKs; a refusal comes
            // back from `poll` as `ConnectionError::ConnectionRefused`.
            Event::Incoming(Incoming::ConnAck(_)) => {
                self.state = SessionState::Connected;
                Step::Subscribe
            }
            Event::Incoming(Incoming::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Step::SubscribeRejected
                } else {
                    self.state = SessionState::Subscribed;
                    self.reached_subscribed = true;
                    Step::Subscribed
                }
            }
            Event::Incoming(Incoming::Publish(publish)) => Step::Deliver(publish),
            Event::Incoming(Incoming::Disconnect) => {
                self.state = SessionState::Disconnected;
                Step::Idle
            }
            _ => Step::Idle,
        }
    }

    /// Marks the session lost; returns whether it had been established.
    fn lost(&mut self) -> bool {
        let was_live = matches!(
            self.state,
            SessionState::Connected | SessionState::Subscribed
        );
        self.state = SessionState::Disconnected;
        was_live
    }
}

pub struct BrokerClient {
    config: BrokerConfig,
    session: Session,
}

impl BrokerClient {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            session: Session::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Whether the most recent `run` got as far as an acknowledged subscription.
    pub fn reached_subscribed(&self) -> bool {
        self.session.reached_subscribed
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keepalive());
        options.set_clean_session(true);
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        options
    }

    /// Runs one broker session until shutdown (`Ok`) or an unrecoverable
    /// session error. An unexpected drop of an established session gets one
    /// immediate reconnect; if that fails the call waits the reconnect delay
    /// before returning.
    pub async fn run<H: MessageHandler>(
        &mut self,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), REQUEST_CAPACITY);
        self.session = Session::new();
        self.session.state = SessionState::Connecting;
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "connecting to MQTT broker"
        );

        let mut reconnecting = false;
        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.disconnect(&client, &mut eventloop).await;
                    return Ok(());
                }
                polled = eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => match self.session.observe(event) {
                    Step::Subscribe => {
                        reconnecting = false;
                        tracing::info!(host = %self.config.host, "connected to MQTT broker");
                        client.try_subscribe(self.config.topic.clone(), self.config.qos)?;
                    }
                    Step::Subscribed => {
                        tracing::info!(topic = %self.config.topic, "subscribed to telemetry topic");
                    }
                    Step::Deliver(publish) => handler.handle(publish.into()).await,
                    Step::SubscribeRejected => {
                        tracing::error!(topic = %self.config.topic, "MQTT subscription rejected");
                        return Err(BrokerError::SubscribeRejected {
                            topic: self.config.topic.clone(),
                        });
                    }
                    Step::Idle => {}
                },
                Err(ConnectionError::ConnectionRefused(code)) => {
                    self.session.lost();
                    tracing::error!(code = ?code, "MQTT connection refused");
                    return Err(BrokerError::Refused(code));
                }
                Err(err) if reconnecting => {
                    self.session.lost();
                    let delay = self.config.reconnect_delay();
                    tracing::error!(error = %err, delay_secs = delay.as_secs(), "failed to reconnect to MQTT broker");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        _ = sleep(delay) => {}
                    }
                    return Err(BrokerError::Reconnect(err));
                }
                Err(err) => {
                    if !self.session.lost() {
                        return Err(BrokerError::Connect(err));
                    }
                    tracing::warn!(error = %err, "unexpectedly disconnected from MQTT broker, reconnecting");
                    reconnecting = true;
                    self.session.state = SessionState::Connecting;
                }
            }
        }
    }

    async fn disconnect(&mut self, client: &AsyncClient, eventloop: &mut EventLoop) {
        if !self.session.lost() {
            return;
        }
        if let Err(err) = client.try_disconnect() {
            tracing::warn!(error = %err, "failed to queue MQTT disconnect");
            return;
        }
        let flushed = timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            tracing::warn!("timed out flushing MQTT disconnect");
        } else {
            tracing::info!("disconnected from MQTT broker");
        }
    }
}
