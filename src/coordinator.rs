use crate::broker::{BrokerClient, BrokerError, InboundMessage, MessageHandler};
use crate::codec::{decode, DecodeError};
use crate::config::Config;
use crate::retry::Backoff;
use crate::storage::{RecordSink, StorageConnector, StorageError, WriteAck};
use anyhow::Result;
use chrono::Utc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub persisted: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub failed_attempts: u64,
    pub broker_sessions: u64,
}

impl IngestStats {
    pub fn log_totals(&self) {
        tracing::info!(
            received = self.received,
            persisted = self.persisted,
            rejected = self.rejected,
            dropped = self.dropped,
            failed_attempts = self.failed_attempts,
            broker_sessions = self.broker_sessions,
            "ingest totals"
        );
    }
}

/// What happened to one inbound payload.
#[derive(Debug)]
pub enum Outcome {
    Persisted(WriteAck),
    Rejected(DecodeError),
    Dropped(StorageError),
}

pub struct Coordinator<S> {
    storage: StorageConnector<S>,
    stats: IngestStats,
}

impl<S: RecordSink> Coordinator<S> {
    pub fn new(storage: StorageConnector<S>) -> Self {
        Self {
            storage,
            stats: IngestStats::default(),
        }
    }

    /// Decode then persist one payload. Never fails: every error is logged and
    /// the payload is dropped.
    pub async fn process(&mut self, payload: &[u8]) -> Outcome {
        self.stats.received += 1;
        let text = String::from_utf8_lossy(payload);

        let record = match decode(payload) {
            Ok(record) => record,
            Err(err) => {
                self.stats.rejected += 1;
                tracing::warn!(error = %err, payload = %text, "dropping malformed message");
                return Outcome::Rejected(err);
            }
        };

        match self.storage.write(&record).await {
            Ok(ack) => {
                self.stats.persisted += 1;
                self.stats.failed_attempts += u64::from(ack.attempts - 1);
                tracing::info!(id = ack.id, attempts = ack.attempts, payload = %text, "saved telemetry record");
                Outcome::Persisted(ack)
            }
            Err(err) => {
                self.stats.dropped += 1;
                if let StorageError::Write { attempts, .. } = &err {
                    self.stats.failed_attempts += u64::from(*attempts);
                }
                tracing::error!(error = %err, payload = %text, "dropping telemetry record after exhausting write retries");
                Outcome::Dropped(err)
            }
        }
    }

    /// Keeps a broker session alive until `cancel` fires, then releases the
    /// database connection and hands back the final counters. There is no
    /// attempt budget: broker failures are retried for as long as it runs.
    pub async fn supervise(
        mut self,
        mut broker: BrokerClient,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> IngestStats {
        let mut failures: u32 = 0;
        while !cancel.is_cancelled() {
            self.stats.broker_sessions += 1;
            let result = broker.run(&mut self, &cancel).await;
            if broker.reached_subscribed() {
                failures = 0;
            }
            let err = match result {
                Ok(()) => break,
                Err(err) => err,
            };

            failures = failures.saturating_add(1);
            if matches!(err, BrokerError::Reconnect(_)) {
                // The adapter already waited before giving up.
                tracing::warn!(error = %err, state = ?broker.state(), "broker session lost; reconnecting");
                continue;
            }

            let delay = backoff.delay_for(failures);
            tracing::error!(
                error = %err,
                attempt = failures,
                delay_secs = delay.as_secs_f64(),
                "MQTT error; retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        tracing::info!("closing MQTT and database connections");
        self.stats.log_totals();
        self.storage.close().await;
        self.stats
    }
}

impl<S: RecordSink> MessageHandler for Coordinator<S> {
    async fn handle(&mut self, message: InboundMessage) {
        let outcome = self.process(&message.payload).await;
        let lag_ms = (Utc::now() - message.received_at).num_milliseconds();
        let topic = message.topic.as_str();
        match outcome {
            Outcome::Persisted(ack) => tracing::debug!(topic, lag_ms, id = ack.id, "handled message"),
            Outcome::Rejected(err) => tracing::debug!(topic, lag_ms, reason = %err, "message rejected"),
            Outcome::Dropped(err) => tracing::debug!(topic, lag_ms, reason = %err, "message dropped"),
        }
    }
}

/// Connects the database (fatal on exhaustion) and then supervises the broker
/// session until `cancel` fires.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let storage = match StorageConnector::connect(
        &config.database,
        &config.db_connect_retry,
        config.db_write_retry.clone(),
    )
    .await
    {
        Ok(storage) => storage,
        Err(err) => {
            tracing::error!(error = %err, "could not connect to the database; exiting");
            return Err(err.into());
        }
    };

    Coordinator::new(storage)
        .supervise(BrokerClient::new(config.broker), config.broker_backoff, cancel)
        .await;
    Ok(())
}
