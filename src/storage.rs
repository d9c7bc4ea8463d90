mod mysql;

#[cfg(test)]
pub(crate) mod tests;

pub use mysql::MySqlSink;

use crate::codec::TelemetryRecord;
use crate::config::DatabaseConfig;
use crate::retry::RetryPolicy;
use std::future::Future;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database unreachable after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error("insert failed after {attempts} attempts: {source}")]
    Write {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
}

/// Acknowledgement for a persisted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub id: u64,
    pub attempts: u32,
}

/// A single-owner destination for decoded records.
///
/// `insert` runs one attempt inside its own transaction and must leave no
/// partial row behind when it fails.
pub trait RecordSink {
    fn insert(&mut self, record: &TelemetryRecord) -> impl Future<Output = Result<u64, sqlx::Error>>;

    fn close(self) -> impl Future<Output = Result<(), sqlx::Error>>;
}

pub struct StorageConnector<S> {
    sink: S,
    write_retry: RetryPolicy,
}

impl StorageConnector<MySqlSink> {
    /// Opens the database connection, retrying per `connect_retry`.
    pub async fn connect(
        config: &DatabaseConfig,
        connect_retry: &RetryPolicy,
        write_retry: RetryPolicy,
    ) -> Result<Self, StorageError> {
        let sink = connect_with_retry(connect_retry, || MySqlSink::connect(config)).await?;
        tracing::info!(host = %config.host, port = config.port, database = %config.name, "connected to database");
        Ok(Self::new(sink, write_retry))
    }
}

impl<S: RecordSink> StorageConnector<S> {
    pub fn new(sink: S, write_retry: RetryPolicy) -> Self {
        Self { sink, write_retry }
    }

    /// Inserts `record`, retrying failed attempts until the write budget runs out.
    pub async fn write(&mut self, record: &TelemetryRecord) -> Result<WriteAck, StorageError> {
        let mut attempt = 1;
        loop {
            match self.sink.insert(record).await {
                Ok(id) => {
                    return Ok(WriteAck {
                        id,
                        attempts: attempt,
                    })
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        attempt,
                        max_attempts = self.write_retry.budget(),
                        chip = %record.chip_code,
                        "failed to insert telemetry record"
                    );
                    if !self.write_retry.should_retry(attempt) {
                        return Err(StorageError::Write {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    sleep(self.write_retry.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn close(self) {
        match self.sink.close().await {
            Ok(()) => tracing::info!("database connection closed"),
            Err(err) => tracing::warn!(error = %err, "failed to close database connection cleanly"),
        }
    }

    #[cfg(test)]
    pub(crate) fn sink(&self) -> &S {
        &self.sink
    }
}

/// Runs `connect` until it succeeds or `policy` is exhausted.
pub async fn connect_with_retry<T, F, Fut>(policy: &RetryPolicy, mut connect: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 1;
    loop {
        match connect().await {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                tracing::error!(
                    error = %err,
                    attempt,
                    max_attempts = policy.budget(),
                    "failed to connect to database"
                );
                if !policy.should_retry(attempt) {
                    return Err(StorageError::Connect {
                        attempts: attempt,
                        source: err,
                    });
                }
                sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}
