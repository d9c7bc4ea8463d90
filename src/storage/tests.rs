use super::{connect_with_retry, MySqlSink, RecordSink, StorageConnector, StorageError, WriteAck};
use crate::codec::{decode, TelemetryRecord};
use crate::retry::RetryPolicy;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{Connection, Executor, MySqlConnection, Row};
use std::cell::Cell;
use std::collections::VecDeque;
use std::env;
use std::time::Duration;

/// In-memory sink that fails according to a script, then succeeds.
#[derive(Default)]
pub(crate) struct ScriptedSink {
    pub(crate) failures: VecDeque<sqlx::Error>,
    pub(crate) rows: Vec<TelemetryRecord>,
    pub(crate) attempts: Vec<String>,
}

impl ScriptedSink {
    pub(crate) fn failing(times: usize) -> Self {
        Self {
            failures: (0..times)
                .map(|i| sqlx::Error::Protocol(format!("scripted failure {i}")))
                .collect(),
            ..Self::default()
        }
    }
}

impl RecordSink for ScriptedSink {
    async fn insert(&mut self, record: &TelemetryRecord) -> Result<u64, sqlx::Error> {
        self.attempts.push(record.chip_code.clone());
        if let Some(err) = self.failures.pop_front() {
            return Err(err);
        }
        self.rows.push(record.clone());
        Ok(self.rows.len() as u64)
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

fn no_delay(attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(attempts, Duration::ZERO)
}

#[tokio::test]
async fn write_succeeds_on_first_attempt() -> Result<()> {
    let mut storage = StorageConnector::new(ScriptedSink::default(), no_delay(3));
    let record = decode(b"ABC123&1&2&3&4&CRCX&EVT1&ON")?;

    let ack = storage.write(&record).await?;

    assert_eq!(ack, WriteAck { id: 1, attempts: 1 });
    assert_eq!(storage.sink().rows, vec![record]);
    Ok(())
}

#[tokio::test]
async fn write_recovers_after_two_failures() -> Result<()> {
    let mut storage = StorageConnector::new(ScriptedSink::failing(2), no_delay(3));
    let record = decode(b"ABC123&1&2&3&4&CRCX&EVT1&ON")?;

    let ack = storage.write(&record).await?;

    assert_eq!(ack.attempts, 3);
    assert_eq!(storage.sink().rows.len(), 1);
    assert_eq!(storage.sink().attempts.len(), 3);
    Ok(())
}

#[tokio::test]
async fn persistent_write_failure_stops_after_three_attempts() -> Result<()> {
    let mut storage = StorageConnector::new(ScriptedSink::failing(10), no_delay(3));
    let record = decode(b"ABC123&1&2&3&4&CRCX&EVT1&ON")?;

    let err = storage.write(&record).await.unwrap_err();

    assert!(matches!(err, StorageError::Write { attempts: 3, .. }));
    assert_eq!(storage.sink().attempts.len(), 3);
    assert!(storage.sink().rows.is_empty());

    // The connector stays usable for the next record.
    storage.sink.failures.clear();
    let ack = storage.write(&record).await?;
    assert_eq!(ack.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn connect_gives_up_after_budget() {
    let calls = Cell::new(0u32);
    let result: Result<(), StorageError> =
        connect_with_retry(&no_delay(5), || {
            calls.set(calls.get() + 1);
            async { Err(sqlx::Error::PoolTimedOut) }
        })
        .await;

    assert!(matches!(result, Err(StorageError::Connect { attempts: 5, .. })));
    assert_eq!(calls.get(), 5);
}

#[tokio::test]
async fn connect_returns_first_success() -> Result<()> {
    let calls = Cell::new(0u32);
    let value = connect_with_retry(&no_delay(5), || {
        calls.set(calls.get() + 1);
        let attempt = calls.get();
        async move {
            if attempt < 3 {
                Err(sqlx::Error::PoolTimedOut)
            } else {
                Ok(attempt)
            }
        }
    })
    .await?;

    assert_eq!(value, 3);
    assert_eq!(calls.get(), 3);
    Ok(())
}

/// Single-connection pool against `BRIDGE_TEST_DATABASE_URL` with `data_reg`
/// in place, or `None` when integration tests are disabled.
async fn integration_pool() -> Result<Option<(MySqlPool, String)>> {
    if env::var("BRIDGE_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return Ok(None);
    }
    let database_url = match env::var("BRIDGE_TEST_DATABASE_URL") {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };

    let pool = MySqlPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS data_reg (
            id_data bigint auto_increment primary key,
            codigo_chip varchar(64) not null,
            cuenta_in1 varchar(32) null,
            cuenta_in2 varchar(32) null,
            cuenta_out1 varchar(32) null,
            cuenta_out2 varchar(32) null,
            crc varchar(32) null,
            evento varchar(32) null,
            estado_relay varchar(32) null,
            Fecha_data timestamp not null default current_timestamp,
            codigo_data_id bigint null
        )
        "#,
    )
    .execute(&pool)
    .await?;
    Ok(Some((pool, database_url)))
}

async fn connection_id(pool: &MySqlPool) -> Result<u64> {
    let (id,): (u64,) = sqlx::query_as("SELECT CONNECTION_ID()")
        .fetch_one(pool)
        .await?;
    Ok(id)
}

async fn delete_row(pool: &MySqlPool, id: u64) -> Result<()> {
    sqlx::query("DELETE FROM data_reg WHERE id_data = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_mysql_insert_sets_timestamp_and_null_link() -> Result<()> {
    let Some((pool, _)) = integration_pool().await? else {
        return Ok(());
    };

    let mut storage = StorageConnector::new(MySqlSink::from_pool(pool.clone()), no_delay(3));
    let chip = format!("itest-{}", std::process::id());
    let payload = format!("{chip}&1&2&3&4&CRCX&EVT1&ON");
    let ack = storage.write(&decode(payload.as_bytes())?).await?;
    assert_eq!(ack.attempts, 1);
    assert!(ack.id > 0);

    let row = sqlx::query(
        "SELECT codigo_chip, estado_relay, Fecha_data, codigo_data_id FROM data_reg WHERE id_data = ?",
    )
    .bind(ack.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(row.try_get::<String, _>("codigo_chip")?, chip);
    assert_eq!(row.try_get::<String, _>("estado_relay")?, "ON");
    assert!(row.try_get::<Option<DateTime<Utc>>, _>("Fecha_data")?.is_some());
    assert_eq!(row.try_get::<Option<i64>, _>("codigo_data_id")?, None);

    delete_row(&pool, ack.id).await?;
    storage.close().await;
    Ok(())
}

#[tokio::test]
async fn test_mysql_failed_insert_rolls_back_and_connection_stays_usable() -> Result<()> {
    let Some((pool, _)) = integration_pool().await? else {
        return Ok(());
    };
    sqlx::query("SET SESSION sql_mode = 'STRICT_ALL_TABLES'")
        .execute(&pool)
        .await?;
    let session = connection_id(&pool).await?;

    let mut storage = StorageConnector::new(MySqlSink::from_pool(pool.clone()), no_delay(3));
    let oversize = format!("rb{}", "X".repeat(100));
    let record = decode(format!("{oversize}&1&2&3&4&C&E&ON").as_bytes())?;
    let err = storage.write(&record).await.unwrap_err();
    assert!(matches!(err, StorageError::Write { attempts: 3, .. }), "got {err:?}");

    let (left,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM data_reg WHERE codigo_chip LIKE 'rbXXXX%'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(left, 0);
    assert_eq!(connection_id(&pool).await?, session);

    let chip = format!("itest-rb-{}", std::process::id());
    let ack = storage
        .write(&decode(format!("{chip}&1&2&3&4&C&E&ON").as_bytes())?)
        .await?;
    assert_eq!(ack.attempts, 1);
    assert_eq!(connection_id(&pool).await?, session);

    delete_row(&pool, ack.id).await?;
    storage.close().await;
    Ok(())
}

#[tokio::test]
async fn test_mysql_write_reopens_connection_dropped_by_server() -> Result<()> {
    let Some((pool, database_url)) = integration_pool().await? else {
        return Ok(());
    };
    let killed = connection_id(&pool).await?;
    let mut admin = MySqlConnection::connect(&database_url).await?;
    admin.execute(format!("KILL {killed}").as_str()).await?;
    admin.close().await?;

    let mut storage = StorageConnector::new(MySqlSink::from_pool(pool.clone()), no_delay(3));
    let chip = format!("itest-kill-{}", std::process::id());
    let ack = storage
        .write(&decode(format!("{chip}&1&2&3&4&C&E&ON").as_bytes())?)
        .await?;
    assert!(ack.id > 0);
    assert_ne!(connection_id(&pool).await?, killed);

    delete_row(&pool, ack.id).await?;
    storage.close().await;
    Ok(())
}
