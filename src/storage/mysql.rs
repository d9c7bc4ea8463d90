use super::RecordSink;
use crate::codec::TelemetryRecord;
use crate::config::DatabaseConfig;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, Transaction};
use std::time::Duration;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const INSERT_RECORD: &str = r#"
    INSERT INTO data_reg
        (id_data, codigo_chip, cuenta_in1, cuenta_in2, cuenta_out1, cuenta_out2,
         crc, evento, estado_relay, Fecha_data, codigo_data_id)
    VALUES (NULL, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP, NULL)
"#;

/// Owns a pool capped at one connection, so writes stay serialized on a single
/// session while a connection the server dropped is replaced on next use.
pub struct MySqlSink {
    pool: MySqlPool,
}

impl MySqlSink {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.name)
            .charset("utf8mb4");
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .test_before_acquire(true)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

async fn insert_row(
    tx: &mut Transaction<'_, MySql>,
    record: &TelemetryRecord,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(INSERT_RECORD)
        .bind(&record.chip_code)
        .bind(&record.count_in1)
        .bind(&record.count_in2)
        .bind(&record.count_out1)
        .bind(&record.count_out2)
        .bind(&record.crc)
        .bind(&record.event)
        .bind(&record.relay_state)
        .execute(&mut **tx)
        .await?;
    Ok(result.last_insert_id())
}

impl RecordSink for MySqlSink {
    async fn insert(&mut self, record: &TelemetryRecord) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        match insert_row(&mut tx, record).await {
            Ok(id) => {
                tx.commit().await?;
                Ok(id)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback after failed insert also failed");
                } else {
                    tracing::debug!("rolled back failed insert");
                }
                Err(err)
            }
        }
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        self.pool.close().await;
        Ok(())
    }
}
