use crate::retry::{Backoff, RetryPolicy};
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use rumqttc::QoS;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CLIENT_ID: &str = "Servidor de Datos";

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    db_host: Option<String>,
    #[serde(default)]
    db_port: Option<u16>,
    #[serde(default)]
    db_user: Option<String>,
    #[serde(default)]
    db_password: Option<String>,
    #[serde(default)]
    db_name: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic: Option<String>,
    #[serde(default)]
    mqtt_client_id: Option<String>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env only"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env only"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub client_id: String,
    pub keepalive_secs: u64,
    pub qos: QoS,
    pub reconnect_delay_secs: u64,
}

impl BrokerConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub db_connect_retry: RetryPolicy,
    pub db_write_retry: RetryPolicy,
    pub broker_backoff: Backoff,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let vars: HashMap<String, String> = std::env::vars().collect();
        let overrides = vars
            .get("BRIDGE_SETUP_CONFIG_PATH")
            .map(|path| path.trim())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .and_then(|path| load_setup_config_overrides(&path))
            .unwrap_or_default();

        Self::from_vars(&vars, &overrides)
    }

    fn from_vars(vars: &HashMap<String, String>, overrides: &SetupConfigOverrides) -> Result<Self> {
        let lookup = |key: &str| {
            vars.get(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let or_override = |key: &str, fallback: &Option<String>| {
            lookup(key).or_else(|| {
                fallback
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
        };

        let database = DatabaseConfig {
            host: or_override("DB_HOST", &overrides.db_host).context("DB_HOST is required")?,
            port: parse_var(vars, "DB_PORT")?
                .or(overrides.db_port)
                .unwrap_or(3306),
            user: or_override("DB_USER", &overrides.db_user).context("DB_USER is required")?,
            password: or_override("DB_PASSWORD", &overrides.db_password),
            name: or_override("DB_NAME", &overrides.db_name).context("DB_NAME is required")?,
        };

        let qos = match parse_var::<u8>(vars, "MQTT_QOS")?.unwrap_or(0) {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => bail!("MQTT_QOS must be 0, 1 or 2 (got {other})"),
        };

        let broker = BrokerConfig {
            host: or_override("MQTT_HOST", &overrides.mqtt_host)
                .context("MQTT_HOST is required")?,
            port: parse_var(vars, "MQTT_PORT")?
                .or(overrides.mqtt_port)
                .unwrap_or(1883),
            username: or_override("MQTT_USER", &overrides.mqtt_username),
            password: or_override("MQTT_PASSWORD", &overrides.mqtt_password),
            topic: or_override("MQTT_TOPIC", &overrides.mqtt_topic)
                .context("MQTT_TOPIC is required")?,
            client_id: or_override("MQTT_CLIENT_ID", &overrides.mqtt_client_id)
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            keepalive_secs: parse_var(vars, "MQTT_KEEPALIVE_SECS")?.unwrap_or(60),
            qos,
            reconnect_delay_secs: parse_var(vars, "BRIDGE_MQTT_RECONNECT_DELAY_SECS")?
                .unwrap_or(5),
        };

        let db_connect_retry = RetryPolicy::fixed(
            parse_var(vars, "BRIDGE_DB_CONNECT_ATTEMPTS")?.unwrap_or(5),
            Duration::from_secs(parse_var(vars, "BRIDGE_DB_CONNECT_DELAY_SECS")?.unwrap_or(5)),
        );
        let db_write_retry = RetryPolicy::fixed(
            parse_var(vars, "BRIDGE_DB_WRITE_ATTEMPTS")?.unwrap_or(3),
            Duration::from_millis(parse_var(vars, "BRIDGE_DB_WRITE_DELAY_MS")?.unwrap_or(1000)),
        );

        let retry_delay =
            Duration::from_secs(parse_var(vars, "BRIDGE_MQTT_RETRY_DELAY_SECS")?.unwrap_or(5));
        let retry_max =
            Duration::from_secs(parse_var(vars, "BRIDGE_MQTT_RETRY_MAX_SECS")?.unwrap_or(60));
        let backoff = match lookup("BRIDGE_MQTT_BACKOFF").as_deref() {
            None | Some("fixed") => Backoff::Fixed(retry_delay),
            Some("exponential") => Backoff::Exponential {
                initial: retry_delay,
                max: retry_max.max(retry_delay),
            },
            Some(other) => bail!("BRIDGE_MQTT_BACKOFF must be fixed or exponential (got {other})"),
        };

        Ok(Self {
            database,
            broker,
            db_connect_retry,
            db_write_retry,
            broker_backoff: backoff,
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match vars.get(key).map(|value| value.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(None),
    }
}
