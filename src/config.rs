use crate::errors::{AppError, AppResult};
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_BIND: &str = "127.0.0.1:8787";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_DEFINITIONS: &str = "metrics.yaml";

/// Process-level configuration read once at startup. Runtime tunables live in
/// `AppSettings` instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub definitions_path: PathBuf,
    pub sql_server_gateway: Option<String>,
    pub access_gateway: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_or = |key: &str, default: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_raw = env_or("METRIC_PULSE_BIND", DEFAULT_BIND);
        let bind_addr = bind_raw
            .parse::<SocketAddr>()
            .map_err(|error| AppError::Validation(format!("METRIC_PULSE_BIND '{}': {}", bind_raw, error)))?;
        let data_dir = PathBuf::from(env_or("METRIC_PULSE_DATA_DIR", DEFAULT_DATA_DIR));
        let definitions_path = PathBuf::from(env_or("METRIC_PULSE_DEFINITIONS", DEFAULT_DEFINITIONS));

        let sql_server_gateway = optional("METRIC_PULSE_SQLSERVER_GATEWAY");
        let access_gateway = optional("METRIC_PULSE_ACCESS_GATEWAY");
        for (key, value) in [
            ("METRIC_PULSE_SQLSERVER_GATEWAY", &sql_server_gateway),
            ("METRIC_PULSE_ACCESS_GATEWAY", &access_gateway),
        ] {
            if let Some(url) = value {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(AppError::Validation(format!(
                        "{} must be an http(s) URL, got '{}'",
                        key, url
                    )));
                }
            }
        }

        Ok(Self {
            bind_addr,
            data_dir,
            definitions_path,
            sql_server_gateway,
            access_gateway,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("metric-pulse.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
