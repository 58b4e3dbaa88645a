use std::{env, net::SocketAddr, net::AddrParseError, path::PathBuf};

use chrono::FixedOffset;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub db_url: Option<String>,
    pub capability_schema_dir: PathBuf,
    pub dispatch_worker_concurrency: usize,
    pub platform_account_id: uuid::Uuid,
    /// Timezone the Budget Gate treats as "today" for the per-day spend cap
    /// (§4.4). Expressed as a fixed UTC offset since the service has no
    /// per-account locale; defaults to UTC.
    pub canonical_timezone: FixedOffset,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RUNTIME_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid RUNTIME_DISPATCH_WORKER_CONCURRENCY: {0}")]
    InvalidDispatchWorkerConcurrency(String),
    #[error("invalid RUNTIME_PLATFORM_ACCOUNT_ID: {0}")]
    InvalidPlatformAccountId(String),
    #[error("invalid RUNTIME_CANONICAL_TIMEZONE_OFFSET_HOURS: {0}")]
    InvalidCanonicalTimezone(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("RUNTIME_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4100".to_string())
            .parse()?;
        let service_name =
            env::var("RUNTIME_SERVICE_NAME").unwrap_or_else(|_| "task-market-runtime".to_string());
        let build_sha = env::var("RUNTIME_BUILD_SHA").unwrap_or_else(|_| "dev".to_string());
        let db_url = env::var("DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let capability_schema_dir = env::var("RUNTIME_CAPABILITY_SCHEMA_DIR")
            .unwrap_or_else(|_| "config/capabilities".to_string())
            .into();
        let dispatch_worker_concurrency = env::var("RUNTIME_DISPATCH_WORKER_CONCURRENCY")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|error: std::num::ParseIntError| {
                ConfigError::InvalidDispatchWorkerConcurrency(error.to_string())
            })?;
        let platform_account_id = env::var("RUNTIME_PLATFORM_ACCOUNT_ID")
            .ok()
            .map(|value| {
                value
                    .parse()
                    .map_err(|error: uuid::Error| ConfigError::InvalidPlatformAccountId(error.to_string()))
            })
            .transpose()?
            .unwrap_or_else(uuid::Uuid::nil);
        let canonical_timezone = env::var("RUNTIME_CANONICAL_TIMEZONE_OFFSET_HOURS")
            .ok()
            .map(|value| {
                value
                    .parse::<i32>()
                    .map_err(|error| ConfigError::InvalidCanonicalTimezone(error.to_string()))
                    .and_then(|hours| {
                        FixedOffset::east_opt(hours * 3600)
                            .ok_or_else(|| ConfigError::InvalidCanonicalTimezone(value.clone()))
                    })
            })
            .transpose()?
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            db_url,
            capability_schema_dir,
            dispatch_worker_concurrency,
            platform_account_id,
            canonical_timezone,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_defaults_when_unset() {
        std::env::remove_var("RUNTIME_BIND_ADDR");
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_addr.port(), 4100);
    }
}
