use crate::error::AppError;
use crate::services::{TransactionPolicies, TransactionPolicy};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    /// Process-local store, for development and tests
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageBackend,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub port: u16,
    pub jwt_secret: Option<String>,
    pub jwt_public_key_pem: Option<String>,
    pub jwt_issuer: Option<String>,
    pub group_tx_timeout: Duration,
    pub initial_message_tx_timeout: Duration,
    pub tx_max_retries: u32,
    pub ws_heartbeat_interval: Duration,
    pub ws_client_timeout: Duration,
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Build from any key/value source; `from_env` passes the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let storage = match lookup("STORAGE_BACKEND").as_deref() {
            None | Some("postgres") => StorageBackend::Postgres,
            Some("memory") => StorageBackend::Memory,
            Some(other) => {
                return Err(AppError::Config(format!(
                    "STORAGE_BACKEND must be postgres or memory, got {other}"
                )))
            }
        };

        let database_url = lookup("DATABASE_URL");
        if storage == StorageBackend::Postgres && database_url.is_none() {
            return Err(AppError::Config("DATABASE_URL missing".into()));
        }

        let jwt_secret = lookup("JWT_SECRET");
        let jwt_public_key_pem = lookup("JWT_PUBLIC_KEY_PEM");
        if jwt_secret.is_none() && jwt_public_key_pem.is_none() {
            return Err(AppError::Config(
                "JWT_SECRET or JWT_PUBLIC_KEY_PEM must be set".into(),
            ));
        }

        Ok(Self {
            storage,
            database_url,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?,
            port: parse_or(&lookup, "PORT", 3000)?,
            jwt_secret,
            jwt_public_key_pem,
            jwt_issuer: lookup("JWT_ISSUER"),
            group_tx_timeout: Duration::from_millis(parse_or(
                &lookup,
                "GROUP_TX_TIMEOUT_MS",
                10_000,
            )?),
            initial_message_tx_timeout: Duration::from_millis(parse_or(
                &lookup,
                "INITIAL_MESSAGE_TX_TIMEOUT_MS",
                15_000,
            )?),
            tx_max_retries: parse_or(&lookup, "TX_MAX_RETRIES", 3)?,
            ws_heartbeat_interval: Duration::from_secs(parse_or(
                &lookup,
                "WS_HEARTBEAT_INTERVAL_SECS",
                5,
            )?),
            ws_client_timeout: Duration::from_secs(parse_or(
                &lookup,
                "WS_CLIENT_TIMEOUT_SECS",
                30,
            )?),
        })
    }

    pub fn transaction_policies(&self) -> TransactionPolicies {
        TransactionPolicies {
            group: TransactionPolicy::with_timeout(self.group_tx_timeout, self.tx_max_retries),
            initial_message: TransactionPolicy::with_timeout(
                self.initial_message_tx_timeout,
                self.tx_max_retries,
            ),
        }
    }
}
