//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;

#[derive(Debug)]
pub struct Config {
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub mail: MailConfig,
    /// Admin HTTP listen port.
    pub port: u16,
    /// Failed deliveries before a message is dead-lettered. None = requeue forever.
    pub max_delivery_attempts: Option<u32>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Key-value store connection settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<SecretString>,
    pub database: i64,
}

/// Message broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// AMQP URL, usually carrying credentials.
    pub url: SecretString,
}

/// Outbound mail settings. `host == None` selects the log-only notifier.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub host: Option<String>,
    pub port: u16,
    pub secure: bool,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub from: String,
    /// Domain appended to a student NIM to form the recipient address.
    pub student_domain: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            store: StoreConfig::from_env()?,
            broker: BrokerConfig::from_env()?,
            mail: MailConfig::from_env()?,
            port: parsed_var("PORT")?.unwrap_or(3004),
            max_delivery_attempts: delivery_attempts()?,
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: required_var("REDIS_HOST")?,
            port: parsed_var("REDIS_PORT")?.unwrap_or(6379),
            password: optional_var("REDIS_PASSWORD").map(SecretString::from),
            database: parsed_var("REDIS_DB")?.unwrap_or(0),
        })
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: SecretString::from(required_var("RABBITMQ_URL")?),
        })
    }
}

impl MailConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: optional_var("SMTP_HOST"),
            port: parsed_var("SMTP_PORT")?.unwrap_or(587),
            secure: optional_var("SMTP_SECURE").is_some_and(|v| v == "true"),
            user: optional_var("SMTP_USER"),
            password: optional_var("SMTP_PASSWORD").map(SecretString::from),
            from: optional_var("EMAIL_FROM")
                .unwrap_or_else(|| "SIAKAD System <noreply@siakad.ac.id>".to_string()),
            student_domain: optional_var("STUDENT_EMAIL_DOMAIN")
                .unwrap_or_else(|| "student.ac.id".to_string()),
        })
    }
}

fn delivery_attempts() -> Result<Option<u32>> {
    match parsed_var("MAX_DELIVERY_ATTEMPTS")? {
        Some(0) => Err(Error::Config(
            "MAX_DELIVERY_ATTEMPTS must be at least 1; unset it to requeue forever".to_string(),
        )),
        attempts => Ok(attempts),
    }
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and empty values both read as absent.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}")))
        })
        .transpose()
}
