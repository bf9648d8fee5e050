//! Process configuration.
//!
//! Everything is read once from the environment at startup; stores live
//! under `{data_dir}` as `tasks.json`, `audit.log`, and `outbox.json`.

use std::path::PathBuf;
use std::time::Duration;

use crate::outbox::DeliveryConfig;

/// Which delivery backend the outbox uses. Selected by configuration, not
/// per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailProvider {
    Resend,
    Smtp,
    /// Configured name not recognized (or nothing configured); eligible
    /// items fail terminally rather than retrying forever.
    None,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Hostname this client announces in EHLO.
    pub ehlo_hostname: String,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub enabled: bool,
    pub provider: EmailProvider,
    pub from_address: String,
    pub resend_api_key: Option<String>,
    pub smtp: Option<SmtpConfig>,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub delivery_interval_secs: u64,
}

impl EmailConfig {
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Operator credential for the administrative endpoints. When unset,
    /// operator endpoints are refused outright.
    pub admin_token: Option<String>,
    pub email: EmailConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let provider = match std::env::var("EMAIL_PROVIDER").as_deref() {
            Ok("resend") => EmailProvider::Resend,
            Ok("smtp") => EmailProvider::Smtp,
            Ok(other) => {
                tracing::warn!("Unrecognized EMAIL_PROVIDER {:?}", other);
                EmailProvider::None
            }
            Err(_) => EmailProvider::None,
        };

        let smtp = match (
            std::env::var("SMTP_HOST").ok(),
            std::env::var("SMTP_USERNAME").ok(),
            std::env::var("SMTP_PASSWORD").ok(),
        ) {
            (Some(host), Some(username), Some(password)) => Some(SmtpConfig {
                host,
                port: env_or("SMTP_PORT", 587),
                username,
                password,
                ehlo_hostname: std::env::var("SMTP_EHLO_HOSTNAME")
                    .unwrap_or_else(|_| "localhost".to_string()),
            }),
            _ => None,
        };

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8099),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            email: EmailConfig {
                enabled: env_or("EMAIL_ENABLED", true),
                provider,
                from_address: std::env::var("EMAIL_FROM")
                    .unwrap_or_else(|_| "companion@localhost".to_string()),
                resend_api_key: std::env::var("RESEND_API_KEY").ok(),
                smtp,
                max_attempts: env_or("EMAIL_MAX_ATTEMPTS", 3),
                base_backoff_ms: env_or("EMAIL_BASE_BACKOFF_MS", 60_000),
                max_backoff_ms: env_or("EMAIL_MAX_BACKOFF_MS", 3_600_000),
                delivery_interval_secs: env_or("EMAIL_DELIVERY_INTERVAL_SECS", 60),
            },
        }
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("audit.log")
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.data_dir.join("outbox.json")
    }
}
