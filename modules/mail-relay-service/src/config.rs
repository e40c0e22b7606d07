//! Service configuration, built once at startup and shared read-only.

use crate::error::ConfigError;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9103;
pub const DEFAULT_COLUMNS: &str = "timestamp=A,from=B,subject=C";

/// Static layout of one sink (sheet)
#[derive(Debug, Clone)]
pub struct SheetConfig {
    /// Sheet (tab) name; doubles as the sink identity
    pub name: String,
    /// Google spreadsheet id; unset means the local SQLite sheet
    pub spreadsheet_id: Option<String>,
    /// Ordered (field name, column letters) pairs
    pub columns: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub db_path: String,
    /// Gmail user id used in API paths (`me` for the authorised account)
    pub user_id: String,
    /// Pub/Sub topic the Gmail watch publishes to
    pub topic: Option<String>,
    pub labels: Vec<String>,
    pub sheet: SheetConfig,
    pub http_timeout: Duration,
    pub run_timeout: Duration,
    /// How long before watch expiry the renewal fires
    pub renew_margin: Duration,
    pub notify_header: String,
    /// Shared token expected on the Pub/Sub push endpoint
    pub push_token: Option<String>,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = parse_or(&get, "MAIL_RELAY_PORT", DEFAULT_PORT)?;
        let http_timeout_secs: u64 = parse_or(&get, "MAIL_RELAY_HTTP_TIMEOUT_SECS", 30)?;
        let run_timeout_secs: u64 = parse_or(&get, "MAIL_RELAY_RUN_TIMEOUT_SECS", 120)?;
        let renew_margin_secs: u64 = parse_or(&get, "MAIL_RELAY_RENEW_MARGIN_SECS", 3600)?;

        let labels = get("MAIL_RELAY_LABELS")
            .unwrap_or_else(|| "INBOX".to_string())
            .split(',')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let columns = parse_columns(
            &get("MAIL_RELAY_COLUMNS").unwrap_or_else(|| DEFAULT_COLUMNS.to_string()),
        )?;

        Ok(Self {
            port,
            db_path: get("MAIL_RELAY_DB_PATH").unwrap_or_else(|| "./mail_relay.db".to_string()),
            user_id: get("MAIL_RELAY_USER_ID").unwrap_or_else(|| "me".to_string()),
            topic: get("MAIL_RELAY_TOPIC"),
            labels,
            sheet: SheetConfig {
                name: get("MAIL_RELAY_SHEET_NAME").unwrap_or_else(|| "Emails".to_string()),
                spreadsheet_id: get("MAIL_RELAY_SPREADSHEET_ID"),
                columns,
            },
            http_timeout: Duration::from_secs(http_timeout_secs),
            run_timeout: Duration::from_secs(run_timeout_secs),
            renew_margin: Duration::from_secs(renew_margin_secs),
            notify_header: get("MAIL_RELAY_NOTIFY_HEADER")
                .unwrap_or_else(|| "New emails".to_string()),
            push_token: get("MAIL_RELAY_PUSH_TOKEN"),
        })
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

/// Parse `name=LETTERS` pairs separated by commas
pub fn parse_columns(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, letters)) if !name.trim().is_empty() && !letters.trim().is_empty() => {
                Ok((name.trim().to_string(), letters.trim().to_string()))
            }
            _ => Err(ConfigError::Invalid {
                key: "MAIL_RELAY_COLUMNS".to_string(),
                value: pair.to_string(),
            }),
        })
        .collect()
}
