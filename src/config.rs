use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::calendar::{CalendarError, SlotCalendar};

/// Server settings, read once from `ROOMBOOK_*` environment variables.
/// Unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub slot_minutes: u32,
    pub utc_offset_minutes: i32,
    pub query_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "roombook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            slot_minutes: 30,
            utc_offset_minutes: 0,
            query_timeout: Duration::from_millis(2000),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; `lookup` receives the full
    /// variable name, e.g. `ROOMBOOK_PORT`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |name: &str| lookup(&format!("ROOMBOOK_{name}"));

        Self {
            port: parse_or(get("PORT"), defaults.port),
            bind: get("BIND").unwrap_or(defaults.bind),
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or(get("MAX_CONNECTIONS"), defaults.max_connections),
            compact_threshold: parse_or(get("COMPACT_THRESHOLD"), defaults.compact_threshold),
            slot_minutes: parse_or(get("SLOT_MINUTES"), defaults.slot_minutes),
            utc_offset_minutes: parse_or(get("UTC_OFFSET_MINUTES"), defaults.utc_offset_minutes),
            query_timeout: get("QUERY_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.query_timeout),
            metrics_port: get("METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert: get("TLS_CERT"),
            tls_key: get("TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }

    /// The slot grid; fails when the slot width or offset is unusable.
    pub fn calendar(&self) -> Result<SlotCalendar, CalendarError> {
        SlotCalendar::from_minutes(self.utc_offset_minutes, self.slot_minutes)
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}
