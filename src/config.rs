use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::OfficeClock;
use crate::model::TransitionPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Server settings, read from `ROOMKEEP_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub admins: Vec<String>,
    pub clock: OfficeClock,
    pub policy: TransitionPolicy,
    pub seed_default_room: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "roomkeep".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            admins: vec!["admin".into()],
            clock: OfficeClock::utc(),
            policy: TransitionPolicy::Lenient,
            seed_default_room: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(v) = get("ROOMKEEP_PORT") {
            config.port = parse("ROOMKEEP_PORT", &v)?;
        }
        if let Some(v) = get("ROOMKEEP_BIND") {
            config.bind = v;
        }
        if let Some(v) = get("ROOMKEEP_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ROOMKEEP_PASSWORD") {
            config.password = v;
        }
        if let Some(v) = get("ROOMKEEP_MAX_CONNECTIONS") {
            config.max_connections = parse("ROOMKEEP_MAX_CONNECTIONS", &v)?;
            if config.max_connections == 0 {
                return Err(invalid("ROOMKEEP_MAX_CONNECTIONS", &v, "must be at least 1"));
            }
        }
        if let Some(v) = get("ROOMKEEP_COMPACT_THRESHOLD") {
            config.compact_threshold = parse("ROOMKEEP_COMPACT_THRESHOLD", &v)?;
        }
        if let Some(v) = get("ROOMKEEP_METRICS_PORT") {
            config.metrics_port = Some(parse("ROOMKEEP_METRICS_PORT", &v)?);
        }
        config.tls_cert = get("ROOMKEEP_TLS_CERT").map(PathBuf::from);
        config.tls_key = get("ROOMKEEP_TLS_KEY").map(PathBuf::from);
        if let Some(v) = get("ROOMKEEP_ADMINS") {
            config.admins = v
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("ROOMKEEP_UTC_OFFSET") {
            let minutes: i32 = parse("ROOMKEEP_UTC_OFFSET", &v)?;
            config.clock = OfficeClock::from_offset_minutes(minutes)
                .ok_or_else(|| invalid("ROOMKEEP_UTC_OFFSET", &v, "offset must be under 24 hours"))?;
        }
        if let Some(v) = get("ROOMKEEP_STRICT_TRANSITIONS") {
            config.policy = if parse_bool("ROOMKEEP_STRICT_TRANSITIONS", &v)? {
                TransitionPolicy::Strict
            } else {
                TransitionPolicy::Lenient
            };
        }
        if let Some(v) = get("ROOMKEEP_SEED_DEFAULT_ROOM") {
            config.seed_default_room = parse_bool("ROOMKEEP_SEED_DEFAULT_ROOM", &v)?;
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| invalid(var, value, e.to_string()))
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "expected a boolean")),
    }
}
