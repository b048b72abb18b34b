use serde::Deserialize;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::str::FromStr;

fn default_max_file_size() -> usize {
    // 10 MB in bytes
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub max_file_size: usize,
    pub default_encoding: String,
    pub sample_size: usize,
    pub sample_seed: u64,
    pub session_idle_secs: u64,
    pub max_sessions: u64,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            max_file_size: default_max_file_size(),
            default_encoding: "utf-8".to_string(),
            sample_size: 1000,
            sample_seed: 42,
            session_idle_secs: 3600,
            max_sessions: 256,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Reads `DASHBOARD_*` variables, after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        Ok(Config {
            bind_addr: parse_var(&lookup, "DASHBOARD_BIND_ADDR", defaults.bind_addr)?,
            max_file_size: parse_var(&lookup, "DASHBOARD_MAX_FILE_SIZE", defaults.max_file_size)?,
            default_encoding: lookup("DASHBOARD_DEFAULT_ENCODING")
                .unwrap_or(defaults.default_encoding),
            sample_size: parse_var(&lookup, "DASHBOARD_SAMPLE_SIZE", defaults.sample_size)?,
            sample_seed: parse_var(&lookup, "DASHBOARD_SAMPLE_SEED", defaults.sample_seed)?,
            session_idle_secs: parse_var(&lookup, "DASHBOARD_SESSION_IDLE_SECS", defaults.session_idle_secs)?,
            max_sessions: parse_var(&lookup, "DASHBOARD_MAX_SESSIONS", defaults.max_sessions)?,
            log_format: parse_var(&lookup, "DASHBOARD_LOG_FORMAT", defaults.log_format)?,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Failed to parse {}={}", key, raw)),
        None => Ok(default),
    }
}

pub fn load_config() -> Result<Config> {
    Config::from_env()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.sample_seed, 42);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup_from(&[
            ("DASHBOARD_BIND_ADDR", "0.0.0.0:8080"),
            ("DASHBOARD_SAMPLE_SIZE", "50"),
            ("DASHBOARD_LOG_FORMAT", "json"),
            ("DASHBOARD_DEFAULT_ENCODING", "gbk"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.sample_size, 50);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.default_encoding, "gbk");
    }

    #[test]
    fn invalid_value_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[("DASHBOARD_MAX_SESSIONS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("DASHBOARD_MAX_SESSIONS"));
    }
}
