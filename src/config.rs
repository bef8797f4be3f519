use std::path::PathBuf;
use thiserror::Error;
use url::Url;

pub const TRANSPORT_ENV: &str = "PILOTWRIGHT_TRANSPORT";
pub const API_KEY_ENV: &str = "PILOTWRIGHT_API_KEY";
pub const FALLBACK_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const BASE_URL_ENV: &str = "PILOTWRIGHT_BASE_URL";
pub const MODEL_ENV: &str = "PILOTWRIGHT_MODEL";
pub const LOCALE_ENV: &str = "PILOTWRIGHT_LOCALE";
pub const DB_PATH_ENV: &str = "PILOTWRIGHT_DB_PATH";
pub const LOG_ENV: &str = "PILOTWRIGHT_LOG";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_LOCALE: &str = "en";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown transport '{0}' (expected openai, mock or none)")]
    UnknownTransport(String),
    #[error("invalid base url '{value}': {reason}")]
    InvalidBaseUrl { value: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    None,
    Mock,
    OpenAi,
}

impl TransportMode {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(Self::None),
            "mock" => Ok(Self::Mock),
            "openai" | "local_http" => Ok(Self::OpenAi),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub transport: TransportMode,
    pub api_key: Option<String>,
    pub base_url: Url,
    pub model: String,
    pub locale: String,
    pub db_path: Option<PathBuf>,
    pub log_filter: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let transport = match read(TRANSPORT_ENV) {
            Some(value) => TransportMode::parse(&value)?,
            None => TransportMode::None,
        };
        let base_url = parse_base_url(read(BASE_URL_ENV).as_deref().unwrap_or(DEFAULT_BASE_URL))?;

        Ok(Self {
            transport,
            api_key: read(API_KEY_ENV).or_else(|| read(FALLBACK_API_KEY_ENV)),
            base_url,
            model: read(MODEL_ENV).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            locale: read(LOCALE_ENV).unwrap_or_else(|| DEFAULT_LOCALE.to_string()),
            db_path: read(DB_PATH_ENV).map(PathBuf::from),
            log_filter: read(LOG_ENV).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        })
    }
}

fn parse_base_url(value: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBaseUrl {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(value).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return Err(invalid("only http and https are supported")),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, ConfigError, TransportMode, DEFAULT_MODEL};
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_means_no_backend() {
        let config = AppConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.transport, TransportMode::None);
        assert_eq!(config.api_key, None);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.locale, "en");
        assert!(config.db_path.is_none());
    }

    #[test]
    fn reads_transport_key_and_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PILOTWRIGHT_TRANSPORT", "OpenAI"),
            ("OPENAI_API_KEY", "sk-test"),
            ("PILOTWRIGHT_BASE_URL", "http://127.0.0.1:8080/v1"),
            ("PILOTWRIGHT_LOCALE", "ja"),
            ("PILOTWRIGHT_DB_PATH", "/tmp/pilots.sqlite"),
        ]))
        .expect("config");
        assert_eq!(config.transport, TransportMode::OpenAi);
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.base_url.as_str(), "http://127.0.0.1:8080/v1");
        assert_eq!(config.locale, "ja");
        assert_eq!(
            config.db_path.as_deref(),
            Some(std::path::Path::new("/tmp/pilots.sqlite"))
        );
    }

    #[test]
    fn primary_key_wins_over_fallback_key() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PILOTWRIGHT_API_KEY", "primary"),
            ("OPENAI_API_KEY", "fallback"),
        ]))
        .expect("config");
        assert_eq!(config.api_key.as_deref(), Some("primary"));
    }

    #[test]
    fn rejects_unknown_transport_and_bad_urls() {
        assert_eq!(
            AppConfig::from_lookup(lookup(&[("PILOTWRIGHT_TRANSPORT", "carrier-pigeon")]))
                .expect_err("bad transport"),
            ConfigError::UnknownTransport("carrier-pigeon".to_string())
        );
        assert!(matches!(
            AppConfig::from_lookup(lookup(&[("PILOTWRIGHT_BASE_URL", "ftp://example.com")])),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            AppConfig::from_lookup(lookup(&[("PILOTWRIGHT_BASE_URL", "not a url")])),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
    }
}
