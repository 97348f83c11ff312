//! Application configuration, read from the environment (and `.env`).

use di::inject;
use di::injectable;
use sqlx::sqlite::SqliteConnectOptions;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}`")]
    Invalid { key: &'static str, value: String },
}

/// Generation defaults applied to users without stored settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationDefaults {
    pub temperature: f64,
    pub top_k: i64,
    pub top_p: f64,
    pub repeat_penalty: f64,
    pub max_tokens: i64,
    pub system_prompt: String,
    pub model: String,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            repeat_penalty: 1.1,
            max_tokens: 2048,
            system_prompt: "You are a helpful assistant.".to_owned(),
            model: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: IpAddr,
    pub port: u16,
    pub database_url: String,
    pub llama_url: String,
    /// Inference servers users may select besides `llama_url`.
    pub allowed_servers: Vec<String>,
    /// Longest silence tolerated from the inference server, including the
    /// wait for response headers.
    pub upstream_idle_timeout: Duration,
    /// How long a new generation request waits for the previous session of
    /// the same conversation to wind down before it is rejected.
    pub session_grace: Duration,
    pub allowed_origins: Vec<String>,
    pub defaults: GenerationDefaults,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8000,
            database_url: "sqlite:data/chat.db?mode=rwc".to_owned(),
            llama_url: "http://localhost:8080".to_owned(),
            allowed_servers: Vec::new(),
            upstream_idle_timeout: Duration::from_secs(120),
            session_grace: Duration::from_millis(2000),
            allowed_origins: vec![
                "http://localhost:3000".to_owned(),
                "http://localhost:5173".to_owned(),
            ],
            defaults: GenerationDefaults::default(),
        }
    }
}

#[injectable]
impl AppConfig {
    #[inject]
    pub fn create() -> AppConfig {
        // main validates the environment before the provider is built
        AppConfig::from_env().expect("configuration must be valid")
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup, falling back to
    /// the defaults for missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = AppConfig::default();
        let generation = GenerationDefaults::default();

        let database_url = lookup("DATABASE_URL").unwrap_or(defaults.database_url);
        if SqliteConnectOptions::from_str(&database_url).is_err() {
            return Err(ConfigError::Invalid {
                key: "DATABASE_URL",
                value: database_url,
            });
        }

        Ok(AppConfig {
            host: parse_or(&lookup, "CHAT_HOST", defaults.host)?,
            port: parse_or(&lookup, "CHAT_PORT", defaults.port)?,
            database_url,
            llama_url: lookup("LLAMA_URL")
                .map(|url| normalize_server(&url))
                .unwrap_or(defaults.llama_url),
            allowed_servers: lookup("ALLOWED_SERVERS")
                .map(|servers| split_list(&servers).map(normalize_server).collect())
                .unwrap_or(defaults.allowed_servers),
            upstream_idle_timeout: Duration::from_secs(parse_or(
                &lookup,
                "UPSTREAM_IDLE_TIMEOUT_SECS",
                defaults.upstream_idle_timeout.as_secs(),
            )?),
            session_grace: Duration::from_millis(parse_or(
                &lookup,
                "SESSION_GRACE_MS",
                defaults.session_grace.as_millis() as u64,
            )?),
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|origins| split_list(&origins).map(str::to_owned).collect())
                .unwrap_or(defaults.allowed_origins),
            defaults: GenerationDefaults {
                temperature: parse_or(&lookup, "DEFAULT_TEMPERATURE", generation.temperature)?,
                top_k: parse_or(&lookup, "DEFAULT_TOP_K", generation.top_k)?,
                top_p: parse_or(&lookup, "DEFAULT_TOP_P", generation.top_p)?,
                repeat_penalty: parse_or(
                    &lookup,
                    "DEFAULT_REPEAT_PENALTY",
                    generation.repeat_penalty,
                )?,
                max_tokens: parse_or(&lookup, "DEFAULT_MAX_TOKENS", generation.max_tokens)?,
                system_prompt: lookup("DEFAULT_SYSTEM_PROMPT").unwrap_or(generation.system_prompt),
                model: lookup("DEFAULT_MODEL").unwrap_or(generation.model),
            },
        })
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Whether users may point their generations at `url`. The default
    /// server is always allowed.
    pub fn is_allowed_server(&self, url: &str) -> bool {
        let url = normalize_server(url);
        url == self.llama_url || self.allowed_servers.iter().any(|server| *server == url)
    }
}

/// Server urls compare without surrounding whitespace or a trailing slash.
pub fn normalize_server(url: &str) -> String {
    url.trim().trim_end_matches('/').to_owned()
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
