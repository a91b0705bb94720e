use crate::notify::telegram::TelegramCredentials;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const CONFIG_PATH_ENV: &str = "PHASE_SENTINEL_CONFIG";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_INTERVAL_MINUTES: u64 = 60;
pub const DEFAULT_MODEL_PATH: &str = "config/phase_model.json";

pub const DEFAULT_DATABASE: &str = "biorreactor_app";
pub const DEFAULT_READINGS_COLLECTION: &str = "dominio_terreno";
pub const DEFAULT_HISTORY_COLLECTION: &str = "clasificaciones";
pub const DEFAULT_STATE_COLLECTION: &str = "estado_clasificacion";

const ENV_STORE_URI: &str = "MONGO_URI";
const ENV_BOT_TOKEN: &str = "BOT_TOKEN";
const ENV_CHAT_ID: &str = "CHAT_ID";
const ENV_INTERVAL_MINUTES: &str = "CLASSIFIER_INTERVAL_MINUTES";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub app: AppSection,
    pub logging: LoggingSection,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub classifier: Option<ClassifierSection>,
    #[serde(default)]
    pub store: Option<StoreSection>,
    #[serde(default)]
    pub telegram: Option<TelegramSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Port to listen on (default: 8080)
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClassifierSection {
    /// Minutes between two passes (default: 60)
    pub interval_minutes: Option<u64>,
    /// JSON artifact holding scaler, label table and network weights
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreSection {
    pub uri: Option<String>,
    pub database: Option<String>,
    pub readings_collection: Option<String>,
    pub history_collection: Option<String>,
    pub state_collection: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramSection {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    /// Override for the Bot API base URL, mostly useful against a local stub.
    pub api_base: Option<String>,
}

/// Resolved names of the database and its three collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub uri: String,
    pub database: String,
    pub readings_collection: String,
    pub history_collection: String,
    pub state_collection: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("store connection string missing (set MONGO_URI or [store].uri)")]
    MissingStoreUri,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Loads the config file (path from `PHASE_SENTINEL_CONFIG`, else the default)
/// and applies process environment overrides.
pub fn load_default() -> Result<Config, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = load_from_path(path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.classifier.as_ref().and_then(|c| c.interval_minutes);
        if interval == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "classifier.interval_minutes",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Environment values win over the file. Blank values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(uri) = lookup(ENV_STORE_URI) {
            self.store.get_or_insert_with(StoreSection::default).uri = Some(uri);
        }

        if let Some(token) = lookup(ENV_BOT_TOKEN) {
            self.telegram
                .get_or_insert_with(TelegramSection::default)
                .bot_token = Some(token);
        }
        if let Some(chat_id) = lookup(ENV_CHAT_ID) {
            self.telegram
                .get_or_insert_with(TelegramSection::default)
                .chat_id = Some(chat_id);
        }

        if let Some(raw) = lookup(ENV_INTERVAL_MINUTES) {
            let minutes = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|minutes| *minutes > 0)
                .ok_or(ConfigError::InvalidValue {
                    key: ENV_INTERVAL_MINUTES,
                    value: raw.clone(),
                })?;
            self.classifier
                .get_or_insert_with(ClassifierSection::default)
                .interval_minutes = Some(minutes);
        }

        Ok(())
    }

    /// Returns the server port (default: 8080)
    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    /// Returns the pass interval (default: 60 minutes)
    pub fn interval(&self) -> Duration {
        let minutes = self
            .classifier
            .as_ref()
            .and_then(|c| c.interval_minutes)
            .unwrap_or(DEFAULT_INTERVAL_MINUTES);
        Duration::from_secs(minutes * 60)
    }

    pub fn model_path(&self) -> &Path {
        self.classifier
            .as_ref()
            .and_then(|c| c.model_path.as_deref())
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new(DEFAULT_MODEL_PATH))
    }

    pub fn log_level(&self) -> tracing::Level {
        self.logging
            .level
            .parse()
            .unwrap_or(tracing::Level::INFO)
    }

    pub fn store_settings(&self) -> Result<StoreSettings, ConfigError> {
        let section = self.store.clone().unwrap_or_default();
        let uri = section
            .uri
            .filter(|uri| !uri.trim().is_empty())
            .ok_or(ConfigError::MissingStoreUri)?;

        Ok(StoreSettings {
            uri,
            database: section
                .database
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            readings_collection: section
                .readings_collection
                .unwrap_or_else(|| DEFAULT_READINGS_COLLECTION.to_string()),
            history_collection: section
                .history_collection
                .unwrap_or_else(|| DEFAULT_HISTORY_COLLECTION.to_string()),
            state_collection: section
                .state_collection
                .unwrap_or_else(|| DEFAULT_STATE_COLLECTION.to_string()),
        })
    }

    /// Both token and chat id must be present, otherwise alerting is disabled.
    pub fn telegram_credentials(&self) -> Option<TelegramCredentials> {
        let section = self.telegram.as_ref()?;
        let bot_token = section.bot_token.clone().filter(|t| !t.trim().is_empty())?;
        let chat_id = section.chat_id.clone().filter(|c| !c.trim().is_empty())?;
        Some(TelegramCredentials { bot_token, chat_id })
    }

    pub fn telegram_api_base(&self) -> Option<&str> {
        self.telegram
            .as_ref()
            .and_then(|t| t.api_base.as_deref())
            .filter(|base| !base.is_empty())
    }
}
