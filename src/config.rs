use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::messaging::MessagingSettings;
use crate::model::ServerIdentity;
use crate::storage::PoolSettings;

pub const DEFAULT_PATH: &str = "staffchat.toml";
const SERVER_ID_FILE: &str = "server-id";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server_id: Option<Uuid>,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub chat: ChatConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

fn default_server_name() -> String {
    "server".to_owned()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChatConfig {
    pub format: String,
    pub allow_markdown: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            format: "[{server}] [{level}] {player} >> {message}".to_owned(),
            allow_markdown: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default)]
    pub settings: PoolSettings,
    #[serde(default)]
    pub engines: BTreeMap<String, Engine<StorageKind>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MessagingConfig {
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    #[serde(default)]
    pub settings: MessagingSettings,
    #[serde(default)]
    pub engines: BTreeMap<String, Engine<MessagingKind>>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            channel_prefix: default_channel_prefix(),
            settings: MessagingSettings::default(),
            engines: BTreeMap::new(),
        }
    }
}

fn default_channel_prefix() -> String {
    "staffchat".to_owned()
}

#[derive(Debug, Deserialize)]
pub struct Engine<T> {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: T,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageKind {
    Mysql {
        url: String,
        #[serde(default = "sql_prefix")]
        prefix: String,
    },
    Sqlite {
        file: PathBuf,
        #[serde(default = "sql_prefix")]
        prefix: String,
    },
    Redis {
        url: String,
        #[serde(default = "kv_prefix")]
        prefix: String,
    },
}

fn sql_prefix() -> String {
    "staffchat_".to_owned()
}

fn kv_prefix() -> String {
    "staffchat:".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagingKind {
    Rabbitmq { url: String },
    Redis { url: String },
    /// Same-process bus, for running several relays side by side.
    Local,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PollConfig {
    pub interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HttpConfig {
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { listen: "0.0.0.0:8080".to_owned() }
    }
}

impl Config {
    /// Reads and parses `path`. Call `validate` before using the result;
    /// the two are split so logging can be set up from `debug` in between.
    pub fn read(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.storage.settings;
        if pool.max_pool_size < 1 {
            return Err(ConfigError::Invalid("storage max-pool-size must be at least 1".to_owned()));
        }
        if pool.max_pool_size < pool.min_idle {
            return Err(ConfigError::Invalid(format!(
                "storage max-pool-size ({}) is below min-idle ({})",
                pool.max_pool_size, pool.min_idle
            )));
        }
        if self.storage_engines().is_empty() {
            return Err(ConfigError::Invalid("no enabled storage engines".to_owned()));
        }
        if self.poll.interval_secs == 0 {
            return Err(ConfigError::Invalid("poll interval-secs must be positive".to_owned()));
        }
        Ok(())
    }

    /// Enabled storage engines, primary first.
    pub fn storage_engines(&self) -> Vec<(&str, &StorageKind)> {
        ordered("storage", &self.storage.order, &self.storage.engines)
    }

    pub fn messaging_engines(&self) -> Vec<(&str, &MessagingKind)> {
        ordered("messaging", &self.messaging.order, &self.messaging.engines)
    }

    /// The configured server id, or the one persisted next to the config
    /// file, minting and persisting one on first run.
    pub fn server_identity(&self, config_path: &Path) -> Result<ServerIdentity, ConfigError> {
        let id = match self.server_id {
            Some(id) => id,
            None => {
                let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
                load_or_create_server_id(&dir.join(SERVER_ID_FILE))?
            }
        };
        Ok(ServerIdentity { id, name: self.server_name.clone() })
    }
}

/// Applies `order` to `engines`. An empty order means every enabled engine by
/// name. Unknown, duplicate and disabled names are skipped with a warning.
fn ordered<'a, T>(what: &str, order: &'a [String], engines: &'a BTreeMap<String, Engine<T>>) -> Vec<(&'a str, &'a T)> {
    if order.is_empty() {
        return engines
            .iter()
            .filter(|(_, engine)| engine.enabled)
            .map(|(name, engine)| (name.as_str(), &engine.kind))
            .collect();
    }

    let mut seen = HashSet::new();
    let mut picked = Vec::new();
    for name in order {
        if !seen.insert(name.as_str()) {
            tracing::warn!("{what} engine {name} listed twice in order, skipping");
            continue;
        }
        let Some(engine) = engines.get(name) else {
            tracing::warn!("{what} engine {name} in order is not configured, skipping");
            continue;
        };
        if !engine.enabled {
            continue;
        }
        picked.push((name.as_str(), &engine.kind));
    }
    picked
}

fn load_or_create_server_id(path: &Path) -> Result<Uuid, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => match Uuid::parse_str(text.trim()) {
            Ok(id) => return Ok(id),
            Err(_) => tracing::warn!(path = %path.display(), "server id file is not a valid id, replacing it"),
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => return Err(ConfigError::Io { path: path.to_owned(), source }),
    }

    let id = Uuid::new_v4();
    std::fs::write(path, id.to_string()).map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
    tracing::info!(%id, path = %path.display(), "minted new server id");
    Ok(id)
}
