//! Configuration loading and management
//!
//! Defaults, then `config.toml` in the data directory, then environment
//! variables. Every file key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::assets::DEFAULT_CLASSIFY_FILE;
use crate::locale::Locale;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// SQLite file holding recorded notes
    pub database_path: PathBuf,

    /// Root of the offline model directory
    pub model_dir: PathBuf,
    /// File name of the classification model inside the model directory
    pub classify_model_file: String,

    pub api_base_url: String,
    pub api_timeout_secs: u64,

    pub locale: Locale,
    pub wake_phrase: String,

    /// How long the transcriber waits for an utterance
    pub listen_timeout_secs: u64,

    pub sync_interval_secs: u64,
    /// First retry delay after a sync pass left notes behind
    pub sync_retry_base_secs: u64,

    pub ollama_url: String,
    pub ollama_model: String,
    pub classify_timeout_secs: u64,
}

/// Keys accepted in `config.toml`
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    database_path: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    classify_model_file: Option<String>,
    api_base_url: Option<String>,
    api_timeout_secs: Option<u64>,
    locale: Option<String>,
    wake_phrase: Option<String>,
    listen_timeout_secs: Option<u64>,
    sync_interval_secs: Option<u64>,
    sync_retry_base_secs: Option<u64>,
    ollama_url: Option<String>,
    ollama_model: Option<String>,
    classify_timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration from defaults, the config file and environment
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("beekeeper-assistant");

        let mut config = Self::with_data_dir(data_dir);

        let file = config.config_file();
        if file.exists() {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            config
                .apply_toml(&text)
                .with_context(|| format!("invalid config file {}", file.display()))?;
            debug!(?file, "config file applied");
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults with every path under `data_dir`
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            socket_path: data_dir.join("daemon.sock"),
            database_path: data_dir.join("notes.db"),
            model_dir: data_dir.join("models"),
            data_dir,
            classify_model_file: DEFAULT_CLASSIFY_FILE.to_string(),
            api_base_url: "http://localhost:8000".to_string(),
            api_timeout_secs: 10,
            locale: Locale::English,
            wake_phrase: "hey beekeeper".to_string(),
            listen_timeout_secs: 8,
            sync_interval_secs: 3600,
            sync_retry_base_secs: 30,
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.2".to_string(),
            classify_timeout_secs: 20,
        }
    }

    fn apply_toml(&mut self, text: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(text)?;

        // A new data dir moves the derived paths along with it
        if let Some(data_dir) = file.data_dir {
            let rebased = Self::with_data_dir(data_dir);
            self.socket_path = rebased.socket_path;
            self.database_path = rebased.database_path;
            self.model_dir = rebased.model_dir;
            self.data_dir = rebased.data_dir;
        }

        set(&mut self.socket_path, file.socket_path);
        set(&mut self.database_path, file.database_path);
        set(&mut self.model_dir, file.model_dir);
        set(&mut self.classify_model_file, file.classify_model_file);
        set(&mut self.api_base_url, file.api_base_url);
        set(&mut self.api_timeout_secs, file.api_timeout_secs);
        set(&mut self.locale, file.locale.as_deref().map(Locale::from_tag));
        set(&mut self.wake_phrase, file.wake_phrase);
        set(&mut self.listen_timeout_secs, file.listen_timeout_secs);
        set(&mut self.sync_interval_secs, file.sync_interval_secs);
        set(&mut self.sync_retry_base_secs, file.sync_retry_base_secs);
        set(&mut self.ollama_url, file.ollama_url);
        set(&mut self.ollama_model, file.ollama_model);
        set(&mut self.classify_timeout_secs, file.classify_timeout_secs);
        Ok(())
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        set(&mut self.api_base_url, lookup("BEEKEEPER_API_URL"));
        set(
            &mut self.locale,
            lookup("BEEKEEPER_LOCALE").map(|tag| Locale::from_tag(&tag)),
        );
        set(&mut self.model_dir, lookup("BEEKEEPER_MODEL_DIR").map(PathBuf::from));
        set(&mut self.wake_phrase, lookup("BEEKEEPER_WAKE_PHRASE"));
        set(&mut self.ollama_url, lookup("BEEKEEPER_OLLAMA_URL"));
        set(&mut self.ollama_model, lookup("BEEKEEPER_OLLAMA_MODEL"));
        set(
            &mut self.sync_interval_secs,
            parse_secs(&lookup, "BEEKEEPER_SYNC_INTERVAL_SECS")?,
        );
        set(
            &mut self.listen_timeout_secs,
            parse_secs(&lookup, "BEEKEEPER_LISTEN_TIMEOUT_SECS")?,
        );
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.listen_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn sync_retry_base(&self) -> Duration {
        Duration::from_secs(self.sync_retry_base_secs)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_secs(self.classify_timeout_secs)
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [Some(self.data_dir.as_path()), self.socket_path.parent()]
            .into_iter()
            .flatten()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))
        })
        .transpose()
}
