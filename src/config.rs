use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2:3b";
pub const DEFAULT_LANGUAGE: &str = "pl-PL";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "Jesteś pomocnym asystentem AI. Rozmawiasz po polsku. Bądź zwięzły i pomocny.";

const SETTINGS_FILE: &str = "settings.json";

// --- Environment-driven configuration ---

/// Start-up configuration resolved from the environment.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub default_server_url: String,
    pub default_model: String,
    pub system_prompt: String,
    pub language: String, // Recognition and synthesis locale
}

impl AppConfig {
    /// Reads `AIAVATAR_DATA_DIR`, `AIAVATAR_SERVER_URL` and `AIAVATAR_MODEL`,
    /// falling back to the platform data directory and built-in defaults.
    pub fn from_env() -> Result<Self> {
        let data_dir = match std::env::var("AIAVATAR_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => dirs::data_dir()
                .map(|p| p.join("aiavatar"))
                .context("Could not find a platform data directory; set AIAVATAR_DATA_DIR")?,
        };
        log::debug!("Using data directory: {}", data_dir.display());

        let default_server_url = std::env::var("AIAVATAR_SERVER_URL")
            .map(|url| normalize_server_url(&url))
            .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
        let default_model =
            std::env::var("AIAVATAR_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Self {
            data_dir,
            default_server_url,
            default_model,
            ..Self::with_data_dir("")
        })
    }

    /// Defaults rooted at the given directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            default_server_url: DEFAULT_SERVER_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

pub fn normalize_server_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

// --- Persisted user settings ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    pub server_url: String,
}

/// Small JSON file holding preferences that survive restarts.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &Path) -> Self {
        Self { path: data_dir.join(SETTINGS_FILE) }
    }

    /// Returns the saved settings, or defaults built from `config` when none are stored.
    pub async fn load(&self, config: &AppConfig) -> Settings {
        let defaults = Settings { server_url: config.default_server_url.clone() };
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str::<Settings>(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Ignoring unreadable settings file {}: {}", self.path.display(), e);
                    defaults
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => defaults,
            Err(e) => {
                log::warn!("Failed to read settings file {}: {}", self.path.display(), e);
                defaults
            }
        }
    }

    pub async fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create settings directory")?;
        }
        let json = serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;
        tokio::fs::write(&self.path, json)
            .await
            .context(format!("Failed to write settings file {}", self.path.display()))?;
        log::info!("Saved settings to {}", self.path.display());
        Ok(())
    }
}
