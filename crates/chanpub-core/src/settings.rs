use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::config::{BitrateMode, ChannelTarget, ConnectionConfiguration, MediaConfiguration};
use crate::errors::ConfigError;

/// Choices remembered between launches.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub connection: Option<ConnectionConfiguration>,
    #[serde(default)]
    pub media: MediaConfiguration,
    #[serde(default)]
    pub bitrate_mode: BitrateMode,
    #[serde(default)]
    pub last_channel: Option<String>,
}

impl Settings {
    /// Publish target for `alias` using the remembered bitrate mode.
    pub fn channel_target(&self, alias: impl Into<String>) -> ChannelTarget {
        ChannelTarget::alias(alias).with_capabilities(self.bitrate_mode.capabilities())
    }
}

/// `settings.json` in a data directory. A missing or unreadable file yields
/// defaults; write failures are logged and otherwise ignored.
pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn set_connection(&self, connection: Option<ConnectionConfiguration>) {
        self.lock().connection = connection;
        self.save();
    }

    pub fn set_media(&self, media: MediaConfiguration) {
        self.lock().media = media;
        self.save();
    }

    pub fn set_bitrate_mode(&self, mode: BitrateMode) {
        self.lock().bitrate_mode = mode;
        self.save();
    }

    pub fn set_last_channel(&self, alias: Option<String>) {
        self.lock().last_channel = alias;
        self.save();
    }

    fn save(&self) {
        if let Err(e) = self.write() {
            tracing::warn!(path = %self.file_path.display(), "could not save settings: {e}");
        }
    }

    fn write(&self) -> Result<(), ConfigError> {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&settings)?;
        std::fs::write(&self.file_path, json)?;
        Ok(())
    }

    fn load(path: &Path) -> Settings {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => return Settings::default(),
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), "ignoring unreadable settings: {e}");
            Settings::default()
        })
    }
}
