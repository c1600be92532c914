use super::errors::Result;
use super::repo_config::RepoEntry;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const CONFIG_HOME_ENV: &str = "GITSYNCER_CONFIG_HOME";

fn default_commit_message() -> String { "update".to_string() }
fn default_pull_time() -> String { "09:00".to_string() }
fn default_push_time() -> String { "18:00".to_string() }

/// User preferences, stored as one flat JSON object.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Settings {
    /// Active working copy, empty when nothing (or ALL) is selected
    #[serde(default)]
    pub repo_path: PathBuf,
    /// Message used for every commit made by push
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    #[serde(default)]
    pub auto_sync_enabled: bool,
    /// Daily pull deadline, "HH:MM"
    #[serde(default = "default_pull_time")]
    pub pull_time: String,
    /// Daily push deadline, "HH:MM"
    #[serde(default = "default_push_time")]
    pub push_time: String,
    #[serde(default)]
    pub repositories: Vec<RepoEntry>,
    /// Index into `repositories`, written as -1 when unset
    #[serde(default, with = "index_or_none")]
    pub current_repo_index: Option<usize>,
    /// The "ALL" pseudo-entry is selected: Pull and Push run over every entry
    #[serde(default)]
    pub all_selected: bool,
    /// Keep running after the window closes (stored only)
    #[serde(default)]
    pub run_in_background: bool,
    /// Launch at login (stored only)
    #[serde(default)]
    pub auto_start: bool,
    /// Keys written by other versions, kept as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::new(),
            commit_message: default_commit_message(),
            auto_sync_enabled: false,
            pull_time: default_pull_time(),
            push_time: default_push_time(),
            repositories: Vec::new(),
            current_repo_index: None,
            all_selected: false,
            run_in_background: false,
            auto_start: false,
            extra: Map::new(),
        }
    }
}

mod index_or_none {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(index: &Option<usize>, serializer: S) -> Result<S::Ok, S::Error> {
        match index {
            Some(index) => serializer.serialize_i64(*index as i64),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<usize>, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Ok(usize::try_from(raw).ok())
    }
}

impl Settings {
    /// Location of the settings file in the installed layout.
    ///
    /// `$GITSYNCER_CONFIG_HOME/config.json` when the variable is set, otherwise
    /// `<config dir>/gitsyncer/config.json` (`~/.config` on Linux, `%AppData%` on Windows).
    pub fn default_path() -> PathBuf {
        if let Ok(home) = env::var(CONFIG_HOME_ENV) {
            if !home.is_empty() {
                return PathBuf::from(home).join(CONFIG_FILE);
            }
        }

        match dirs::config_dir() {
            Some(dir) => dir.join("gitsyncer").join(CONFIG_FILE),
            None => {
                warn!("No per-user config directory, falling back to {CONFIG_FILE} in the working directory");
                Self::portable_path()
            }
        }
    }

    /// Portable layout: `config.json` next to wherever the program is started.
    pub fn portable_path() -> PathBuf {
        PathBuf::from(CONFIG_FILE)
    }

    /// Load settings, falling back to defaults when the file is missing or broken.
    pub fn load(path: &Path) -> Settings {
        if !path.is_file() {
            debug!("No settings at {}, using defaults", path.display());
            return Settings::default();
        }

        match Self::load_file(path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Could not load settings from {}: {e}", path.display());
                Settings::default()
            }
        }
    }

    pub fn load_file(path: &Path) -> Result<Settings> {
        let file_text = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&file_text)?;
        Ok(settings)
    }

    /// Write the whole document. Failures are logged and swallowed.
    pub fn save_to_path(&self, path: &Path) {
        if let Err(e) = self.write_file(path) {
            error!("Could not save settings to {}: {e}", path.display());
            return;
        }
        debug!("Settings saved to {}", path.display());
    }

    fn write_file(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        fs::write(path, text)?;
        Ok(())
    }
}

/// Settings bound to the file they came from; every mutation is followed by `save`.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = Settings::load(&path);
        Self { path, settings }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn save(&self) {
        self.settings.save_to_path(&self.path);
    }

    /// Re-read the file, picking up changes made by another process.
    pub fn reload(&mut self) {
        self.settings = Settings::load(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("config.json"));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.commit_message, "update");
        assert_eq!(settings.pull_time, "09:00");
        assert_eq!(settings.push_time, "18:00");
        assert_eq!(settings.current_repo_index, None);
    }

    #[test]
    fn malformed_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ this is not json").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"commit_message": "wip", "current_repo_index": 2}"#).unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.commit_message, "wip");
        assert_eq!(settings.current_repo_index, Some(2));
        assert_eq!(settings.pull_time, "09:00");
        assert!(settings.repositories.is_empty());
    }

    #[test]
    fn round_trip_keeps_every_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut settings = Settings::default();
        settings.repo_path = PathBuf::from("/tmp/demo");
        settings.commit_message = "자동 커밋".to_string();
        settings.auto_sync_enabled = true;
        settings.pull_time = "07:30".to_string();
        settings.repositories.push(RepoEntry::new("demo", "/tmp/demo"));
        settings.current_repo_index = Some(0);
        settings.run_in_background = true;
        settings.all_selected = true;

        settings.save_to_path(&path);
        let loaded = Settings::load(&path);
        assert_eq!(loaded, settings);

        loaded.save_to_path(&path);
        assert_eq!(Settings::load(&path), settings);
    }

    #[test]
    fn unset_index_is_written_as_minus_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        Settings::default().save_to_path(&path);

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["current_repo_index"], Value::from(-1));
    }

    #[test]
    fn non_ascii_is_written_verbatim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut settings = Settings::default();
        settings.commit_message = "업데이트".to_string();
        settings.save_to_path(&path);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("업데이트"));
        assert!(text.contains("\n  \"repo_path\""));
    }

    #[test]
    fn unknown_keys_survive_a_load_save_cycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"theme": "dark", "push_time": "20:15"}"#).unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.extra.get("theme"), Some(&Value::from("dark")));
        settings.save_to_path(&path);

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["theme"], Value::from("dark"));
        assert_eq!(raw["push_time"], Value::from("20:15"));
    }

    #[test]
    fn store_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut store = SettingsStore::open(&path);
        store.settings_mut().commit_message = "sync".to_string();
        store.save();

        let mut other = SettingsStore::open(&path);
        assert_eq!(other.settings().commit_message, "sync");

        store.settings_mut().auto_start = true;
        store.save();
        other.reload();
        assert!(other.settings().auto_start);
    }

    #[test]
    fn save_failure_keeps_memory_state() {
        let dir = tempdir().unwrap();
        // a directory where the file should be makes the write fail
        let path = dir.path().join("config.json");
        fs::create_dir(&path).unwrap();

        let mut store = SettingsStore::open(&path);
        store.settings_mut().commit_message = "kept".to_string();
        store.save();
        assert_eq!(store.settings().commit_message, "kept");
    }
}
