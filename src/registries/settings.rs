use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contexts::{WorkerCommand, WorkerCommands};

pub const DEFAULT_SETTINGS_FILE: &str = "unitsmith.yml";

pub const MODEL_VAR: &str = "UNITSMITH_MODEL";
pub const PROVIDER_URL_VAR: &str = "UNITSMITH_PROVIDER_URL";
pub const OUTPUT_DIR_VAR: &str = "UNITSMITH_OUTPUT_DIR";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid settings file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Worker script paths, one per stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerScripts {
    pub extract: String,
    pub scenarios: String,
    pub tests: String,
}

impl Default for WorkerScripts {
    fn default() -> Self {
        Self {
            extract: "python/extract_functions.py".to_string(),
            scenarios: "python/generate_scenarios.py".to_string(),
            tests: "python/generate_unit_tests.py".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Interpreter used to run the worker scripts.
    pub python: String,
    pub workers: WorkerScripts,
    pub output_dir: PathBuf,
    pub model: String,
    pub provider_url: String,
    pub worker_timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            workers: WorkerScripts::default(),
            output_dir: PathBuf::from("tests"),
            model: "llama3.2".to_string(),
            provider_url: "http://localhost:11434".to_string(),
            worker_timeout_secs: None,
        }
    }
}

impl Settings {
    pub fn worker_commands(&self) -> WorkerCommands {
        let command = |script: &str| WorkerCommand::new(self.python.clone()).arg(script);
        WorkerCommands {
            extract: command(&self.workers.extract),
            scenarios: command(&self.workers.scenarios),
            tests: command(&self.workers.tests),
        }
    }

    pub fn worker_timeout(&self) -> Option<Duration> {
        self.worker_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Applies environment overrides; `lookup` returns a variable's value.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(model) = lookup(MODEL_VAR) {
            self.model = model;
        }
        if let Some(url) = lookup(PROVIDER_URL_VAR) {
            self.provider_url = url;
        }
        if let Some(dir) = lookup(OUTPUT_DIR_VAR) {
            self.output_dir = PathBuf::from(dir);
        }
        self
    }
}

/// Settings backed by a YAML file that is re-read on every `load`.
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: path.unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file, falling back to defaults when it does not exist, then
    /// applies environment overrides.
    pub fn load(&self) -> Result<Settings, SettingsError> {
        self.load_with(|name| std::env::var(name).ok())
    }

    /// Like [`FileSettings::load`], with overrides taken from `lookup`.
    pub fn load_with<F>(&self, lookup: F) -> Result<Settings, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(self.load_file()?.apply_overrides(lookup))
    }

    fn load_file(&self) -> Result<Settings, SettingsError> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&self.path).map_err(|source| SettingsError::Read {
            path: self.path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }

        serde_yaml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}
