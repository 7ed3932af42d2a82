use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::settings::{FileSettings, Settings};
use crate::data::OutputMapping;

#[derive(Debug, Clone)]
enum OutputDir {
    Fixed(PathBuf),
    Configured(FileSettings),
}

/// Places `src/foo.py` at `{output_dir}/test_foo.py`.
#[derive(Debug, Clone)]
pub struct PytestLayout {
    output_dir: OutputDir,
}

impl PytestLayout {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: OutputDir::Fixed(output_dir.into()),
        }
    }

    /// Reads `output_dir` from the settings file on every lookup.
    pub fn from_file(settings: FileSettings) -> Self {
        Self {
            output_dir: OutputDir::Configured(settings),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir_with(|name| std::env::var(name).ok())
    }

    fn output_dir_with<F>(&self, lookup: F) -> PathBuf
    where
        F: Fn(&str) -> Option<String>,
    {
        match &self.output_dir {
            OutputDir::Fixed(dir) => dir.clone(),
            OutputDir::Configured(settings) => {
                let settings = settings.load_with(lookup).unwrap_or_else(|e| {
                    warn!("{}; using default settings", e);
                    Settings::default()
                });
                settings.output_dir
            }
        }
    }
}

impl OutputMapping for PytestLayout {
    fn resolve_test_path(&self, source_file_path: &Path) -> PathBuf {
        let stem = source_file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        self.output_dir().join(format!("test_{}.py", stem))
    }

    fn ensure_directory(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}
