use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    Error,
}

/// Result of probing the LLM provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn ok(models: Vec<String>) -> Self {
        Self {
            status: HealthState::Ok,
            models: Some(models),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: HealthState::Error,
            models: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthState::Ok
    }
}

/// Availability of the LLM provider the workers call into.
pub trait LlmAvailability {
    fn check_health(&self) -> impl Future<Output = HealthReport> + Send;

    /// Checks `name`, or the configured model when `None`.
    fn is_model_available(&self, name: Option<&str>) -> impl Future<Output = bool> + Send;

    fn get_model(&self) -> String;
}

/// Maps source files to the test files generated for them.
pub trait OutputMapping {
    fn resolve_test_path(&self, source_file_path: &Path) -> PathBuf;

    /// Creates `path` and any missing parents.
    fn ensure_directory(&self, path: &Path) -> io::Result<()>;
}
