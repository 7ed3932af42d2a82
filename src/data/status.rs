use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ExtractedFunction;

/// Pipeline states.
///
/// `Idle` is initial. `Complete` and `Error` are terminal until the
/// controller is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Extracting,
    Selecting,
    GeneratingScenarios,
    GeneratingTests,
    Complete,
    Error,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Extracting => "extracting",
            PipelineState::Selecting => "selecting",
            PipelineState::GeneratingScenarios => "generating_scenarios",
            PipelineState::GeneratingTests => "generating_tests",
            PipelineState::Complete => "complete",
            PipelineState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Error)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the controller's state, emitted on every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of functions found, set while `Selecting`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<ExtractedFunction>>,
    pub at: DateTime<Utc>,
}

impl PipelineStatus {
    pub fn new(state: PipelineState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            progress: None,
            error: None,
            function_count: None,
            functions: None,
            at: Utc::now(),
        }
    }

    pub fn idle() -> Self {
        Self::new(PipelineState::Idle, "Ready")
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attaches the extracted functions offered for selection.
    pub fn with_functions(mut self, functions: Vec<ExtractedFunction>) -> Self {
        self.function_count = Some(functions.len());
        self.functions = Some(functions);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(PipelineState::Complete.is_terminal());
        assert!(PipelineState::Error.is_terminal());
        assert!(!PipelineState::Selecting.is_terminal());
        assert!(!PipelineState::GeneratingTests.is_terminal());
    }

    #[test]
    fn test_progress_is_clamped() {
        let status = PipelineStatus::new(PipelineState::GeneratingTests, "x").with_progress(250);
        assert_eq!(status.progress, Some(100));
    }

    #[test]
    fn test_status_serializes_snake_case_state() {
        let status = PipelineStatus::new(PipelineState::GeneratingScenarios, "Generating")
            .with_progress(0);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "generating_scenarios");
        assert_eq!(json["progress"], 0);
        assert!(json.get("error").is_none());
        assert!(json.get("functions").is_none());
    }
}
