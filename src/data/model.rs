use serde::{Deserialize, Serialize};

/// A function reported by the extraction worker.
///
/// `qualified_name` is the unique key: `Class.method` for methods, the bare
/// function name otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFunction {
    #[serde(default)]
    pub func_name: String,
    pub qualified_name: String,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub is_async: bool,
    #[serde(rename = "funcSource")]
    pub source: String,
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
}

impl ExtractedFunction {
    /// Inclusive `[start, end]` line range in the source file.
    pub fn line_range(&self) -> (u32, u32) {
        (self.line_start, self.line_end)
    }
}

/// Positive and negative scenario text generated for one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default)]
    pub positive: String,
    #[serde(default)]
    pub negative: String,
    #[serde(default)]
    pub func_source: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One function's generated test code, before it is merged into a file.
///
/// `file_path` is the source file the function came from, not the test file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedTestFragment {
    pub function_name: String,
    #[serde(default)]
    pub test_content: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
