mod collaborators;
mod model;
mod scenario_map;
mod status;

pub use collaborators::{HealthReport, HealthState, LlmAvailability, OutputMapping};
pub use model::{ExtractedFunction, GeneratedTestFragment, Scenario};
pub use scenario_map::{DuplicateKey, ScenarioMap};
pub use status::{PipelineState, PipelineStatus};
