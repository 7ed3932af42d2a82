mod ollama;
pub mod settings;
mod test_layout;
mod workers;

pub use ollama::OllamaAvailability;
pub use settings::{FileSettings, Settings, SettingsError, WorkerScripts};
pub use test_layout::PytestLayout;
pub use workers::ConfiguredWorkers;
