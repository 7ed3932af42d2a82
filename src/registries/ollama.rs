use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::settings::{FileSettings, Settings};
use crate::data::{HealthReport, LlmAvailability};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

/// Queries an Ollama server through `GET /api/tags`.
///
/// The provider URL and model are taken from the settings file on every call.
#[derive(Clone)]
pub struct OllamaAvailability {
    settings: FileSettings,
    client: Client,
}

impl OllamaAvailability {
    pub fn new(settings: FileSettings) -> Self {
        Self {
            settings,
            client: Client::new(),
        }
    }

    fn current_settings(&self) -> Settings {
        self.settings.load().unwrap_or_else(|e| {
            warn!("{}; using default settings", e);
            Settings::default()
        })
    }

    async fn fetch_models(&self, provider_url: &str) -> Result<Vec<String>, String> {
        let url = format!("{}/api/tags", provider_url.trim_end_matches('/'));
        debug!(%url, "checking LLM provider");

        let response = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("Request to {} failed: {}", url, e))?;

        if !response.status().is_success() {
            return Err(format!("Provider returned status {}", response.status()));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse provider response: {}", e))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

impl LlmAvailability for OllamaAvailability {
    async fn check_health(&self) -> HealthReport {
        let settings = self.current_settings();
        match self.fetch_models(&settings.provider_url).await {
            Ok(models) => HealthReport::ok(models),
            Err(e) => HealthReport::error(e),
        }
    }

    async fn is_model_available(&self, name: Option<&str>) -> bool {
        let settings = self.current_settings();
        let wanted = name.map(str::to_string).unwrap_or(settings.model);

        match self.fetch_models(&settings.provider_url).await {
            Ok(models) => model_listed(&models, &wanted),
            Err(e) => {
                debug!(model = %wanted, "model lookup failed: {}", e);
                false
            }
        }
    }

    fn get_model(&self) -> String {
        self.current_settings().model
    }
}

/// A bare name also matches its `:latest` tag.
fn model_listed(models: &[String], wanted: &str) -> bool {
    models.iter().any(|model| {
        model == wanted
            || (!wanted.contains(':') && model.strip_suffix(":latest") == Some(wanted))
    })
}
