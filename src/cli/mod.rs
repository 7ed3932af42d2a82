use anyhow::{Context, Result, bail};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

mod progress;

use progress::ProgressIndicator;
use unitsmith::contexts::PipelineController;
use unitsmith::data::{ExtractedFunction, LlmAvailability};
use unitsmith::registries::{ConfiguredWorkers, FileSettings, OllamaAvailability, PytestLayout};

#[derive(Clone)]
pub struct Config {
    pub verbose: bool,
    pub settings_path: Option<PathBuf>,
}

type Controller = PipelineController<ConfiguredWorkers, OllamaAvailability, PytestLayout>;

fn build_controller(config: &Config) -> Result<Controller> {
    let file_settings = FileSettings::new(config.settings_path.clone());
    let settings = file_settings.load().with_context(|| {
        format!(
            "Failed to load settings from {}",
            file_settings.path().display()
        )
    })?;

    if config.verbose {
        println!("Using model {} at {}", settings.model, settings.provider_url);
    }

    Ok(PipelineController::new(
        ConfiguredWorkers::new(file_settings.clone()),
        OllamaAvailability::new(file_settings.clone()),
        PytestLayout::from_file(file_settings),
    ))
}

fn file_arguments(files: &[PathBuf]) -> Vec<String> {
    files
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect()
}

pub async fn extract(files: Vec<PathBuf>, json: bool, config: &Config) -> Result<()> {
    let controller = build_controller(config)?;
    let functions = controller
        .extract_functions(&file_arguments(&files))
        .await
        .context("Extraction failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&functions)?);
        return Ok(());
    }

    if functions.is_empty() {
        println!("No functions found");
        return Ok(());
    }

    println!("{}", controller.status().message);
    for function in &functions {
        let (start, end) = function.line_range();
        let prefix = if function.is_async { "async " } else { "" };
        println!(
            "  {}{} ({}:{}-{})",
            prefix, function.qualified_name, function.file_path, start, end
        );
    }
    Ok(())
}

pub async fn generate(files: Vec<PathBuf>, names: Vec<String>, config: &Config) -> Result<()> {
    let controller = Arc::new(build_controller(config)?);

    let found = controller
        .extract_functions(&file_arguments(&files))
        .await
        .context("Extraction failed")?;
    let selected = select_functions(found, &names)?;

    let printer = tokio::spawn(ProgressIndicator::new(selected.len()).follow(controller.subscribe()));
    let interrupt = {
        let controller = controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, stopping worker...");
                controller.cancel();
            }
        })
    };

    let result = controller.generate_tests(&selected).await;
    interrupt.abort();

    if controller.state().is_terminal() {
        let _ = printer.await;
    } else {
        printer.abort();
    }

    let written = result.context("Test generation failed")?;
    for path in &written {
        println!("  {}", path.display());
    }
    Ok(())
}

/// Keeps every function when `names` is empty; otherwise the ones whose
/// qualified or bare name was asked for.
fn select_functions(
    found: Vec<ExtractedFunction>,
    names: &[String],
) -> Result<Vec<ExtractedFunction>> {
    if names.is_empty() {
        return Ok(found);
    }

    let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
    let mut matched: HashSet<&str> = HashSet::new();
    let mut selected = Vec::new();
    for function in &found {
        let hit = [function.qualified_name.as_str(), function.func_name.as_str()]
            .into_iter()
            .find(|name| wanted.contains(name));
        if let Some(name) = hit {
            matched.insert(name);
            selected.push(function.clone());
        }
    }

    let unknown: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| !matched.contains(name))
        .collect();
    if !unknown.is_empty() {
        bail!("No function named {} was found", unknown.join(", "));
    }
    Ok(selected)
}

pub async fn health(config: &Config) -> Result<()> {
    let file_settings = FileSettings::new(config.settings_path.clone());
    let ollama = OllamaAvailability::new(file_settings);

    let report = ollama.check_health().await;
    if !report.is_ok() {
        bail!(
            "LLM provider unavailable: {}",
            report.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    println!("✓ LLM provider is reachable");
    for model in report.models.unwrap_or_default() {
        println!("  {}", model);
    }

    let model = ollama.get_model();
    if ollama.is_model_available(None).await {
        println!("✓ Model {} is available", model);
        Ok(())
    } else {
        bail!("Model {} is not available", model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(qualified: &str) -> ExtractedFunction {
        ExtractedFunction {
            func_name: qualified.rsplit('.').next().unwrap().to_string(),
            qualified_name: qualified.to_string(),
            class_name: qualified.split_once('.').map(|(c, _)| c.to_string()),
            is_async: false,
            source: String::new(),
            file_path: "calc.py".to_string(),
            line_start: 1,
            line_end: 2,
        }
    }

    #[test]
    fn test_select_all_when_no_names() {
        let selected = select_functions(vec![function("add"), function("Calc.mul")], &[]).unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_select_by_qualified_or_bare_name() {
        let found = vec![function("add"), function("Calc.mul"), function("sub")];
        let names = vec!["mul".to_string(), "sub".to_string()];

        let selected = select_functions(found, &names).unwrap();
        let picked: Vec<_> = selected.iter().map(|f| f.qualified_name.as_str()).collect();
        assert_eq!(picked, vec!["Calc.mul", "sub"]);
    }

    #[test]
    fn test_unknown_name_is_error() {
        let err = select_functions(vec![function("add")], &["nope".to_string()]).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
