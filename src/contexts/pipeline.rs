use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::result_aggregator::{AggregateError, ResultAggregator};
use super::worker_invoker::{ProgressSink, Stage, WorkerError, WorkerInvoker, invoke_stage};
use crate::data::{
    ExtractedFunction, GeneratedTestFragment, LlmAvailability, OutputMapping, PipelineState,
    PipelineStatus, ScenarioMap,
};

const EVENT_BUFFER: usize = 256;

/// Errors surfaced by [`PipelineController`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{} failed: {source}", .stage.label())]
    Worker {
        stage: Stage,
        #[source]
        source: WorkerError,
    },

    #[error("LLM provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("model '{0}' is not available")]
    ModelUnavailable(String),

    #[error("no functions selected")]
    NoFunctionsSelected,

    #[error("Writing test files failed: {0}")]
    FileWriteFailed(#[source] AggregateError),

    #[error("a pipeline run is already in progress")]
    Busy,

    #[error("cannot {operation} while the pipeline is {state}; reset it first")]
    InvalidState {
        state: PipelineState,
        operation: &'static str,
    },
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    files: &'a [String],
}

#[derive(Serialize)]
struct ScenariosRequest<'a> {
    functions: &'a [ExtractedFunction],
}

#[derive(Serialize)]
struct TestsRequest<'a> {
    scenarios: &'a ScenarioMap,
}

/// Maps per-function completions of one stage onto its half of 0..=100.
struct StageProgress {
    total: usize,
    completed: usize,
    base: u8,
    last: u8,
}

impl StageProgress {
    fn new(total: usize, base: u8) -> Self {
        Self {
            total,
            completed: 0,
            base,
            last: base,
        }
    }

    fn advance(&mut self) -> u8 {
        self.completed = (self.completed + 1).min(self.total);
        let share = if self.total == 0 {
            50.0
        } else {
            (self.completed as f64 / self.total as f64 * 50.0).round()
        };
        let value = (self.base as f64 + share).min(100.0) as u8;
        self.last = self.last.max(value);
        self.last
    }
}

struct RunGuard<'a> {
    in_flight: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

/// Sequences extraction, scenario generation and test generation through a
/// [`WorkerInvoker`], publishing a [`PipelineStatus`] on every transition.
///
/// Runs on one controller are serialized: an overlapping call fails with
/// [`PipelineError::Busy`].
pub struct PipelineController<W, L, O>
where
    W: WorkerInvoker,
    L: LlmAvailability,
    O: OutputMapping,
{
    invoker: W,
    llm: L,
    output: O,
    status: Mutex<PipelineStatus>,
    events: broadcast::Sender<PipelineStatus>,
    in_flight: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl<W, L, O> PipelineController<W, L, O>
where
    W: WorkerInvoker + Sync,
    L: LlmAvailability + Sync,
    O: OutputMapping + Sync,
{
    pub fn new(invoker: W, llm: L, output: O) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            invoker,
            llm,
            output,
            status: Mutex::new(PipelineStatus::idle()),
            events,
            in_flight: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Receives every status emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineStatus> {
        self.events.subscribe()
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> PipelineState {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Forces the state back to `Idle`. A running worker is not cancelled.
    pub fn reset(&self) {
        self.transition(PipelineStatus::idle());
    }

    /// Cancels the worker of the run in progress, if any.
    pub fn cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Runs the extraction stage over `files`.
    ///
    /// On success the controller moves to `Selecting`. Functions are keyed by
    /// qualified name, so two files that both define `helper` collide: only
    /// the first is kept, and the status message reports how many were
    /// dropped.
    pub async fn extract_functions(
        &self,
        files: &[String],
    ) -> Result<Vec<ExtractedFunction>, PipelineError> {
        let (_guard, cancel) = self.begin("extract functions")?;

        self.transition(PipelineStatus::new(
            PipelineState::Extracting,
            format!("Extracting functions from {} file(s)", files.len()),
        ));

        let request = ExtractRequest { files };
        let functions: Vec<ExtractedFunction> =
            match invoke_stage(&self.invoker, Stage::Extract, &request, None, &cancel).await {
                Ok(functions) => functions,
                Err(source) => {
                    return Err(self.fail(PipelineError::Worker {
                        stage: Stage::Extract,
                        source,
                    }));
                }
            };

        let (functions, dropped) = distinct(functions);
        let message = if dropped == 0 {
            format!("Found {} function(s); select the ones to test", functions.len())
        } else {
            format!(
                "Found {} function(s); {} duplicate qualified name(s) dropped; select the ones to test",
                functions.len(),
                dropped
            )
        };
        self.transition(
            PipelineStatus::new(PipelineState::Selecting, message).with_functions(functions.clone()),
        );
        Ok(functions)
    }

    /// Generates scenarios and tests for `functions`, then writes the test
    /// files. Returns the paths written.
    pub async fn generate_tests(
        &self,
        functions: &[ExtractedFunction],
    ) -> Result<Vec<PathBuf>, PipelineError> {
        if functions.is_empty() {
            return Err(PipelineError::NoFunctionsSelected);
        }
        let (_guard, cancel) = self.begin("generate tests")?;

        let health = self.llm.check_health().await;
        if !health.is_ok() {
            let reason = health
                .error
                .unwrap_or_else(|| "health check failed".to_string());
            return Err(self.fail(PipelineError::ProviderUnavailable(reason)));
        }
        if !self.llm.is_model_available(None).await {
            return Err(self.fail(PipelineError::ModelUnavailable(self.llm.get_model())));
        }

        let (functions, _) = distinct(functions.to_vec());
        let scenarios = self.generate_scenarios(&functions, &cancel).await?;
        let fragments = self.generate_fragments(&scenarios, &cancel).await?;

        let written = ResultAggregator::new(&self.output)
            .write(&fragments)
            .map_err(|e| self.fail(PipelineError::FileWriteFailed(e)))?;

        self.transition(
            PipelineStatus::new(
                PipelineState::Complete,
                format!("Wrote {} test file(s)", written.len()),
            )
            .with_progress(100),
        );
        Ok(written)
    }

    async fn generate_scenarios(
        &self,
        functions: &[ExtractedFunction],
        cancel: &CancellationToken,
    ) -> Result<ScenarioMap, PipelineError> {
        let total = functions.len();
        self.transition(
            PipelineStatus::new(
                PipelineState::GeneratingScenarios,
                format!("Generating scenarios (0/{})", total),
            )
            .with_progress(0),
        );

        let mut progress = StageProgress::new(total, 0);
        let mut on_progress = |function: &str| {
            let value = progress.advance();
            self.transition(
                PipelineStatus::new(
                    PipelineState::GeneratingScenarios,
                    format!("Scenarios ready for {} ({}/{})", function, progress.completed, total),
                )
                .with_progress(value),
            );
        };

        let sink: &mut ProgressSink<'_> = &mut on_progress;
        let request = ScenariosRequest { functions };
        let result: Result<ScenarioMap, WorkerError> = invoke_stage(
            &self.invoker,
            Stage::Scenarios,
            &request,
            Some(sink),
            cancel,
        )
        .await;

        let scenarios = result
            .and_then(|scenarios| check_coverage(functions, scenarios))
            .map_err(|source| {
                self.fail(PipelineError::Worker {
                    stage: Stage::Scenarios,
                    source,
                })
            })?;

        for (name, scenario) in scenarios.iter() {
            if let Some(reason) = &scenario.error {
                warn!(function = name, "scenario worker reported an error: {}", reason);
            }
        }
        Ok(scenarios)
    }

    async fn generate_fragments(
        &self,
        scenarios: &ScenarioMap,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedTestFragment>, PipelineError> {
        let total = scenarios.len();
        self.transition(
            PipelineStatus::new(
                PipelineState::GeneratingTests,
                format!("Generating tests (0/{})", total),
            )
            .with_progress(50),
        );

        let mut progress = StageProgress::new(total, 50);
        let mut on_progress = |function: &str| {
            let value = progress.advance();
            self.transition(
                PipelineStatus::new(
                    PipelineState::GeneratingTests,
                    format!("Tests ready for {} ({}/{})", function, progress.completed, total),
                )
                .with_progress(value),
            );
        };

        let sink: &mut ProgressSink<'_> = &mut on_progress;
        let request = TestsRequest { scenarios };
        let fragments: Vec<GeneratedTestFragment> = invoke_stage(
            &self.invoker,
            Stage::Tests,
            &request,
            Some(sink),
            cancel,
        )
        .await
        .map_err(|source| {
            self.fail(PipelineError::Worker {
                stage: Stage::Tests,
                source,
            })
        })?;

        for fragment in &fragments {
            if let Some(reason) = &fragment.error {
                warn!(function = %fragment.function_name, "test worker reported an error: {}", reason);
            }
        }
        Ok(fragments)
    }

    /// Claims the controller for one run.
    fn begin(
        &self,
        operation: &'static str,
    ) -> Result<(RunGuard<'_>, CancellationToken), PipelineError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::Busy);
        }
        let guard = RunGuard {
            in_flight: &self.in_flight,
        };

        let state = self.state();
        if !matches!(state, PipelineState::Idle | PipelineState::Selecting) {
            return Err(PipelineError::InvalidState { state, operation });
        }

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        Ok((guard, token))
    }

    fn transition(&self, status: PipelineStatus) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if current.state == status.state {
            debug!(state = %status.state, progress = ?status.progress, "{}", status.message);
        } else {
            info!(state = %status.state, progress = ?status.progress, "{}", status.message);
        }
        *current = status.clone();
        drop(current);
        // No subscribers is fine.
        let _ = self.events.send(status);
    }

    fn fail(&self, err: PipelineError) -> PipelineError {
        let message = err.to_string();
        error!(error = ?err, "{}", message);
        self.transition(PipelineStatus::new(PipelineState::Error, message.clone()).with_error(message));
        err
    }
}

/// Keeps the first function per qualified name; also returns how many were
/// dropped.
fn distinct(functions: Vec<ExtractedFunction>) -> (Vec<ExtractedFunction>, usize) {
    let mut seen = HashSet::new();
    let mut dropped = 0;
    let kept = functions
        .into_iter()
        .filter(|function| {
            let fresh = seen.insert(function.qualified_name.clone());
            if !fresh {
                dropped += 1;
                warn!(
                    function = %function.qualified_name,
                    file = %function.file_path,
                    "dropping duplicate qualified name"
                );
            }
            fresh
        })
        .collect();
    (kept, dropped)
}

/// Requires exactly one scenario per submitted function.
fn check_coverage(
    functions: &[ExtractedFunction],
    scenarios: ScenarioMap,
) -> Result<ScenarioMap, WorkerError> {
    let missing: Vec<&str> = functions
        .iter()
        .map(|f| f.qualified_name.as_str())
        .filter(|name| !scenarios.contains_key(name))
        .collect();
    let submitted: HashSet<&str> = functions.iter().map(|f| f.qualified_name.as_str()).collect();
    let unexpected: Vec<&str> = scenarios.keys().filter(|k| !submitted.contains(k)).collect();

    if missing.is_empty() && unexpected.is_empty() {
        // Re-key in submission order.
        let mut ordered = ScenarioMap::new();
        for (name, scenario) in functions
            .iter()
            .filter_map(|f| scenarios.get(&f.qualified_name).map(|s| (&f.qualified_name, s)))
        {
            ordered
                .insert(name.clone(), scenario.clone())
                .map_err(|e| WorkerError::InvalidResponse {
                    stage: Stage::Scenarios,
                    reason: e.to_string(),
                })?;
        }
        return Ok(ordered);
    }

    let mut reason = format!(
        "expected one scenario per function ({} submitted, {} returned)",
        functions.len(),
        scenarios.len()
    );
    if !missing.is_empty() {
        reason.push_str(&format!("; missing: {}", missing.join(", ")));
    }
    if !unexpected.is_empty() {
        reason.push_str(&format!("; unexpected: {}", unexpected.join(", ")));
    }
    Err(WorkerError::InvalidResponse {
        stage: Stage::Scenarios,
        reason,
    })
}
