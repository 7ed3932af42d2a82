use std::io;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::settings::FileSettings;
use crate::contexts::{ExternalWorkerInvoker, ProgressSink, Stage, WorkerError, WorkerInvoker};

/// Process bridge whose worker commands and timeout come from the settings
/// file, read again for every stage.
#[derive(Debug, Clone)]
pub struct ConfiguredWorkers {
    settings: FileSettings,
}

impl ConfiguredWorkers {
    pub fn new(settings: FileSettings) -> Self {
        Self { settings }
    }

    fn invoker(&self, stage: Stage) -> Result<ExternalWorkerInvoker, WorkerError> {
        let settings = self.settings.load().map_err(|e| WorkerError::Io {
            stage,
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        Ok(ExternalWorkerInvoker::new(settings.worker_commands())
            .with_timeout(settings.worker_timeout()))
    }
}

impl WorkerInvoker for ConfiguredWorkers {
    async fn run(
        &self,
        stage: Stage,
        request: &Value,
        on_progress: Option<&mut ProgressSink<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Value, WorkerError> {
        let invoker = self.invoker(stage)?;
        invoker.run(stage, request, on_progress, cancel).await
    }
}
