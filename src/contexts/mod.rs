mod diagnostics;
mod pipeline;
mod result_aggregator;
mod worker_invoker;

pub use diagnostics::{DiagnosticDecoder, DiagnosticLine};
pub use pipeline::{PipelineController, PipelineError};
pub use result_aggregator::{
    AggregateError, OutputFile, PYTEST_PREAMBLE, ResultAggregator, strip_code_fences,
};
pub use worker_invoker::{
    ExternalWorkerInvoker, ProgressSink, Stage, WorkerCommand, WorkerCommands, WorkerError,
    WorkerInvoker, decode_response, invoke_stage,
};
