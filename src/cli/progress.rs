use std::time::Instant;

use tokio::sync::broadcast::{self, error::RecvError};
use unitsmith::data::{PipelineState, PipelineStatus};

/// Prints pipeline status events as they arrive.
pub struct ProgressIndicator {
    start_time: Instant,
    last_state: Option<PipelineState>,
    functions: usize,
}

impl ProgressIndicator {
    pub fn new(functions: usize) -> Self {
        Self {
            start_time: Instant::now(),
            last_state: None,
            functions,
        }
    }

    pub fn show(&mut self, status: &PipelineStatus) {
        if self.last_state != Some(status.state) {
            self.last_state = Some(status.state);
            if status.state == PipelineState::GeneratingScenarios {
                println!("Generating tests for {} function(s)", self.functions);
            }
        }

        match status.state {
            PipelineState::Complete => println!("✓ {}", status.message),
            PipelineState::Error => eprintln!("✗ {}", status.message),
            _ => match status.progress {
                Some(progress) => println!("[{:>3}%] {}", progress, status.message),
                None => println!("{}", status.message),
            },
        }
    }

    /// Consumes events until the pipeline reaches a terminal state or the
    /// channel closes.
    pub async fn follow(mut self, mut events: broadcast::Receiver<PipelineStatus>) {
        loop {
            match events.recv().await {
                Ok(status) => {
                    self.show(&status);
                    if status.state.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    println!("({} progress update(s) skipped)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.finish();
    }

    pub fn finish(&self) {
        let elapsed = self.start_time.elapsed();
        println!("\n{}", "=".repeat(60));
        println!("Summary:");
        if let Some(state) = self.last_state {
            println!("  Final state: {}", state);
        }
        println!("  Functions:   {}", self.functions);
        println!("  Duration:    {:.2}s", elapsed.as_secs_f64());
        println!("{}", "=".repeat(60));
    }
}
