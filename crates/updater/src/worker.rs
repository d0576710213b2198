use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::{RunOutcome, UpdateEngine};
use crate::progress::{CancellationToken, ProgressEvent};

/// An engine running on its own task, talking to the caller through channels.
pub struct UpdateWorker {
    token: CancellationToken,
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    task: JoinHandle<RunOutcome>,
}

impl UpdateWorker {
    /// Start `engine` in the background. Any sink already set on it is replaced
    /// by the worker's event channel.
    pub fn spawn(mut engine: UpdateEngine) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        engine.set_log_function(move |event| {
            // The receiver may already be gone if the caller stopped listening.
            let _ = tx.send(event);
        });
        let token = engine.cancellation_token();
        let task = tokio::spawn(async move { engine.start().await });
        Self {
            token,
            events,
            task,
        }
    }

    /// Ask the run to stop. A download in flight is abandoned and nothing
    /// already written is rolled back.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Next event, or `None` once the run is over and all events are drained.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Wait for the terminal outcome.
    pub async fn join(self) -> Result<RunOutcome, tokio::task::JoinError> {
        self.task.await
    }
}
