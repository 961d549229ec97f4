use tokio::sync::mpsc;

use super::job::CompletedJob;

/// Create the handoff channel between dispatcher and aggregation worker.
pub fn completion_queue() -> (CompletionQueue, CompletionDrain) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionQueue { tx }, CompletionDrain { rx })
}

/// Producer side. Pushing never blocks.
#[derive(Debug, Clone)]
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<CompletedJob>,
}

impl CompletionQueue {
    /// Hand a completed job to the worker. Returns the job back when the
    /// worker side is gone.
    pub fn push(&self, job: CompletedJob) -> Result<(), CompletedJob> {
        self.tx.send(job).map_err(|e| e.0)
    }
}

/// Consumer side.
#[derive(Debug)]
pub struct CompletionDrain {
    rx: mpsc::UnboundedReceiver<CompletedJob>,
}

impl CompletionDrain {
    /// Take everything currently queued. Returns immediately when empty.
    pub fn drain(&mut self) -> Vec<CompletedJob> {
        let mut batch = Vec::new();
        while let Ok(job) = self.rx.try_recv() {
            batch.push(job);
        }
        batch
    }
}
