//! Per-iteration progress reporting.
//!
//! A run produces a finite, ordered sequence of [`ProgressUpdate`]s followed by
//! exactly one terminal [`RunStatus`]. Sinks receive them synchronously on the
//! optimizer thread; [`ProgressLog`] and the channel sink make them readable
//! from other threads.

use std::sync::{mpsc::Sender, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// 1-based index of the completed iteration
    pub iteration: usize,
    pub max_iterations: usize,
    /// Compliance of the design analysed in this iteration
    pub objective: f64,
    /// Mean physical density over the design domain
    pub volume_fraction: f64,
    pub change: f64,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    Initialized,
    Iterating,
    Converged,
    MaxIterationsReached,
    Failed(String),
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Converged | RunStatus::MaxIterationsReached | RunStatus::Failed(_)
        )
    }
}

/// Message form of the progress sequence
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Update(ProgressUpdate),
    Finished(RunStatus),
}

/// Receives the progress sequence of one run
pub trait ProgressSink {
    fn report(&self, update: &ProgressUpdate);

    /// Called once with the terminal status
    fn finish(&self, _status: &RunStatus) {}
}

/// Adapts a closure into a sink
pub struct Callback<F>(pub F);

impl<F> ProgressSink for Callback<F>
where
    F: Fn(&ProgressUpdate),
{
    fn report(&self, update: &ProgressUpdate) {
        (self.0)(update)
    }
}

impl ProgressSink for Sender<ProgressEvent> {
    fn report(&self, update: &ProgressUpdate) {
        // a dropped receiver means nobody is listening any more
        let _ = self.send(ProgressEvent::Update(update.clone()));
    }

    fn finish(&self, status: &RunStatus) {
        let _ = self.send(ProgressEvent::Finished(status.clone()));
    }
}

/// Append-only progress record of a run, safe to read while the run is
/// still appending to it.
#[derive(Debug, Default)]
pub struct ProgressLog {
    updates: RwLock<Vec<ProgressUpdate>>,
    terminal: OnceLock<RunStatus>,
}

impl ProgressLog {
    pub fn new() -> ProgressLog {
        ProgressLog::default()
    }

    /// Appends an update. Returns `false` once the run has a terminal status.
    pub fn push(&self, update: ProgressUpdate) -> bool {
        let mut updates = self.updates.write();
        if self.terminal.get().is_some() {
            return false;
        }
        updates.push(update);
        true
    }

    /// Sets the terminal status. Only the first call has an effect.
    pub fn complete(&self, status: RunStatus) -> bool {
        // holding the write lock orders this against in-flight pushes
        let _updates = self.updates.write();
        self.terminal.set(status).is_ok()
    }

    pub fn status(&self) -> RunStatus {
        match self.terminal.get() {
            Some(status) => status.clone(),
            None if self.updates.read().is_empty() => RunStatus::Initialized,
            None => RunStatus::Iterating,
        }
    }

    pub fn len(&self) -> usize {
        self.updates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.read().is_empty()
    }

    pub fn latest(&self) -> Option<ProgressUpdate> {
        self.updates.read().last().cloned()
    }

    /// Copy of the updates from index `from` on, in emission order
    pub fn since(&self, from: usize) -> Vec<ProgressUpdate> {
        let updates = self.updates.read();
        updates.get(from..).map(<[_]>::to_vec).unwrap_or_default()
    }
}

impl ProgressSink for ProgressLog {
    fn report(&self, update: &ProgressUpdate) {
        self.push(update.clone());
    }

    fn finish(&self, status: &RunStatus) {
        self.complete(status.clone());
    }
}
