use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

/// Coarse pipeline phase reported to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Downloading,
    Compiling,
    Complete,
    Error,
}

/// Snapshot of a single run's state. `progress` is 0..=100.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RunStatus {
    pub phase: Phase,
    pub progress: u8,
}

impl RunStatus {
    fn idle() -> Self {
        RunStatus {
            phase: Phase::Idle,
            progress: 0,
        }
    }
}

/// Per-run status registry. Each pipeline invocation registers under a fresh
/// run id, so concurrent runs never clobber each other's progress.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    runs: Arc<Mutex<HashMap<Uuid, RunStatus>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new run at Idle/0 and returns a writer handle for it.
    pub fn register(&self) -> StatusHandle {
        let run_id = Uuid::new_v4();
        self.runs.lock().unwrap().insert(run_id, RunStatus::idle());
        StatusHandle {
            run_id,
            runs: Arc::clone(&self.runs),
        }
    }

    pub fn get(&self, run_id: Uuid) -> Option<RunStatus> {
        self.runs.lock().unwrap().get(&run_id).copied()
    }
}

/// Write side of a run's status. Held only by the pipeline task; the registry
/// remains the single read path.
#[derive(Clone)]
pub struct StatusHandle {
    run_id: Uuid,
    runs: Arc<Mutex<HashMap<Uuid, RunStatus>>>,
}

impl StatusHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn set_phase(&self, phase: Phase) {
        if let Some(status) = self.runs.lock().unwrap().get_mut(&self.run_id) {
            status.phase = phase;
        }
    }

    pub fn set_progress(&self, progress: u8) {
        if let Some(status) = self.runs.lock().unwrap().get_mut(&self.run_id) {
            status.progress = progress.min(100);
        }
    }
}
