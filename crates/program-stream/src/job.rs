use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;
use crate::payload::ResultUnit;

/// Lifecycle stage of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStage {
    Idle,
    Preparing,
    Generating,
    Streaming,
    Complete,
    Error,
    Retrying,
}

impl GenerationStage {
    /// Stages in which the job is doing work and the ticker runs.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Generating | Self::Streaming | Self::Retrying
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Read-only snapshot of a job, published after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationJob {
    pub job_id: uuid::Uuid,
    pub stage: GenerationStage,
    pub progress_current: u32,
    pub progress_total: u32,
    pub partial_results: Vec<ResultUnit>,
    pub elapsed_seconds: u64,
    pub last_error: Option<String>,
    pub retry_attempt: u32,
    /// The job ended because the caller cancelled it.
    pub cancelled: bool,
    #[serde(skip)]
    seen_ids: HashSet<String>,
}

impl GenerationJob {
    pub fn new(job_id: uuid::Uuid) -> Self {
        Self {
            job_id,
            stage: GenerationStage::Idle,
            progress_current: 0,
            progress_total: 0,
            partial_results: Vec::new(),
            elapsed_seconds: 0,
            last_error: None,
            retry_attempt: 0,
            cancelled: false,
            seen_ids: HashSet::new(),
        }
    }

    /// Fraction of expected units received, clamped to 1.0.
    pub fn progress_fraction(&self) -> f32 {
        if self.progress_total == 0 {
            return 0.0;
        }
        (self.progress_current as f32 / self.progress_total as f32).min(1.0)
    }

    /// Appends a unit unless its id was already delivered this attempt.
    pub(crate) fn accept_unit(&mut self, unit: ResultUnit) -> bool {
        if !self.seen_ids.insert(unit.id.clone()) {
            return false;
        }
        self.partial_results.push(unit);
        self.progress_current = self.partial_results.len() as u32;
        true
    }

    pub(crate) fn clear_results(&mut self) {
        self.partial_results.clear();
        self.seen_ids.clear();
        self.progress_current = 0;
    }
}

impl Default for GenerationJob {
    fn default() -> Self {
        Self::new(uuid::Uuid::nil())
    }
}

/// Final result of [`crate::GenerationOrchestrator::start`].
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum GenerationOutcome {
    /// Stream closed cleanly; `result_count` units were received.
    Completed { result_count: usize },
    /// Attempts exhausted or a fatal error occurred.
    Failed { error: GenerationError },
    /// The caller cancelled, or a newer job superseded this one.
    Cancelled,
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn result_count(&self) -> usize {
        match self {
            Self::Completed { result_count } => *result_count,
            _ => 0,
        }
    }

    pub fn error(&self) -> Option<&GenerationError> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Side-channel notifications for things that do not change the stage.
#[derive(Debug, Clone, PartialEq)]
pub enum JobNotice {
    Status { message: Option<String> },
    UnitAdded { id: String, progress_current: u32 },
    Metadata(serde_json::Map<String, serde_json::Value>),
    Warning { message: String },
    CompleteHint,
    Retrying { attempt: u32, error: String },
    Cancelled,
}
