//! Caller-facing handle over a shared orchestrator.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::errors::GenerationError;
use crate::job::{GenerationJob, GenerationOutcome, JobNotice};
use crate::orchestrator::GenerationOrchestrator;
use crate::params::JobParameters;
use crate::payload::ResultUnit;

/// Where finished programs are persisted by the backend.
#[async_trait::async_trait]
pub trait WorkoutStore: Send + Sync {
    async fn fetch_units(&self, program_id: &str) -> Result<Vec<ResultUnit>, GenerationError>;
}

/// Spawns jobs and exposes their state. Dropping the controller cancels
/// whatever job is still running.
pub struct GenerationController {
    orchestrator: Arc<GenerationOrchestrator>,
}

impl GenerationController {
    pub fn new(orchestrator: Arc<GenerationOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<GenerationOrchestrator> {
        &self.orchestrator
    }

    /// Starts a job in the background. Any job already running is superseded
    /// before this returns.
    pub fn start(&self, params: JobParameters) -> JoinHandle<GenerationOutcome> {
        let ticket = self.orchestrator.register();
        debug!(job_id = %ticket.job_id(), "spawning generation job");
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(ticket, params).await })
    }

    pub fn cancel(&self) {
        self.orchestrator.cancel();
    }

    pub fn state(&self) -> watch::Receiver<GenerationJob> {
        self.orchestrator.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<JobNotice> {
        self.orchestrator.notices()
    }

    pub fn snapshot(&self) -> GenerationJob {
        self.orchestrator.snapshot()
    }

    /// Received units over expected units, in `0.0..=1.0`.
    pub fn progress_fraction(&self) -> f32 {
        self.orchestrator.snapshot().progress_fraction()
    }

    /// Refetches the persisted program and merges it with what was streamed.
    pub async fn refresh_from_store(
        &self,
        store: &dyn WorkoutStore,
        program_id: &str,
    ) -> Result<Vec<ResultUnit>, GenerationError> {
        let local = self.orchestrator.snapshot().partial_results;
        let stored = store.fetch_units(program_id).await?;
        info!(
            program_id,
            local = local.len(),
            stored = stored.len(),
            "reconciling streamed units with store"
        );
        Ok(reconcile(local, stored))
    }
}

impl Drop for GenerationController {
    fn drop(&mut self) {
        self.orchestrator.cancel();
    }
}

/// Stored units win by id; units only seen locally are appended in order.
pub fn reconcile(local: Vec<ResultUnit>, stored: Vec<ResultUnit>) -> Vec<ResultUnit> {
    let stored_ids: HashSet<String> = stored.iter().map(|u| u.id.clone()).collect();
    let mut merged = stored;
    merged.extend(local.into_iter().filter(|u| !stored_ids.contains(&u.id)));
    merged
}
