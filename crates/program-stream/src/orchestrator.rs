//! Job lifecycle: preparation, attempts, retry, deadline and cancellation.
//!
//! All state changes go through [`crate::machine::transition`]; this module
//! only performs the effects it returns and feeds it events from the
//! transport, the deadline timer, the retry wait and the elapsed-time ticker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::auth::CredentialProvider;
use crate::cancel::{CancelHandle, CancelReason, CancelToken};
use crate::config::GenerationClientConfig;
use crate::errors::{GenerationError, TransportError};
use crate::frame::StreamFrame;
use crate::job::{GenerationJob, GenerationOutcome, GenerationStage, JobNotice};
use crate::machine::{Effect, MachineEvent, Transition, transition};
use crate::params::{JobParameters, PreparedJob};
use crate::payload::StreamPayload;
use crate::retry::RetryPolicy;
use crate::transport::{
    StreamCallbacks, StreamCapabilities, StreamRequest, StreamTransport, TransportKind,
    build_http_client,
};

const NOTICE_CAPACITY: usize = 64;
const TICK: Duration = Duration::from_secs(1);

/// A registered job, see [`GenerationOrchestrator::register`].
#[derive(Debug)]
pub struct JobTicket {
    job_id: uuid::Uuid,
    cancel: CancelToken,
}

impl JobTicket {
    pub fn job_id(&self) -> uuid::Uuid {
        self.job_id
    }
}

struct ActiveJob {
    job_id: uuid::Uuid,
    cancel: CancelHandle,
}

/// Runs generation jobs against the streaming endpoint.
///
/// One job is active at a time; starting another supersedes the first.
pub struct GenerationOrchestrator {
    config: GenerationClientConfig,
    transport: Arc<dyn StreamTransport>,
    credentials: Arc<dyn CredentialProvider>,
    policy: RetryPolicy,
    state_tx: watch::Sender<GenerationJob>,
    notices_tx: broadcast::Sender<JobNotice>,
    active: Mutex<Option<ActiveJob>>,
}

impl GenerationOrchestrator {
    pub fn builder(
        config: GenerationClientConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> GenerationOrchestratorBuilder {
        GenerationOrchestratorBuilder {
            config,
            credentials,
            transport: None,
            capabilities: StreamCapabilities::default(),
            policy: RetryPolicy::default(),
        }
    }

    /// Watch channel of job snapshots.
    pub fn subscribe(&self) -> watch::Receiver<GenerationJob> {
        self.state_tx.subscribe()
    }

    /// Current job snapshot.
    pub fn snapshot(&self) -> GenerationJob {
        self.state_tx.borrow().clone()
    }

    /// Stream of notices that do not change the job stage (warnings,
    /// metadata, per-unit progress).
    pub fn notices(&self) -> broadcast::Receiver<JobNotice> {
        self.notices_tx.subscribe()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs one generation job to its outcome.
    pub async fn start(&self, params: JobParameters) -> GenerationOutcome {
        let ticket = self.register();
        self.run(ticket, params).await
    }

    /// Makes a new job the active one, superseding any job in flight. The
    /// job does nothing until passed to [`Self::run`].
    pub fn register(&self) -> JobTicket {
        let job_id = uuid::Uuid::new_v4();
        let cancel = CancelHandle::new();
        let mut active = self.lock_active();
        if let Some(previous) = active.replace(ActiveJob {
            job_id,
            cancel: cancel.clone(),
        }) {
            info!(previous_job_id = %previous.job_id, "superseding in-flight generation job");
            previous.cancel.cancel(CancelReason::Superseded);
        }
        JobTicket {
            job_id,
            cancel: cancel.token(),
        }
    }

    /// Runs a registered job to its outcome.
    pub async fn run(&self, ticket: JobTicket, params: JobParameters) -> GenerationOutcome {
        let JobTicket { job_id, cancel } = ticket;
        let span = info_span!("generation_job", %job_id);
        let outcome = self.run_job(job_id, params, cancel).instrument(span).await;

        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.job_id == job_id) {
            *active = None;
        }
        outcome
    }

    /// Stops the active job. No-op when nothing is running.
    pub fn cancel(&self) {
        let active = self.lock_active();
        let Some(job) = active.as_ref() else {
            return;
        };
        if job.cancel.cancel(CancelReason::User) {
            info!(job_id = %job.job_id, "generation cancelled by caller");
            self.state_tx.send_if_modified(|state| {
                if state.job_id != job.job_id || !state.stage.is_active() {
                    return false;
                }
                state.stage = GenerationStage::Idle;
                state.cancelled = true;
                true
            });
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes a snapshot if `job` still owns the orchestrator. Once the job
    /// is cancelled only its settled (inactive) state is published.
    fn publish(&self, job: &GenerationJob, cancel: &CancelToken) {
        if cancel.is_cancelled() && job.stage.is_active() {
            return;
        }
        let active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.job_id == job.job_id) {
            self.state_tx.send_replace(job.clone());
        }
    }

    async fn run_job(
        &self,
        job_id: uuid::Uuid,
        params: JobParameters,
        cancel: CancelToken,
    ) -> GenerationOutcome {
        let mut driver = Driver {
            orchestrator: self,
            job: GenerationJob::new(job_id),
            cancel,
            pending: VecDeque::new(),
        };
        self.publish(&driver.job, &driver.cancel);
        driver.dispatch(MachineEvent::Start);

        let prepared = match params.prepare(chrono::Local::now().date_naive()) {
            Ok(prepared) => prepared,
            Err(error) => {
                warn!(error = %error, "generation job parameters rejected");
                driver.dispatch(MachineEvent::AttemptFailed(error));
                return driver.take_outcome();
            }
        };
        info!(
            weeks = prepared.weeks,
            days_per_week = prepared.days_per_week,
            expected_units = prepared.expected_units,
            deadline_secs = prepared.deadline.as_secs(),
            regenerate = params.regenerate,
            "generation job prepared"
        );
        driver.dispatch(MachineEvent::Prepared {
            progress_total: prepared.expected_units,
        });

        let mut ticker: Option<Interval> = None;
        while let Some(effect) = driver.pending.pop_front() {
            match effect {
                Effect::StartTicker => ticker = Some(new_ticker()),
                Effect::StopTicker => ticker = None,
                Effect::OpenStream => {
                    let event = self.run_attempt(&mut driver, &prepared, &mut ticker).await;
                    driver.dispatch(event);
                }
                Effect::ScheduleRetry(delay) => {
                    let event = wait_retry(&mut driver, delay, &mut ticker).await;
                    driver.dispatch(event);
                }
                Effect::Resolve(outcome) => {
                    match &outcome {
                        GenerationOutcome::Completed { result_count } => {
                            info!(result_count, elapsed_secs = driver.job.elapsed_seconds, "generation complete");
                        }
                        GenerationOutcome::Failed { error } => {
                            warn!(error = %error, attempts = driver.job.retry_attempt + 1, "generation failed");
                        }
                        GenerationOutcome::Cancelled => info!("generation stopped"),
                    }
                    return outcome;
                }
                Effect::Notify(_) => {}
            }
        }
        GenerationOutcome::Failed {
            error: GenerationError::protocol("generation ended without an outcome"),
        }
    }

    /// One transport attempt. Returns the event that ends it.
    async fn run_attempt(
        &self,
        driver: &mut Driver<'_>,
        prepared: &PreparedJob,
        ticker: &mut Option<Interval>,
    ) -> MachineEvent {
        let cancel = driver.cancel.clone();
        let attempt = driver.job.retry_attempt;

        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return MachineEvent::Cancelled,
            token = self.credentials.access_token() => token,
        };
        let token = match token {
            Ok(token) => token,
            Err(error) => {
                warn!(attempt, error = %error, "no credential for generation request");
                return MachineEvent::AttemptFailed(error);
            }
        };
        let body = match serde_json::to_string(&prepared.body) {
            Ok(body) => body,
            Err(e) => {
                return MachineEvent::AttemptFailed(GenerationError::Validation(format!(
                    "failed to serialize request body: {e}"
                )));
            }
        };
        let request = StreamRequest::post(self.config.generate_url(), body)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "text/event-stream")
            .header("Content-Type", "application/json");
        info!(attempt, url = %request.url, "starting generation attempt");

        let attempt_cancel = CancelHandle::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = self.transport.open_stream(
            request,
            attempt_cancel.token(),
            Box::new(ChannelCallbacks { tx }),
        );
        tokio::pin!(stream);
        let deadline = tokio::time::sleep(prepared.deadline);
        tokio::pin!(deadline);
        let mut stream_done = false;
        let mut abort: Option<AttemptAbort> = None;

        loop {
            tokio::select! {
                biased;
                reason = cancel.cancelled(), if abort.is_none() => {
                    abort = Some(AttemptAbort::Cancelled);
                    attempt_cancel.cancel(reason);
                }
                _ = &mut deadline, if abort.is_none() => {
                    warn!(attempt, deadline_secs = prepared.deadline.as_secs(), "generation deadline elapsed");
                    abort = Some(AttemptAbort::Failed(GenerationError::Timeout {
                        after: prepared.deadline,
                    }));
                    attempt_cancel.cancel(CancelReason::Timeout);
                }
                signal = rx.recv() => match signal {
                    Some(TransportSignal::Open) => {
                        if abort.is_none() {
                            driver.dispatch(MachineEvent::StreamOpened);
                        }
                    }
                    Some(TransportSignal::Frame(frame)) => {
                        if abort.is_none()
                            && let Some(error) = self.handle_frame(driver, &frame)
                        {
                            warn!(attempt, error = %error, "server reported generation error");
                            abort = Some(AttemptAbort::Failed(error));
                            attempt_cancel.cancel(CancelReason::Aborted);
                        }
                    }
                    Some(TransportSignal::Error(error)) => return finish_attempt(abort, Some(error)),
                    Some(TransportSignal::Close) | None => return finish_attempt(abort, None),
                },
                _ = &mut stream, if !stream_done => stream_done = true,
                _ = next_tick(ticker) => driver.dispatch(MachineEvent::Tick),
            }
        }
    }

    /// Interprets one frame. Returns an error when the server reported a failure.
    fn handle_frame(&self, driver: &mut Driver<'_>, frame: &StreamFrame) -> Option<GenerationError> {
        if self.config.debug_frames {
            debug!(event = frame.event_type(), id = ?frame.id, data = %frame.data, "frame received");
        }
        let Some(payload) = StreamPayload::from_frame(frame) else {
            debug!(event = frame.event_type(), "ignoring non-protocol frame");
            return None;
        };
        match payload {
            StreamPayload::Status { message } => {
                debug!(message = ?message, "generation status");
                driver.dispatch(MachineEvent::Status(message));
            }
            StreamPayload::Workout(unit) => driver.dispatch(MachineEvent::UnitReceived(unit)),
            StreamPayload::Metadata(fields) => driver.dispatch(MachineEvent::Metadata(fields)),
            StreamPayload::Warning { message } => {
                warn!(message = %message, "generation warning");
                driver.dispatch(MachineEvent::Warning(message));
            }
            StreamPayload::Error { message } => {
                let message = if message.trim().is_empty() {
                    "generation failed".to_string()
                } else {
                    message
                };
                return Some(GenerationError::protocol(message));
            }
            StreamPayload::Complete { total } => {
                debug!(total = ?total, "server reported completion");
                driver.dispatch(MachineEvent::CompleteHint);
            }
            StreamPayload::Unknown => {}
        }
        None
    }
}

/// Owns the local job copy for one `start` call.
struct Driver<'a> {
    orchestrator: &'a GenerationOrchestrator,
    job: GenerationJob,
    cancel: CancelToken,
    pending: VecDeque<Effect>,
}

impl Driver<'_> {
    /// Resolution left in the pending effects, if any.
    fn take_outcome(&mut self) -> GenerationOutcome {
        self.pending
            .drain(..)
            .find_map(|effect| match effect {
                Effect::Resolve(outcome) => Some(outcome),
                _ => None,
            })
            .unwrap_or(GenerationOutcome::Failed {
                error: GenerationError::protocol("generation ended without an outcome"),
            })
    }

    fn dispatch(&mut self, event: MachineEvent) {
        let job = std::mem::take(&mut self.job);
        let Transition { job, effects } = transition(job, event, &self.orchestrator.policy);
        self.job = job;
        self.orchestrator.publish(&self.job, &self.cancel);
        for effect in effects {
            match effect {
                Effect::Notify(notice) => {
                    let _ = self.orchestrator.notices_tx.send(notice);
                }
                other => self.pending.push_back(other),
            }
        }
    }
}

enum AttemptAbort {
    Cancelled,
    Failed(GenerationError),
}

fn finish_attempt(abort: Option<AttemptAbort>, error: Option<TransportError>) -> MachineEvent {
    match (abort, error) {
        (Some(AttemptAbort::Cancelled), _) => MachineEvent::Cancelled,
        (Some(AttemptAbort::Failed(error)), _) => MachineEvent::AttemptFailed(error),
        (None, Some(error)) => MachineEvent::AttemptFailed(error.into()),
        (None, None) => MachineEvent::StreamClosed,
    }
}

async fn wait_retry(
    driver: &mut Driver<'_>,
    delay: Duration,
    ticker: &mut Option<Interval>,
) -> MachineEvent {
    info!(
        delay_ms = delay.as_millis() as u64,
        next_attempt = driver.job.retry_attempt + 1,
        last_error = driver.job.last_error.as_deref().unwrap_or(""),
        "retrying generation"
    );
    let cancel = driver.cancel.clone();
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return MachineEvent::Cancelled,
            _ = &mut sleep => return MachineEvent::RetryDelayElapsed,
            _ = next_tick(ticker) => driver.dispatch(MachineEvent::Tick),
        }
    }
}

fn new_ticker() -> Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

enum TransportSignal {
    Open,
    Frame(StreamFrame),
    Error(TransportError),
    Close,
}

/// Forwards transport callbacks to the attempt loop.
struct ChannelCallbacks {
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl StreamCallbacks for ChannelCallbacks {
    fn on_open(&mut self) {
        let _ = self.tx.send(TransportSignal::Open);
    }

    fn on_message(&mut self, frame: StreamFrame) {
        let _ = self.tx.send(TransportSignal::Frame(frame));
    }

    fn on_error(&mut self, error: TransportError) {
        let _ = self.tx.send(TransportSignal::Error(error));
    }

    fn on_close(&mut self) {
        let _ = self.tx.send(TransportSignal::Close);
    }
}

/// Builder for [`GenerationOrchestrator`].
pub struct GenerationOrchestratorBuilder {
    config: GenerationClientConfig,
    credentials: Arc<dyn CredentialProvider>,
    transport: Option<Arc<dyn StreamTransport>>,
    capabilities: StreamCapabilities,
    policy: RetryPolicy,
}

impl GenerationOrchestratorBuilder {
    /// Uses an explicit transport instead of one chosen from capabilities.
    pub fn transport(mut self, transport: Arc<dyn StreamTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Declares what the platform supports; picks the transport strategy.
    pub fn capabilities(mut self, capabilities: StreamCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<GenerationOrchestrator, GenerationError> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let kind = TransportKind::for_capabilities(self.capabilities);
                debug!(?kind, "selected stream transport");
                kind.build(build_http_client(self.config.connect_timeout)?)
            }
        };
        let (state_tx, _) = watch::channel(GenerationJob::default());
        let (notices_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Ok(GenerationOrchestrator {
            config: self.config,
            transport,
            credentials: self.credentials,
            policy: self.policy,
            state_tx,
            notices_tx,
            active: Mutex::new(None),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::transport::CallbackDispatch;

    /// How a scripted attempt ends after its chunks are delivered.
    #[derive(Clone)]
    pub(crate) enum End {
        Close,
        Error(TransportError),
        /// Stay open until cancelled.
        Hang,
    }

    #[derive(Clone)]
    pub(crate) enum Attempt {
        /// Fail before headers with this status.
        Status(u16),
        Stream { chunks: Vec<String>, end: End },
    }

    pub(crate) fn stream(chunks: Vec<String>, end: End) -> Attempt {
        Attempt::Stream { chunks, end }
    }

    pub(crate) fn workout_frame(id: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"type": "workout", "id": id, "title": format!("Workout {id}"), "body": "3x10"})
        )
    }

    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        attempts: Mutex<VecDeque<Attempt>>,
        pub(crate) requests: Mutex<Vec<StreamRequest>>,
        pub(crate) closes: Arc<AtomicUsize>,
        pub(crate) errors: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(attempts: Vec<Attempt>) -> Arc<Self> {
            Arc::new(Self {
                attempts: Mutex::new(attempts.into()),
                ..Self::default()
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().expect("requests lock").len()
        }
    }

    struct Counting {
        inner: Box<dyn StreamCallbacks>,
        closes: Arc<AtomicUsize>,
        errors: Arc<AtomicUsize>,
    }

    impl StreamCallbacks for Counting {
        fn on_open(&mut self) {
            self.inner.on_open();
        }

        fn on_message(&mut self, frame: StreamFrame) {
            self.inner.on_message(frame);
        }

        fn on_error(&mut self, error: TransportError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
            self.inner.on_error(error);
        }

        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.on_close();
        }
    }

    #[async_trait::async_trait]
    impl StreamTransport for ScriptedTransport {
        async fn open_stream(
            &self,
            request: StreamRequest,
            cancel: CancelToken,
            callbacks: Box<dyn StreamCallbacks>,
        ) {
            self.requests.lock().expect("requests lock").push(request);
            let attempt = self
                .attempts
                .lock()
                .expect("attempts lock")
                .pop_front()
                .expect("no scripted attempt left");
            let counting = Counting {
                inner: callbacks,
                closes: self.closes.clone(),
                errors: self.errors.clone(),
            };
            let mut dispatch = CallbackDispatch::new(Box::new(counting), cancel.clone());
            match attempt {
                Attempt::Status(status) => {
                    dispatch.error(TransportError::status(status, "scripted failure"));
                }
                Attempt::Stream { chunks, end } => {
                    dispatch.open();
                    for chunk in chunks {
                        tokio::task::yield_now().await;
                        if cancel.is_cancelled() {
                            dispatch.close();
                            return;
                        }
                        dispatch.feed(chunk.as_bytes());
                    }
                    match end {
                        End::Close => dispatch.close(),
                        End::Error(error) => dispatch.error(error),
                        End::Hang => {
                            cancel.cancelled().await;
                            dispatch.close();
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn orchestrator(transport: Arc<ScriptedTransport>) -> GenerationOrchestrator {
        orchestrator_with(transport, Arc::new(crate::auth::StaticCredentials::new("tok")))
    }

    pub(crate) fn orchestrator_with(
        transport: Arc<ScriptedTransport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> GenerationOrchestrator {
        GenerationOrchestrator::builder(
            GenerationClientConfig::new("http://coach.test"),
            credentials,
        )
        .transport(transport)
        .retry_policy(RetryPolicy::fixed(2, Duration::from_millis(5)))
        .build()
        .expect("orchestrator")
    }
}
