//! Client for server-side workout program generation streamed over HTTP.
//!
//! A job is prepared from [`JobParameters`], posted to the generation
//! endpoint, and its result units arrive incrementally as server-sent-event
//! frames. The orchestrator retries transient failures, enforces a deadline
//! scaled to the program length and can be cancelled at any point.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use program_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), GenerationError> {
//! let orchestrator = GenerationOrchestrator::builder(
//!     GenerationClientConfig::from_env()?,
//!     Arc::new(EnvCredentials::default()),
//! )
//! .build()?;
//!
//! let params = JobParameters {
//!     entity_id: "client-42".into(),
//!     number_of_weeks: 4,
//!     days_of_week: vec!["monday".into(), "wednesday".into(), "friday".into()],
//!     ..JobParameters::default()
//! };
//!
//! match orchestrator.start(params).await {
//!     GenerationOutcome::Completed { result_count } => println!("{result_count} workouts"),
//!     GenerationOutcome::Failed { error } => eprintln!("failed: {error}"),
//!     GenerationOutcome::Cancelled => {}
//! }
//! # Ok(())
//! # }
//! ```

/// Bearer credential providers.
pub mod auth;
/// Cancellation handle and token.
pub mod cancel;
/// Endpoint configuration.
pub mod config;
/// Caller-facing controller and result reconciliation.
pub mod controller;
/// Public error types.
pub mod errors;
/// Incremental event-stream frame decoding.
pub mod frame;
/// Job snapshot, stages and outcomes.
pub mod job;
/// Pure generation state machine.
pub mod machine;
/// Logging setup.
pub mod observability;
/// Job lifecycle driver.
pub mod orchestrator;
/// Job parameters and request preparation.
pub mod params;
/// Request body and in-band payload types.
pub mod payload;
/// Common imports for typical usage.
pub mod prelude;
/// Retry policy.
pub mod retry;
/// Native and progressive-poll stream transports.
pub mod transport;

pub use auth::{
    CredentialProvider, EnvCredentials, IssuedToken, RefreshingCredentials, StaticCredentials,
    TokenSource,
};
pub use cancel::{CancelHandle, CancelReason, CancelToken};
pub use config::GenerationClientConfig;
pub use controller::{GenerationController, WorkoutStore, reconcile};
pub use errors::{GenerationError, TransportError};
pub use frame::{FrameDecoder, StreamFrame};
pub use job::{GenerationJob, GenerationOutcome, GenerationStage, JobNotice};
pub use observability::init_observability;
pub use orchestrator::{GenerationOrchestrator, GenerationOrchestratorBuilder, JobTicket};
pub use params::{JobParameters, PreparedJob};
pub use payload::{GenerationRequestBody, ResultUnit, StreamPayload};
pub use retry::RetryPolicy;
pub use transport::{
    NativeStreamTransport, PollingStreamTransport, StreamCallbacks, StreamCapabilities,
    StreamMethod, StreamRequest, StreamTransport, TransportKind,
};
