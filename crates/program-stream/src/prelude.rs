//! Common imports for typical client usage.
pub use crate::{
    CancelReason, CredentialProvider, EnvCredentials, GenerationClientConfig,
    GenerationController, GenerationError, GenerationJob, GenerationOrchestrator,
    GenerationOutcome, GenerationStage, JobNotice, JobParameters, ResultUnit, RetryPolicy,
    StaticCredentials, StreamCapabilities, TransportKind,
};
