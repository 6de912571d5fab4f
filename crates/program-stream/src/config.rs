use std::time::Duration;

use crate::errors::GenerationError;

const DEFAULT_GENERATE_PATH: &str = "/api/generate-program";

/// Client configuration, passed explicitly to the orchestrator.
#[derive(Clone, Debug)]
pub struct GenerationClientConfig {
    /// Scheme and host of the backend, e.g. `https://coach.example.com`.
    pub endpoint_base: String,
    /// Path of the streaming generation endpoint.
    pub generate_path: String,
    /// TCP/TLS connect timeout. The overall deadline is set per job.
    pub connect_timeout: Duration,
    /// Log every received frame at `debug` level.
    pub debug_frames: bool,
}

impl GenerationClientConfig {
    pub fn new(endpoint_base: impl Into<String>) -> Self {
        Self {
            endpoint_base: endpoint_base.into(),
            generate_path: DEFAULT_GENERATE_PATH.to_string(),
            connect_timeout: Duration::from_secs(15),
            debug_frames: false,
        }
    }

    /// Builds a config from `PROGRAM_STREAM_ENDPOINT`, with optional
    /// `PROGRAM_STREAM_GENERATE_PATH` and `PROGRAM_STREAM_DEBUG_FRAMES`.
    pub fn from_env() -> Result<Self, GenerationError> {
        let endpoint = std::env::var("PROGRAM_STREAM_ENDPOINT").unwrap_or_default();
        if endpoint.trim().is_empty() {
            return Err(GenerationError::Config(
                "missing PROGRAM_STREAM_ENDPOINT".into(),
            ));
        }
        let mut config = Self::new(endpoint.trim());
        if let Ok(path) = std::env::var("PROGRAM_STREAM_GENERATE_PATH")
            && !path.trim().is_empty()
        {
            config.generate_path = path.trim().to_string();
        }
        if let Ok(flag) = std::env::var("PROGRAM_STREAM_DEBUG_FRAMES") {
            config.debug_frames = crate::observability::parse_bool_env(&flag).unwrap_or(false);
        }
        Ok(config)
    }

    pub fn generate_path(mut self, path: impl Into<String>) -> Self {
        self.generate_path = path.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn debug_frames(mut self, enabled: bool) -> Self {
        self.debug_frames = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), GenerationError> {
        let base = self.endpoint_base.trim();
        if base.is_empty() {
            return Err(GenerationError::Config("endpoint_base must not be empty".into()));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(GenerationError::Config(format!(
                "endpoint_base must be an http(s) URL: {base}"
            )));
        }
        Ok(())
    }

    pub(crate) fn generate_url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint_base.trim().trim_end_matches('/'),
            self.generate_path.trim_start_matches('/')
        )
    }
}
