//! Bearer credential sources.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::GenerationError;

/// Supplies a bearer token that is valid at call time.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, GenerationError>;
}

/// Fixed token, mostly for tests and scripts.
#[derive(Clone)]
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self) -> Result<String, GenerationError> {
        non_empty(self.token.clone())
    }
}

/// Reads the token from an environment variable on every call.
#[derive(Clone)]
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new("PROGRAM_STREAM_ACCESS_TOKEN")
    }
}

#[async_trait::async_trait]
impl CredentialProvider for EnvCredentials {
    async fn access_token(&self) -> Result<String, GenerationError> {
        match std::env::var(&self.var) {
            Ok(token) => non_empty(token),
            Err(_) => Err(GenerationError::authentication(format!(
                "no access token in {}",
                self.var
            ))),
        }
    }
}

/// A token together with its lifetime.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: Duration,
}

/// Session backend able to mint a fresh token, e.g. by refreshing a session.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh(&self) -> Result<IssuedToken, GenerationError>;
}

struct Cached {
    token: String,
    refresh_at: Instant,
}

/// Caches a token and refreshes it `skew` before it expires.
pub struct RefreshingCredentials {
    source: Arc<dyn TokenSource>,
    skew: Duration,
    cached: Mutex<Option<Cached>>,
}

impl RefreshingCredentials {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            skew: Duration::from_secs(60),
            cached: Mutex::new(None),
        }
    }

    pub fn skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }
}

#[async_trait::async_trait]
impl CredentialProvider for RefreshingCredentials {
    async fn access_token(&self) -> Result<String, GenerationError> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref()
            && Instant::now() < entry.refresh_at
        {
            return Ok(entry.token.clone());
        }
        debug!("refreshing access token");
        let issued = self.source.refresh().await?;
        let token = non_empty(issued.token)?;
        let lifetime = issued.expires_in.saturating_sub(self.skew);
        *cached = Some(Cached {
            token: token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token)
    }
}

fn non_empty(token: String) -> Result<String, GenerationError> {
    if token.trim().is_empty() {
        return Err(GenerationError::authentication("access token is empty"));
    }
    Ok(token)
}
