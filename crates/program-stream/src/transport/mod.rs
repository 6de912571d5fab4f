//! HTTP transports that turn a streamed response body into callbacks.
//!
//! Two interchangeable implementations exist: [`NativeStreamTransport`] reads
//! the body incrementally, [`PollingStreamTransport`] diffs a growing response
//! buffer for runtimes that cannot expose incremental POST bodies. Pick one
//! once, at construction, with [`TransportKind::for_capabilities`].

mod native;
mod polling;

use std::sync::Arc;

use tracing::debug;

pub use native::NativeStreamTransport;
pub use polling::{
    ExchangeSnapshot, ProgressiveConnector, ProgressiveExchange, PollingStreamTransport,
    ReadyState, ReqwestProgressiveConnector,
};

use crate::cancel::CancelToken;
use crate::errors::{GenerationError, TransportError};
use crate::frame::{FrameDecoder, StreamFrame};

/// HTTP method for a stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMethod {
    Get,
    Post,
}

impl StreamMethod {
    pub(crate) fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
        }
    }
}

/// A fully built request for one stream attempt.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub method: StreamMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl StreamRequest {
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: StreamMethod::Post,
            headers: Vec::new(),
            body: Some(body.into()),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Receiver of stream lifecycle callbacks.
pub trait StreamCallbacks: Send {
    /// Response headers arrived with a 2xx status.
    fn on_open(&mut self) {}
    /// One decoded frame, in wire order.
    fn on_message(&mut self, frame: StreamFrame);
    /// Terminal failure.
    fn on_error(&mut self, error: TransportError);
    /// Terminal close: end of body or cancellation.
    fn on_close(&mut self);
}

/// A transport capable of opening one event stream.
///
/// Implementations must deliver exactly one terminal callback. When `cancel`
/// fires, the underlying request is aborted and only `on_close` follows.
#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open_stream(
        &self,
        request: StreamRequest,
        cancel: CancelToken,
        callbacks: Box<dyn StreamCallbacks>,
    );
}

/// What the running platform can do with streamed response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCapabilities {
    /// Whether a POST response body can be read incrementally.
    pub incremental_post_body: bool,
}

impl Default for StreamCapabilities {
    fn default() -> Self {
        Self {
            incremental_post_body: true,
        }
    }
}

/// Transport strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Native,
    ProgressivePoll,
}

impl TransportKind {
    /// Generation requests are always POST, so only the POST capability matters.
    pub fn for_capabilities(capabilities: StreamCapabilities) -> Self {
        if capabilities.incremental_post_body {
            Self::Native
        } else {
            Self::ProgressivePoll
        }
    }

    /// Builds the transport for this strategy on top of a shared client.
    pub fn build(self, client: reqwest::Client) -> Arc<dyn StreamTransport> {
        match self {
            Self::Native => Arc::new(NativeStreamTransport::new(client)),
            Self::ProgressivePoll => Arc::new(PollingStreamTransport::new(Arc::new(
                ReqwestProgressiveConnector::new(client),
            ))),
        }
    }
}

pub(crate) fn build_request(
    client: &reqwest::Client,
    request: &StreamRequest,
) -> reqwest::RequestBuilder {
    let mut builder = client.request(request.method.as_reqwest(), &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }
    builder
}

pub(crate) fn build_http_client(
    connect_timeout: std::time::Duration,
) -> Result<reqwest::Client, GenerationError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| GenerationError::Config(format!("failed to build HTTP client: {e}")))
}

/// Enforces the callback discipline shared by every transport: one `on_open`,
/// one terminal callback, nothing but `on_close` after cancellation.
pub(crate) struct CallbackDispatch {
    callbacks: Box<dyn StreamCallbacks>,
    decoder: FrameDecoder,
    cancel: CancelToken,
    opened: bool,
    finished: bool,
}

impl CallbackDispatch {
    pub(crate) fn new(callbacks: Box<dyn StreamCallbacks>, cancel: CancelToken) -> Self {
        Self {
            callbacks,
            decoder: FrameDecoder::new(),
            cancel,
            opened: false,
            finished: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn open(&mut self) {
        if self.opened || self.finished || self.cancel.is_cancelled() {
            return;
        }
        self.opened = true;
        self.callbacks.on_open();
    }

    /// Feeds body bytes and emits every frame they complete.
    pub(crate) fn feed(&mut self, chunk: &[u8]) {
        if self.finished {
            return;
        }
        for frame in self.decoder.push_chunk(chunk) {
            if self.cancel.is_cancelled() {
                return;
            }
            self.callbacks.on_message(frame);
        }
    }

    pub(crate) fn error(&mut self, error: TransportError) {
        if self.finished {
            return;
        }
        if self.cancel.is_cancelled() {
            self.close();
            return;
        }
        self.finished = true;
        debug!(error = %error, "stream ended with error");
        self.callbacks.on_error(error);
    }

    pub(crate) fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.decoder.pending_len() > 0 {
            debug!(
                pending_bytes = self.decoder.pending_len(),
                "discarding unterminated trailing frame"
            );
        }
        self.callbacks.on_close();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    /// One-shot loopback HTTP responder. Writes `pieces` as the body with a
    /// short pause between them, then closes (or holds the socket open).
    /// The join handle yields the raw request text.
    pub(crate) async fn serve_once(
        status_line: &str,
        pieces: Vec<String>,
        hold_open: bool,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let status_line = status_line.to_string();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut socket).await;
            let head = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n"
            );
            let _ = socket.write_all(head.as_bytes()).await;
            for piece in pieces {
                let _ = socket.write_all(piece.as_bytes()).await;
                let _ = socket.flush().await;
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            if hold_open {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
            let _ = socket.shutdown().await;
            request
        });
        (format!("http://{addr}/generate"), task)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let body_len = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.trim().eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Callback log entry.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Seen {
        Open,
        Message(String),
        Error(TransportError),
        Close,
    }

    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        pub(crate) seen: Arc<Mutex<Vec<Seen>>>,
    }

    impl Recorder {
        pub(crate) fn boxed(&self) -> Box<dyn StreamCallbacks> {
            Box::new(self.clone())
        }

        pub(crate) fn log(&self) -> Vec<Seen> {
            self.seen.lock().expect("recorder lock").clone()
        }
    }

    impl StreamCallbacks for Recorder {
        fn on_open(&mut self) {
            self.seen.lock().expect("recorder lock").push(Seen::Open);
        }

        fn on_message(&mut self, frame: StreamFrame) {
            self.seen
                .lock()
                .expect("recorder lock")
                .push(Seen::Message(frame.data));
        }

        fn on_error(&mut self, error: TransportError) {
            self.seen
                .lock()
                .expect("recorder lock")
                .push(Seen::Error(error));
        }

        fn on_close(&mut self) {
            self.seen.lock().expect("recorder lock").push(Seen::Close);
        }
    }
}
