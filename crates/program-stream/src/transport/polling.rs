//! Progressive-poll transport.
//!
//! Some runtimes only expose a POST response as a text buffer that keeps
//! growing while the request is in flight, plus ready-state transitions. This
//! transport watches those transitions and feeds the decoder only the suffix
//! appended since the previous observation.

use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt as _;
use tokio::sync::watch;
use tracing::debug;

use super::{CallbackDispatch, StreamCallbacks, StreamRequest, StreamTransport, build_request};
use crate::cancel::CancelToken;
use crate::errors::TransportError;

/// Request progress, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Opened,
    HeadersReceived,
    Loading,
    Done,
}

/// Observable state of an in-flight exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSnapshot {
    pub ready_state: ReadyState,
    /// HTTP status, known from `HeadersReceived` on.
    pub status: Option<u16>,
    /// Failure description; only set together with `Done`.
    pub error: Option<String>,
}

impl ExchangeSnapshot {
    pub fn opened() -> Self {
        Self {
            ready_state: ReadyState::Opened,
            status: None,
            error: None,
        }
    }
}

/// Handle to an in-flight exchange: state transitions plus the accumulated
/// response text.
pub struct ProgressiveExchange {
    state: watch::Receiver<ExchangeSnapshot>,
    response_text: Arc<Mutex<String>>,
    abort: Option<tokio::task::AbortHandle>,
}

impl ProgressiveExchange {
    pub fn new(
        state: watch::Receiver<ExchangeSnapshot>,
        response_text: Arc<Mutex<String>>,
        abort: Option<tokio::task::AbortHandle>,
    ) -> Self {
        Self {
            state,
            response_text,
            abort,
        }
    }

    fn abort(&mut self) {
        if let Some(handle) = self.abort.take() {
            handle.abort();
        }
    }

    /// Text appended since `seen` bytes; advances `seen`.
    fn take_suffix(&self, seen: &mut usize) -> String {
        let text = self
            .response_text
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *seen >= text.len() {
            return String::new();
        }
        let suffix = text[*seen..].to_string();
        *seen = text.len();
        suffix
    }

    fn full_text(&self) -> String {
        self.response_text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for ProgressiveExchange {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Starts requests whose body is only observable as a growing buffer.
pub trait ProgressiveConnector: Send + Sync {
    fn send(&self, request: StreamRequest) -> ProgressiveExchange;
}

/// Transport that diffs a [`ProgressiveExchange`]'s buffer on every state change.
pub struct PollingStreamTransport {
    connector: Arc<dyn ProgressiveConnector>,
}

impl PollingStreamTransport {
    pub fn new(connector: Arc<dyn ProgressiveConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait::async_trait]
impl StreamTransport for PollingStreamTransport {
    async fn open_stream(
        &self,
        request: StreamRequest,
        cancel: CancelToken,
        callbacks: Box<dyn StreamCallbacks>,
    ) {
        let mut dispatch = CallbackDispatch::new(callbacks, cancel.clone());
        if cancel.is_cancelled() {
            dispatch.close();
            return;
        }
        debug!(url = %request.url, "opening generation stream (progressive poll)");
        let mut exchange = self.connector.send(request);
        let mut seen = 0usize;
        let mut headers_checked = false;
        let mut failed_status: Option<u16> = None;

        loop {
            let snapshot = exchange.state.borrow_and_update().clone();

            if snapshot.ready_state >= ReadyState::HeadersReceived && !headers_checked {
                headers_checked = true;
                match snapshot.status {
                    Some(status) if (200..300).contains(&status) => dispatch.open(),
                    Some(status) => failed_status = Some(status),
                    None => {
                        exchange.abort();
                        dispatch.error(TransportError::malformed(
                            "headers received without a status",
                        ));
                        return;
                    }
                }
            }

            if headers_checked && failed_status.is_none() {
                let suffix = exchange.take_suffix(&mut seen);
                if !suffix.is_empty() {
                    dispatch.feed(suffix.as_bytes());
                }
            }

            if snapshot.ready_state == ReadyState::Done {
                if let Some(status) = failed_status {
                    dispatch.error(TransportError::status(status, exchange.full_text()));
                } else if let Some(error) = snapshot.error {
                    dispatch.error(TransportError::network(error));
                } else if !headers_checked {
                    dispatch.error(TransportError::malformed(
                        "request finished before headers were received",
                    ));
                } else {
                    dispatch.close();
                }
                return;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    exchange.abort();
                    dispatch.close();
                    return;
                }
                changed = exchange.state.changed() => {
                    if changed.is_err() {
                        dispatch.error(TransportError::malformed(
                            "exchange dropped before completion",
                        ));
                        return;
                    }
                }
            }
        }
    }
}

/// Production connector: a spawned reader task appends decoded body text to a
/// shared buffer and publishes ready-state transitions.
#[derive(Clone)]
pub struct ReqwestProgressiveConnector {
    client: reqwest::Client,
}

impl ReqwestProgressiveConnector {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ProgressiveConnector for ReqwestProgressiveConnector {
    fn send(&self, request: StreamRequest) -> ProgressiveExchange {
        let (tx, rx) = watch::channel(ExchangeSnapshot::opened());
        let text = Arc::new(Mutex::new(String::new()));
        let builder = build_request(&self.client, &request);
        let task = tokio::spawn(drive_exchange(builder, tx, text.clone()));
        ProgressiveExchange::new(rx, text, Some(task.abort_handle()))
    }
}

async fn drive_exchange(
    builder: reqwest::RequestBuilder,
    tx: watch::Sender<ExchangeSnapshot>,
    text: Arc<Mutex<String>>,
) {
    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            tx.send_modify(|s| {
                s.ready_state = ReadyState::Done;
                s.error = Some(format!("generation request failed: {e}"));
            });
            return;
        }
    };
    let status = response.status().as_u16();
    tx.send_modify(|s| {
        s.ready_state = ReadyState::HeadersReceived;
        s.status = Some(status);
    });

    let mut bytes_stream = response.bytes_stream();
    let mut carry: Vec<u8> = Vec::new();
    while let Some(next) = bytes_stream.next().await {
        match next {
            Ok(chunk) => {
                carry.extend_from_slice(&chunk);
                let decoded = take_utf8_prefix(&mut carry);
                append_text(&text, &decoded);
                tx.send_modify(|s| s.ready_state = ReadyState::Loading);
            }
            Err(e) => {
                tx.send_modify(|s| {
                    s.ready_state = ReadyState::Done;
                    s.error = Some(format!("stream read failed: {e}"));
                });
                return;
            }
        }
    }
    if !carry.is_empty() {
        append_text(&text, &String::from_utf8_lossy(&carry));
    }
    tx.send_modify(|s| s.ready_state = ReadyState::Done);
}

fn append_text(text: &Mutex<String>, decoded: &str) {
    text.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push_str(decoded);
}

/// Decodes the longest valid UTF-8 prefix, keeping an incomplete trailing
/// sequence in `carry` for the next chunk.
fn take_utf8_prefix(carry: &mut Vec<u8>) -> String {
    let valid_up_to = match std::str::from_utf8(carry) {
        Ok(_) => carry.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => carry.len(),
    };
    let rest = carry.split_off(valid_up_to);
    let decoded = String::from_utf8_lossy(carry).into_owned();
    *carry = rest;
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelHandle, CancelReason};
    use crate::transport::test_support::{Recorder, Seen, serve_once};

    /// Connector driven by a script of (appended text, snapshot) steps.
    struct ScriptedConnector {
        steps: Vec<(&'static str, ExchangeSnapshot)>,
        hold_open: bool,
    }

    fn snapshot(ready_state: ReadyState, status: Option<u16>) -> ExchangeSnapshot {
        ExchangeSnapshot {
            ready_state,
            status,
            error: None,
        }
    }

    impl ProgressiveConnector for ScriptedConnector {
        fn send(&self, _request: StreamRequest) -> ProgressiveExchange {
            let (tx, rx) = watch::channel(ExchangeSnapshot::opened());
            let text = Arc::new(Mutex::new(String::new()));
            let steps = self.steps.clone();
            let hold_open = self.hold_open;
            let shared = text.clone();
            let task = tokio::spawn(async move {
                for (appended, snap) in steps {
                    tokio::task::yield_now().await;
                    append_text(&shared, appended);
                    tx.send_replace(snap);
                }
                if hold_open {
                    std::future::pending::<()>().await;
                }
            });
            ProgressiveExchange::new(rx, text, Some(task.abort_handle()))
        }
    }

    fn polling(steps: Vec<(&'static str, ExchangeSnapshot)>, hold_open: bool) -> PollingStreamTransport {
        PollingStreamTransport::new(Arc::new(ScriptedConnector { steps, hold_open }))
    }

    #[tokio::test]
    async fn feeds_only_new_suffix_on_each_transition() {
        let transport = polling(
            vec![
                ("", snapshot(ReadyState::HeadersReceived, Some(200))),
                ("data: a\n\ndata: b", snapshot(ReadyState::Loading, Some(200))),
                ("\n\n", snapshot(ReadyState::Loading, Some(200))),
                ("data: c\n\n", snapshot(ReadyState::Done, Some(200))),
            ],
            false,
        );
        let recorder = Recorder::default();
        transport
            .open_stream(
                StreamRequest::post("http://unused/generate", "{}"),
                CancelHandle::new().token(),
                recorder.boxed(),
            )
            .await;
        assert_eq!(
            recorder.log(),
            vec![
                Seen::Open,
                Seen::Message("a".into()),
                Seen::Message("b".into()),
                Seen::Message("c".into()),
                Seen::Close,
            ]
        );
    }

    #[tokio::test]
    async fn non_success_status_reports_error_with_body() {
        let transport = polling(
            vec![
                ("", snapshot(ReadyState::HeadersReceived, Some(504))),
                ("gateway timeout", snapshot(ReadyState::Done, Some(504))),
            ],
            false,
        );
        let recorder = Recorder::default();
        transport
            .open_stream(
                StreamRequest::post("http://unused/generate", "{}"),
                CancelHandle::new().token(),
                recorder.boxed(),
            )
            .await;
        assert_eq!(
            recorder.log(),
            vec![Seen::Error(TransportError::status(504, "gateway timeout"))]
        );
    }

    #[tokio::test]
    async fn cancel_closes_silently() {
        let transport = polling(
            vec![
                ("", snapshot(ReadyState::HeadersReceived, Some(200))),
                ("data: a\n\n", snapshot(ReadyState::Loading, Some(200))),
            ],
            true,
        );
        let recorder = Recorder::default();
        let handle = CancelHandle::new();
        let token = handle.token();
        let watcher = recorder.clone();
        let canceller = tokio::spawn(async move {
            while !watcher.log().contains(&Seen::Message("a".into())) {
                tokio::task::yield_now().await;
            }
            handle.cancel(CancelReason::Timeout);
        });
        transport
            .open_stream(
                StreamRequest::post("http://unused/generate", "{}"),
                token,
                recorder.boxed(),
            )
            .await;
        canceller.await.expect("canceller");
        assert_eq!(
            recorder.log(),
            vec![Seen::Open, Seen::Message("a".into()), Seen::Close]
        );
    }

    #[tokio::test]
    async fn reqwest_connector_accumulates_body_text() {
        let (url, _server) = serve_once(
            "200 OK",
            vec!["data: x\n".into(), "\ndata: ü".into(), "\n\n".into()],
            false,
        )
        .await;
        let transport =
            PollingStreamTransport::new(Arc::new(ReqwestProgressiveConnector::new(
                reqwest::Client::new(),
            )));
        let recorder = Recorder::default();
        transport
            .open_stream(
                StreamRequest::post(url, "{}"),
                CancelHandle::new().token(),
                recorder.boxed(),
            )
            .await;
        assert_eq!(
            recorder.log(),
            vec![
                Seen::Open,
                Seen::Message("x".into()),
                Seen::Message("ü".into()),
                Seen::Close,
            ]
        );
    }

    #[test]
    fn utf8_prefix_keeps_incomplete_tail() {
        let mut carry = "aé".as_bytes().to_vec();
        carry.pop();
        assert_eq!(take_utf8_prefix(&mut carry), "a");
        assert_eq!(carry, vec![0xC3]);
        carry.push(0xA9);
        assert_eq!(take_utf8_prefix(&mut carry), "é");
        assert!(carry.is_empty());
    }
}
