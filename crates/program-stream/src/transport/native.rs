use futures::StreamExt as _;
use tracing::debug;

use super::{CallbackDispatch, StreamCallbacks, StreamRequest, StreamTransport, build_request};
use crate::cancel::CancelToken;
use crate::errors::TransportError;

/// Reads the response body incrementally with `reqwest`'s byte stream.
#[derive(Clone)]
pub struct NativeStreamTransport {
    client: reqwest::Client,
}

impl NativeStreamTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl StreamTransport for NativeStreamTransport {
    async fn open_stream(
        &self,
        request: StreamRequest,
        cancel: CancelToken,
        callbacks: Box<dyn StreamCallbacks>,
    ) {
        let mut dispatch = CallbackDispatch::new(callbacks, cancel.clone());
        debug!(url = %request.url, "opening generation stream");

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                dispatch.close();
                return;
            }
            sent = build_request(&self.client, &request).send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                dispatch.error(TransportError::network(format!(
                    "generation request failed: {e}"
                )));
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    dispatch.close();
                    return;
                }
                body = response.text() => body.unwrap_or_else(|_| "<unreadable body>".to_string()),
            };
            dispatch.error(TransportError::status(status.as_u16(), body));
            return;
        }

        dispatch.open();
        let mut bytes_stream = response.bytes_stream();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    dispatch.close();
                    return;
                }
                next = bytes_stream.next() => match next {
                    Some(Ok(chunk)) => dispatch.feed(&chunk),
                    Some(Err(e)) => {
                        dispatch.error(TransportError::network(format!(
                            "stream read failed: {e}"
                        )));
                        return;
                    }
                    None => {
                        dispatch.close();
                        return;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelHandle, CancelReason};
    use crate::transport::test_support::{Recorder, Seen, serve_once};

    fn transport() -> NativeStreamTransport {
        NativeStreamTransport::new(reqwest::Client::new())
    }

    #[tokio::test]
    async fn streams_frames_then_closes() {
        let (url, server) = serve_once(
            "200 OK",
            vec![
                "data: {\"type\":\"status\"}\n\ndata: one".into(),
                "\n\ndata: two\n".into(),
                "\n".into(),
            ],
            false,
        )
        .await;
        let recorder = Recorder::default();
        let request = StreamRequest::post(url, "{\"name\":\"x\"}")
            .header("Accept", "text/event-stream")
            .header("Content-Type", "application/json");
        transport()
            .open_stream(request, CancelHandle::new().token(), recorder.boxed())
            .await;

        assert_eq!(
            recorder.log(),
            vec![
                Seen::Open,
                Seen::Message("{\"type\":\"status\"}".into()),
                Seen::Message("one".into()),
                Seen::Message("two".into()),
                Seen::Close,
            ]
        );
        let raw_request = server.await.expect("server");
        assert!(raw_request.starts_with("POST /generate"));
        assert!(raw_request.contains("{\"name\":\"x\"}"));
    }

    #[tokio::test]
    async fn non_success_status_reports_error_without_open() {
        let (url, _server) = serve_once(
            "503 Service Unavailable",
            vec!["upstream busy".into()],
            false,
        )
        .await;
        let recorder = Recorder::default();
        transport()
            .open_stream(
                StreamRequest::post(url, "{}"),
                CancelHandle::new().token(),
                recorder.boxed(),
            )
            .await;

        assert_eq!(
            recorder.log(),
            vec![Seen::Error(TransportError::status(503, "upstream busy"))]
        );
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let recorder = Recorder::default();
        transport()
            .open_stream(
                StreamRequest::post(format!("http://{addr}/generate"), "{}"),
                CancelHandle::new().token(),
                recorder.boxed(),
            )
            .await;
        let log = recorder.log();
        assert_eq!(log.len(), 1);
        assert!(matches!(&log[0], Seen::Error(TransportError::Network(_))));
    }

    #[tokio::test]
    async fn cancel_mid_stream_closes_without_error() {
        let (url, _server) = serve_once("200 OK", vec!["data: first\n\n".into()], true).await;
        let recorder = Recorder::default();
        let handle = CancelHandle::new();
        let token = handle.token();
        let watcher = recorder.clone();
        let canceller = tokio::spawn(async move {
            while !watcher.log().contains(&Seen::Message("first".into())) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            handle.cancel(CancelReason::User);
        });

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            transport().open_stream(StreamRequest::post(url, "{}"), token, recorder.boxed()),
        )
        .await
        .expect("cancel should end the stream promptly");
        canceller.await.expect("canceller");

        assert_eq!(
            recorder.log(),
            vec![Seen::Open, Seen::Message("first".into()), Seen::Close]
        );
    }
}
