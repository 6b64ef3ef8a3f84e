// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use h2::server::SendResponse;
use h2::RecvStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use replay_core::message::{CONTENT_LENGTH, EXPECT};
use replay_core::{HttpMessage, ProtocolFamily};

use super::{proto_error, BodyExpectation, PollStatus, WriteOutcome};

fn h2_error(err: h2::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

type Accepted = (http::Request<RecvStream>, SendResponse<Bytes>);

struct H2StreamState {
    respond: SendResponse<Bytes>,
    body: RecvStream,
    expectation: Option<BodyExpectation>,
}

/// An HTTP/2 connection. The h2 `Connection` must be polled continuously
/// to move bytes in either direction, so it lives on its own driver task;
/// the session receives accepted streams over a channel and keeps the
/// per-stream state until the response goes out.
pub struct H2Session {
    incoming: mpsc::Receiver<Accepted>,
    driver: JoinHandle<()>,
    close: Option<oneshot::Sender<()>>,
    streams: HashMap<u32, H2StreamState>,
    pending: VecDeque<HttpMessage>,
    closed: bool,
}

impl H2Session {
    pub async fn handshake<S>(io: S) -> io::Result<H2Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = h2::server::handshake(io).await.map_err(h2_error)?;
        let (tx, rx) = mpsc::channel(16);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = conn.accept() => match next {
                        Some(Ok(accepted)) => {
                            if tx.send(accepted).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            debug!(%err, "HTTP/2 connection error");
                            break;
                        }
                        None => break,
                    },
                    _ = &mut close_rx => {
                        // Flush queued frames and say goodbye before the
                        // worker lets go of the connection.
                        conn.graceful_shutdown();
                        let _ = poll_fn(|cx| conn.poll_closed(cx)).await;
                        break;
                    }
                }
            }
        });
        Ok(H2Session {
            incoming: rx,
            driver,
            close: Some(close_tx),
            streams: HashMap::new(),
            pending: VecDeque::new(),
            closed: false,
        })
    }

    pub async fn poll_for_headers(&mut self, wait: Duration) -> io::Result<PollStatus> {
        if !self.pending.is_empty() {
            return Ok(PollStatus::Ready);
        }
        match tokio::time::timeout(wait, self.incoming.recv()).await {
            Err(_) => Ok(PollStatus::Timeout),
            Ok(None) => Ok(PollStatus::PeerClosed),
            Ok(Some((request, respond))) => {
                self.admit(request, respond)?;
                Ok(PollStatus::Ready)
            }
        }
    }

    fn admit(
        &mut self,
        request: http::Request<RecvStream>,
        respond: SendResponse<Bytes>,
    ) -> io::Result<()> {
        let stream_id = u32::from(respond.stream_id());
        let (parts, body) = request.into_parts();

        let mut msg = HttpMessage::request();
        msg.protocol = ProtocolFamily::Http2;
        msg.stream_id = Some(stream_id);
        msg.method = parts.method.as_str().to_string();
        msg.scheme = parts.uri.scheme_str().unwrap_or("https").to_string();
        msg.authority = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        msg.target = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        for (name, value) in parts.headers.iter() {
            let value = value
                .to_str()
                .map_err(|_| proto_error("header value is not UTF-8"))?;
            msg.fields.add_field(name.as_str(), value);
        }
        if msg.authority.is_empty() {
            msg.authority = msg.fields.get("host").unwrap_or("").to_string();
        }
        if let Some(expect) = msg.fields.get(EXPECT) {
            if expect.eq_ignore_ascii_case("100-continue") {
                msg.send_continue = true;
            }
        }
        msg.update_transfer_encoding();
        debug!(stream_id, method = %msg.method, target = %msg.target, "accepted stream");

        self.streams.insert(
            stream_id,
            H2StreamState {
                respond,
                body,
                expectation: None,
            },
        );
        self.pending.push_back(msg);
        Ok(())
    }

    pub fn read_and_parse_request(&mut self) -> Option<HttpMessage> {
        self.pending.pop_front()
    }

    pub fn attach_expectation(&mut self, stream_id: u32, expectation: BodyExpectation) {
        if let Some(state) = self.streams.get_mut(&stream_id) {
            state.expectation = Some(expectation);
        } else {
            warn!(stream_id, "no open stream to attach the expectation to");
        }
    }

    /// Respond on the request's stream. The request body is drained to
    /// end-of-stream first (releasing flow-control credit as it goes) and
    /// checked against any attached expectation.
    pub async fn write(&mut self, rsp: &HttpMessage, fill: &Bytes) -> io::Result<WriteOutcome> {
        let stream_id = rsp
            .stream_id
            .ok_or_else(|| proto_error("response without a stream id"))?;
        let mut state = self
            .streams
            .remove(&stream_id)
            .ok_or_else(|| proto_error(format!("no open stream {stream_id}")))?;

        let body_ok = drain_stream(&mut state.body, state.expectation.as_ref()).await?;

        let body = rsp.body(fill);
        let mut builder = http::Response::builder().status(rsp.status);
        let mut has_length = false;
        for (name, value) in rsp.fields.iter() {
            if is_connection_field(name) {
                continue;
            }
            if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
                has_length = true;
            }
            builder = builder.header(name, value);
        }
        if !has_length && !body.is_empty() {
            builder = builder.header(CONTENT_LENGTH, body.len());
        }
        let response = builder
            .body(())
            .map_err(|err| proto_error(format!("bad recorded response: {err}")))?;

        let end_of_stream = rsp.suppress_body || body.is_empty();
        let mut send = state
            .respond
            .send_response(response, end_of_stream)
            .map_err(h2_error)?;

        let mut written = 0;
        if !end_of_stream {
            let mut data = body;
            while !data.is_empty() {
                send.reserve_capacity(data.len());
                let granted = match poll_fn(|cx| send.poll_capacity(cx)).await {
                    Some(Ok(0)) => continue,
                    Some(Ok(n)) => n,
                    Some(Err(err)) => return Err(h2_error(err)),
                    None => return Err(proto_error("stream closed while sending the body")),
                };
                let chunk = data.split_to(granted.min(data.len()));
                written += chunk.len();
                send.send_data(chunk, data.is_empty()).map_err(h2_error)?;
            }
        }
        debug!(stream_id, bytes = written, "response sent");
        Ok(WriteOutcome {
            bytes: written,
            body_ok,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.streams.clear();
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
        // Give the driver a bounded window to finish the goodbye.
        if tokio::time::timeout(Duration::from_secs(1), &mut self.driver)
            .await
            .is_err()
        {
            self.driver.abort();
        }
    }
}

async fn drain_stream(
    body: &mut RecvStream,
    expectation: Option<&BodyExpectation>,
) -> io::Result<bool> {
    let collect = expectation.is_some_and(|e| e.verify_equal);
    let mut collected = Vec::new();
    let mut drained = 0u64;
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(h2_error)?;
        let _ = body.flow_control().release_capacity(chunk.len());
        drained += chunk.len() as u64;
        if collect {
            collected.extend_from_slice(&chunk);
        }
    }
    debug!(drained, "stream body drained");
    match expectation {
        Some(e) if e.verify_equal => Ok(e.data.as_deref() == Some(collected.as_slice())),
        _ => Ok(true),
    }
}

fn is_connection_field(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
}
