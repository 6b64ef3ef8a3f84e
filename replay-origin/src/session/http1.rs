// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use replay_core::message::{CONTENT_LENGTH, EXPECT};
use replay_core::{HttpMessage, ProtocolFamily};

use super::{proto_error, BodyExpectation, PollStatus, WriteOutcome};

const MAX_HEADER_FIELDS: usize = 100;
const READ_CHUNK: usize = 16 * 1024;

fn closed_early() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "peer closed mid request body",
    )
}

/// An HTTP/1.x connection, over a bare socket or a finished TLS stream.
/// Pipelined requests are handled strictly in arrival order: parsed bytes
/// are consumed from the front of one persistent buffer.
pub struct Http1Session<S> {
    stream: S,
    scheme: &'static str,
    buf: BytesMut,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Http1Session<S> {
    pub fn new(stream: S) -> Http1Session<S> {
        Http1Session::with_scheme(stream, "http")
    }

    pub fn with_scheme(stream: S, scheme: &'static str) -> Http1Session<S> {
        Http1Session {
            stream,
            scheme,
            buf: BytesMut::with_capacity(READ_CHUNK),
            closed: false,
        }
    }

    fn headers_complete(&self) -> bool {
        self.buf.windows(4).any(|window| window == b"\r\n\r\n")
    }

    async fn fill_buf(&mut self) -> io::Result<usize> {
        self.stream.read_buf(&mut self.buf).await
    }

    pub async fn poll_for_headers(&mut self, wait: Duration) -> io::Result<PollStatus> {
        if self.headers_complete() {
            return Ok(PollStatus::Ready);
        }
        match tokio::time::timeout(wait, self.stream.read_buf(&mut self.buf)).await {
            Err(_) => Ok(PollStatus::Timeout),
            Ok(Ok(0)) => Ok(PollStatus::PeerClosed),
            Ok(Ok(_)) => Ok(if self.headers_complete() {
                PollStatus::Ready
            } else {
                PollStatus::Timeout
            }),
            Ok(Err(err)) => Err(err),
        }
    }

    pub async fn read_and_parse_request(&mut self) -> io::Result<Option<HttpMessage>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let (mut msg, head_len) = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_FIELDS];
            let mut parsed = httparse::Request::new(&mut headers);
            let status = parsed
                .parse(&self.buf)
                .map_err(|err| proto_error(format!("bad request head: {err}")))?;
            let httparse::Status::Complete(head_len) = status else {
                return Err(proto_error("incomplete request head"));
            };

            let mut msg = HttpMessage::request();
            msg.protocol = ProtocolFamily::Http1;
            msg.scheme = self.scheme.to_string();
            msg.method = parsed.method.unwrap_or("").to_string();
            msg.target = parsed.path.unwrap_or("").to_string();
            msg.version = match parsed.version {
                Some(0) => "1.0".to_string(),
                _ => "1.1".to_string(),
            };
            for header in parsed.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| proto_error("header value is not UTF-8"))?;
                msg.fields.add_field(header.name, value);
            }
            (msg, head_len)
        };
        self.buf.advance(head_len);

        msg.authority = msg.fields.get("Host").unwrap_or("").to_string();
        if let Some(expect) = msg.fields.get(EXPECT) {
            if expect.eq_ignore_ascii_case("100-continue") {
                msg.send_continue = true;
            }
        }
        msg.update_transfer_encoding();
        debug!(method = %msg.method, target = %msg.target, "parsed request");
        Ok(Some(msg))
    }

    /// Consume the request body: `content_size` bytes, or chunked framing
    /// until the terminal chunk. Collects the bytes only when a content
    /// rule has to be checked.
    pub async fn drain_body(
        &mut self,
        chunked: bool,
        content_size: usize,
        expectation: &BodyExpectation,
    ) -> io::Result<(u64, bool)> {
        let collect = expectation.verify_equal;
        let mut body = Vec::new();
        let mut drained = 0u64;

        if chunked {
            loop {
                let (consumed, size) = loop {
                    match httparse::parse_chunk_size(&self.buf)
                        .map_err(|_| proto_error("bad chunk size line"))?
                    {
                        httparse::Status::Complete(parsed) => break parsed,
                        httparse::Status::Partial => {
                            if self.fill_buf().await? == 0 {
                                return Err(closed_early());
                            }
                        }
                    }
                };
                self.buf.advance(consumed);
                if size == 0 {
                    self.consume_trailers().await?;
                    break;
                }
                self.consume_data(size as usize, collect.then_some(&mut body), &mut drained)
                    .await?;
                self.consume_crlf().await?;
            }
        } else {
            self.consume_data(content_size, collect.then_some(&mut body), &mut drained)
                .await?;
        }

        let ok = !collect || expectation.data.as_deref() == Some(body.as_slice());
        Ok((drained, ok))
    }

    async fn consume_data(
        &mut self,
        size: usize,
        mut sink: Option<&mut Vec<u8>>,
        drained: &mut u64,
    ) -> io::Result<()> {
        let mut remaining = size;
        while remaining > 0 {
            if self.buf.is_empty() && self.fill_buf().await? == 0 {
                return Err(closed_early());
            }
            let take = remaining.min(self.buf.len());
            if let Some(sink) = sink.as_mut() {
                sink.extend_from_slice(&self.buf[..take]);
            }
            self.buf.advance(take);
            *drained += take as u64;
            remaining -= take;
        }
        Ok(())
    }

    async fn consume_crlf(&mut self) -> io::Result<()> {
        while self.buf.len() < 2 {
            if self.fill_buf().await? == 0 {
                return Err(closed_early());
            }
        }
        if &self.buf[..2] != b"\r\n" {
            return Err(proto_error("missing chunk terminator"));
        }
        self.buf.advance(2);
        Ok(())
    }

    /// After the terminal chunk: discard trailer lines up to and
    /// including the blank line.
    async fn consume_trailers(&mut self) -> io::Result<()> {
        loop {
            let line_end = loop {
                match self.buf.windows(2).position(|w| w == b"\r\n") {
                    Some(pos) => break pos,
                    None => {
                        if self.fill_buf().await? == 0 {
                            return Err(closed_early());
                        }
                    }
                }
            };
            self.buf.advance(line_end + 2);
            if line_end == 0 {
                return Ok(());
            }
        }
    }

    /// Serialize and send one response. Recorded fields go out verbatim;
    /// a Content-Length is computed only when the recording does not
    /// carry one. Responses to HEAD keep their length fields but no body
    /// bytes follow the blank line.
    pub async fn write(&mut self, rsp: &HttpMessage, fill: &Bytes) -> io::Result<WriteOutcome> {
        let body = rsp.body(fill);
        let mut wire = Vec::with_capacity(256 + body.len());

        wire.extend_from_slice(b"HTTP/");
        wire.extend_from_slice(rsp.version.as_bytes());
        wire.push(b' ');
        wire.extend_from_slice(rsp.status.to_string().as_bytes());
        wire.push(b' ');
        wire.extend_from_slice(rsp.reason.as_bytes());
        wire.extend_from_slice(b"\r\n");

        for (name, value) in rsp.fields.iter() {
            wire.extend_from_slice(name.as_bytes());
            wire.extend_from_slice(b": ");
            wire.extend_from_slice(value.as_bytes());
            wire.extend_from_slice(b"\r\n");
        }
        if rsp.status >= 200 && !rsp.chunked && rsp.fields.get(CONTENT_LENGTH).is_none() {
            wire.extend_from_slice(b"Content-Length: ");
            wire.extend_from_slice(body.len().to_string().as_bytes());
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b"\r\n");

        if !rsp.suppress_body {
            if rsp.chunked {
                if !body.is_empty() {
                    wire.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
                    wire.extend_from_slice(&body);
                    wire.extend_from_slice(b"\r\n");
                }
                wire.extend_from_slice(b"0\r\n\r\n");
            } else {
                wire.extend_from_slice(&body);
            }
        }

        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        Ok(WriteOutcome {
            bytes: wire.len(),
            body_ok: true,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn close(&mut self) {
        if !self.closed {
            let _ = self.stream.shutdown().await;
            self.closed = true;
        }
    }
}
