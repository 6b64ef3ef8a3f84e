// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The session abstraction: a uniform, request-at-a-time interface over
//! the protocol variants the listeners speak. Plain listeners run
//! HTTP/1.x; TLS listeners run HTTP/1.x or HTTP/2 as negotiated by ALPN
//! during `accept`; the HTTP/3 variant is a hook that reports itself
//! unsupported.

pub mod http1;
pub mod http2;
pub mod http3;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::LazyConfigAcceptor;

use replay_core::{HttpMessage, MessageContent};

use crate::tls::TlsContext;
pub use http1::Http1Session;
pub use http2::H2Session;
pub use http3::H3Session;

pub(crate) fn proto_error(detail: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.into())
}

/// Outcome of a bounded wait for request headers. The short timeout keeps
/// the serve loop responsive to shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Ready,
    Timeout,
    PeerClosed,
}

/// What the framing layer should expect of a request body: the recorded
/// size and, when a content rule was recorded, the bytes to compare
/// against.
#[derive(Debug, Clone, Default)]
pub struct BodyExpectation {
    pub size: usize,
    pub data: Option<Bytes>,
    pub verify_equal: bool,
}

impl From<&MessageContent> for BodyExpectation {
    fn from(content: &MessageContent) -> BodyExpectation {
        BodyExpectation {
            size: content.size,
            data: content.data.clone(),
            verify_equal: content.verify_equal,
        }
    }
}

/// Result of writing one response.
#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
    pub bytes: usize,
    /// False when a recorded content rule failed against the request body
    /// delivered by the stream layer.
    pub body_ok: bool,
}

/// A connection being served, polymorphic over the wire protocol.
pub enum Session {
    Plain(Http1Session<TcpStream>),
    Tls(TlsSession),
    H3(H3Session),
}

/// TLS connections start out pending and become HTTP/1.x or HTTP/2
/// sessions once the handshake settles ALPN.
pub enum TlsSession {
    Pending {
        io: Option<TcpStream>,
        tls: Arc<TlsContext>,
    },
    Http1(Http1Session<tokio_rustls::server::TlsStream<TcpStream>>),
    Http2(H2Session),
}

impl TlsSession {
    pub fn pending(io: TcpStream, tls: Arc<TlsContext>) -> TlsSession {
        TlsSession::Pending { io: Some(io), tls }
    }

    async fn establish(&mut self) -> io::Result<()> {
        let TlsSession::Pending { io, tls } = self else {
            return Ok(());
        };
        let stream = io
            .take()
            .ok_or_else(|| proto_error("TLS handshake already attempted"))?;
        let tls = tls.clone();

        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let sni = start.client_hello().server_name().map(str::to_string);
        let config = tls.config_for(sni.as_deref());
        let stream = start.into_stream(config).await?;

        let negotiated_h2 = stream.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);
        *self = if negotiated_h2 {
            TlsSession::Http2(H2Session::handshake(stream).await?)
        } else {
            TlsSession::Http1(Http1Session::with_scheme(stream, "https"))
        };
        Ok(())
    }
}

impl Session {
    /// Complete any protocol-level handshake. An error abandons the
    /// connection before it reaches the serve loop.
    pub async fn accept(&mut self) -> io::Result<()> {
        match self {
            Session::Plain(_) => Ok(()),
            Session::Tls(tls) => tls.establish().await,
            Session::H3(h3) => h3.accept().await,
        }
    }

    pub async fn poll_for_headers(&mut self, wait: Duration) -> io::Result<PollStatus> {
        match self {
            Session::Plain(s) => s.poll_for_headers(wait).await,
            Session::Tls(TlsSession::Http1(s)) => s.poll_for_headers(wait).await,
            Session::Tls(TlsSession::Http2(s)) => s.poll_for_headers(wait).await,
            _ => Err(proto_error("session is not established")),
        }
    }

    /// The next available request, or `None` when the peer closed
    /// cleanly. Multiplexed requests come back tagged with their stream
    /// id.
    pub async fn read_and_parse_request(&mut self) -> io::Result<Option<HttpMessage>> {
        match self {
            Session::Plain(s) => s.read_and_parse_request().await,
            Session::Tls(TlsSession::Http1(s)) => s.read_and_parse_request().await,
            Session::Tls(TlsSession::Http2(s)) => Ok(s.read_and_parse_request()),
            _ => Err(proto_error("session is not established")),
        }
    }

    /// HTTP/1 only: consume the request body off the connection, checking
    /// any recorded content rule along the way. HTTP/2 bodies are drained
    /// by the stream layer underneath `write`.
    pub async fn drain_body(
        &mut self,
        chunked: bool,
        content_size: usize,
        expectation: &BodyExpectation,
    ) -> io::Result<(u64, bool)> {
        match self {
            Session::Plain(s) => s.drain_body(chunked, content_size, expectation).await,
            Session::Tls(TlsSession::Http1(s)) => {
                s.drain_body(chunked, content_size, expectation).await
            }
            _ => Ok((0, true)),
        }
    }

    /// Hand the recorded request expectation to a multiplexed stream so
    /// body delivery can be verified at end-of-stream.
    pub fn attach_expectation(&mut self, stream_id: u32, expectation: BodyExpectation) {
        if let Session::Tls(TlsSession::Http2(s)) = self {
            s.attach_expectation(stream_id, expectation);
        }
    }

    pub async fn write(&mut self, rsp: &HttpMessage, fill: &Bytes) -> io::Result<WriteOutcome> {
        match self {
            Session::Plain(s) => s.write(rsp, fill).await,
            Session::Tls(TlsSession::Http1(s)) => s.write(rsp, fill).await,
            Session::Tls(TlsSession::Http2(s)) => s.write(rsp, fill).await,
            _ => Err(proto_error("session is not established")),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Session::Plain(s) => s.is_closed(),
            Session::Tls(TlsSession::Http1(s)) => s.is_closed(),
            Session::Tls(TlsSession::Http2(s)) => s.is_closed(),
            Session::Tls(TlsSession::Pending { .. }) => false,
            Session::H3(s) => s.is_closed(),
        }
    }

    pub async fn close(&mut self) {
        match self {
            Session::Plain(s) => s.close().await,
            Session::Tls(TlsSession::Http1(s)) => s.close().await,
            Session::Tls(TlsSession::Http2(s)) => s.close().await,
            Session::Tls(TlsSession::Pending { .. }) => {}
            Session::H3(s) => s.close(),
        }
    }
}
