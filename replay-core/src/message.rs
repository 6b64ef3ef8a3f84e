// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;

use crate::fields::FieldSet;

pub const CONTENT_LENGTH: &str = "Content-Length";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const EXPECT: &str = "Expect";

/// Which wire protocol a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolFamily {
    #[default]
    Http1,
    Http2,
    Http3,
}

impl ProtocolFamily {
    /// HTTP/2 and HTTP/3 carry many requests on one connection; bodies are
    /// delivered per stream below the session interface.
    pub fn is_multiplexed(self) -> bool {
        !matches!(self, ProtocolFamily::Http1)
    }

    pub fn describe(self) -> &'static str {
        match self {
            ProtocolFamily::Http1 => "HTTP/1.x",
            ProtocolFamily::Http2 => "HTTP/2",
            ProtocolFamily::Http3 => "HTTP/3",
        }
    }
}

/// Message body description: a literal byte string from the corpus, or a
/// synthesized filler of `size` bytes served from the catalog's shared
/// fill buffer.
#[derive(Debug, Clone, Default)]
pub struct MessageContent {
    pub size: usize,
    pub data: Option<Bytes>,
    /// Content rule: the drained request body must equal `data`.
    pub verify_equal: bool,
}

impl MessageContent {
    pub fn literal(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        MessageContent {
            size: data.len(),
            data: Some(data),
            verify_equal: false,
        }
    }

    pub fn synthesized(size: usize) -> Self {
        MessageContent {
            size,
            data: None,
            verify_equal: false,
        }
    }

    pub fn is_synthesized(&self) -> bool {
        self.data.is_none() && self.size > 0
    }
}

/// One HTTP message, request or response, as recorded in the corpus or as
/// parsed off the wire. Shared read-only from the catalog; per-connection
/// clones are stamped with protocol and stream id before writing.
#[derive(Debug, Clone, Default)]
pub struct HttpMessage {
    pub is_request: bool,
    pub method: String,
    pub scheme: String,
    pub authority: String,
    /// Request target as it appears on the wire (path plus query).
    pub target: String,
    pub status: u16,
    pub reason: String,
    /// HTTP/1 version suffix, e.g. "1.1". Unused on multiplexed wires.
    pub version: String,
    pub fields: FieldSet,
    pub content: MessageContent,
    pub protocol: ProtocolFamily,
    pub stream_id: Option<u32>,
    /// The message carries a `Transfer-Encoding: chunked` framing.
    pub chunked: bool,
    pub has_content_length: bool,
    /// The request asked for a 100 Continue before sending its body.
    pub send_continue: bool,
    /// Set for responses to HEAD: length headers stay, the body does not go
    /// out on the wire.
    pub suppress_body: bool,
}

impl HttpMessage {
    pub fn request() -> Self {
        HttpMessage {
            is_request: true,
            version: "1.1".to_string(),
            ..HttpMessage::default()
        }
    }

    pub fn response() -> Self {
        HttpMessage {
            is_request: false,
            version: "1.1".to_string(),
            ..HttpMessage::default()
        }
    }

    /// Reconcile the body with the request method. Responses to HEAD keep
    /// any recorded Content-Length on the wire but never transmit a body;
    /// HEAD requests themselves carry no body to drain.
    pub fn update_content_length(&mut self, method: &str) {
        if method.eq_ignore_ascii_case("HEAD") {
            self.suppress_body = true;
            if self.is_request {
                self.content.size = 0;
            }
        }
    }

    /// Normalize chunked vs content-length framing. Chunked wins: when a
    /// `Transfer-Encoding: chunked` field is recorded, any Content-Length
    /// is dropped from the framing decision.
    pub fn update_transfer_encoding(&mut self) {
        if let Some(te) = self.fields.get(TRANSFER_ENCODING) {
            if te.to_ascii_lowercase().contains("chunked") {
                self.chunked = true;
            }
        }
        if self.chunked {
            self.has_content_length = false;
            if !self.is_request {
                self.fields.remove(CONTENT_LENGTH);
            }
        } else if let Some(cl) = self.fields.get(CONTENT_LENGTH) {
            if let Ok(size) = cl.trim().parse::<usize>() {
                self.has_content_length = true;
                if self.content.data.is_none() && self.content.size == 0 {
                    self.content.size = size;
                }
            }
        }
    }

    /// Resolve the body bytes, aliasing the shared fill buffer for
    /// synthesized content.
    pub fn body(&self, fill: &Bytes) -> Bytes {
        match &self.content.data {
            Some(data) => data.clone(),
            None => fill.slice(..self.content.size.min(fill.len())),
        }
    }

    pub fn merge_all(&mut self, all: &FieldSet) {
        self.fields.merge(all);
    }
}

/// Default reason phrases for synthesized responses.
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}
