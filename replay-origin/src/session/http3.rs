// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::SocketAddr;

use tracing::warn;

/// Placeholder for server-side HTTP/3. The listener and dispatch hooks
/// exist so a QUIC stack can slot in, but `accept` turns every
/// connection away until one does.
pub struct H3Session {
    peer: SocketAddr,
    closed: bool,
}

impl H3Session {
    pub fn new(peer: SocketAddr) -> H3Session {
        H3Session {
            peer,
            closed: false,
        }
    }

    pub async fn accept(&mut self) -> io::Result<()> {
        warn!(peer = %self.peer, "server-side HTTP/3 is not available; dropping the connection");
        self.closed = true;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "server-side HTTP/3 is not available",
        ))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}
