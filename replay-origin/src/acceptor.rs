// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, error, info, warn};

use crate::handler::serve_connection;
use crate::pool::{Shutdown, WorkerPool};
use crate::session::{H3Session, Http1Session, Session, TlsSession};
use crate::tls::TlsContext;
use crate::Engine;

const LISTEN_BACKLOG: u32 = 16384;

/// What a listening endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenKind {
    Http,
    Https,
    Http3,
}

impl ListenKind {
    pub fn describe(self) -> &'static str {
        match self {
            ListenKind::Http => "HTTP/1.x",
            ListenKind::Https => "HTTPS (HTTP/1.x or HTTP/2)",
            ListenKind::Http3 => "HTTP/3",
        }
    }
}

/// Open a listening socket, reusing the port aggressively.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// One accept loop per listening endpoint: accept, configure the socket,
/// wrap it in the protocol-appropriate session, and hand it to a worker.
/// Accept errors are logged and the loop keeps going; only shutdown ends
/// it.
pub async fn accept_loop(
    listener: TcpListener,
    kind: ListenKind,
    engine: Arc<Engine>,
    tls: Option<Arc<TlsContext>>,
    pool: WorkerPool,
    mut shutdown: Shutdown,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                error!(%err, "failed to accept a connection");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            warn!(%err, %peer, "could not set TCP_NODELAY");
        }

        let session = match (kind, &tls) {
            (ListenKind::Http, _) => Session::Plain(Http1Session::new(stream)),
            (ListenKind::Https, Some(tls)) => {
                Session::Tls(TlsSession::pending(stream, tls.clone()))
            }
            (ListenKind::Https, None) => {
                error!(%peer, "HTTPS listener has no TLS context; dropping the connection");
                continue;
            }
            (ListenKind::Http3, _) => Session::H3(H3Session::new(peer)),
        };

        let permit = tokio::select! {
            _ = shutdown.wait() => break,
            permit = pool.reserve() => match permit {
                Some(permit) => permit,
                None => break,
            },
        };
        debug!(%peer, protocol = kind.describe(), "connection accepted");

        let engine = engine.clone();
        let worker_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _permit = permit;
            serve_connection(&engine, session, worker_shutdown).await;
        });
    }
    info!(protocol = kind.describe(), "listener shut down");
}
