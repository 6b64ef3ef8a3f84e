// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, warn};

use replay_core::message::CONTENT_LENGTH;
use replay_core::{HttpMessage, ProtocolFamily};

use crate::session::{BodyExpectation, PollStatus, Session};
use crate::{pool::Shutdown, Engine};

/// How long each bounded wait runs before the loop rechecks the shutdown
/// flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn not_found_response(stream_id: Option<u32>, protocol: ProtocolFamily) -> HttpMessage {
    let mut rsp = HttpMessage::response();
    rsp.protocol = protocol;
    rsp.stream_id = stream_id;
    rsp.status = 404;
    rsp.reason = "Not Found".to_string();
    rsp.fields.add_field(CONTENT_LENGTH, "0");
    rsp
}

pub fn continue_response(stream_id: Option<u32>, protocol: ProtocolFamily) -> HttpMessage {
    let mut rsp = HttpMessage::response();
    rsp.protocol = protocol;
    rsp.stream_id = stream_id;
    rsp.status = 100;
    rsp.reason = "continue".to_string();
    rsp
}

enum ServiceEnd {
    /// Terminal posture: the 404 went out and the connection is done.
    CloseConnection,
    Fatal(io::Error),
}

/// The per-connection serve loop a worker runs: handshake, then poll,
/// parse, match, verify, respond until the peer closes or shutdown is
/// requested. In-flight requests complete; the loop re-checks the flag at
/// every poll boundary.
pub async fn serve_connection(engine: &Engine, mut session: Session, shutdown: Shutdown) {
    if let Err(err) = session.accept().await {
        debug!(%err, "connection handshake failed");
        session.close().await;
        return;
    }

    while !shutdown.is_set() && !session.is_closed() {
        match session.poll_for_headers(POLL_INTERVAL).await {
            Ok(PollStatus::Timeout) => continue,
            Ok(PollStatus::PeerClosed) => break,
            Ok(PollStatus::Ready) => {}
            Err(err) => {
                warn!(%err, "poll for headers failed");
                break;
            }
        }

        let req = match session.read_and_parse_request().await {
            Ok(Some(req)) => req,
            // No request to retrieve: the peer closed, not an error.
            Ok(None) => break,
            Err(err) => {
                error!(%err, "could not read the request head");
                engine.flag_error();
                break;
            }
        };

        match service_request(engine, &mut session, req).await {
            Ok(()) => {}
            Err(ServiceEnd::CloseConnection) => break,
            Err(ServiceEnd::Fatal(err)) => {
                warn!(%err, "connection failed while servicing a request");
                break;
            }
        }
    }

    session.close().await;
}

async fn service_request(
    engine: &Engine,
    session: &mut Session,
    mut req: HttpMessage,
) -> Result<(), ServiceEnd> {
    let stream_id = req.stream_id;
    let protocol = req.protocol;
    let method = req.method.clone();
    let key = engine.key_format.key_for(&req).unwrap_or_default();

    let Some(txn) = engine.catalog.lookup(&key) else {
        error!(%key, "request key not found, sending a 404");
        engine.flag_error();
        let mut not_found = not_found_response(stream_id, protocol);
        not_found.update_content_length(&method);
        session
            .write(&not_found, engine.catalog.fill())
            .await
            .map_err(ServiceEnd::Fatal)?;
        return Err(ServiceEnd::CloseConnection);
    };

    req.update_content_length(&method);
    req.update_transfer_encoding();

    if req.send_continue {
        if protocol == ProtocolFamily::Http1 {
            let interim = continue_response(stream_id, protocol);
            session
                .write(&interim, engine.catalog.fill())
                .await
                .map_err(ServiceEnd::Fatal)?;
        } else {
            debug!(%key, "interim responses are not emitted on multiplexed streams");
        }
    }

    let expectation = BodyExpectation::from(&txn.req.content);
    if protocol == ProtocolFamily::Http1 {
        if req.chunked || req.content.size > 0 {
            // A chunked request declares no length; the recorded request
            // knows how much content to expect.
            let expected_size = if req.chunked {
                txn.req.content.size
            } else {
                req.content.size
            };
            let (drained, body_ok) = session
                .drain_body(req.chunked, expected_size, &expectation)
                .await
                .map_err(|err| {
                    error!(%key, %err, "failed to drain the request body");
                    ServiceEnd::Fatal(err)
                })?;
            debug!(%key, drained, "request body drained");
            if !body_ok {
                error!(%key, "request body did not match the recorded content");
                engine.flag_error();
            }
        }
    } else if let Some(id) = stream_id {
        session.attach_expectation(id, expectation);
    }

    let failures = txn.req.fields.verify(&req.fields, &key, engine.strict);
    if failures > 0 {
        error!(%key, failures, "request headers did not match the expected request headers");
        engine.flag_error();
    } else {
        debug!(%key, "request passed validation");
    }

    let mut rsp = txn.rsp.clone();
    rsp.protocol = protocol;
    rsp.stream_id = stream_id;
    rsp.update_content_length(&method);

    if let Some(delay) = txn.delay {
        sleep(delay).await;
    }

    let outcome = session
        .write(&rsp, engine.catalog.fill())
        .await
        .map_err(ServiceEnd::Fatal)?;
    if !outcome.body_ok {
        error!(%key, "request body did not match the recorded content");
        engine.flag_error();
    }
    debug!(%key, bytes = outcome.bytes, "response written");
    Ok(())
}
