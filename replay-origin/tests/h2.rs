//! HTTP/2 session tests driven by an h2 client over an in-memory duplex
//! pipe: stream bookkeeping, per-stream responses, and body verification
//! at end-of-stream.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::duplex;

use replay_core::{HttpMessage, MessageContent, ProtocolFamily};
use replay_origin::session::{BodyExpectation, H2Session, PollStatus};

async fn next_request(session: &mut H2Session) -> Option<HttpMessage> {
    loop {
        match session
            .poll_for_headers(Duration::from_millis(200))
            .await
            .unwrap()
        {
            PollStatus::Ready => return session.read_and_parse_request(),
            PollStatus::Timeout => continue,
            PollStatus::PeerClosed => return None,
        }
    }
}

fn canned_response(stream_id: u32, body: String) -> HttpMessage {
    let mut rsp = HttpMessage::response();
    rsp.protocol = ProtocolFamily::Http2;
    rsp.stream_id = Some(stream_id);
    rsp.status = 200;
    rsp.content = MessageContent::literal(body);
    rsp
}

async fn collect_body(mut body: h2::RecvStream) -> Vec<u8> {
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        collected.extend_from_slice(&chunk);
    }
    collected
}

#[tokio::test]
async fn responses_land_on_their_own_streams() {
    let (client_io, server_io) = duplex(256 * 1024);

    let server = tokio::spawn(async move {
        let mut session = H2Session::handshake(server_io).await.unwrap();
        for _ in 0..2 {
            let req = next_request(&mut session).await.unwrap();
            let stream_id = req.stream_id.unwrap();
            assert_eq!(req.protocol, ProtocolFamily::Http2);
            let rsp = canned_response(stream_id, format!("body for {}", req.target));
            session.attach_expectation(stream_id, BodyExpectation::default());
            let outcome = session.write(&rsp, &Bytes::new()).await.unwrap();
            assert!(outcome.body_ok);
        }
        session.close().await;
    });

    let (mut send_request, connection) = h2::client::handshake(client_io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request_one = http::Request::builder()
        .method("GET")
        .uri("https://origin.test/one")
        .body(())
        .unwrap();
    let (response_one, _) = send_request.send_request(request_one, true).unwrap();

    let request_two = http::Request::builder()
        .method("GET")
        .uri("https://origin.test/two")
        .body(())
        .unwrap();
    let (response_two, _) = send_request.send_request(request_two, true).unwrap();

    let response_two = response_two.await.unwrap();
    assert_eq!(response_two.status(), 200);
    assert_eq!(collect_body(response_two.into_body()).await, b"body for /two");

    let response_one = response_one.await.unwrap();
    assert_eq!(response_one.status(), 200);
    assert_eq!(collect_body(response_one.into_body()).await, b"body for /one");

    server.await.unwrap();
}

#[tokio::test]
async fn stream_bodies_are_verified_against_the_expectation() {
    let (client_io, server_io) = duplex(256 * 1024);

    let server = tokio::spawn(async move {
        let mut session = H2Session::handshake(server_io).await.unwrap();

        let req = next_request(&mut session).await.unwrap();
        let stream_id = req.stream_id.unwrap();
        session.attach_expectation(
            stream_id,
            BodyExpectation {
                size: 5,
                data: Some(Bytes::from_static(b"hello")),
                verify_equal: true,
            },
        );
        let rsp = canned_response(stream_id, "first".to_string());
        let outcome = session.write(&rsp, &Bytes::new()).await.unwrap();
        assert!(outcome.body_ok, "matching body failed the content rule");

        let req = next_request(&mut session).await.unwrap();
        let stream_id = req.stream_id.unwrap();
        session.attach_expectation(
            stream_id,
            BodyExpectation {
                size: 5,
                data: Some(Bytes::from_static(b"hello")),
                verify_equal: true,
            },
        );
        let rsp = canned_response(stream_id, "second".to_string());
        let outcome = session.write(&rsp, &Bytes::new()).await.unwrap();
        assert!(!outcome.body_ok, "mismatched body passed the content rule");

        session.close().await;
    });

    let (mut send_request, connection) = h2::client::handshake(client_io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    for body in [&b"hello"[..], &b"XXXXX"[..]] {
        let request = http::Request::builder()
            .method("POST")
            .uri("https://origin.test/upload")
            .body(())
            .unwrap();
        let (response, mut send_body) = send_request.send_request(request, false).unwrap();
        send_body.send_data(Bytes::from_static(body), true).unwrap();
        let response = response.await.unwrap();
        assert_eq!(response.status(), 200);
        collect_body(response.into_body()).await;
    }

    server.await.unwrap();
}

#[tokio::test]
async fn head_responses_end_the_stream_without_data() {
    let (client_io, server_io) = duplex(256 * 1024);

    let server = tokio::spawn(async move {
        let mut session = H2Session::handshake(server_io).await.unwrap();
        let req = next_request(&mut session).await.unwrap();
        let stream_id = req.stream_id.unwrap();

        let mut rsp = canned_response(stream_id, "hidden".to_string());
        rsp.fields.add_field("Content-Length", "6");
        rsp.update_content_length(&req.method);
        session.write(&rsp, &Bytes::new()).await.unwrap();
        session.close().await;
    });

    let (mut send_request, connection) = h2::client::handshake(client_io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = http::Request::builder()
        .method("HEAD")
        .uri("https://origin.test/x")
        .body(())
        .unwrap();
    let (response, _) = send_request.send_request(request, true).unwrap();
    let response = response.await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-length").unwrap(),
        &http::HeaderValue::from_static("6")
    );
    assert!(collect_body(response.into_body()).await.is_empty());

    server.await.unwrap();
}
