// Integration tests for IPC frame size limits and the connection handshake

#![cfg(unix)]

mod helpers;

use anyhow::Result;
use helpers::daemon_guard::{stderr, BridgeEnv};
use pane_bridge::session::error::ErrorCode;
use pane_bridge::session::protocol::{
    deserialize_message, serialize_message, DaemonRequest, DaemonResponse, Request, RequestMode,
    MAX_REQUEST_FRAME_SIZE, PROTOCOL_VERSION,
};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Start a daemon by submitting one background request
fn running_daemon() -> BridgeEnv {
    let env = BridgeEnv::new();
    let output = env.run(&["ask", "claude", "warm up"]);
    assert!(output.status.success(), "ask failed: {}", stderr(&output));
    env
}

fn connect(env: &BridgeEnv) -> Result<BufReader<UnixStream>> {
    let stream = UnixStream::connect(&env.config().socket_path)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    Ok(BufReader::new(stream))
}

/// Send a request and receive one response
fn send_request(stream: &mut BufReader<UnixStream>, request: &DaemonRequest) -> Result<DaemonResponse> {
    let bytes = serialize_message(request)?;
    stream.get_mut().write_all(&bytes)?;
    stream.get_mut().flush()?;

    let mut line = String::new();
    stream.read_line(&mut line)?;
    Ok(deserialize_message(line.as_bytes())?)
}

fn handshake(stream: &mut BufReader<UnixStream>) {
    let response = send_request(
        stream,
        &DaemonRequest::Handshake {
            client_version: PROTOCOL_VERSION,
        },
    )
    .expect("handshake");
    match response {
        DaemonResponse::Handshake { protocol_version } => assert_eq!(protocol_version, PROTOCOL_VERSION),
        other => panic!("Expected handshake response, got: {:?}", other),
    }
}

#[test]
fn test_server_rejects_oversized_request() {
    let env = running_daemon();
    let mut stream = connect(&env).expect("Failed to connect to daemon");
    handshake(&mut stream);

    let oversized = DaemonRequest::Enqueue {
        request: Request::new("x".repeat(MAX_REQUEST_FRAME_SIZE + 1000), RequestMode::Background),
        resume: false,
    };
    match send_request(&mut stream, &oversized).expect("Failed to send request") {
        DaemonResponse::Error { code, message, .. } => {
            assert_eq!(code, ErrorCode::InvalidRequest);
            assert!(
                message.contains("Request frame too large"),
                "Expected 'Request frame too large' error, got: {}",
                message
            );
            assert!(message.contains("max 1048576"), "got: {}", message);
        }
        other => panic!("Expected error response for oversized request, got: {:?}", other),
    }

    // The daemon closes the connection after an oversized frame
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).expect("read to EOF"), 0);
}

#[test]
fn test_request_just_under_limit_is_accepted() {
    let env = running_daemon();
    let mut stream = connect(&env).unwrap();
    handshake(&mut stream);

    // Leave room for the JSON envelope around the payload
    let payload = "y".repeat(MAX_REQUEST_FRAME_SIZE - 4096);
    let request = DaemonRequest::Enqueue {
        request: Request::new(payload, RequestMode::Background),
        resume: false,
    };
    match send_request(&mut stream, &request).unwrap() {
        DaemonResponse::Queued { round, .. } => assert_eq!(round, 2),
        other => panic!("Expected queued response, got: {:?}", other),
    }
}

#[test]
fn test_requests_before_handshake_are_refused() {
    let env = running_daemon();
    let mut stream = connect(&env).unwrap();

    match send_request(&mut stream, &DaemonRequest::Ping).unwrap() {
        DaemonResponse::Error { code, message, .. } => {
            assert_eq!(code, ErrorCode::InvalidRequest);
            assert!(message.contains("handshake"), "got: {}", message);
        }
        other => panic!("Expected error response, got: {:?}", other),
    }
}

#[test]
fn test_version_mismatch_is_reported() {
    let env = running_daemon();
    let mut stream = connect(&env).unwrap();

    let response = send_request(
        &mut stream,
        &DaemonRequest::Handshake {
            client_version: PROTOCOL_VERSION + 1,
        },
    )
    .unwrap();
    match response {
        DaemonResponse::Error { code, .. } => assert_eq!(code, ErrorCode::VersionMismatch),
        other => panic!("Expected version mismatch, got: {:?}", other),
    }
}

#[test]
fn test_malformed_frame_keeps_connection_open() {
    let env = running_daemon();
    let mut stream = connect(&env).unwrap();
    handshake(&mut stream);

    stream.get_mut().write_all(b"{\"type\":\"launch_rockets\"}\n").unwrap();
    let mut line = String::new();
    stream.read_line(&mut line).unwrap();
    match deserialize_message::<DaemonResponse>(line.as_bytes()).unwrap() {
        DaemonResponse::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
        other => panic!("Expected parse error, got: {:?}", other),
    }

    match send_request(&mut stream, &DaemonRequest::Ping).unwrap() {
        DaemonResponse::Pong { status } => assert_eq!(status.key, env.key()),
        other => panic!("Expected pong, got: {:?}", other),
    }
}
