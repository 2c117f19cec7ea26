use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use wsgate_verify::{
    ConnectionVerifier, ExpectedMarker, Probe, TransportConfig, TransportError,
    TungsteniteTransport, VerifyConfig, VerifyError,
};

/// Echo-style backend: answers every `{"action": ...}` frame with `reply`.
async fn spawn_ws_backend(reply: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                        assert!(frame.get("action").is_some());
                        let _ = ws.send(Message::Text(reply.to_string())).await;
                    }
                }
            });
        }
    });
    format!("ws://{addr}/test")
}

/// Endpoint that refuses every upgrade, like a stage that is not live yet.
async fn spawn_rejecting_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("ws://{addr}/test")
}

fn verifier(max_attempts: u32) -> ConnectionVerifier<TungsteniteTransport> {
    let transport = TungsteniteTransport::new(TransportConfig {
        handshake_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_secs(1),
        ping_interval: None,
    })
    .unwrap();
    ConnectionVerifier::new(
        transport,
        VerifyConfig {
            max_attempts,
            initial_sleep: Duration::from_millis(10),
            backoff_factor: 1.5,
            max_sleep: Duration::from_secs(1),
            response_timeout: Duration::from_secs(5),
            deadline: Some(Duration::from_secs(30)),
        },
    )
}

#[tokio::test]
async fn verifies_live_endpoint() {
    let url = spawn_ws_backend(r#"{"message": "success"}"#).await;
    let report = verifier(5)
        .verify(&url, &Probe::action("test"), &ExpectedMarker::default())
        .await
        .unwrap();
    assert_eq!(report.attempts, 1);
    assert_eq!(report.response["message"], "success");
}

#[tokio::test]
async fn reports_mismatch_from_live_endpoint() {
    let url = spawn_ws_backend(r#"{"message": "failure"}"#).await;
    let err = verifier(5)
        .verify(&url, &Probe::action("test"), &ExpectedMarker::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::AssertionMismatch { .. }), "{err:?}");
}

#[tokio::test]
async fn refused_upgrade_is_retried_then_abandoned() {
    let url = spawn_rejecting_backend().await;
    let err = verifier(3)
        .verify(&url, &Probe::action("test"), &ExpectedMarker::default())
        .await
        .unwrap_err();
    match err {
        VerifyError::GaveUp { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(last, TransportError::Rejected(_)), "{last:?}");
        }
        other => panic!("expected GaveUp, got {other:?}"),
    }
}
