#![cfg(feature = "ws-stream")]

//! WebSocket transport against a local tokio-tungstenite server

use futures_util::SinkExt;
use gateway::streaming::{
    ConnectionConfig, ConnectionManager, ConnectionState, EndpointConfig, EventSocket, EventTransport,
    ReconnectPolicy, StreamUpdate, WsTransport, HEAD_KIND, TRANSACTION_KIND,
};
use gateway::EventFilter;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

/// Accept `sessions` connections in turn, sending `frames` on each and then closing
async fn serve(sessions: usize, frames: Vec<String>) -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        for _ in 0..sessions {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            for frame in &frames {
                ws.send(Message::Text(frame.clone())).await.unwrap();
            }
            let _ = ws.close(None).await;
        }
    });
    (port, handle)
}

#[tokio::test]
async fn test_ws_transport_reads_text_frames() {
    let (port, server) = serve(1, vec![r#"{"type":"head","view":1}"#.to_string()]).await;

    let transport = WsTransport::new(WAIT);
    let mut socket = transport
        .connect(&format!("ws://127.0.0.1:{}/updates/all", port))
        .await
        .unwrap();

    let first = timeout(WAIT, socket.next_message()).await.unwrap();
    assert_eq!(first.unwrap().unwrap(), r#"{"type":"head","view":1}"#);

    // Peer close ends the stream
    let end = timeout(WAIT, socket.next_message()).await.unwrap();
    assert!(end.is_none());
    socket.close().await;

    server.await.unwrap();
}

#[tokio::test]
async fn test_connection_manager_over_websocket_reconnects() {
    let frames = vec![
        r#"{"type":"head","view":5}"#.to_string(),
        r#"{"type":"events","events":[{"kind":"transaction","sequence":1}]}"#.to_string(),
    ];
    let (port, server) = serve(2, frames).await;

    let config = ConnectionConfig {
        endpoints: EndpointConfig {
            primary_url: Some(format!("http://127.0.0.1:{}", port)),
            ..Default::default()
        },
        reconnect: ReconnectPolicy::new(50, 200),
        stale_after: None,
    };
    let manager = ConnectionManager::new(config, Arc::new(WsTransport::new(WAIT)));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let head_tx = tx.clone();
    let _heads = manager.on_event(HEAD_KIND, move |update| {
        if let StreamUpdate::Head { view } = update {
            let _ = head_tx.send(format!("head:{}", view));
        }
    });
    let _txs = manager.on_event(TRANSACTION_KIND, move |update| {
        if let StreamUpdate::Event(event) = update {
            let _ = tx.send(format!("tx:{:?}", event.sequence));
        }
    });

    manager.connect(EventFilter::All).unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let next = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        seen.push(next);
    }

    // Same head view after the reconnect is not redelivered
    assert_eq!(seen, vec!["head:5", "tx:Some(1)", "tx:Some(1)"]);
    assert_eq!(manager.view(), 5);

    timeout(WAIT, server).await.unwrap().unwrap();
    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}
