//! End-to-end test of the line-delimited JSON transport.

mod common;

use std::sync::Arc;

use common::*;
use ember_host::clock::{Clock, SystemClock};
use ember_host::demo::counter_definition;
use ember_host::{tcp, InstanceOptions, MemoryDriver};
use ember_protocol::{ActionResponse, ToClient};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

async fn start_server() -> (Harness, std::net::SocketAddr) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let h = harness_with(MemoryDriver::new(Arc::clone(&clock)), clock, |b| {
        b.register(counter_definition(InstanceOptions::default()).unwrap())
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(tcp::serve(listener, h.manager.clone(), h.shutdown_tx.subscribe()));
    (h, addr)
}

#[tokio::test]
async fn test_increment_over_tcp() {
    let (h, addr) = start_server().await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let handshake = json!({
        "type": "connect",
        "query": { "kind": "get_or_create_for_key", "name": "counter", "key": ["tcp"] }
    });
    writer
        .write_all(format!("{handshake}\n").as_bytes())
        .await
        .unwrap();

    let first: ToClient = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    let ToClient::Init(init) = first else {
        panic!("expected an init frame first");
    };

    let request = json!({ "tag": "ActionRequest", "val": { "id": 1, "name": "increment", "args": [] } });
    writer
        .write_all(format!("{request}\n").as_bytes())
        .await
        .unwrap();

    let response: ToClient = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(
        response,
        ToClient::ActionResponse(ActionResponse {
            id: 1,
            output: json!(1),
        })
    );

    let snapshot = h.manager.inspect(init.actor_id).await.unwrap().unwrap();
    assert_eq!(snapshot.connections.len(), 1);
    assert_eq!(snapshot.state, json!({ "count": 1 }));

    h.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_bad_handshake_gets_error_frame() {
    let (h, addr) = start_server().await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    writer.write_all(b"{\"type\":\"hello\"}\n").await.unwrap();

    let frame: ToClient = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    match frame {
        ToClient::Error(error) => assert_eq!(error.code, "malformed_message"),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(lines.next_line().await.unwrap().is_none());

    h.shutdown_tx.send(true).unwrap();
}
