// WebSocket transport against a small in-process relay

use firmata_link::transport::{
    RpcTransport, TransportError, TransportEvent, WebSocketTransport,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

/// Accepts one client. `echo` returns its params, `fail` returns an RPC
/// error, `ask` makes the relay send a request of its own, `hangup` drops
/// the socket and anything else goes unanswered. Every frame received is
/// forwarded to the returned channel.
async fn relay_server() -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (seen_tx, seen) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else { continue };
            let frame: Value = serde_json::from_str(&text).unwrap();
            let _ = seen_tx.send(frame.clone());
            let id = frame["id"].clone();
            let reply = match frame["method"].as_str() {
                Some("echo") => json!({"jsonrpc": "2.0", "id": id, "result": frame["params"]}),
                Some("fail") => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32000, "message": "board busy"}
                }),
                Some("ask") => json!({"jsonrpc": "2.0", "id": "relay-1", "method": "whoami", "params": {}}),
                Some("hangup") => break,
                _ => continue,
            };
            if ws.send(Message::Text(reply.to_string())).await.is_err() {
                break;
            }
        }
    });

    (url, seen)
}

async fn open_transport(
    url: &str,
    call_timeout: Duration,
) -> (WebSocketTransport, mpsc::UnboundedReceiver<TransportEvent>) {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let transport = WebSocketTransport::open(url, call_timeout, events_tx);
    let first = timeout(WAIT, events.recv()).await.unwrap();
    assert_eq!(first, Some(TransportEvent::Open));
    assert!(transport.is_open());
    (transport, events)
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    want: TransportEvent,
) {
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if event == want {
                return;
            }
        }
        panic!("event channel closed before {:?}", want);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_calls_are_correlated() {
    let (url, _seen) = relay_server().await;
    let (transport, _events) = open_transport(&url, WAIT).await;

    let (a, b) = tokio::join!(
        transport.call("echo", json!({"n": 1})),
        transport.call("echo", json!({"n": 2}))
    );
    assert_eq!(assert_ok!(a), json!({"n": 1}));
    assert_eq!(assert_ok!(b), json!({"n": 2}));
    assert_eq!(transport.pending_calls().await, 0);
}

#[tokio::test]
async fn test_requests_carry_jsonrpc_envelope() {
    let (url, mut seen) = relay_server().await;
    let (transport, _events) = open_transport(&url, WAIT).await;

    assert_ok!(transport.call("echo", json!({"portPath": "COM3"})).await);
    let frame = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(frame["jsonrpc"], "2.0");
    assert_eq!(frame["method"], "echo");
    assert_eq!(frame["params"], json!({"portPath": "COM3"}));
    assert!(frame["id"].is_u64());
}

#[tokio::test]
async fn test_rpc_error_is_mapped() {
    let (url, _seen) = relay_server().await;
    let (transport, _events) = open_transport(&url, WAIT).await;

    let error = assert_err!(transport.call("fail", json!({})).await);
    assert_eq!(error, TransportError::Rpc { code: -32000, message: "board busy".to_string() });
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let (url, _seen) = relay_server().await;
    let (transport, _events) = open_transport(&url, Duration::from_millis(200)).await;

    let result = transport.call("silent", json!({})).await;
    assert_eq!(
        result,
        Err(TransportError::Timeout { method: "silent".to_string(), timeout_ms: 200 })
    );
    assert_eq!(transport.pending_calls().await, 0);
}

#[tokio::test]
async fn test_call_before_open_fails() {
    let (url, _seen) = relay_server().await;
    let (events_tx, _events) = mpsc::unbounded_channel();
    let transport = WebSocketTransport::open(&url, WAIT, events_tx);
    assert!(!transport.is_open());
    assert_eq!(transport.call("echo", json!({})).await, Err(TransportError::NotOpen));
    assert_eq!(transport.notify("echo", json!({})).await, Err(TransportError::NotOpen));
}

#[tokio::test]
async fn test_relay_request_gets_method_not_found() {
    let (url, mut seen) = relay_server().await;
    let (transport, _events) = open_transport(&url, WAIT).await;

    assert_ok!(transport.notify("ask", json!({})).await);
    let reply = timeout(WAIT, async {
        while let Some(frame) = seen.recv().await {
            if frame.get("error").is_some() {
                return frame;
            }
        }
        panic!("relay never saw a reply");
    })
    .await
    .unwrap();
    assert_eq!(reply["id"], "relay-1");
    assert_eq!(reply["error"]["code"], -32601);
}

#[tokio::test]
async fn test_server_hangup_closes_transport() {
    let (url, _seen) = relay_server().await;
    let (transport, mut events) = open_transport(&url, WAIT).await;

    let result = transport.call("hangup", json!({})).await;
    assert_eq!(result, Err(TransportError::Closed));
    wait_for(&mut events, TransportEvent::Closed).await;
    assert!(!transport.is_open());
    assert_eq!(transport.call("echo", json!({})).await, Err(TransportError::NotOpen));
}

#[tokio::test]
async fn test_close_reports_closed() {
    let (url, _seen) = relay_server().await;
    let (transport, mut events) = open_transport(&url, WAIT).await;

    transport.close().await;
    assert!(!transport.is_open());
    wait_for(&mut events, TransportEvent::Closed).await;
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let transport = WebSocketTransport::open(&url, WAIT, events_tx);
    let first = timeout(WAIT, events.recv()).await.unwrap();
    assert!(matches!(first, Some(TransportEvent::Error(_))));
    wait_for(&mut events, TransportEvent::Closed).await;
    assert!(!transport.is_open());
}
