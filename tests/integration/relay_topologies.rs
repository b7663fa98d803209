//! End-to-end flows for the raw relay topologies: broadcast and cable.

use std::sync::Arc;
use std::time::Duration;

use crosswire_relay::session::{self, RelayState};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const BROADCAST_ID: &str = "abcdefgh12345678";
const CABLE_ID: &str = "0123456789abcdef0123456789abcdef-";

async fn start_relay() -> (std::net::SocketAddr, Arc<RelayState>) {
    let state = Arc::new(RelayState::with_ready_delay(Duration::from_millis(10)));
    let (addr, _handle) = session::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay server");
    (addr, state)
}

async fn connect(addr: std::net::SocketAddr, path: &str) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("failed to connect");
    ws
}

async fn recv_frame(ws: &mut WsClient) -> tungstenite::Message {
    tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection ended unexpectedly")
        .unwrap()
}

fn text_of(msg: &tungstenite::Message) -> &str {
    match msg {
        tungstenite::Message::Text(text) => text.as_str(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn broadcast_relays_to_all_other_members() {
    let (addr, _state) = start_relay().await;
    let path = format!("/broadcast/{BROADCAST_ID}");

    let mut ws_1 = connect(addr, &path).await;
    let mut ws_2 = connect(addr, &path).await;
    let mut ws_3 = connect(addr, &path).await;
    // Give all three sessions time to join the channel.
    tokio::time::sleep(Duration::from_millis(100)).await;

    ws_1.send(tungstenite::Message::text("to everyone else"))
        .await
        .unwrap();
    for ws in [&mut ws_2, &mut ws_3] {
        let got = recv_frame(ws).await;
        assert_eq!(text_of(&got), "to everyone else");
    }

    // Member 1's first inbound frame is member 3's message, proving its
    // own frame was never echoed.
    ws_3.send(tungstenite::Message::text("reply")).await.unwrap();
    let got = recv_frame(&mut ws_1).await;
    assert_eq!(text_of(&got), "reply");
}

#[tokio::test]
async fn broadcast_member_departure_leaves_the_rest_connected() {
    let (addr, state) = start_relay().await;
    let path = format!("/broadcast/{BROADCAST_ID}");

    let mut ws_1 = connect(addr, &path).await;
    let mut ws_2 = connect(addr, &path).await;
    let mut ws_3 = connect(addr, &path).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    ws_3.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Relay continues among the remaining members.
    ws_1.send(tungstenite::Message::text("still here"))
        .await
        .unwrap();
    let got = recv_frame(&mut ws_2).await;
    assert_eq!(text_of(&got), "still here");
    assert!(state.broadcasts().contains(BROADCAST_ID).await);
}

#[tokio::test]
async fn broadcast_channel_removed_when_last_member_leaves() {
    let (addr, state) = start_relay().await;
    let path = format!("/broadcast/{BROADCAST_ID}");

    let mut ws_1 = connect(addr, &path).await;
    let mut ws_2 = connect(addr, &path).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.broadcasts().contains(BROADCAST_ID).await);

    ws_1.close(None).await.unwrap();
    ws_2.close(None).await.unwrap();

    for _ in 0..100 {
        if !state.broadcasts().contains(BROADCAST_ID).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("broadcast registry entry was never removed");
}

#[tokio::test]
async fn cable_pairs_by_connection_order_and_relays_bytes() {
    let (addr, _state) = start_relay().await;
    let path = format!("/cable/connect/{CABLE_ID}");

    let mut ws_a = connect(addr, &path).await;
    let mut ws_b = connect(addr, &path).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    ws_a.send(tungstenite::Message::binary(vec![0x01, 0x02, 0x03]))
        .await
        .unwrap();
    let got = recv_frame(&mut ws_b).await;
    assert_eq!(got.into_data().as_ref(), &[0x01, 0x02, 0x03]);

    ws_b.send(tungstenite::Message::binary(vec![0xFF]))
        .await
        .unwrap();
    let got = recv_frame(&mut ws_a).await;
    assert_eq!(got.into_data().as_ref(), &[0xFF]);
}

#[tokio::test]
async fn cable_disconnect_closes_peer_and_frees_the_identifier() {
    let (addr, state) = start_relay().await;
    let path = format!("/cable/connect/{CABLE_ID}");

    let mut ws_a = connect(addr, &path).await;
    let mut ws_b = connect(addr, &path).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    ws_a.close(None).await.unwrap();
    match recv_frame(&mut ws_b).await {
        tungstenite::Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Normal);
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    for _ in 0..100 {
        if !state.cables().contains(CABLE_ID).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!state.cables().contains(CABLE_ID).await);

    // The identifier is immediately reusable for a fresh pair.
    let mut ws_c = connect(addr, &path).await;
    let mut ws_d = connect(addr, &path).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    ws_c.send(tungstenite::Message::text("fresh cable"))
        .await
        .unwrap();
    let got = recv_frame(&mut ws_d).await;
    assert_eq!(text_of(&got), "fresh cable");
}

#[tokio::test]
async fn cable_rejects_third_connection() {
    let (addr, _state) = start_relay().await;
    let path = format!("/cable/connect/{CABLE_ID}");

    let _ws_a = connect(addr, &path).await;
    let _ws_b = connect(addr, &path).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut ws_c = connect(addr, &path).await;
    match recv_frame(&mut ws_c).await {
        tungstenite::Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert!(frame.reason.contains("full"), "got: {}", frame.reason);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}
