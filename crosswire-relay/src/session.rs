//! Per-connection session handling and the WebSocket server surface.
//!
//! The session layer validates the channel identifier carried in the
//! request path, resolves the channel through the topology's registry, and
//! wires transport events (message, close) to channel operations. Each
//! connection gets a reader task and a writer task; everything sent to a
//! connection flows through its writer's queue, so relays never block on
//! another connection's traffic.
//!
//! Route prefixes select the topology:
//! - `/channel/{id}` — exclusive pair, declared-role control protocol
//! - `/cable/connect/{id}` — exclusive pair, connection order, raw frames
//! - `/broadcast/{id}` — broadcast, raw frames

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use axum::extract::{Path, State, WebSocketUpgrade};
use crosswire_proto::envelope::{self, ControlMessage};
use crosswire_proto::ident;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::channel::{
    BroadcastChannel, ConnHandle, DEFAULT_READY_DELAY_MS, PairChannel, PairSettings, PairStrategy,
    Role,
};
use crate::registry::ChannelRegistry;

/// Shared server state: one registry per topology keyspace.
///
/// Constructed at process start and shared with every connection task via
/// `Arc`; tests build as many independent states as they need.
pub struct RelayState {
    pairs: ChannelRegistry<PairChannel>,
    cables: ChannelRegistry<PairChannel>,
    broadcasts: ChannelRegistry<BroadcastChannel>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a state with the default ready-notification delay.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ready_delay(Duration::from_millis(DEFAULT_READY_DELAY_MS))
    }

    /// Creates a state with a custom ready-notification delay.
    #[must_use]
    pub fn with_ready_delay(ready_delay: Duration) -> Self {
        Self {
            pairs: ChannelRegistry::new(PairSettings {
                strategy: PairStrategy::DeclaredRole,
                ready_delay,
            }),
            cables: ChannelRegistry::new(PairSettings {
                strategy: PairStrategy::ConnectionOrder,
                ready_delay,
            }),
            broadcasts: ChannelRegistry::new(()),
        }
    }

    /// Registry for `/channel` paired sessions.
    #[must_use]
    pub fn pairs(&self) -> &ChannelRegistry<PairChannel> {
        &self.pairs
    }

    /// Registry for `/cable/connect` sessions.
    #[must_use]
    pub fn cables(&self) -> &ChannelRegistry<PairChannel> {
        &self.cables
    }

    /// Registry for `/broadcast` sessions.
    #[must_use]
    pub fn broadcasts(&self) -> &ChannelRegistry<BroadcastChannel> {
        &self.broadcasts
    }
}

/// Starts the relay server on the given address and returns the bound
/// address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/channel/{channel_id}", axum::routing::get(channel_route))
        .route(
            "/cable/connect/{channel_id}",
            axum::routing::get(cable_route),
        )
        .route(
            "/broadcast/{channel_id}",
            axum::routing::get(broadcast_route),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

async fn channel_route(
    ws: WebSocketUpgrade,
    Path(channel_id): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| async move {
        match ident::validate_channel_id(&channel_id) {
            Ok(()) => paired_session(socket, channel_id, state).await,
            Err(e) => reject(socket, &e.to_string()).await,
        }
    })
}

async fn cable_route(
    ws: WebSocketUpgrade,
    Path(channel_id): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| async move {
        match ident::validate_cable_id(&channel_id) {
            Ok(()) => cable_session(socket, channel_id, state).await,
            Err(e) => reject(socket, &e.to_string()).await,
        }
    })
}

async fn broadcast_route(
    ws: WebSocketUpgrade,
    Path(channel_id): Path<String>,
    State(state): State<Arc<RelayState>>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| async move {
        match ident::validate_channel_id(&channel_id) {
            Ok(()) => broadcast_session(socket, channel_id, state).await,
            Err(e) => reject(socket, &e.to_string()).await,
        }
    })
}

/// Closes a connection with a policy-violation status and a reason string.
///
/// Identifier validation and arity failures are connection-fatal; no
/// registry interaction happens for a rejected connection.
async fn reject(mut socket: WebSocket, reason: &str) {
    tracing::warn!(reason = %reason, "rejecting connection");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.to_owned().into(),
        })))
        .await;
}

// ---------------------------------------------------------------------------
// Per-topology session loops
// ---------------------------------------------------------------------------

/// Paired session over the declared-role control protocol.
///
/// The connection does not join on connect; it holds a slot only after an
/// explicit `hello-*` declaration. Whichever participant disconnects first
/// disposes the whole channel.
async fn paired_session(socket: WebSocket, channel_id: String, state: Arc<RelayState>) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ConnHandle::new(tx);
    let conn_id = handle.id();
    let channel = state.pairs.resolve(&channel_id).await;
    tracing::info!(channel_id = %channel_id, conn_id = %conn_id, "connection accepted on paired channel");

    let mut write_task = tokio::spawn(write_loop(sink, rx));
    let mut read_task = tokio::spawn(declared_role_loop(stream, Arc::clone(&channel), handle));

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    if channel.dispose_if_member(conn_id) {
        state.pairs.remove(&channel_id).await;
    }
    tracing::info!(channel_id = %channel_id, conn_id = %conn_id, "connection closed");
}

/// Cable session: same pair state machine, roles assigned by connection
/// order, frames relayed raw.
async fn cable_session(socket: WebSocket, channel_id: String, state: Arc<RelayState>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ConnHandle::new(tx);
    let conn_id = handle.id();
    let channel = state.cables.resolve(&channel_id).await;

    if let Err(e) = channel.claim(handle) {
        tracing::warn!(channel_id = %channel_id, error = %e, "rejecting cable connection");
        reject(socket, &e.to_string()).await;
        return;
    }
    tracing::info!(channel_id = %channel_id, conn_id = %conn_id, "connection claimed cable slot");

    let (sink, stream) = socket.split();
    let mut write_task = tokio::spawn(write_loop(sink, rx));
    let relay_channel = Arc::clone(&channel);
    let mut read_task = tokio::spawn(raw_relay_loop(stream, move |frame| {
        relay_channel.relay(conn_id, frame);
    }));

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    if channel.dispose_if_member(conn_id) {
        state.cables.remove(&channel_id).await;
    }
    tracing::info!(channel_id = %channel_id, conn_id = %conn_id, "connection closed");
}

/// Broadcast session: join on connect, fan out every frame, leave on
/// disconnect. The registry entry is dropped once the last member leaves.
async fn broadcast_session(socket: WebSocket, channel_id: String, state: Arc<RelayState>) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ConnHandle::new(tx);
    let conn_id = handle.id();
    let channel = state.broadcasts.resolve(&channel_id).await;
    channel.join(handle);
    tracing::info!(channel_id = %channel_id, conn_id = %conn_id, "connection joined broadcast channel");

    let mut write_task = tokio::spawn(write_loop(sink, rx));
    let relay_channel = Arc::clone(&channel);
    let mut read_task = tokio::spawn(raw_relay_loop(stream, move |frame| {
        relay_channel.relay(conn_id, frame);
    }));

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    let remaining = channel.leave(conn_id);
    if remaining == 0 {
        state.broadcasts.remove_if_vacant(&channel_id).await;
    }
    tracing::info!(channel_id = %channel_id, conn_id = %conn_id, remaining, "connection left broadcast channel");
}

// ---------------------------------------------------------------------------
// Reader/writer plumbing
// ---------------------------------------------------------------------------

/// Forwards queued frames to the socket until the queue closes, the socket
/// fails, or a close frame has been delivered.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if sink.send(frame).await.is_err() || closing {
            break;
        }
    }
}

/// Reader loop for paired channels: parses each text frame as a control
/// message and dispatches it.
async fn declared_role_loop(
    mut stream: SplitStream<WebSocket>,
    channel: Arc<PairChannel>,
    handle: ConnHandle,
) {
    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            Message::Text(text) => handle_control_frame(&channel, &handle, &text),
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Reader loop for raw topologies: every text or binary frame is relayed
/// verbatim, with no envelope parsing.
async fn raw_relay_loop(mut stream: SplitStream<WebSocket>, mut relay: impl FnMut(Message)) {
    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            Message::Text(_) | Message::Binary(_) => relay(frame),
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Dispatches one control frame from a paired-channel participant.
///
/// A parse failure is reported back to the sender and never closes the
/// connection; later frames are still processed.
fn handle_control_frame(channel: &PairChannel, handle: &ConnHandle, raw: &Utf8Bytes) {
    match envelope::decode(raw.as_str()) {
        Ok(ControlMessage::HelloClient) => declare_role(channel, handle, Role::Initiator),
        Ok(ControlMessage::HelloMessenger) => declare_role(channel, handle, Role::Responder),
        // Relay the original frame verbatim; the nested payload is opaque.
        Ok(ControlMessage::Message { .. }) => channel.relay(handle.id(), Message::Text(raw.clone())),
        Ok(other) => {
            tracing::debug!(channel_id = %channel.channel_id(), msg = ?other, "ignoring control message");
        }
        Err(e) => {
            tracing::warn!(channel_id = %channel.channel_id(), error = %e, "malformed control message");
            send_control(handle, &ControlMessage::Error {
                data: e.to_string(),
            });
        }
    }
}

/// Applies a role declaration, answering with `ack` or an `error` envelope.
fn declare_role(channel: &PairChannel, handle: &ConnHandle, role: Role) {
    match channel.set_role(role, handle.clone()) {
        Ok(phase) => {
            tracing::info!(
                channel_id = %channel.channel_id(),
                conn_id = %handle.id(),
                %role,
                ?phase,
                "role declared"
            );
            send_control(handle, &ControlMessage::Ack);
        }
        Err(e) => {
            tracing::warn!(
                channel_id = %channel.channel_id(),
                conn_id = %handle.id(),
                %role,
                error = %e,
                "role declaration rejected"
            );
            send_control(handle, &ControlMessage::Error {
                data: e.to_string(),
            });
        }
    }
}

fn send_control(handle: &ConnHandle, msg: &ControlMessage) {
    if let Ok(text) = envelope::encode(msg) {
        handle.send(Message::Text(text.into()));
    }
}
