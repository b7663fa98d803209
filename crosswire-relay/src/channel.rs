//! Channel state machines: exclusive pairs and broadcast groups.
//!
//! A channel owns the participants joined under one channel identifier and
//! applies the join rules, relay, and disposal for its topology. Channels
//! hold non-owning [`ConnHandle`]s — the sockets themselves live in the
//! session layer's writer tasks, and a handle only carries the sender half
//! of that task's queue plus a stable identity token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, close_code};
use crosswire_proto::envelope::{self, ControlMessage};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::ChannelKind;

/// Default delay before the `channel-ready` notification, in milliseconds.
///
/// Gives both ends of a fresh pairing time to finish their own setup before
/// traffic starts.
pub const DEFAULT_READY_DELAY_MS: u64 = 1000;

/// Stable identity token for one live connection.
pub type ConnId = Uuid;

/// Non-owning handle to one live connection.
///
/// Cloneable; all clones share the same identity token and feed the same
/// writer task. Sends are fire-and-forget — a send to a connection whose
/// writer has already shut down is a harmless no-op.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    id: ConnId,
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnHandle {
    /// Creates a handle with a fresh identity token around the sender half
    /// of a connection's writer queue.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::now_v7(),
            tx,
        }
    }

    /// The connection's identity token.
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queues a frame for delivery; returns `false` if the writer is gone.
    pub fn send(&self, frame: Message) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Queues a graceful close frame for delivery.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_owned().into(),
        })));
    }
}

/// The two named roles of an exclusive pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// First named role; declared on the wire as `hello-client`.
    Initiator,
    /// Second named role; declared on the wire as `hello-messenger`.
    Responder,
}

impl Role {
    /// The opposite role.
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initiator => f.write_str("initiator"),
            Self::Responder => f.write_str("responder"),
        }
    }
}

/// How a pair channel assigns its two role slots.
///
/// Both strategies drive the same slot logic; they only differ in who picks
/// the role — the connecting party (via `hello-*` control messages) or the
/// server (first free slot in connection order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStrategy {
    /// Roles are declared explicitly by control message.
    DeclaredRole,
    /// Roles are assigned by connection order; frames are relayed raw.
    ConnectionOrder,
}

/// Lifecycle phase of a pair channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPhase {
    /// No role occupied.
    Empty,
    /// Exactly one role occupied.
    Partial,
    /// Both roles occupied.
    Ready,
    /// Terminal; the channel accepts no further joins or relays.
    Disposed,
}

/// Protocol violations raised by channel operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The requested role slot is already occupied.
    #[error("{0} role is already taken")]
    RoleAlreadySet(Role),
    /// One connection attempted to occupy both roles.
    #[error("a connection cannot occupy both roles of a channel")]
    SelfPairing,
    /// Both role slots are occupied.
    #[error("channel is full")]
    ChannelFull,
    /// The channel has been disposed.
    #[error("channel is closed")]
    Disposed,
}

/// Construction settings for a pair channel.
#[derive(Debug, Clone)]
pub struct PairSettings {
    /// Role-assignment strategy for every channel in the registry.
    pub strategy: PairStrategy,
    /// Delay before the `channel-ready` notification.
    pub ready_delay: Duration,
}

impl Default for PairSettings {
    fn default() -> Self {
        Self {
            strategy: PairStrategy::DeclaredRole,
            ready_delay: Duration::from_millis(DEFAULT_READY_DELAY_MS),
        }
    }
}

#[derive(Debug, Default)]
struct PairSlots {
    initiator: Option<ConnHandle>,
    responder: Option<ConnHandle>,
    disposed: bool,
}

impl PairSlots {
    fn get(&self, role: Role) -> Option<&ConnHandle> {
        match role {
            Role::Initiator => self.initiator.as_ref(),
            Role::Responder => self.responder.as_ref(),
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<ConnHandle> {
        match role {
            Role::Initiator => &mut self.initiator,
            Role::Responder => &mut self.responder,
        }
    }

    /// Single slot-assignment step shared by both pairing strategies.
    fn fill(&mut self, role: Role, handle: ConnHandle) -> Result<(), ChannelError> {
        if self.get(role).is_some() {
            return Err(ChannelError::RoleAlreadySet(role));
        }
        if self
            .get(role.peer())
            .is_some_and(|peer| peer.id() == handle.id())
        {
            return Err(ChannelError::SelfPairing);
        }
        *self.slot_mut(role) = Some(handle);
        Ok(())
    }

    fn phase(&self) -> PairPhase {
        if self.disposed {
            PairPhase::Disposed
        } else {
            match (&self.initiator, &self.responder) {
                (Some(_), Some(_)) => PairPhase::Ready,
                (None, None) => PairPhase::Empty,
                _ => PairPhase::Partial,
            }
        }
    }

    fn is_member(&self, conn: ConnId) -> bool {
        self.initiator.as_ref().is_some_and(|h| h.id() == conn)
            || self.responder.as_ref().is_some_and(|h| h.id() == conn)
    }
}

/// Exclusive-pair channel: at most two participants, one per role.
///
/// State machine: `Empty → Partial → Ready → Disposed`. A role is set at
/// most once per channel lifetime, one connection may not occupy both
/// roles, and a disposed channel accepts no further joins or relays.
pub struct PairChannel {
    channel_id: String,
    created_at: Instant,
    strategy: PairStrategy,
    ready_delay: Duration,
    slots: Arc<Mutex<PairSlots>>,
}

impl PairChannel {
    /// Creates an empty channel for `channel_id`.
    #[must_use]
    pub fn new(channel_id: &str, settings: &PairSettings) -> Self {
        Self {
            channel_id: channel_id.to_owned(),
            created_at: Instant::now(),
            strategy: settings.strategy,
            ready_delay: settings.ready_delay,
            slots: Arc::new(Mutex::new(PairSlots::default())),
        }
    }

    /// The owning registry key.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// When the channel was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> PairPhase {
        self.slots.lock().phase()
    }

    /// Assigns `handle` to `role`.
    ///
    /// Entering [`PairPhase::Ready`] schedules the ready notification.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ChannelError::RoleAlreadySet`] if the slot is occupied,
    /// [`ChannelError::SelfPairing`] if `handle` already holds the other
    /// role, [`ChannelError::Disposed`] if the channel is closed.
    pub fn set_role(&self, role: Role, handle: ConnHandle) -> Result<PairPhase, ChannelError> {
        let phase = {
            let mut slots = self.slots.lock();
            if slots.disposed {
                return Err(ChannelError::Disposed);
            }
            slots.fill(role, handle)?;
            slots.phase()
        };
        if phase == PairPhase::Ready {
            self.on_ready();
        }
        Ok(phase)
    }

    /// Assigns `handle` to the first free role, in connection order.
    ///
    /// Same state machine as [`PairChannel::set_role`]; the server picks the
    /// role instead of the connecting party.
    ///
    /// # Errors
    ///
    /// [`ChannelError::ChannelFull`] if both slots are occupied,
    /// [`ChannelError::Disposed`] if the channel is closed.
    pub fn claim(&self, handle: ConnHandle) -> Result<PairPhase, ChannelError> {
        let phase = {
            let mut slots = self.slots.lock();
            if slots.disposed {
                return Err(ChannelError::Disposed);
            }
            let role = if slots.initiator.is_none() {
                Role::Initiator
            } else if slots.responder.is_none() {
                Role::Responder
            } else {
                return Err(ChannelError::ChannelFull);
            };
            slots.fill(role, handle)?;
            slots.phase()
        };
        if phase == PairPhase::Ready {
            self.on_ready();
        }
        Ok(phase)
    }

    /// Forwards `frame` to the role opposite the sender.
    ///
    /// A frame from a connection holding no role is dropped silently —
    /// forwarding requires an unambiguous single target. Fire-and-forget:
    /// a dead peer writer is not an error.
    pub fn relay(&self, sender: ConnId, frame: Message) {
        let slots = self.slots.lock();
        if slots.disposed {
            return;
        }
        let target = if slots.initiator.as_ref().is_some_and(|h| h.id() == sender) {
            slots.responder.as_ref()
        } else if slots.responder.as_ref().is_some_and(|h| h.id() == sender) {
            slots.initiator.as_ref()
        } else {
            tracing::debug!(
                channel_id = %self.channel_id,
                conn_id = %sender,
                "dropping frame from connection holding no role"
            );
            return;
        };
        if let Some(peer) = target {
            peer.send(frame);
        }
    }

    /// Disposes the channel if `conn` occupies either role.
    ///
    /// On disposal both occupied connections receive a graceful close and
    /// `true` is returned; the caller must then remove the channel from its
    /// registry. A non-member trigger (duplicate or late close event) is a
    /// no-op.
    pub fn dispose_if_member(&self, conn: ConnId) -> bool {
        let (initiator, responder) = {
            let mut slots = self.slots.lock();
            if slots.disposed || !slots.is_member(conn) {
                return false;
            }
            slots.disposed = true;
            (slots.initiator.take(), slots.responder.take())
        };
        for handle in [initiator, responder].into_iter().flatten() {
            handle.close(close_code::NORMAL, "channel closed");
        }
        tracing::info!(channel_id = %self.channel_id, "channel disposed");
        true
    }

    /// Schedules the delayed ready notification on entering `Ready`.
    ///
    /// Only declared-role channels carry a control plane; connection-order
    /// channels relay raw streams and get no injected envelope.
    fn on_ready(&self) {
        if self.strategy != PairStrategy::DeclaredRole {
            return;
        }
        let slots = Arc::clone(&self.slots);
        let delay = self.ready_delay;
        let channel_id = self.channel_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let guard = slots.lock();
            // The channel may have been disposed while we slept.
            if guard.disposed {
                return;
            }
            if let (Some(initiator), Some(responder)) = (&guard.initiator, &guard.responder)
                && let Ok(text) = envelope::encode(&ControlMessage::ChannelReady)
            {
                initiator.send(Message::Text(text.clone().into()));
                responder.send(Message::Text(text.into()));
                tracing::info!(channel_id = %channel_id, "channel ready");
            }
        });
    }
}

impl ChannelKind for PairChannel {
    type Settings = PairSettings;

    fn open(id: &str, settings: &Self::Settings) -> Self {
        Self::new(id, settings)
    }

    fn is_vacant(&self) -> bool {
        let slots = self.slots.lock();
        slots.disposed || (slots.initiator.is_none() && slots.responder.is_none())
    }
}

/// Broadcast channel: unbounded anonymous membership, fan-out relay.
pub struct BroadcastChannel {
    channel_id: String,
    created_at: Instant,
    members: Mutex<HashMap<ConnId, ConnHandle>>,
}

impl BroadcastChannel {
    /// Creates an empty channel for `channel_id`.
    #[must_use]
    pub fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_owned(),
            created_at: Instant::now(),
            members: Mutex::new(HashMap::new()),
        }
    }

    /// The owning registry key.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// When the channel was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Adds a member; joining an already-member connection is a no-op.
    pub fn join(&self, handle: ConnHandle) {
        self.members.lock().entry(handle.id()).or_insert(handle);
    }

    /// Current membership count.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Forwards `frame` to every member except the sender.
    ///
    /// A failed send to one member (e.g. a writer that already shut down)
    /// never aborts delivery to the rest.
    pub fn relay(&self, sender: ConnId, frame: Message) {
        let members = self.members.lock();
        for (id, member) in members.iter() {
            if *id == sender {
                continue;
            }
            if !member.send(frame.clone()) {
                tracing::debug!(
                    channel_id = %self.channel_id,
                    conn_id = %id,
                    "skipping member with closed writer"
                );
            }
        }
    }

    /// Removes a member if present; idempotent. Returns the remaining
    /// membership count.
    pub fn leave(&self, conn: ConnId) -> usize {
        let mut members = self.members.lock();
        members.remove(&conn);
        members.len()
    }
}

impl ChannelKind for BroadcastChannel {
    type Settings = ();

    fn open(id: &str, _settings: &Self::Settings) -> Self {
        Self::new(id)
    }

    fn is_vacant(&self) -> bool {
        self.members.lock().is_empty()
    }
}
