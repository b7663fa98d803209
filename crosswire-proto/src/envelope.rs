//! Control-message envelope for paired channels.
//!
//! Defines the [`ControlMessage`] enum that is JSON-encoded and sent over
//! WebSocket text frames on paired channels. Raw topologies (cable,
//! broadcast) carry opaque frames and never use this envelope.

use serde::{Deserialize, Serialize};

/// Messages exchanged between clients and the relay on a paired channel.
///
/// The envelope is intentionally small: two role declarations, an opaque
/// relayed payload, and three server-originated signals. The relay never
/// inspects the `data` of a [`ControlMessage::Message`] — it forwards the
/// original frame verbatim and only reads the `type` tag for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Declares the sending connection as the channel's initiator.
    ///
    /// Acknowledged with [`ControlMessage::Ack`] on success.
    HelloClient,

    /// Declares the sending connection as the channel's responder.
    ///
    /// Acknowledged with [`ControlMessage::Ack`] on success.
    HelloMessenger,

    /// An opaque payload to be relayed to the channel peer.
    Message {
        /// Arbitrary nested payload; not interpreted by the relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    /// Server acknowledges a successful role declaration.
    Ack,

    /// Server reports a protocol violation or a malformed frame.
    Error {
        /// Human-readable description of what went wrong.
        data: String,
    },

    /// Server signals both peers that pairing completed.
    ChannelReady,
}

/// Error type for envelope encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The frame is not a valid control message.
    #[error("malformed control message: {0}")]
    Malformed(String),
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes a [`ControlMessage`] into its JSON wire form.
///
/// # Errors
///
/// Returns [`EnvelopeError::Serialization`] if the message cannot be
/// serialized.
pub fn encode(msg: &ControlMessage) -> Result<String, EnvelopeError> {
    serde_json::to_string(msg).map_err(|e| EnvelopeError::Serialization(e.to_string()))
}

/// Decodes a [`ControlMessage`] from a JSON text frame.
///
/// # Errors
///
/// Returns [`EnvelopeError::Malformed`] if the frame is not valid JSON or
/// does not carry a recognized `type` tag.
pub fn decode(raw: &str) -> Result<ControlMessage, EnvelopeError> {
    serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}
