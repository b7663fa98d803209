//! Channel-identifier rules.
//!
//! Channel identifiers are opaque tokens supplied by the connecting party
//! and used verbatim as registry keys. They are distributed out of band
//! (QR code, copied link), so the only server-side defense against guessing
//! is a minimum length. Cable channels use a stricter fixed-length format.

/// Minimum accepted channel identifier length.
pub const MIN_CHANNEL_ID_LEN: usize = 16;

/// Exact cable identifier length: 16 hex-encoded bytes plus a 1-character
/// separator.
pub const CABLE_ID_LEN: usize = 16 * 2 + 1;

/// Validation failures for channel identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentError {
    /// Identifier is shorter than [`MIN_CHANNEL_ID_LEN`].
    #[error("channel id must be at least {MIN_CHANNEL_ID_LEN} characters, got {0}")]
    TooShort(usize),
    /// Cable identifier is not exactly [`CABLE_ID_LEN`] characters.
    #[error("cable id must be exactly {CABLE_ID_LEN} characters, got {0}")]
    BadCableLength(usize),
}

/// Validates an identifier for paired and broadcast channels.
///
/// # Errors
///
/// Returns [`IdentError::TooShort`] if the identifier is shorter than the
/// minimum length.
pub fn validate_channel_id(id: &str) -> Result<(), IdentError> {
    if id.len() < MIN_CHANNEL_ID_LEN {
        return Err(IdentError::TooShort(id.len()));
    }
    Ok(())
}

/// Validates a cable channel identifier.
///
/// # Errors
///
/// Returns [`IdentError::BadCableLength`] unless the identifier is exactly
/// [`CABLE_ID_LEN`] characters.
pub fn validate_cable_id(id: &str) -> Result<(), IdentError> {
    if id.len() != CABLE_ID_LEN {
        return Err(IdentError::BadCableLength(id.len()));
    }
    Ok(())
}
