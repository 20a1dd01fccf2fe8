use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::device::DeviceRole;
use crate::{DeviceId, Frame};

/// A specialized `Result` type for rollsync operations.
///
/// The second type parameter can be overridden for functions that return a
/// different error type. The alias is named `RollsyncResult` rather than
/// `Result` so that glob imports never shadow `std::result::Result`.
pub type RollsyncResult<T, E = RollsyncError> = std::result::Result<T, E>;

/// Errors that can occur during a rollsync session.
///
/// Every variant represents a caller-contract violation and is fatal to the
/// session. Transport-level anomalies (undecodable datagrams, datagrams from
/// unknown senders, duplicate acknowledgements, out-of-order input frames)
/// are deliberately *not* represented here: the message protocol is
/// idempotent over its message set, so the session absorbs them silently.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RollsyncError {
    /// Caller-supplied input bytes do not match the registered input size.
    SizeMismatch {
        /// The number of bytes the operation requires
        /// (`player_count * size_per_player`).
        expected: usize,
        /// The number of bytes the caller supplied.
        actual: usize,
    },
    /// An operation reserved for one device role was invoked on the other.
    WrongDeviceRole {
        /// The device the operation targeted.
        device: DeviceId,
        /// The role the operation requires.
        expected: DeviceRole,
    },
    /// A state slot was requested for a frame that is no longer (or not yet)
    /// inside the storage ring's window.
    FrameOutOfWindow {
        /// The requested frame.
        frame: Frame,
        /// The frame currently occupying the slot.
        stored: Frame,
    },
    /// A state load was issued for a slot that was never written.
    ///
    /// This indicates a scheduler bug: the engine never emits a
    /// [`Directive::Load`](crate::Directive::Load) without a prior matching
    /// save for that frame, so an empty slot means the host skipped a
    /// [`Directive::Save`](crate::Directive::Save).
    MissingState {
        /// The frame whose slot was empty.
        frame: Frame,
    },
    /// The session is not yet ready to accept input.
    ///
    /// Either wait for the handshake with all remote devices to complete, or
    /// check [`Session::is_running`](crate::Session::is_running) first.
    NotSynchronized,
    /// A provided argument or requested operation is invalid.
    InvalidRequest {
        /// Human-readable details about the invalid request.
        info: String,
    },
}

impl Display for RollsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch { expected, actual } => {
                write!(
                    f,
                    "input size mismatch: expected {} bytes, got {}",
                    expected, actual
                )
            }
            Self::WrongDeviceRole { device, expected } => {
                write!(f, "{} does not have the required role {}", device, expected)
            }
            Self::FrameOutOfWindow { frame, stored } => {
                write!(
                    f,
                    "state slot for frame {} is outside the ring window (slot now holds frame {})",
                    frame, stored
                )
            }
            Self::MissingState { frame } => {
                write!(
                    f,
                    "no state saved for frame {}; a save directive was not fulfilled",
                    frame
                )
            }
            Self::NotSynchronized => {
                write!(
                    f,
                    "the session is not yet synchronized with all remote devices"
                )
            }
            Self::InvalidRequest { info } => {
                write!(f, "invalid request: {}", info)
            }
        }
    }
}

impl Error for RollsyncError {}
