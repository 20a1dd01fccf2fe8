//! # rollsync
//!
//! `rollsync` is a peer-to-peer rollback synchronization core for real-time
//! simulations in which every participant runs the full game deterministically
//! and must agree, frame by frame, on the inputs of all players.
//!
//! The crate hides round-trip latency by speculatively advancing the local
//! simulation with predicted remote inputs, detecting when a prediction
//! disagrees with the authoritative input received from a peer, and rolling
//! the simulation back to the last verified frame to re-advance it with
//! corrected inputs. Instead of callbacks, every call to
//! [`Session::advance_frame`] returns an ordered list of [`Directive`]s
//! (save state, load state, advance one frame) for the host loop to fulfill.
//!
//! ```
//! use rollsync::{DeviceId, Directive, Session, SessionConfig};
//!
//! let mut session = Session::new(1, SessionConfig::default())?;
//! session.set_local_device(DeviceId::new(0), 1, 0)?;
//!
//! // A session with no remote devices starts running after the first poll.
//! session.poll();
//! assert!(session.is_running());
//!
//! for directive in session.advance_frame(&[0x00])? {
//!     match directive {
//!         Directive::Save { frame, cell } => {
//!             cell.save(frame, b"serialized game state".to_vec());
//!         }
//!         Directive::Load { cell, .. } => {
//!             let _state = cell.load();
//!         }
//!         Directive::Advance { frame, inputs } => {
//!             // step the simulation one frame using `inputs`
//!             let _ = (frame, inputs);
//!         }
//!     }
//! }
//! # Ok::<(), rollsync::RollsyncError>(())
//! ```
//!
//! The core is single-threaded and cooperatively driven: a typical tick is
//! [`Session::poll`] followed by [`Session::advance_frame`], and neither call
//! suspends. Datagram transport is injected per remote device through the
//! [`DeviceAdapter`] capability.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use config::SessionConfig;
pub use device::{DeviceRole, DeviceStats, HandshakeState};
pub use error::{RollsyncError, RollsyncResult};
pub use frame_info::GameInput;
pub use network::adapter::{DeviceAdapter, UdpDeviceAdapter};
pub use network::loopback::LoopbackAdapter;
pub use network::messages::Message;
pub use session::Session;
pub use state_storage::StateCell;
pub use sync_engine::{Directive, DirectiveVec};

pub mod config;
#[doc(hidden)]
pub mod device;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
#[doc(hidden)]
pub mod input_queue;
/// Convenient re-exports for common usage.
pub mod prelude;
#[doc(hidden)]
pub mod session;
#[doc(hidden)]
pub mod state_storage;
#[doc(hidden)]
pub mod sync_engine;
#[doc(hidden)]
pub mod time_sync;
#[doc(hidden)]
pub mod network {
    #[doc(hidden)]
    pub mod adapter;
    #[doc(hidden)]
    pub mod codec;
    #[doc(hidden)]
    pub mod loopback;
    #[doc(hidden)]
    pub mod messages;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// The frame that denotes the initial, pre-simulation state of a session.
///
/// The first [`Directive::Save`] a session emits targets this frame, so that
/// a misprediction in the very first simulated frame can still be rolled back.
pub const INITIAL_FRAME: Frame = Frame::new(0);

/// The maximum number of devices a session supports.
///
/// The synchronization protocol is a full mesh; beyond a handful of peers the
/// redundant input traffic grows quadratically, so the cap is deliberately
/// small.
pub const MAX_DEVICES: usize = 8;

/// A frame is a single step of simulation execution.
///
/// Frames are the fundamental unit of time in rollback networking. Frame
/// numbers start at [`INITIAL_FRAME`] (0) and increment sequentially; the
/// special value [`NULL_FRAME`] (-1) represents "no frame yet".
///
/// `Frame` is a newtype around `i32` so that frame counters cannot be
/// accidentally mixed with other integers.
///
/// # Examples
///
/// ```
/// use rollsync::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!((frame + 1).as_i32(), 1);
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Self = Self(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Self(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Calculates the ring-buffer slot for this frame.
    ///
    /// Returns `None` if the frame is negative or `capacity` is zero.
    ///
    /// ```
    /// use rollsync::Frame;
    ///
    /// assert_eq!(Frame::new(7).buffer_index(4), Some(3));
    /// assert_eq!(Frame::NULL.buffer_index(4), None);
    /// ```
    #[inline]
    #[must_use]
    pub const fn buffer_index(self, capacity: usize) -> Option<usize> {
        if self.0 >= 0 && capacity > 0 {
            Some(self.0 as usize % capacity)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl std::ops::Sub<Self> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// A unique identifier for a device in a session.
///
/// A device is one participating machine; it may carry the inputs of more
/// than one player. Device ids establish the canonical ordering of combined
/// input buffers: [`Directive::Advance`] concatenates per-device inputs in
/// ascending device-id order, so all peers must register devices under the
/// same ids.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceId(usize);

impl DeviceId {
    /// Creates a new `DeviceId` from a `usize` value.
    #[inline]
    #[must_use]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl From<usize> for DeviceId {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// A session is always in one of these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// The session is verifying its remote devices via the handshake
    /// protocol and does not accept input yet.
    Synchronizing,
    /// All remote devices are verified; the session accepts and transmits
    /// player input.
    Running,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synchronizing => write!(f, "Synchronizing"),
            Self::Running => write!(f, "Running"),
        }
    }
}

#[cfg(test)]
mod frame_tests {
    use super::*;

    #[test]
    fn null_frame_is_null() {
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
        assert_eq!(Frame::NULL.as_i32(), NULL_FRAME);
    }

    #[test]
    fn frame_arithmetic() {
        let f = Frame::new(5);
        assert_eq!(f + 1, Frame::new(6));
        assert_eq!(f - 2, Frame::new(3));
        assert_eq!(Frame::new(8) - Frame::new(5), 3);
        let mut g = Frame::new(0);
        g += 4;
        assert_eq!(g, 4);
    }

    #[test]
    fn frame_comparison_with_i32() {
        assert!(Frame::new(3) > 2);
        assert!(Frame::new(3) == 3);
        assert!(Frame::NULL < 0);
    }

    #[test]
    fn buffer_index_wraps() {
        assert_eq!(Frame::new(0).buffer_index(9), Some(0));
        assert_eq!(Frame::new(9).buffer_index(9), Some(0));
        assert_eq!(Frame::new(13).buffer_index(9), Some(4));
        assert_eq!(Frame::NULL.buffer_index(9), None);
        assert_eq!(Frame::new(5).buffer_index(0), None);
    }

    #[test]
    fn frame_display() {
        assert_eq!(Frame::new(42).to_string(), "42");
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
    }

    #[test]
    fn device_id_ordering() {
        assert!(DeviceId::new(0) < DeviceId::new(1));
        assert_eq!(DeviceId::new(3).as_usize(), 3);
    }
}
