use crate::{Frame, RollsyncError, RollsyncResult};

/// The raw input bytes of all players of a single device for a single frame.
///
/// A `GameInput` is immutable once it has been handed to a queue. The payload
/// is `player_count * size_per_player` bytes, with each player's slice stored
/// contiguously in player order. A `GameInput` whose frame is
/// [`Frame::NULL`] represents an absent or uninitialized slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInput {
    /// The frame to which this input belongs. [`Frame::NULL`] represents an
    /// absent input.
    pub frame: Frame,
    size_per_player: usize,
    player_count: usize,
    bytes: Vec<u8>,
}

impl GameInput {
    /// Creates a zero-filled input for `player_count` players of
    /// `size_per_player` bytes each.
    #[must_use]
    pub fn new(frame: Frame, size_per_player: usize, player_count: usize) -> Self {
        Self {
            frame,
            size_per_player,
            player_count,
            bytes: vec![0; size_per_player * player_count],
        }
    }

    /// Creates an input with the given payload.
    ///
    /// # Errors
    /// Returns [`RollsyncError::SizeMismatch`] if `bytes` is not exactly
    /// `player_count * size_per_player` bytes long.
    pub fn from_bytes(
        frame: Frame,
        size_per_player: usize,
        player_count: usize,
        bytes: &[u8],
    ) -> RollsyncResult<Self> {
        let expected = size_per_player * player_count;
        if bytes.len() != expected {
            return Err(RollsyncError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            frame,
            size_per_player,
            player_count,
            bytes: bytes.to_vec(),
        })
    }

    /// Overwrites the slices of `player_count` players starting at
    /// `player_offset`.
    ///
    /// # Errors
    /// Returns [`RollsyncError::SizeMismatch`] if `bytes` is not exactly
    /// `player_count * size_per_player` bytes long, and
    /// [`RollsyncError::InvalidRequest`] if the player range does not fit
    /// into this input.
    pub fn set_slice(
        &mut self,
        player_offset: usize,
        player_count: usize,
        bytes: &[u8],
    ) -> RollsyncResult<()> {
        let expected = player_count * self.size_per_player;
        if bytes.len() != expected {
            return Err(RollsyncError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        if player_offset + player_count > self.player_count {
            return Err(RollsyncError::InvalidRequest {
                info: format!(
                    "player range {}..{} exceeds player count {}",
                    player_offset,
                    player_offset + player_count,
                    self.player_count
                ),
            });
        }
        let start = player_offset * self.size_per_player;
        self.bytes[start..start + expected].copy_from_slice(bytes);
        Ok(())
    }

    /// Byte-wise equality over the payload. With `include_frame`, the frames
    /// must match as well.
    #[must_use]
    pub fn equal(&self, other: &Self, include_frame: bool) -> bool {
        (!include_frame || self.frame == other.frame) && self.bytes == other.bytes
    }

    /// Returns the payload bytes of all players.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the per-player input size in bytes.
    #[must_use]
    pub fn size_per_player(&self) -> usize {
        self.size_per_player
    }

    /// Returns the number of players covered by this input.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.player_count
    }

    /// Returns a copy of this input re-stamped with another frame number.
    #[must_use]
    pub(crate) fn with_frame(&self, frame: Frame) -> Self {
        let mut input = self.clone();
        input.frame = frame;
        input
    }
}

// #########
// # TESTS #
// #########
