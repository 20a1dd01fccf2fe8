//! Session tunables.
//!
//! Every compiled-in constant of the synchronization core that reasonably
//! varies between deployments is gathered here, so hosts can tune the
//! latency/smoothness trade-off without patching the crate.

use web_time::Duration;

use crate::{RollsyncError, RollsyncResult};

/// Default number of frames the engine may run past its last verified frame.
pub const DEFAULT_MAX_ROLLBACK_FRAMES: usize = 8;

/// Default number of trailing frames re-sent with every input broadcast.
pub const DEFAULT_INPUT_REDUNDANCY_FRAMES: usize = 8;

/// Default minimum local advantage before a stall is considered.
pub const DEFAULT_MIN_FRAME_ADVANTAGE: i32 = 3;

/// Default advantage difference at which the faster peer stalls.
pub const DEFAULT_FRAME_ADVANTAGE_DIFFERENCE: i32 = 2;

/// Configuration for a [`Session`](crate::Session).
///
/// The defaults match a 60 Hz simulation on a consumer connection. Raising
/// `max_rollback_frames` tolerates more latency at the cost of memory and
/// longer re-simulations; raising `input_redundancy_frames` masks more packet
/// loss at the cost of bandwidth.
///
/// # Examples
///
/// ```
/// use rollsync::SessionConfig;
///
/// let config = SessionConfig {
///     max_rollback_frames: 10,
///     input_redundancy_frames: 10,
///     ..SessionConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// The maximum number of frames the simulation may run past its last
    /// verified frame. Every state older than this window is authoritative
    /// and can no longer be corrected. Sized with the state ring: the ring
    /// holds `max_rollback_frames + 1` slots.
    pub max_rollback_frames: usize,
    /// How many trailing frames each input broadcast repeats. The redundancy
    /// window masks datagram loss without retransmission logic; it must not
    /// exceed `max_rollback_frames`, or broadcasts would reference inputs the
    /// ring has already dropped.
    pub input_redundancy_frames: usize,
    /// The local advantage (frames simulated past the last received remote
    /// input) below which the peer never stalls.
    pub min_frame_advantage: i32,
    /// The difference between the local advantage and the largest advantage
    /// reported by a remote at which the faster peer stalls one frame.
    pub frame_advantage_difference: i32,
    /// How often a `SyncRequest` is re-sent while a device is still
    /// unverified.
    pub sync_retry_interval: Duration,
    /// How often a quality report is sent to each verified device.
    pub quality_report_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rollback_frames: DEFAULT_MAX_ROLLBACK_FRAMES,
            input_redundancy_frames: DEFAULT_INPUT_REDUNDANCY_FRAMES,
            min_frame_advantage: DEFAULT_MIN_FRAME_ADVANTAGE,
            frame_advantage_difference: DEFAULT_FRAME_ADVANTAGE_DIFFERENCE,
            sync_retry_interval: Duration::from_millis(250),
            quality_report_interval: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    /// Creates a configuration with the default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    /// Returns [`RollsyncError::InvalidRequest`] describing the first
    /// violated constraint.
    pub fn validate(&self) -> RollsyncResult<()> {
        if self.max_rollback_frames == 0 {
            return Err(RollsyncError::InvalidRequest {
                info: "max_rollback_frames must be at least 1".to_owned(),
            });
        }
        if self.input_redundancy_frames > self.max_rollback_frames {
            return Err(RollsyncError::InvalidRequest {
                info: format!(
                    "input_redundancy_frames ({}) must not exceed max_rollback_frames ({})",
                    self.input_redundancy_frames, self.max_rollback_frames
                ),
            });
        }
        if self.min_frame_advantage < 1 {
            return Err(RollsyncError::InvalidRequest {
                info: "min_frame_advantage must be at least 1".to_owned(),
            });
        }
        if self.frame_advantage_difference < 1 {
            return Err(RollsyncError::InvalidRequest {
                info: "frame_advantage_difference must be at least 1".to_owned(),
            });
        }
        if self.sync_retry_interval.is_zero() {
            return Err(RollsyncError::InvalidRequest {
                info: "sync_retry_interval must be non-zero".to_owned(),
            });
        }
        if self.quality_report_interval.is_zero() {
            return Err(RollsyncError::InvalidRequest {
                info: "quality_report_interval must be non-zero".to_owned(),
            });
        }
        Ok(())
    }
}

// #########
// # TESTS #
// #########
