use crate::config::SessionConfig;
use crate::{Frame, INITIAL_FRAME};

/// Tracks the simulation clocks of this peer and its remotes, and decides
/// when the local simulation may advance and when it must roll back.
///
/// Three frame counters drive the engine:
///
/// - `local_frame` — the most recently simulated local frame,
/// - `remote_frame` — the minimum, over all remote devices, of the last
///   input frame received from them,
/// - `sync_frame` — the highest frame for which every device's prediction
///   has been verified correct (or no prediction existed). Everything at or
///   before `sync_frame` is authoritative.
///
/// The *advantage* comparison throttles whichever peer runs ahead: a peer
/// that is several frames ahead of the inputs it has received, and further
/// ahead than its remotes report being, stalls for one frame so the clocks
/// converge.
#[derive(Debug, Clone)]
pub struct TimeSync {
    local_frame: Frame,
    remote_frame: Frame,
    sync_frame: Frame,
    /// The largest frame advantage any remote device has reported.
    remote_advantage: i32,
    min_frame_advantage: i32,
    frame_advantage_difference: i32,
    max_rollback_frames: usize,
}

impl TimeSync {
    /// Creates a new `TimeSync` with the thresholds from `config`.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            local_frame: INITIAL_FRAME,
            remote_frame: Frame::NULL,
            sync_frame: Frame::NULL,
            remote_advantage: 0,
            min_frame_advantage: config.min_frame_advantage,
            frame_advantage_difference: config.frame_advantage_difference,
            max_rollback_frames: config.max_rollback_frames,
        }
    }

    /// The most recently simulated local frame.
    #[must_use]
    pub fn local_frame(&self) -> Frame {
        self.local_frame
    }

    /// The minimum last-received input frame over all remote devices.
    #[must_use]
    pub fn remote_frame(&self) -> Frame {
        self.remote_frame
    }

    /// The highest frame verified authoritative for every device.
    #[must_use]
    pub fn sync_frame(&self) -> Frame {
        self.sync_frame
    }

    /// How far the local simulation runs ahead of the inputs it has received.
    #[must_use]
    pub fn local_advantage(&self) -> i32 {
        self.local_frame - self.remote_frame
    }

    pub(crate) fn advance_local(&mut self) {
        self.local_frame += 1;
    }

    pub(crate) fn set_sync_frame(&mut self, frame: Frame) {
        self.sync_frame = frame;
    }

    /// Folds the per-device trackers into the aggregate view: the remote
    /// frame is the *minimum* over devices (the slowest peer gates
    /// verification), the remote advantage the *maximum* (the most starved
    /// peer gates throttling). With no remote devices every local frame is
    /// immediately authoritative.
    pub(crate) fn observe_remotes<I>(&mut self, remotes: I)
    where
        I: IntoIterator<Item = (Frame, i32)>,
    {
        let mut min_frame: Option<Frame> = None;
        let mut max_advantage: Option<i32> = None;
        for (frame, advantage) in remotes {
            min_frame = Some(min_frame.map_or(frame, |m| m.min(frame)));
            max_advantage = Some(max_advantage.map_or(advantage, |m| m.max(advantage)));
        }
        self.remote_frame = min_frame.unwrap_or(self.local_frame);
        self.remote_advantage = max_advantage.unwrap_or(0);
    }

    /// Returns `true` when this peer should advance its local frame this
    /// tick, `false` when it should stall one frame.
    ///
    /// The peer stalls when it is at least `min_frame_advantage` frames ahead
    /// of the inputs it has received *and* its advantage exceeds the largest
    /// advantage its remotes report by `frame_advantage_difference` or more.
    /// Independently, the peer never runs more than `max_rollback_frames`
    /// past its sync frame: state older than the rollback window could not be
    /// corrected.
    #[must_use]
    pub fn is_time_synced(&self) -> bool {
        let frames_unverified = self.local_frame - self.sync_frame;
        if frames_unverified >= self.max_rollback_frames as i32 {
            return false;
        }
        let local_advantage = self.local_advantage();
        let throttled = local_advantage >= self.min_frame_advantage
            && local_advantage - self.remote_advantage >= self.frame_advantage_difference;
        !throttled
    }

    /// Returns `true` when the simulation must be rolled back: a frame past
    /// `sync_frame` has been simulated speculatively, and authoritative
    /// inputs beyond `sync_frame` now exist for every device.
    #[must_use]
    pub fn should_rollback(&self) -> bool {
        self.local_frame > self.sync_frame && self.remote_frame > self.sync_frame
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod time_sync_tests {
    use super::*;
    use crate::config::SessionConfig;

    fn time_sync() -> TimeSync {
        TimeSync::new(&SessionConfig::default())
    }

    #[test]
    fn initial_counters() {
        let ts = time_sync();
        assert_eq!(ts.local_frame(), INITIAL_FRAME);
        assert!(ts.remote_frame().is_null());
        assert!(ts.sync_frame().is_null());
    }

    #[test]
    fn no_remotes_means_always_synced() {
        let mut ts = time_sync();
        for _ in 0..20 {
            ts.observe_remotes(std::iter::empty());
            // every local frame is authoritative without remotes
            ts.set_sync_frame(ts.local_frame());
            assert!(ts.is_time_synced());
            ts.advance_local();
        }
        assert_eq!(ts.local_frame(), 20);
    }

    #[test]
    fn stalls_when_far_ahead_of_silent_remote() {
        let mut ts = time_sync();
        ts.observe_remotes([(Frame::NULL, 0)]);
        // local 0, remote -1: advantage 1, below the threshold
        assert!(ts.is_time_synced());
        ts.advance_local();
        ts.advance_local();
        // local 2, remote -1: advantage 3, difference 3 -> stall
        assert!(!ts.is_time_synced());
    }

    #[test]
    fn keeps_running_when_remote_equally_starved() {
        let mut ts = time_sync();
        ts.advance_local();
        ts.advance_local();
        ts.advance_local();
        ts.set_sync_frame(Frame::new(0));
        // local advantage 3 meets the threshold, but the remote reports
        // being nearly as far ahead, so the difference stays small
        ts.observe_remotes([(Frame::new(0), 2)]);
        assert!(ts.is_time_synced());
    }

    #[test]
    fn remote_frame_is_minimum_over_devices() {
        let mut ts = time_sync();
        ts.observe_remotes([(Frame::new(5), 0), (Frame::new(3), 2), (Frame::new(7), 1)]);
        assert_eq!(ts.remote_frame(), Frame::new(3));
        // and the advantage used is the maximum
        assert_eq!(ts.remote_advantage, 2);
    }

    #[test]
    fn never_outruns_the_rollback_window() {
        let mut ts = time_sync();
        // remote keeps pace frame-wise but verification lags
        for _ in 0..8 {
            ts.advance_local();
        }
        ts.observe_remotes([(ts.local_frame(), 0)]);
        ts.set_sync_frame(Frame::new(0));
        assert_eq!(ts.local_frame() - ts.sync_frame(), 8);
        assert!(!ts.is_time_synced());
        ts.set_sync_frame(Frame::new(1));
        assert!(ts.is_time_synced());
    }

    #[test]
    fn rollback_requires_inputs_past_sync_frame() {
        let mut ts = time_sync();
        for _ in 0..5 {
            ts.advance_local();
        }
        ts.set_sync_frame(Frame::new(4));
        // remote inputs only reach the sync frame: nothing to correct
        ts.observe_remotes([(Frame::new(4), 0)]);
        assert!(!ts.should_rollback());
        // a newer authoritative input exists: roll back
        ts.observe_remotes([(Frame::new(5), 0)]);
        assert!(ts.should_rollback());
    }

    #[test]
    fn no_rollback_when_fully_verified() {
        let mut ts = time_sync();
        ts.advance_local();
        ts.set_sync_frame(Frame::new(1));
        ts.observe_remotes([(Frame::new(1), 0)]);
        assert!(!ts.should_rollback());
    }
}
