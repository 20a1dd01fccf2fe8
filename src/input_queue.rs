use tracing::warn;

use crate::frame_info::GameInput;
use crate::{Frame, RollsyncError, RollsyncResult};

/// Extra ring slots beyond the rollback window, so that confirmed inputs for
/// the redundant broadcast window survive a peer running slightly ahead.
const QUEUE_SLACK: usize = 2;

/// `InputQueue` holds the inputs of a single device, indexed by frame.
///
/// Two logical streams live side by side in ring buffers of the same
/// capacity:
///
/// - *confirmed* inputs — inputs actually received (local inputs upon
///   submission, remote inputs upon message receipt). Once written, a
///   confirmed input is never replaced by a different value; duplicate
///   writes with equal bytes are idempotent.
/// - *prediction records* — speculative inputs synthesized by
///   [`get_input`](InputQueue::get_input) when the confirmed input for a
///   frame has not arrived yet. A record is kept until the engine consults
///   it for mismatch detection and clears it via
///   [`reset_prediction`](InputQueue::reset_prediction).
///
/// Local queues carry a *frame delay*: an input submitted for frame `f`
/// becomes visible at frame `f + delay`. Remote queues have a delay of zero.
#[derive(Debug, Clone)]
pub struct InputQueue {
    player_count: usize,
    input_size: usize,
    frame_delay: usize,
    capacity: usize,
    confirmed: Vec<GameInput>,
    predicted: Vec<GameInput>,
    /// The most recent frame holding a confirmed input.
    last_added_frame: Frame,
}

impl InputQueue {
    /// Creates a queue for a device with `player_count` players of
    /// `input_size` bytes each.
    ///
    /// The ring capacity is `max_rollback_frames + frame_delay` plus a small
    /// slack, so every frame the engine can still roll back to (or rebroadcast)
    /// stays resident.
    #[must_use]
    pub fn new(
        player_count: usize,
        input_size: usize,
        frame_delay: usize,
        max_rollback_frames: usize,
    ) -> Self {
        let capacity = max_rollback_frames + frame_delay + QUEUE_SLACK;
        let blank = GameInput::new(Frame::NULL, input_size, player_count);
        Self {
            player_count,
            input_size,
            frame_delay,
            capacity,
            confirmed: vec![blank.clone(); capacity],
            predicted: vec![blank; capacity],
            last_added_frame: Frame::NULL,
        }
    }

    /// Returns the queue's frame delay.
    #[must_use]
    pub fn frame_delay(&self) -> usize {
        self.frame_delay
    }

    /// Returns the number of players whose inputs this queue carries.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.player_count
    }

    /// Returns the most recent frame holding a confirmed input, or
    /// [`Frame::NULL`] if nothing has been added yet.
    #[must_use]
    pub fn last_added_frame(&self) -> Frame {
        self.last_added_frame
    }

    /// Stores `input` as the confirmed input for frame `frame`.
    ///
    /// On queues with a frame delay `d`, the input is stored at `frame + d`;
    /// the frame gap opened by the delay on the very first submission is
    /// filled with zero inputs, so peers predicting a blank input verify
    /// cleanly. Returns the frame the input was actually stored at.
    ///
    /// A duplicate write with equal bytes is a no-op; a write that disagrees
    /// with an already confirmed input is discarded (the first value stands),
    /// since the wire protocol may legitimately re-deliver frames.
    ///
    /// # Errors
    /// Returns [`RollsyncError::SizeMismatch`] if the input's layout does not
    /// match the queue, and [`RollsyncError::InvalidRequest`] for a null
    /// frame.
    pub fn add_input(&mut self, frame: Frame, input: &GameInput) -> RollsyncResult<Frame> {
        if input.player_count() != self.player_count
            || input.size_per_player() != self.input_size
        {
            return Err(RollsyncError::SizeMismatch {
                expected: self.player_count * self.input_size,
                actual: input.player_count() * input.size_per_player(),
            });
        }
        if !frame.is_valid() {
            return Err(RollsyncError::InvalidRequest {
                info: format!("cannot add input for invalid frame {}", frame),
            });
        }

        let target = frame + self.frame_delay as i32;

        // idempotence: a slot already confirmed for this frame is final
        if let Some(existing) = self.confirmed_input(target) {
            if !existing.equal(input, false) {
                warn!(
                    frame = target.as_i32(),
                    "discarding conflicting rewrite of a confirmed input"
                );
            }
            return Ok(target);
        }

        // a frame so old its slot has been recycled must not clobber the
        // newer occupant; the redundancy window never legitimately reaches
        // this far back
        if !self.last_added_frame.is_null()
            && target < self.last_added_frame - (self.capacity as i32 - 1)
        {
            return Ok(target);
        }

        // the delay opens a gap below the first stored frame; confirm zero
        // inputs for it so the frames are resolvable on every peer
        if self.frame_delay > 0 && self.last_added_frame.is_null() {
            for gap in frame.as_i32()..target.as_i32() {
                let gap_frame = Frame::new(gap);
                self.store_confirmed(
                    gap_frame,
                    GameInput::new(gap_frame, self.input_size, self.player_count),
                );
            }
        }

        self.store_confirmed(target, input.with_frame(target));
        Ok(target)
    }

    /// Returns the input for `frame`, synthesizing a prediction if no
    /// confirmed input exists.
    ///
    /// A freshly synthesized prediction repeats the most recent confirmed
    /// input (or is zero-filled if the queue is empty) and is recorded so the
    /// engine can verify it once the authoritative input arrives. Reads past
    /// the end of the confirmed stream never fail.
    pub fn get_input(&mut self, frame: Frame) -> GameInput {
        let Some(idx) = frame.buffer_index(self.capacity) else {
            return GameInput::new(frame, self.input_size, self.player_count);
        };
        if self.confirmed[idx].frame == frame {
            return self.confirmed[idx].clone();
        }
        if self.predicted[idx].frame == frame {
            return self.predicted[idx].clone();
        }

        // predict that the device will repeat whatever it did last
        let prediction = match self.last_added_frame.buffer_index(self.capacity) {
            Some(last) if self.confirmed[last].frame == self.last_added_frame => {
                self.confirmed[last].with_frame(frame)
            }
            _ => GameInput::new(frame, self.input_size, self.player_count),
        };
        self.predicted[idx] = prediction.clone();
        prediction
    }

    /// Returns the prediction record made for `frame`, or an input with a
    /// null frame if none exists.
    #[must_use]
    pub fn get_predicted_input(&self, frame: Frame) -> GameInput {
        match frame.buffer_index(self.capacity) {
            Some(idx) if self.predicted[idx].frame == frame => self.predicted[idx].clone(),
            _ => GameInput::new(Frame::NULL, self.input_size, self.player_count),
        }
    }

    /// Clears the prediction record for `frame`. Idempotent.
    pub fn reset_prediction(&mut self, frame: Frame) {
        if let Some(idx) = frame.buffer_index(self.capacity) {
            if self.predicted[idx].frame == frame {
                self.predicted[idx].frame = Frame::NULL;
            }
        }
    }

    /// Returns the confirmed input for `frame`, without ever predicting.
    #[must_use]
    pub fn confirmed_input(&self, frame: Frame) -> Option<&GameInput> {
        match frame.buffer_index(self.capacity) {
            Some(idx) if self.confirmed[idx].frame == frame => Some(&self.confirmed[idx]),
            _ => None,
        }
    }

    fn store_confirmed(&mut self, frame: Frame, input: GameInput) {
        // frame is valid here; capacity is nonzero by construction
        if let Some(idx) = frame.buffer_index(self.capacity) {
            self.confirmed[idx] = input;
            self.last_added_frame = self.last_added_frame.max(frame);
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod input_queue_tests {
    use super::*;

    fn queue() -> InputQueue {
        InputQueue::new(1, 1, 0, 8)
    }

    fn input(frame: i32, byte: u8) -> GameInput {
        GameInput::from_bytes(Frame::new(frame), 1, 1, &[byte]).unwrap()
    }

    #[test]
    fn add_then_get_returns_confirmed() {
        let mut q = queue();
        q.add_input(Frame::new(0), &input(0, 7)).unwrap();
        let got = q.get_input(Frame::new(0));
        assert_eq!(got.bytes(), &[7]);
        assert_eq!(got.frame, Frame::new(0));
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let mut q = queue();
        q.add_input(Frame::new(0), &input(0, 7)).unwrap();
        q.add_input(Frame::new(0), &input(0, 7)).unwrap();
        assert_eq!(q.get_input(Frame::new(0)).bytes(), &[7]);
    }

    #[test]
    fn conflicting_rewrite_is_discarded() {
        let mut q = queue();
        q.add_input(Frame::new(0), &input(0, 7)).unwrap();
        q.add_input(Frame::new(0), &input(0, 9)).unwrap();
        // the first confirmed value stands
        assert_eq!(q.get_input(Frame::new(0)).bytes(), &[7]);
    }

    #[test]
    fn missing_frame_predicts_last_confirmed() {
        let mut q = queue();
        q.add_input(Frame::new(0), &input(0, 42)).unwrap();
        let predicted = q.get_input(Frame::new(3));
        assert_eq!(predicted.bytes(), &[42]);
        assert_eq!(predicted.frame, Frame::new(3));
        // the prediction was recorded
        assert_eq!(q.get_predicted_input(Frame::new(3)).frame, Frame::new(3));
    }

    #[test]
    fn empty_queue_predicts_zero() {
        let mut q = queue();
        let predicted = q.get_input(Frame::new(0));
        assert_eq!(predicted.bytes(), &[0]);
    }

    #[test]
    fn prediction_record_absent_by_default() {
        let q = queue();
        assert!(q.get_predicted_input(Frame::new(2)).frame.is_null());
    }

    #[test]
    fn reset_prediction_is_idempotent() {
        let mut q = queue();
        let _ = q.get_input(Frame::new(1));
        assert_eq!(q.get_predicted_input(Frame::new(1)).frame, Frame::new(1));
        q.reset_prediction(Frame::new(1));
        assert!(q.get_predicted_input(Frame::new(1)).frame.is_null());
        q.reset_prediction(Frame::new(1));
        assert!(q.get_predicted_input(Frame::new(1)).frame.is_null());
    }

    #[test]
    fn prediction_survives_confirmation_until_reset() {
        let mut q = queue();
        q.add_input(Frame::new(0), &input(0, 1)).unwrap();
        let _ = q.get_input(Frame::new(1));
        // the authoritative input arrives with different bytes
        q.add_input(Frame::new(1), &input(1, 2)).unwrap();
        // the record is retained for mismatch detection
        let record = q.get_predicted_input(Frame::new(1));
        assert_eq!(record.bytes(), &[1]);
        let confirmed = q.confirmed_input(Frame::new(1)).unwrap();
        assert!(!record.equal(confirmed, false));
    }

    #[test]
    fn frame_delay_shifts_storage() {
        let mut q = InputQueue::new(1, 1, 2, 8);
        let stored = q.add_input(Frame::new(1), &input(1, 9)).unwrap();
        assert_eq!(stored, Frame::new(3));
        assert_eq!(q.confirmed_input(Frame::new(3)).unwrap().bytes(), &[9]);
        // the delay gap was confirmed as zero input
        assert_eq!(q.confirmed_input(Frame::new(1)).unwrap().bytes(), &[0]);
        assert_eq!(q.confirmed_input(Frame::new(2)).unwrap().bytes(), &[0]);
    }

    #[test]
    fn delayed_queue_stays_sequential_after_warmup() {
        let mut q = InputQueue::new(1, 1, 2, 8);
        for f in 1..=5 {
            let stored = q.add_input(Frame::new(f), &input(f, f as u8)).unwrap();
            assert_eq!(stored, Frame::new(f + 2));
        }
        assert_eq!(q.confirmed_input(Frame::new(7)).unwrap().bytes(), &[5]);
    }

    #[test]
    fn reads_past_the_end_never_fail() {
        let mut q = queue();
        q.add_input(Frame::new(0), &input(0, 3)).unwrap();
        let far = q.get_input(Frame::new(1000));
        assert_eq!(far.bytes(), &[3]);
    }

    #[test]
    fn stale_ring_slots_read_as_empty() {
        let mut q = queue();
        for f in 0..12 {
            q.add_input(Frame::new(f), &input(f, f as u8)).unwrap();
        }
        // frame 0's slot has been overwritten by a newer frame
        assert!(q.confirmed_input(Frame::new(0)).is_none());
        assert!(q.confirmed_input(Frame::new(11)).is_some());
    }

    #[test]
    fn add_input_rejects_wrong_layout() {
        let mut q = queue();
        let wide = GameInput::new(Frame::new(0), 2, 1);
        assert!(matches!(
            q.add_input(Frame::new(0), &wide),
            Err(RollsyncError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn add_input_rejects_null_frame() {
        let mut q = queue();
        assert!(q.add_input(Frame::NULL, &input(0, 1)).is_err());
    }
}

#[cfg(test)]
mod input_queue_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Once confirmed, an input is immutable: later conflicting writes
        /// and predictions never change what `get_input` returns.
        #[test]
        fn confirmed_inputs_are_immutable(
            byte in any::<u8>(),
            rewrite in any::<u8>(),
            probe_frame in 0i32..20,
        ) {
            let mut q = InputQueue::new(1, 1, 0, 8);
            q.add_input(Frame::new(0), &GameInput::from_bytes(
                Frame::new(0), 1, 1, &[byte]).unwrap()).unwrap();
            let _ = q.get_input(Frame::new(probe_frame));
            q.add_input(Frame::new(0), &GameInput::from_bytes(
                Frame::new(0), 1, 1, &[rewrite]).unwrap()).unwrap();
            let confirmed = q.get_input(Frame::new(0));
            prop_assert_eq!(confirmed.bytes(), &[byte]);
        }

        /// A prediction always matches either the last confirmed input or,
        /// for an empty queue, the zero input.
        #[test]
        fn predictions_repeat_last_confirmed(
            bytes in proptest::collection::vec(any::<u8>(), 0..6),
        ) {
            let mut q = InputQueue::new(1, 1, 0, 8);
            for (f, b) in bytes.iter().enumerate() {
                q.add_input(
                    Frame::new(f as i32),
                    &GameInput::from_bytes(Frame::new(f as i32), 1, 1, &[*b]).unwrap(),
                ).unwrap();
            }
            let probe = Frame::new(bytes.len() as i32 + 1);
            let expected = bytes.last().copied().unwrap_or(0);
            let predicted = q.get_input(probe);
            prop_assert_eq!(predicted.bytes(), &[expected]);
        }
    }
}
