use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::device::{Device, DeviceRole};
use crate::frame_info::GameInput;
use crate::input_queue::InputQueue;
use crate::network::messages::Message;
use crate::state_storage::{StateCell, StateStorage};
use crate::time_sync::TimeSync;
use crate::{DeviceId, Frame, RollsyncError, RollsyncResult, INITIAL_FRAME};

/// One instruction the session hands to the host loop.
///
/// Directives returned by a single
/// [`advance_frame`](crate::Session::advance_frame) call are totally ordered;
/// the host must execute them in list order. Within a rollback, the `Load`
/// precedes all re-advances, and every `Advance(i)` precedes its paired
/// `Save(i)`.
#[derive(Debug, Clone)]
pub enum Directive {
    /// Serialize the current game state and store it in `cell`, keyed by
    /// `frame`.
    Save {
        /// The frame the state belongs to.
        frame: Frame,
        /// The storage slot to write, via [`StateCell::save`].
        cell: StateCell,
    },
    /// Restore the game state stored in `cell`.
    Load {
        /// The frame being restored.
        frame: Frame,
        /// The storage slot to read, via [`StateCell::load`].
        cell: StateCell,
    },
    /// Step the simulation one frame with the combined inputs of all
    /// devices.
    Advance {
        /// The frame being simulated.
        frame: Frame,
        /// Per-device input payloads concatenated in device-id order;
        /// `player_count * size_per_player` bytes per device.
        inputs: Vec<u8>,
    },
}

impl Directive {
    /// The frame this directive applies to.
    #[must_use]
    pub fn frame(&self) -> Frame {
        match self {
            Self::Save { frame, .. } | Self::Load { frame, .. } | Self::Advance { frame, .. } => {
                *frame
            }
        }
    }
}

/// Stack-allocated list of directives for one tick.
///
/// The common tick produces two directives (one advance, one save); rollbacks
/// spill to the heap.
pub type DirectiveVec = SmallVec<[Directive; 4]>;

/// The per-tick orchestrator: owns the input queues, the clock trackers and
/// the state ring, and turns "the host wants to advance one frame" into a
/// directive list.
pub(crate) struct SyncEngine {
    input_size: usize,
    input_redundancy_frames: usize,
    time_sync: TimeSync,
    /// Per-device input queues. A `BTreeMap` so combined input buffers are
    /// assembled in device-id order on every peer.
    queues: BTreeMap<DeviceId, InputQueue>,
    storage: StateStorage,
    local_device: Option<DeviceId>,
    initial_save_emitted: bool,
}

impl SyncEngine {
    pub(crate) fn new(input_size: usize, config: &SessionConfig) -> Self {
        Self {
            input_size,
            input_redundancy_frames: config.input_redundancy_frames,
            time_sync: TimeSync::new(config),
            queues: BTreeMap::new(),
            storage: StateStorage::new(config.max_rollback_frames),
            local_device: None,
            initial_save_emitted: false,
        }
    }

    pub(crate) fn register_local(
        &mut self,
        id: DeviceId,
        player_count: usize,
        frame_delay: usize,
        max_rollback_frames: usize,
    ) {
        self.local_device = Some(id);
        self.queues.insert(
            id,
            InputQueue::new(player_count, self.input_size, frame_delay, max_rollback_frames),
        );
    }

    pub(crate) fn register_remote(
        &mut self,
        id: DeviceId,
        player_count: usize,
        max_rollback_frames: usize,
    ) {
        self.queues.insert(
            id,
            InputQueue::new(player_count, self.input_size, 0, max_rollback_frames),
        );
    }

    pub(crate) fn time_sync(&self) -> &TimeSync {
        &self.time_sync
    }

    /// Feeds a received input batch into the owning device's queue, advancing
    /// the device's clock trackers and queueing acknowledgements for frames
    /// that are new.
    ///
    /// Anything inconsistent — payload sizes that do not match the device's
    /// layout, duplicated frames, frames out of order — is absorbed: the wire
    /// protocol is idempotent, and a malformed batch is treated like a lost
    /// datagram.
    pub(crate) fn ingest_batch(
        &mut self,
        device: &mut Device,
        start_frame: Frame,
        end_frame: Frame,
        bytes: &[u8],
    ) {
        if !start_frame.is_valid() || end_frame < start_frame {
            trace!(device = %device.id(), "discarding input batch with an invalid frame range");
            return;
        }
        let Some(queue) = self.queues.get_mut(&device.id()) else {
            return;
        };
        let chunk = queue.player_count() * self.input_size;
        let frames = (end_frame - start_frame) as usize + 1;
        if chunk == 0 || bytes.len() != frames * chunk {
            trace!(
                device = %device.id(),
                "discarding input batch with inconsistent payload size"
            );
            return;
        }

        let local_frame = self.time_sync.local_frame();
        for (i, payload) in bytes.chunks_exact(chunk).enumerate() {
            let frame = start_frame + i as i32;
            if device.note_input_frame(frame, local_frame) {
                device.queue_message(Message::InputAck { frame });
            }
            match GameInput::from_bytes(frame, self.input_size, queue.player_count(), payload) {
                Ok(input) => {
                    if let Err(e) = queue.add_input(frame, &input) {
                        trace!(device = %device.id(), frame = frame.as_i32(), "dropping input: {}", e);
                    }
                }
                Err(e) => {
                    trace!(device = %device.id(), "dropping undecodable input chunk: {}", e);
                    return;
                }
            }
        }
    }

    /// Computes the directive list for one tick.
    ///
    /// The order of operations is fixed: evaluate the clock comparison once,
    /// run the prediction verification sweep, emit the one-shot initial
    /// save, emit the rollback pass if a misprediction was confirmed, and
    /// finally — unless this peer must stall — advance the local frame,
    /// ingest and broadcast the local input, and emit the advance/save pair.
    pub(crate) fn advance(
        &mut self,
        devices: &mut BTreeMap<DeviceId, Device>,
        local_device: DeviceId,
        local_input: &[u8],
    ) -> RollsyncResult<DirectiveVec> {
        match devices.get(&local_device) {
            Some(device) if device.role() == DeviceRole::Local => {}
            Some(_) => {
                return Err(RollsyncError::WrongDeviceRole {
                    device: local_device,
                    expected: DeviceRole::Local,
                })
            }
            None => {
                return Err(RollsyncError::InvalidRequest {
                    info: format!("unknown device {}", local_device),
                })
            }
        }
        let local_players = self
            .queues
            .get(&local_device)
            .map(InputQueue::player_count)
            .ok_or_else(|| RollsyncError::InvalidRequest {
                info: format!("no input queue registered for {}", local_device),
            })?;
        let expected = local_players * self.input_size;
        if local_input.len() != expected {
            return Err(RollsyncError::SizeMismatch {
                expected,
                actual: local_input.len(),
            });
        }

        // evaluate the clock comparison once per tick
        self.time_sync.observe_remotes(
            devices
                .values()
                .filter(|d| d.role() == DeviceRole::Remote)
                .map(|d| (d.remote_frame(), d.remote_advantage())),
        );
        let may_advance = self.time_sync.is_time_synced();

        self.update_sync_frame();

        let mut directives = DirectiveVec::new();

        // the pre-simulation state must be saved before anything can roll
        // back to it
        if self.time_sync.local_frame() == INITIAL_FRAME && !self.initial_save_emitted {
            self.initial_save_emitted = true;
            directives.push(Directive::Save {
                frame: INITIAL_FRAME,
                cell: self.storage.cell_for_save(INITIAL_FRAME)?,
            });
        }

        if self.time_sync.should_rollback() {
            self.rollback(&mut directives)?;
        }

        if may_advance {
            self.time_sync.advance_local();
            let frame = self.time_sync.local_frame();

            let input = GameInput::from_bytes(frame, self.input_size, local_players, local_input)?;
            let queue = self
                .queues
                .get_mut(&local_device)
                .ok_or_else(|| RollsyncError::InvalidRequest {
                    info: format!("no input queue registered for {}", local_device),
                })?;
            // the queue shifts the input by the configured frame delay
            queue.add_input(frame, &input)?;

            self.broadcast_local_inputs(devices);

            let inputs = self.combined_inputs(frame);
            directives.push(Directive::Advance { frame, inputs });
            directives.push(Directive::Save {
                frame,
                cell: self.storage.cell_for_save(frame)?,
            });
        } else {
            debug!(
                frame = self.time_sync.local_frame().as_i32(),
                "stalling one frame to let remote devices catch up"
            );
        }

        Ok(directives)
    }

    /// The prediction verification sweep: walk the frames between the sync
    /// frame and the verification ceiling, comparing every prediction record
    /// against the confirmed input that has since arrived. The first
    /// disagreement pins the new sync frame just below the mistake; a clean
    /// sweep raises it to the ceiling.
    fn update_sync_frame(&mut self) {
        let ceiling = self
            .time_sync
            .remote_frame()
            .min(self.time_sync.local_frame());
        let start = self.time_sync.sync_frame() + 1;

        let mut mistake = Frame::NULL;
        'scan: for n in start.as_i32()..=ceiling.as_i32() {
            let frame = Frame::new(n);
            for queue in self.queues.values_mut() {
                let prediction = queue.get_predicted_input(frame);
                if prediction.frame != frame {
                    continue;
                }
                let verdict = queue
                    .confirmed_input(frame)
                    .map(|confirmed| prediction.equal(confirmed, false));
                if let Some(correct) = verdict {
                    queue.reset_prediction(frame);
                    if !correct {
                        mistake = frame;
                    }
                }
            }
            if !mistake.is_null() {
                break 'scan;
            }
        }

        if mistake.is_null() {
            let sync_frame = self.time_sync.sync_frame().max(ceiling);
            self.time_sync.set_sync_frame(sync_frame);
        } else {
            debug!(frame = mistake.as_i32(), "misprediction confirmed");
            self.time_sync.set_sync_frame(mistake - 1);
        }
    }

    /// Emits the rollback pass: load the last verified state, then
    /// re-advance (and re-save) every frame up to the current one with the
    /// corrected inputs.
    fn rollback(&mut self, directives: &mut DirectiveVec) -> RollsyncResult<()> {
        let sync_frame = self.time_sync.sync_frame();
        let local_frame = self.time_sync.local_frame();
        debug!(
            from = local_frame.as_i32(),
            to = sync_frame.as_i32(),
            "rolling back"
        );

        directives.push(Directive::Load {
            frame: sync_frame,
            cell: self.storage.cell_for_load(sync_frame)?,
        });

        for n in (sync_frame.as_i32() + 1)..=local_frame.as_i32() {
            let frame = Frame::new(n);
            // void the stale speculation so re-prediction starts from the
            // newest confirmed inputs
            for queue in self.queues.values_mut() {
                queue.reset_prediction(frame);
            }
            let inputs = self.combined_inputs(frame);
            directives.push(Directive::Advance { frame, inputs });
            directives.push(Directive::Save {
                frame,
                cell: self.storage.cell_for_save(frame)?,
            });
        }
        Ok(())
    }

    /// Concatenates every device's input for `frame` in device-id order,
    /// predicting where the confirmed input has not arrived.
    fn combined_inputs(&mut self, frame: Frame) -> Vec<u8> {
        let mut combined = Vec::new();
        for queue in self.queues.values_mut() {
            combined.extend_from_slice(queue.get_input(frame).bytes());
        }
        combined
    }

    /// Queues the redundant input broadcast on every remote device: the local
    /// queue's confirmed inputs for the trailing redundancy window through
    /// the newest delayed frame.
    fn broadcast_local_inputs(&mut self, devices: &mut BTreeMap<DeviceId, Device>) {
        let Some(local_id) = self.local_device else {
            return;
        };
        let Some(queue) = self.queues.get(&local_id) else {
            return;
        };

        let local_frame = self.time_sync.local_frame();
        let end_frame = local_frame + queue.frame_delay() as i32;
        let window_start = (local_frame.as_i32() - self.input_redundancy_frames as i32).max(0);

        // the window may reach before the first confirmed input; shrink it to
        // the contiguous confirmed run ending at `end_frame`
        let mut start_frame = None;
        let mut payload = Vec::new();
        for n in window_start..=end_frame.as_i32() {
            let frame = Frame::new(n);
            match queue.confirmed_input(frame) {
                Some(input) => {
                    if start_frame.is_none() {
                        start_frame = Some(frame);
                    }
                    payload.extend_from_slice(input.bytes());
                }
                None => {
                    start_frame = None;
                    payload.clear();
                }
            }
        }
        let Some(start_frame) = start_frame else {
            return;
        };

        let batch = Message::InputBatch {
            start_frame,
            end_frame,
            bytes: payload,
        };
        for device in devices.values_mut() {
            if device.role() == DeviceRole::Remote {
                device.queue_message(batch.clone());
            }
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod sync_engine_tests {
    use super::*;
    use crate::network::loopback::LoopbackAdapter;

    /// Host-side helper: fulfill save/load directives the way a game loop
    /// would, tracking which frames were advanced.
    fn fulfill(directives: &DirectiveVec) -> Vec<String> {
        let mut trace = Vec::new();
        for directive in directives {
            match directive {
                Directive::Save { frame, cell } => {
                    cell.save(*frame, vec![frame.as_i32() as u8]);
                    trace.push(format!("save({})", frame));
                }
                Directive::Load { frame, cell } => {
                    assert_eq!(cell.load(), Some(vec![frame.as_i32() as u8]));
                    trace.push(format!("load({})", frame));
                }
                Directive::Advance { frame, .. } => trace.push(format!("advance({})", frame)),
            }
        }
        trace
    }

    fn engine_with_remote() -> (SyncEngine, BTreeMap<DeviceId, Device>) {
        let config = SessionConfig::default();
        let mut engine = SyncEngine::new(1, &config);
        engine.register_local(DeviceId::new(0), 1, 0, config.max_rollback_frames);
        engine.register_remote(DeviceId::new(1), 1, config.max_rollback_frames);

        let mut devices = BTreeMap::new();
        devices.insert(DeviceId::new(0), Device::new_local(DeviceId::new(0), 1));
        let (ours, _theirs) = LoopbackAdapter::pair();
        devices.insert(
            DeviceId::new(1),
            Device::new_remote(DeviceId::new(1), 1, Box::new(ours)),
        );
        (engine, devices)
    }

    fn ingest(
        engine: &mut SyncEngine,
        devices: &mut BTreeMap<DeviceId, Device>,
        frame: i32,
        byte: u8,
    ) {
        let device = devices.get_mut(&DeviceId::new(1)).unwrap();
        engine.ingest_batch(device, Frame::new(frame), Frame::new(frame), &[byte]);
    }

    #[test]
    fn first_tick_emits_initial_save_then_advances() {
        let (mut engine, mut devices) = engine_with_remote();
        let directives = engine
            .advance(&mut devices, DeviceId::new(0), &[0x00])
            .unwrap();
        assert_eq!(
            fulfill(&directives),
            vec!["save(0)", "advance(1)", "save(1)"]
        );
    }

    #[test]
    fn wrong_device_role_is_rejected() {
        let (mut engine, mut devices) = engine_with_remote();
        let err = engine
            .advance(&mut devices, DeviceId::new(1), &[0x00])
            .unwrap_err();
        assert_eq!(
            err,
            RollsyncError::WrongDeviceRole {
                device: DeviceId::new(1),
                expected: DeviceRole::Local,
            }
        );
    }

    #[test]
    fn oversized_input_is_rejected() {
        let (mut engine, mut devices) = engine_with_remote();
        let err = engine
            .advance(&mut devices, DeviceId::new(0), &[0x00, 0x01])
            .unwrap_err();
        assert_eq!(
            err,
            RollsyncError::SizeMismatch {
                expected: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn combined_inputs_follow_device_id_order() {
        let (mut engine, mut devices) = engine_with_remote();
        ingest(&mut engine, &mut devices, 1, 0xBB);
        let directives = engine
            .advance(&mut devices, DeviceId::new(0), &[0xAA])
            .unwrap();
        let Directive::Advance { inputs, .. } = &directives[1] else {
            panic!("expected an advance directive");
        };
        assert_eq!(inputs, &[0xAA, 0xBB]);
    }

    #[test]
    fn verified_predictions_raise_the_sync_frame() {
        let (mut engine, mut devices) = engine_with_remote();
        // tick 1: remote input missing, predicted as zero
        let d1 = engine
            .advance(&mut devices, DeviceId::new(0), &[0x00])
            .unwrap();
        fulfill(&d1);
        assert!(engine.time_sync().sync_frame().is_null());

        // the authoritative zero arrives and verifies the prediction
        ingest(&mut engine, &mut devices, 1, 0x00);
        let d2 = engine
            .advance(&mut devices, DeviceId::new(0), &[0x00])
            .unwrap();
        assert_eq!(fulfill(&d2), vec!["advance(2)", "save(2)"]);
        assert_eq!(engine.time_sync().sync_frame(), Frame::new(1));
    }

    #[test]
    fn misprediction_rolls_back_and_resimulates() {
        let (mut engine, mut devices) = engine_with_remote();
        let d1 = engine
            .advance(&mut devices, DeviceId::new(0), &[0x00])
            .unwrap();
        fulfill(&d1);

        ingest(&mut engine, &mut devices, 1, 0x00);
        let d2 = engine
            .advance(&mut devices, DeviceId::new(0), &[0x00])
            .unwrap();
        fulfill(&d2);

        // frame 2 was predicted as 0x00; the peer actually pressed 0x01
        ingest(&mut engine, &mut devices, 2, 0x01);
        let d3 = engine
            .advance(&mut devices, DeviceId::new(0), &[0x00])
            .unwrap();
        assert_eq!(
            fulfill(&d3),
            vec![
                "load(1)",
                "advance(2)",
                "save(2)",
                "advance(3)",
                "save(3)"
            ]
        );
        // the resimulated frame used the corrected remote input
        let Directive::Advance { inputs, .. } = &d3[1] else {
            panic!("expected an advance directive");
        };
        assert_eq!(inputs, &[0x00, 0x01]);
        assert_eq!(engine.time_sync().sync_frame(), Frame::new(1));
    }

    #[test]
    fn stalls_without_remote_input() {
        let (mut engine, mut devices) = engine_with_remote();
        let mut frames = Vec::new();
        for _ in 0..6 {
            let directives = engine
                .advance(&mut devices, DeviceId::new(0), &[0x00])
                .unwrap();
            fulfill(&directives);
            frames.push(engine.time_sync().local_frame());
        }
        // advantage throttling caps speculation against a silent peer
        let final_frame = *frames.last().unwrap();
        assert!(final_frame < Frame::new(6));
        // and the last ticks did not advance at all
        assert_eq!(frames[frames.len() - 1], frames[frames.len() - 2]);
    }

    #[test]
    fn duplicate_batch_is_ingested_without_new_acks() {
        let (mut engine, mut devices) = engine_with_remote();
        let d1 = engine
            .advance(&mut devices, DeviceId::new(0), &[0x00])
            .unwrap();
        fulfill(&d1);

        ingest(&mut engine, &mut devices, 1, 0x05);
        let first_acks = devices.get_mut(&DeviceId::new(1)).unwrap().stats();
        assert_eq!(first_acks.remote_frame, Frame::new(1));

        // replay the identical batch: no tracker movement
        ingest(&mut engine, &mut devices, 1, 0x05);
        let second = devices.get_mut(&DeviceId::new(1)).unwrap().stats();
        assert_eq!(first_acks, second);
    }

    #[test]
    fn inconsistent_batch_sizes_are_absorbed() {
        let (mut engine, mut devices) = engine_with_remote();
        let device = devices.get_mut(&DeviceId::new(1)).unwrap();
        // three frames declared, two bytes of payload
        engine.ingest_batch(device, Frame::new(1), Frame::new(3), &[0x01, 0x02]);
        assert!(device.remote_frame().is_null());
    }
}
