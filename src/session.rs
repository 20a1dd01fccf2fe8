use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::device::{Device, DeviceRole, DeviceStats};
use crate::network::adapter::DeviceAdapter;
use crate::network::codec;
use crate::network::messages::Message;
use crate::sync_engine::{DirectiveVec, SyncEngine};
use crate::{DeviceId, Frame, RollsyncError, RollsyncResult, SessionState, MAX_DEVICES};

/// A peer-to-peer rollback session.
///
/// A session owns a device record per participant, the per-device input
/// queues, the clock trackers and the state storage ring. The host drives it
/// cooperatively:
///
/// 1. register the local device and every remote device,
/// 2. call [`poll`](Session::poll) until [`is_running`](Session::is_running)
///    (the handshake needs a few round trips),
/// 3. each tick, call [`poll`](Session::poll) and then
///    [`advance_frame`](Session::advance_frame), fulfilling the returned
///    [`Directive`](crate::Directive)s in order.
///
/// All state lives inside the session instance; multiple independent
/// sessions can coexist in one process. Nothing in the session blocks or
/// suspends — if the transport runs on another thread, marshal inbound
/// datagrams into the [`DeviceAdapter`]s and the session will drain them at
/// the start of the next `poll`.
pub struct Session {
    state: SessionState,
    input_size: usize,
    config: SessionConfig,
    devices: BTreeMap<DeviceId, Device>,
    engine: SyncEngine,
    local_device: Option<DeviceId>,
    pending_local_input: Option<Vec<u8>>,
}

impl Session {
    /// Creates an empty session for inputs of `input_size` bytes per player.
    ///
    /// # Errors
    /// Returns [`RollsyncError::InvalidRequest`] if `input_size` is zero or
    /// the configuration is inconsistent.
    pub fn new(input_size: usize, config: SessionConfig) -> RollsyncResult<Self> {
        config.validate()?;
        if input_size == 0 {
            return Err(RollsyncError::InvalidRequest {
                info: "input_size must be at least 1 byte".to_owned(),
            });
        }
        let engine = SyncEngine::new(input_size, &config);
        Ok(Self {
            state: SessionState::Synchronizing,
            input_size,
            config,
            devices: BTreeMap::new(),
            engine,
            local_device: None,
            pending_local_input: None,
        })
    }

    /// Registers the device this session runs on.
    ///
    /// `frame_delay` buffers local inputs for that many extra frames,
    /// trading input latency for fewer mispredictions on the remote side.
    ///
    /// # Errors
    /// Returns [`RollsyncError::InvalidRequest`] if a local device is already
    /// registered, the id is taken, the device cap is reached or
    /// `player_count` is zero.
    pub fn set_local_device(
        &mut self,
        id: DeviceId,
        player_count: usize,
        frame_delay: usize,
    ) -> RollsyncResult<()> {
        if let Some(existing) = self.local_device {
            return Err(RollsyncError::InvalidRequest {
                info: format!("the session already has a local device ({})", existing),
            });
        }
        self.check_registration(id, player_count)?;
        self.engine
            .register_local(id, player_count, frame_delay, self.config.max_rollback_frames);
        self.devices.insert(id, Device::new_local(id, player_count));
        self.local_device = Some(id);
        Ok(())
    }

    /// Registers a remote device reachable through `adapter`.
    ///
    /// # Errors
    /// Returns [`RollsyncError::InvalidRequest`] if the id is taken, the
    /// device cap is reached or `player_count` is zero.
    pub fn add_remote_device<A>(
        &mut self,
        id: DeviceId,
        player_count: usize,
        adapter: A,
    ) -> RollsyncResult<()>
    where
        A: DeviceAdapter + 'static,
    {
        self.check_registration(id, player_count)?;
        self.engine
            .register_remote(id, player_count, self.config.max_rollback_frames);
        self.devices
            .insert(id, Device::new_remote(id, player_count, Box::new(adapter)));
        Ok(())
    }

    fn check_registration(&self, id: DeviceId, player_count: usize) -> RollsyncResult<()> {
        if self.devices.contains_key(&id) {
            return Err(RollsyncError::InvalidRequest {
                info: format!("{} is already registered", id),
            });
        }
        if self.devices.len() >= MAX_DEVICES {
            return Err(RollsyncError::InvalidRequest {
                info: format!("a session supports at most {} devices", MAX_DEVICES),
            });
        }
        if player_count == 0 {
            return Err(RollsyncError::InvalidRequest {
                info: "a device must carry at least one player".to_owned(),
            });
        }
        Ok(())
    }

    /// Drains every adapter, dispatches the received messages, drives the
    /// handshake and liveness cadence, and sends everything queued.
    ///
    /// Undecodable datagrams are discarded silently; datagrams from senders
    /// that are not part of the session never reach the session (the
    /// per-device adapters drop them).
    pub fn poll(&mut self) {
        // drain and dispatch inbound datagrams
        let engine = &mut self.engine;
        for device in self.devices.values_mut() {
            if device.role() != DeviceRole::Remote {
                continue;
            }
            for datagram in device.poll_datagrams() {
                match codec::decode(&datagram) {
                    Ok(message) => Self::dispatch(engine, device, message),
                    Err(e) => trace!(device = %device.id(), "discarding malformed datagram: {}", e),
                }
            }
        }

        // handshake probes while unverified, liveness reports while running
        for device in self.devices.values_mut() {
            device.tick_handshake(self.config.sync_retry_interval);
        }
        self.check_promotion();
        if self.state == SessionState::Running {
            let local_frame = self.engine.time_sync().local_frame();
            let advantage = self.engine.time_sync().local_advantage();
            for device in self.devices.values_mut() {
                if device.role() == DeviceRole::Remote {
                    device.tick_quality(
                        local_frame,
                        advantage,
                        self.config.quality_report_interval,
                    );
                }
            }
        }

        for device in self.devices.values_mut() {
            device.flush();
        }
    }

    fn dispatch(engine: &mut SyncEngine, device: &mut Device, message: Message) {
        trace!(device = %device.id(), kind = message.kind(), "handling message");
        match message {
            Message::SyncRequest { nonce } => device.handle_sync_request(nonce),
            Message::SyncReply { nonce } => device.handle_sync_reply(nonce),
            Message::InputBatch {
                start_frame,
                end_frame,
                bytes,
            } => engine.ingest_batch(device, start_frame, end_frame, &bytes),
            Message::InputAck { frame } => device.note_ack(frame),
            Message::QualityReport { frame, advantage } => {
                device.handle_quality_report(frame, advantage)
            }
            Message::QualityReply { frame } => device.handle_quality_reply(frame),
        }
    }

    /// Promotes the session (and every device) to running once all remote
    /// devices have completed the handshake.
    fn check_promotion(&mut self) {
        if self.state != SessionState::Synchronizing || self.local_device.is_none() {
            return;
        }
        let all_synced = self
            .devices
            .values()
            .filter(|d| d.role() == DeviceRole::Remote)
            .all(Device::is_synced);
        if !all_synced {
            return;
        }
        debug!("all remote devices verified; session running");
        self.state = SessionState::Running;
        for device in self.devices.values_mut() {
            device.promote_running();
        }
    }

    /// Returns `true` once the handshake with every remote device has
    /// completed and the session accepts input.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Returns the session's current state.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The most recently simulated local frame.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.engine.time_sync().local_frame()
    }

    /// The highest frame verified authoritative for every device. All state
    /// at or before this frame is final.
    #[must_use]
    pub fn sync_frame(&self) -> Frame {
        self.engine.time_sync().sync_frame()
    }

    /// What the session knows about a remote device, or `None` for unknown
    /// ids and the local device.
    #[must_use]
    pub fn device_stats(&self, id: DeviceId) -> Option<DeviceStats> {
        self.devices
            .get(&id)
            .filter(|d| d.role() == DeviceRole::Remote)
            .map(Device::stats)
    }

    /// Queues the local input for the next [`advance`](Session::advance).
    ///
    /// This is the alternate entry for hosts that consume directives
    /// elsewhere; [`advance_frame`](Session::advance_frame) is the one-call
    /// version. Calling it twice before advancing overwrites the queued
    /// input.
    ///
    /// # Errors
    /// Returns [`RollsyncError::SizeMismatch`] if `input` does not hold
    /// exactly `player_count * input_size` bytes for the local device, and
    /// [`RollsyncError::InvalidRequest`] if no local device is registered.
    pub fn add_local_input(&mut self, input: &[u8]) -> RollsyncResult<()> {
        let local = self.require_local_device()?;
        let player_count = self
            .devices
            .get(&local)
            .map(Device::player_count)
            .unwrap_or_default();
        let expected = player_count * self.input_size;
        if input.len() != expected {
            return Err(RollsyncError::SizeMismatch {
                expected,
                actual: input.len(),
            });
        }
        self.pending_local_input = Some(input.to_vec());
        Ok(())
    }

    /// Queues `local_input` and advances one tick, returning the directives
    /// the host must fulfill in order.
    ///
    /// # Errors
    /// - [`RollsyncError::NotSynchronized`] while the handshake is pending.
    /// - [`RollsyncError::SizeMismatch`] for input of the wrong size.
    /// - [`RollsyncError::MissingState`] / [`RollsyncError::FrameOutOfWindow`]
    ///   if a rollback target was not saved by the host — a host-side
    ///   scheduling bug.
    pub fn advance_frame(&mut self, local_input: &[u8]) -> RollsyncResult<DirectiveVec> {
        self.add_local_input(local_input)?;
        self.advance()
    }

    /// Advances one tick using the input queued via
    /// [`add_local_input`](Session::add_local_input).
    ///
    /// # Errors
    /// As [`advance_frame`](Session::advance_frame), plus
    /// [`RollsyncError::InvalidRequest`] if no input was queued.
    pub fn advance(&mut self) -> RollsyncResult<DirectiveVec> {
        self.poll();
        if self.state != SessionState::Running {
            return Err(RollsyncError::NotSynchronized);
        }
        let local = self.require_local_device()?;
        let input = self
            .pending_local_input
            .take()
            .ok_or_else(|| RollsyncError::InvalidRequest {
                info: "no local input queued; call add_local_input first".to_owned(),
            })?;
        let directives = self.engine.advance(&mut self.devices, local, &input)?;
        // the advance queued input broadcasts on the remote devices
        for device in self.devices.values_mut() {
            device.flush();
        }
        Ok(directives)
    }

    fn require_local_device(&self) -> RollsyncResult<DeviceId> {
        self.local_device.ok_or_else(|| RollsyncError::InvalidRequest {
            info: "the session has no local device".to_owned(),
        })
    }
}

// #########
// # TESTS #
// #########
