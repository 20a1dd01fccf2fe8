use std::collections::VecDeque;

use rand::random;
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::network::adapter::DeviceAdapter;
use crate::network::codec;
use crate::network::messages::Message;
use crate::{DeviceId, Frame};

/// Whether a device is the local machine or a remote peer.
///
/// Exactly one device per session is `Local`. The role is data, not a type:
/// devices differ only in which operations apply to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    /// The device this session runs on. Its inputs are submitted directly by
    /// the host.
    Local,
    /// A peer reachable through a [`DeviceAdapter`]. Its inputs arrive as
    /// input batches.
    Remote,
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "Local"),
            Self::Remote => write!(f, "Remote"),
        }
    }
}

/// The verification state of a device.
///
/// Remote devices start in `Syncing` and are promoted to `Synced` when they
/// echo our handshake nonce. The session promotes every device to `Running`
/// once all remotes are at least `Synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Still exchanging `SyncRequest` / `SyncReply` probes.
    Syncing,
    /// This device has echoed our nonce; waiting for the rest of the mesh.
    Synced,
    /// The session is running; the device exchanges inputs.
    Running,
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syncing => write!(f, "Syncing"),
            Self::Synced => write!(f, "Synced"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// A snapshot of what the session knows about one remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    /// The last input frame received from this device.
    pub remote_frame: Frame,
    /// The advantage this peer grants us: our local frame at the time its
    /// last input arrived, minus that input's frame.
    pub remote_advantage: i32,
    /// The highest of our input frames this device has acknowledged.
    pub last_acked_frame: Frame,
    /// Round-trip estimate from the quality exchange, once one completed.
    pub round_trip: Option<Duration>,
}

/// One participant of the session: its role, handshake progress, clock
/// trackers and (for remote devices) its send channel.
///
/// The device owns its adapter exclusively; all messages to the peer funnel
/// through [`queue_message`](Device::queue_message) and leave in
/// [`flush`](Device::flush), so a tick produces at most one burst of
/// datagrams per device.
pub(crate) struct Device {
    id: DeviceId,
    role: DeviceRole,
    player_count: usize,
    handshake_state: HandshakeState,
    /// The nonce a `SyncReply` must echo for this device to count as
    /// verified.
    sync_nonce: u32,
    last_sync_sent: Option<Instant>,
    last_quality_sent: Option<(Frame, Instant)>,
    remote_frame: Frame,
    remote_advantage: i32,
    last_acked_frame: Frame,
    round_trip: Option<Duration>,
    send_queue: VecDeque<Message>,
    adapter: Option<Box<dyn DeviceAdapter>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("player_count", &self.player_count)
            .field("handshake_state", &self.handshake_state)
            .field("remote_frame", &self.remote_frame)
            .field("remote_advantage", &self.remote_advantage)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub(crate) fn new_local(id: DeviceId, player_count: usize) -> Self {
        Self::new(id, DeviceRole::Local, player_count, None)
    }

    pub(crate) fn new_remote(
        id: DeviceId,
        player_count: usize,
        adapter: Box<dyn DeviceAdapter>,
    ) -> Self {
        Self::new(id, DeviceRole::Remote, player_count, Some(adapter))
    }

    fn new(
        id: DeviceId,
        role: DeviceRole,
        player_count: usize,
        adapter: Option<Box<dyn DeviceAdapter>>,
    ) -> Self {
        Self {
            id,
            role,
            player_count,
            // the local device needs no verification
            handshake_state: match role {
                DeviceRole::Local => HandshakeState::Running,
                DeviceRole::Remote => HandshakeState::Syncing,
            },
            sync_nonce: random(),
            last_sync_sent: None,
            last_quality_sent: None,
            remote_frame: Frame::NULL,
            remote_advantage: 0,
            last_acked_frame: Frame::NULL,
            round_trip: None,
            send_queue: VecDeque::new(),
            adapter,
        }
    }

    pub(crate) fn id(&self) -> DeviceId {
        self.id
    }

    pub(crate) fn role(&self) -> DeviceRole {
        self.role
    }

    pub(crate) fn player_count(&self) -> usize {
        self.player_count
    }

    pub(crate) fn handshake_state(&self) -> HandshakeState {
        self.handshake_state
    }

    pub(crate) fn is_synced(&self) -> bool {
        matches!(
            self.handshake_state,
            HandshakeState::Synced | HandshakeState::Running
        )
    }

    pub(crate) fn remote_frame(&self) -> Frame {
        self.remote_frame
    }

    pub(crate) fn remote_advantage(&self) -> i32 {
        self.remote_advantage
    }

    pub(crate) fn stats(&self) -> DeviceStats {
        DeviceStats {
            remote_frame: self.remote_frame,
            remote_advantage: self.remote_advantage,
            last_acked_frame: self.last_acked_frame,
            round_trip: self.round_trip,
        }
    }

    /// Promotes a `Synced` device to `Running`. Called by the session once
    /// the whole mesh is verified.
    pub(crate) fn promote_running(&mut self) {
        if self.handshake_state == HandshakeState::Synced {
            debug!(device = %self.id, "device running");
            self.handshake_state = HandshakeState::Running;
        }
    }

    /// Re-sends the handshake probe if the device is unverified and the
    /// retry interval elapsed (or no probe was ever sent).
    pub(crate) fn tick_handshake(&mut self, retry_interval: Duration) {
        if self.handshake_state != HandshakeState::Syncing {
            return;
        }
        let due = self
            .last_sync_sent
            .map_or(true, |sent| sent.elapsed() >= retry_interval);
        if due {
            self.last_sync_sent = Some(Instant::now());
            self.queue_message(Message::SyncRequest {
                nonce: self.sync_nonce,
            });
        }
    }

    /// Sends the periodic liveness report while running.
    pub(crate) fn tick_quality(
        &mut self,
        local_frame: Frame,
        local_advantage: i32,
        report_interval: Duration,
    ) {
        if self.handshake_state != HandshakeState::Running {
            return;
        }
        let due = self
            .last_quality_sent
            .map_or(true, |(_, sent)| sent.elapsed() >= report_interval);
        if due {
            self.last_quality_sent = Some((local_frame, Instant::now()));
            self.queue_message(Message::QualityReport {
                frame: local_frame,
                advantage: local_advantage,
            });
        }
    }

    /// Answers a handshake probe from the peer.
    pub(crate) fn handle_sync_request(&mut self, nonce: u32) {
        self.queue_message(Message::SyncReply { nonce });
    }

    /// Consumes a handshake echo. A reply carrying our nonce verifies the
    /// device; anything else (stale or duplicate replies included) is
    /// ignored.
    pub(crate) fn handle_sync_reply(&mut self, nonce: u32) {
        if self.handshake_state != HandshakeState::Syncing {
            trace!(device = %self.id, "ignoring sync reply outside handshake");
            return;
        }
        if nonce != self.sync_nonce {
            trace!(device = %self.id, "ignoring sync reply with stale nonce");
            return;
        }
        debug!(device = %self.id, "device synced");
        self.handshake_state = HandshakeState::Synced;
    }

    /// Records an input frame received from this device. Returns `true` if
    /// the frame advanced the device's clock (and therefore deserves an
    /// acknowledgement), `false` for duplicates and stragglers.
    pub(crate) fn note_input_frame(&mut self, frame: Frame, local_frame: Frame) -> bool {
        if frame <= self.remote_frame {
            return false;
        }
        self.remote_frame = frame;
        self.remote_advantage = local_frame - frame;
        true
    }

    /// Records an acknowledgement for one of our input frames. Monotonic and
    /// idempotent.
    pub(crate) fn note_ack(&mut self, frame: Frame) {
        self.last_acked_frame = self.last_acked_frame.max(frame);
    }

    /// Answers a liveness report from the peer.
    pub(crate) fn handle_quality_report(&mut self, frame: Frame, advantage: i32) {
        trace!(device = %self.id, advantage, "peer reported its frame advantage");
        self.queue_message(Message::QualityReply { frame });
    }

    /// Consumes a liveness echo, updating the round-trip estimate when it
    /// answers our outstanding report.
    pub(crate) fn handle_quality_reply(&mut self, frame: Frame) {
        if let Some((sent_frame, sent_at)) = self.last_quality_sent {
            if frame == sent_frame {
                self.round_trip = Some(sent_at.elapsed());
            }
        }
    }

    /// Appends a message to the device's send queue.
    pub(crate) fn queue_message(&mut self, message: Message) {
        trace!(device = %self.id, kind = message.kind(), "queueing message");
        self.send_queue.push_back(message);
    }

    /// Encodes and sends everything queued since the last flush.
    pub(crate) fn flush(&mut self) {
        let Some(adapter) = self.adapter.as_mut() else {
            self.send_queue.clear();
            return;
        };
        for message in self.send_queue.drain(..) {
            adapter.send(&codec::encode(&message));
        }
    }

    /// Drains the datagrams the adapter buffered since the last poll.
    pub(crate) fn poll_datagrams(&mut self) -> Vec<Vec<u8>> {
        self.adapter
            .as_mut()
            .map(|adapter| adapter.poll())
            .unwrap_or_default()
    }
}

// #########
// # TESTS #
// #########
