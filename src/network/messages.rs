use crate::Frame;

/// The messages devices exchange over their [`DeviceAdapter`]s.
///
/// The protocol is deliberately idempotent over this message set: duplicated,
/// reordered or lost datagrams never corrupt a session, they only delay it.
///
/// [`DeviceAdapter`]: crate::DeviceAdapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake probe, re-sent periodically while a device is unverified.
    /// Carries a random nonce the peer must echo.
    SyncRequest {
        /// The sender's current handshake nonce.
        nonce: u32,
    },
    /// Handshake echo answering a [`Message::SyncRequest`].
    SyncReply {
        /// The nonce copied from the request.
        nonce: u32,
    },
    /// A redundant window of the sender's local inputs, one payload chunk per
    /// frame in `start_frame..=end_frame`.
    InputBatch {
        /// First frame covered by `bytes`.
        start_frame: Frame,
        /// Last frame covered by `bytes` (inclusive).
        end_frame: Frame,
        /// The concatenated per-frame input payloads. Each chunk is
        /// `player_count * size_per_player` bytes of the sending device.
        bytes: Vec<u8>,
    },
    /// Acknowledges the highest new frame ingested from an
    /// [`Message::InputBatch`].
    InputAck {
        /// The acknowledged frame.
        frame: Frame,
    },
    /// Periodic liveness probe carrying the sender's clock state.
    QualityReport {
        /// The sender's current local frame.
        frame: Frame,
        /// The sender's current local frame advantage.
        advantage: i32,
    },
    /// Echo answering a [`Message::QualityReport`].
    QualityReply {
        /// The frame copied from the report.
        frame: Frame,
    },
}

impl Message {
    /// A short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncRequest { .. } => "SyncRequest",
            Self::SyncReply { .. } => "SyncReply",
            Self::InputBatch { .. } => "InputBatch",
            Self::InputAck { .. } => "InputAck",
            Self::QualityReport { .. } => "QualityReport",
            Self::QualityReply { .. } => "QualityReply",
        }
    }
}

#[cfg(test)]
mod messages_tests {
    use super::*;

    #[test]
    fn kind_names_every_variant() {
        let variants = [
            Message::SyncRequest { nonce: 1 },
            Message::SyncReply { nonce: 1 },
            Message::InputBatch {
                start_frame: Frame::new(0),
                end_frame: Frame::new(0),
                bytes: vec![0],
            },
            Message::InputAck {
                frame: Frame::new(0),
            },
            Message::QualityReport {
                frame: Frame::new(0),
                advantage: 0,
            },
            Message::QualityReply {
                frame: Frame::new(0),
            },
        ];
        let mut kinds: Vec<&str> = variants.iter().map(Message::kind).collect();
        kinds.dedup();
        assert_eq!(kinds.len(), variants.len());
    }
}
