//! Re-exports the types most hosts need: the session surface, the directive
//! list, the transport capability and the frame/device identifiers.
//!
//! ```
//! use rollsync::prelude::*;
//!
//! let session = Session::new(2, SessionConfig::default());
//! assert!(session.is_ok());
//! ```

pub use crate::config::SessionConfig;
pub use crate::device::{DeviceRole, DeviceStats, HandshakeState};
pub use crate::error::{RollsyncError, RollsyncResult};
pub use crate::frame_info::GameInput;
pub use crate::network::adapter::{DeviceAdapter, UdpDeviceAdapter};
pub use crate::network::loopback::LoopbackAdapter;
pub use crate::session::Session;
pub use crate::state_storage::StateCell;
pub use crate::sync_engine::{Directive, DirectiveVec};
pub use crate::{DeviceId, Frame, SessionState, INITIAL_FRAME, NULL_FRAME};
