use parking_lot::Mutex;
use std::sync::Arc;

use tracing::warn;

use crate::{Frame, RollsyncError, RollsyncResult};

/// One slot of the state ring: the frame it was saved for and the host's
/// opaque state blob.
#[derive(Debug)]
struct StateSlot {
    frame: Frame,
    data: Option<Vec<u8>>,
}

impl Default for StateSlot {
    fn default() -> Self {
        Self {
            frame: Frame::NULL,
            data: None,
        }
    }
}

/// A shared handle to one slot of the session's state storage.
///
/// The session hands out `StateCell`s inside [`Directive::Save`] and
/// [`Directive::Load`] and keeps the slots themselves; the host writes a
/// serialized state blob into the cell when saving and reads it back when
/// loading. The core never inspects the blob.
///
/// Cells use interior mutability, so cloning a cell yields another handle to
/// the same slot.
///
/// # Examples
///
/// ```
/// use rollsync::{Frame, StateCell};
///
/// let cell = StateCell::default();
/// assert!(cell.save(Frame::new(3), vec![1, 2, 3]));
/// assert_eq!(cell.frame(), Frame::new(3));
/// assert_eq!(cell.load(), Some(vec![1, 2, 3]));
/// ```
///
/// [`Directive::Save`]: crate::Directive::Save
/// [`Directive::Load`]: crate::Directive::Load
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<Mutex<StateSlot>>);

impl StateCell {
    /// Stores a state blob for `frame` in this slot, replacing whatever the
    /// slot held before.
    ///
    /// Returns `false` (and stores nothing) if `frame` is null.
    pub fn save(&self, frame: Frame, data: Vec<u8>) -> bool {
        if !frame.is_valid() {
            warn!("attempted to save state with invalid frame {}", frame);
            return false;
        }
        let mut slot = self.0.lock();
        slot.frame = frame;
        slot.data = Some(data);
        true
    }

    /// Returns a copy of the stored state blob, or `None` if the slot was
    /// never written.
    #[must_use]
    pub fn load(&self) -> Option<Vec<u8>> {
        self.0.lock().data.clone()
    }

    /// Returns the frame this slot was last saved for, or [`Frame::NULL`] if
    /// it was never written.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.0.lock().frame
    }
}

/// Fixed-capacity circular buffer mapping frames to state slots.
///
/// The ring holds `max_rollback_frames + 1` slots so the engine can always
/// roll back to the oldest frame of its prediction window. The slot for
/// frame `f` lives at index `f % capacity`; writing a slot forgets whichever
/// frame previously occupied it.
#[derive(Debug)]
pub(crate) struct StateStorage {
    cells: Vec<StateCell>,
}

impl StateStorage {
    /// Creates storage able to roll back `max_rollback_frames` frames.
    #[must_use]
    pub(crate) fn new(max_rollback_frames: usize) -> Self {
        // the current frame plus the whole prediction window must fit
        let capacity = max_rollback_frames + 1;
        let mut cells = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            cells.push(StateCell::default());
        }
        Self { cells }
    }

    /// Returns the cell a save directive for `frame` should target.
    ///
    /// # Errors
    /// Returns [`RollsyncError::InvalidRequest`] for invalid frames.
    pub(crate) fn cell_for_save(&self, frame: Frame) -> RollsyncResult<StateCell> {
        let idx = frame
            .buffer_index(self.cells.len())
            .ok_or_else(|| RollsyncError::InvalidRequest {
                info: format!("cannot save state for invalid frame {}", frame),
            })?;
        Ok(self.cells[idx].clone())
    }

    /// Returns the cell holding the state of `frame`, verifying that the
    /// slot actually still holds that frame.
    ///
    /// # Errors
    /// - [`RollsyncError::MissingState`] if the slot was never written.
    /// - [`RollsyncError::FrameOutOfWindow`] if the slot has since been
    ///   overwritten by a newer frame (or not yet written for this one).
    /// - [`RollsyncError::InvalidRequest`] for invalid frames.
    pub(crate) fn cell_for_load(&self, frame: Frame) -> RollsyncResult<StateCell> {
        let idx = frame
            .buffer_index(self.cells.len())
            .ok_or_else(|| RollsyncError::InvalidRequest {
                info: format!("cannot load state for invalid frame {}", frame),
            })?;
        let cell = &self.cells[idx];
        let stored = cell.frame();
        if stored.is_null() {
            return Err(RollsyncError::MissingState { frame });
        }
        if stored != frame {
            return Err(RollsyncError::FrameOutOfWindow { frame, stored });
        }
        Ok(cell.clone())
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod state_storage_tests {
    use super::*;

    #[test]
    fn cell_roundtrip() {
        let cell = StateCell::default();
        assert!(cell.frame().is_null());
        assert!(cell.load().is_none());
        assert!(cell.save(Frame::new(7), vec![0xAB]));
        assert_eq!(cell.frame(), Frame::new(7));
        assert_eq!(cell.load(), Some(vec![0xAB]));
    }

    #[test]
    fn cell_rejects_null_frame() {
        let cell = StateCell::default();
        assert!(!cell.save(Frame::NULL, vec![1]));
        assert!(cell.load().is_none());
    }

    #[test]
    fn clones_share_the_slot() {
        let cell = StateCell::default();
        let handle = cell.clone();
        handle.save(Frame::new(2), vec![9]);
        assert_eq!(cell.load(), Some(vec![9]));
    }

    #[test]
    fn load_after_save_restores_state() {
        let storage = StateStorage::new(8);
        let cell = storage.cell_for_save(Frame::new(4)).unwrap();
        cell.save(Frame::new(4), vec![1, 2, 3]);
        let loaded = storage.cell_for_load(Frame::new(4)).unwrap();
        assert_eq!(loaded.load(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn load_of_unwritten_slot_is_missing_state() {
        let storage = StateStorage::new(8);
        assert_eq!(
            storage.cell_for_load(Frame::new(0)).unwrap_err(),
            RollsyncError::MissingState {
                frame: Frame::new(0)
            }
        );
    }

    #[test]
    fn ring_overwrite_evicts_old_frames() {
        // capacity is max_rollback + 1 = 9; frame 9 reuses frame 0's slot
        let storage = StateStorage::new(8);
        for f in 0..=9 {
            let cell = storage.cell_for_save(Frame::new(f)).unwrap();
            cell.save(Frame::new(f), vec![f as u8]);
        }
        let err = storage.cell_for_load(Frame::new(0)).unwrap_err();
        assert_eq!(
            err,
            RollsyncError::FrameOutOfWindow {
                frame: Frame::new(0),
                stored: Frame::new(9),
            }
        );
        // the rest of the window is still loadable
        for f in 1..=9 {
            assert!(storage.cell_for_load(Frame::new(f)).is_ok());
        }
    }

    #[test]
    fn invalid_frames_are_rejected() {
        let storage = StateStorage::new(8);
        assert!(storage.cell_for_save(Frame::NULL).is_err());
        assert!(storage.cell_for_load(Frame::NULL).is_err());
    }
}
