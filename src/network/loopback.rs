use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::network::adapter::DeviceAdapter;

type Channel = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// An in-process [`DeviceAdapter`] for wiring sessions together without a
/// network, used by the integration tests and useful for local couch-play or
/// deterministic replays.
///
/// [`LoopbackAdapter::pair`] returns two connected endpoints: datagrams sent
/// on one are delivered, in order and without loss, to the other's
/// [`poll`](DeviceAdapter::poll).
///
/// # Examples
///
/// ```
/// use rollsync::{DeviceAdapter, LoopbackAdapter};
///
/// let (mut a, mut b) = LoopbackAdapter::pair();
/// a.send(&[0x01]);
/// assert_eq!(b.poll(), vec![vec![0x01]]);
/// assert!(b.poll().is_empty());
/// ```
#[derive(Debug)]
pub struct LoopbackAdapter {
    outbound: Channel,
    inbound: Channel,
}

impl LoopbackAdapter {
    /// Creates two connected endpoints.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a_to_b: Channel = Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a: Channel = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                outbound: Arc::clone(&a_to_b),
                inbound: Arc::clone(&b_to_a),
            },
            Self {
                outbound: b_to_a,
                inbound: a_to_b,
            },
        )
    }
}

impl DeviceAdapter for LoopbackAdapter {
    fn send(&mut self, datagram: &[u8]) {
        self.outbound.lock().push_back(datagram.to_vec());
    }

    fn poll(&mut self) -> Vec<Vec<u8>> {
        self.inbound.lock().drain(..).collect()
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod loopback_tests {
    use super::*;

    #[test]
    fn delivers_in_order() {
        let (mut a, mut b) = LoopbackAdapter::pair();
        a.send(&[1]);
        a.send(&[2]);
        a.send(&[3]);
        assert_eq!(b.poll(), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn directions_are_independent() {
        let (mut a, mut b) = LoopbackAdapter::pair();
        a.send(&[0xAA]);
        b.send(&[0xBB]);
        assert_eq!(a.poll(), vec![vec![0xBB]]);
        assert_eq!(b.poll(), vec![vec![0xAA]]);
    }

    #[test]
    fn poll_drains_the_queue() {
        let (mut a, mut b) = LoopbackAdapter::pair();
        a.send(&[7]);
        assert_eq!(b.poll().len(), 1);
        assert!(b.poll().is_empty());
    }
}
