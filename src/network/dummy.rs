//! A do-nothing device for exercising the stack: transmitted frames are
//! captured instead of delivered, and tests inject whatever they want on
//! the receive side.

use super::{Device, DeviceError, FrameType, Mac, Mtu};
use std::collections::VecDeque;
use std::sync::Mutex;

/// The test double for a link device. Captures every transmitted frame for
/// later inspection and replays injected frames through `poll`.
#[derive(Debug)]
pub struct Dummy {
    name: String,
    mtu: Mtu,
    mac: Mac,
    needs_resolution: bool,
    rx: Mutex<VecDeque<(FrameType, Vec<u8>)>>,
    sent: Mutex<Vec<(FrameType, Vec<u8>, Mac)>>,
}

impl Dummy {
    pub fn new(name: &str, mtu: Mtu) -> Self {
        Self {
            name: name.to_string(),
            mtu,
            mac: Mac::UNSPECIFIED,
            needs_resolution: false,
            rx: Default::default(),
            sent: Default::default(),
        }
    }

    /// A dummy that behaves like an addressed device: it has a hardware
    /// address and outgoing datagrams go through address resolution.
    pub fn addressed(name: &str, mtu: Mtu, mac: Mac) -> Self {
        Self {
            mac,
            needs_resolution: true,
            ..Self::new(name, mtu)
        }
    }

    /// Queues a frame to be handed to the stack on the next poll.
    pub fn inject(&self, frame: FrameType, data: Vec<u8>) {
        self.rx.lock().unwrap().push_back((frame, data));
    }

    /// Drains and returns everything transmitted so far.
    pub fn take_sent(&self) -> Vec<(FrameType, Vec<u8>, Mac)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Device for Dummy {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> Mtu {
        self.mtu
    }

    fn mac(&self) -> Mac {
        self.mac
    }

    fn needs_resolution(&self) -> bool {
        self.needs_resolution
    }

    fn transmit(&self, frame: FrameType, data: &[u8], dst: Mac) -> Result<(), DeviceError> {
        tracing::trace!(dev = %self.name, len = data.len(), %dst, "frame captured");
        self.sent.lock().unwrap().push((frame, data.to_vec(), dst));
        Ok(())
    }

    fn poll(&self) -> Option<(FrameType, Vec<u8>)> {
        self.rx.lock().unwrap().pop_front()
    }
}
