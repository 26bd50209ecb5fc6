//! The loopback device: everything transmitted comes back as received.

use super::{Device, DeviceError, FrameType, Mac, Mtu};
use std::collections::VecDeque;
use std::sync::Mutex;

const LOOPBACK_MTU: Mtu = Mtu::MAX;
const QUEUE_LIMIT: usize = 16;

/// A device that queues transmitted frames onto its own receive side. The
/// driver thread delivers them on its next pass, which keeps the turnaround
/// off the transmitting thread's stack.
#[derive(Debug, Default)]
pub struct Loopback {
    queue: Mutex<VecDeque<(FrameType, Vec<u8>)>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Device for Loopback {
    fn name(&self) -> &str {
        "lo"
    }

    fn mtu(&self) -> Mtu {
        LOOPBACK_MTU
    }

    fn transmit(&self, frame: FrameType, data: &[u8], _dst: Mac) -> Result<(), DeviceError> {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= QUEUE_LIMIT {
            tracing::error!(dev = self.name(), "queue is full");
            return Err(DeviceError::QueueFull);
        }
        queue.push_back((frame, data.to_vec()));
        tracing::trace!(dev = self.name(), len = data.len(), "queued frame");
        Ok(())
    }

    fn poll(&self) -> Option<(FrameType, Vec<u8>)> {
        self.queue.lock().unwrap().pop_front()
    }
}
