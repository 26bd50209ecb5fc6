//! Virtual network devices.
//!
//! A [`Device`] carries whole datagrams between stacks in the same address
//! space; there is no Ethernet framing, only a frame type tag and, for
//! devices that want one, a destination hardware address. Devices never
//! deliver received frames synchronously: `transmit` queues and the stack's
//! driver thread later [`poll`](Device::poll)s frames back out, so an output
//! path can never re-enter the protocol input path while holding its locks.

use std::fmt::{self, Display};
use thiserror::Error as ThisError;

pub mod dummy;
pub mod loopback;

/// The maximum transmission unit of a device, in bytes of IP datagram.
pub type Mtu = u16;

/// A six-octet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    /// The all-zero address, used by devices that do not address frames.
    pub const UNSPECIFIED: Self = Self([0u8; 6]);

    /// The broadcast address.
    pub const BROADCAST: Self = Self([0xffu8; 6]);
}

impl Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// The payload kind of a frame, standing in for the link layer's protocol
/// type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Ipv4,
    Arp,
}

/// A virtual link device.
pub trait Device: Send + Sync + 'static {
    /// A short name for logs, e.g. `lo` or `dummy0`.
    fn name(&self) -> &str;

    /// The largest datagram the device will carry.
    fn mtu(&self) -> Mtu;

    /// The device's own hardware address, if it has one.
    fn mac(&self) -> Mac {
        Mac::UNSPECIFIED
    }

    /// Whether outgoing datagrams need their next hop resolved to a
    /// hardware address first.
    fn needs_resolution(&self) -> bool {
        false
    }

    /// Hands a frame to the device for transmission. The device takes a
    /// copy; delivery is best-effort.
    fn transmit(&self, frame: FrameType, data: &[u8], dst: Mac) -> Result<(), DeviceError>;

    /// Fetches the next received frame without blocking.
    fn poll(&self) -> Option<(FrameType, Vec<u8>)>;
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("the device's receive queue is full")]
    QueueFull,
    #[error("the frame is larger than the device MTU")]
    TooLarge,
}
