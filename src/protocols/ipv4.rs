//! An implementation of the [Internet Protocol version
//! 4](https://datatracker.ietf.org/doc/html/rfc791), trimmed to what a
//! transport needs: interfaces bound to devices, longest-prefix routing,
//! datagram validation on input, and a pluggable demultiplex registry keyed
//! by protocol number. Fragmentation is rejected in both directions.

use crate::network::{Device, FrameType, Mac, Mtu};
use crate::protocols::arp::{Arp, Resolution};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error as ThisError;

mod ipv4_address;
pub use ipv4_address::Ipv4Address;

mod ipv4_parsing;
pub use ipv4_parsing::{Ipv4Header, ParseError};
use ipv4_parsing::{Ipv4HeaderBuilder, BASE_OCTETS};

mod route;
use route::RouteTable;

/// A handler for one upper-layer protocol, registered against its protocol
/// number. The stack calls `input` with the datagram payload once the IPv4
/// header has been validated and stripped.
pub trait IpProtocol: Send + Sync + 'static {
    fn input(&self, data: &[u8], src: Ipv4Address, dst: Ipv4Address, iface: &Arc<Iface>);
}

/// An IPv4 interface: a unicast/netmask pair bound to a device.
pub struct Iface {
    pub unicast: Ipv4Address,
    pub netmask: Ipv4Address,
    pub broadcast: Ipv4Address,
    pub device: Arc<dyn Device>,
}

impl Iface {
    pub fn new(device: Arc<dyn Device>, unicast: Ipv4Address, netmask: Ipv4Address) -> Self {
        let broadcast = (unicast.masked(netmask).to_u32() | !netmask.to_u32()).into();
        Self {
            unicast,
            netmask,
            broadcast,
            device,
        }
    }
}

/// The IPv4 layer.
pub struct Ipv4 {
    ifaces: RwLock<Vec<Arc<Iface>>>,
    routes: RwLock<RouteTable>,
    protocols: DashMap<u8, Arc<dyn IpProtocol>>,
    arp: Arc<Arp>,
    next_identification: AtomicU16,
}

impl Ipv4 {
    /// The length of the option-less IPv4 header this stack emits.
    pub const HEADER_OCTETS: u16 = BASE_OCTETS;

    pub fn new(arp: Arc<Arp>) -> Self {
        Self {
            ifaces: Default::default(),
            routes: Default::default(),
            protocols: Default::default(),
            arp,
            next_identification: AtomicU16::new(0),
        }
    }

    /// Registers a handler for an upper-layer protocol number. At most one
    /// handler may exist per protocol.
    pub fn register_protocol(
        &self,
        protocol: u8,
        handler: Arc<dyn IpProtocol>,
    ) -> Result<(), IpError> {
        match self.protocols.entry(protocol) {
            Entry::Occupied(_) => {
                tracing::error!(protocol, "already registered");
                Err(IpError::DuplicateProtocol(protocol))
            }
            Entry::Vacant(entry) => {
                entry.insert(handler);
                tracing::info!(protocol, "registered");
                Ok(())
            }
        }
    }

    /// Binds an interface to a device and installs the connected route for
    /// its subnet.
    pub fn add_iface(
        &self,
        device: Arc<dyn Device>,
        unicast: Ipv4Address,
        netmask: Ipv4Address,
    ) -> Arc<Iface> {
        let iface = Arc::new(Iface::new(device, unicast, netmask));
        self.routes.write().unwrap().add(
            unicast.masked(netmask),
            netmask,
            None,
            iface.clone(),
        );
        self.ifaces.write().unwrap().push(iface.clone());
        tracing::info!(
            dev = iface.device.name(),
            unicast = %iface.unicast,
            netmask = %iface.netmask,
            "interface registered"
        );
        iface
    }

    /// Installs the default route through `gateway`, reached via `iface`.
    pub fn set_default_gateway(&self, iface: &Arc<Iface>, gateway: Ipv4Address) {
        self.routes.write().unwrap().add(
            Ipv4Address::ANY,
            Ipv4Address::ANY,
            Some(gateway),
            iface.clone(),
        );
    }

    /// A snapshot of the registered interfaces, for the driver loop.
    pub fn ifaces(&self) -> Vec<Arc<Iface>> {
        self.ifaces.read().unwrap().clone()
    }

    /// The interface a datagram for `dst` would leave through, if any.
    /// Transports use this to derive the path MTU.
    pub fn route_iface(&self, dst: Ipv4Address) -> Option<Arc<Iface>> {
        self.routes
            .read()
            .unwrap()
            .lookup(dst)
            .map(|route| route.iface.clone())
    }

    /// Validates a received datagram and demultiplexes its payload to the
    /// registered upper-layer protocol. Malformed datagrams are dropped
    /// with a log entry.
    pub fn input(&self, data: &[u8], iface: &Arc<Iface>) {
        let header = match Ipv4Header::from_bytes(data.iter().cloned()) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(dev = iface.device.name(), %e, "dropped datagram");
                return;
            }
        };
        let header_length = header.ihl as usize * 4;
        let total_length = header.total_length as usize;
        if total_length < header_length || total_length > data.len() {
            tracing::debug!(dev = iface.device.name(), "dropped datagram: bad length");
            return;
        }
        if header.is_fragment() {
            tracing::debug!(
                dev = iface.device.name(),
                "dropped datagram: fragments are not supported"
            );
            return;
        }
        if header.destination != iface.unicast
            && header.destination != iface.broadcast
            && header.destination != Ipv4Address::BROADCAST
        {
            // Addressed to someone else; this stack does not forward
            return;
        }
        tracing::trace!(
            dev = iface.device.name(),
            src = %header.source,
            dst = %header.destination,
            protocol = header.protocol,
            len = total_length,
            "datagram in"
        );
        match self.protocols.get(&header.protocol) {
            Some(handler) => handler.input(
                &data[header_length..total_length],
                header.source,
                header.destination,
                iface,
            ),
            None => {
                tracing::debug!(protocol = header.protocol, "unsupported protocol");
            }
        }
    }

    /// Routes and transmits one upper-layer payload. The source address, if
    /// given, must match the egress interface. Next-hop hardware addresses
    /// are resolved through ARP for devices that need it; a pending
    /// resolution drops the datagram, which upper layers treat as loss.
    pub fn output(
        &self,
        protocol: u8,
        payload: &[u8],
        src: Ipv4Address,
        dst: Ipv4Address,
    ) -> Result<(), IpError> {
        let routes = self.routes.read().unwrap();
        let route = routes.lookup(dst).ok_or_else(|| {
            tracing::error!(%dst, "no route to host");
            IpError::Unreachable(dst)
        })?;
        let iface = route.iface.clone();
        let nexthop = route.nexthop.unwrap_or(dst);
        drop(routes);

        if !src.is_any() && src != iface.unicast {
            tracing::error!(%src, unicast = %iface.unicast, "source address mismatch");
            return Err(IpError::SourceMismatch);
        }

        let total = payload.len() + BASE_OCTETS as usize;
        if total > iface.device.mtu() as usize {
            tracing::error!(
                total,
                mtu = iface.device.mtu(),
                "datagram too long and fragmentation is not supported"
            );
            return Err(IpError::TooBig(iface.device.mtu()));
        }

        let identification = self.next_identification.fetch_add(1, Ordering::Relaxed);
        let mut datagram =
            Ipv4HeaderBuilder::new(iface.unicast, dst, protocol, payload.len() as u16)
                .identification(identification)
                .build()
                .map_err(|_| IpError::TooBig(iface.device.mtu()))?;
        datagram.extend_from_slice(payload);

        let dst_mac = if iface.device.needs_resolution() {
            match self.arp.resolve(&iface, nexthop) {
                Resolution::Resolved(mac) => mac,
                Resolution::Pending => {
                    tracing::debug!(%nexthop, "address resolution pending, datagram dropped");
                    return Ok(());
                }
            }
        } else {
            Mac::UNSPECIFIED
        };

        tracing::trace!(
            dev = iface.device.name(),
            src = %iface.unicast,
            %dst,
            protocol,
            len = total,
            "datagram out"
        );
        iface
            .device
            .transmit(FrameType::Ipv4, &datagram, dst_mac)
            .map_err(IpError::Device)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum IpError {
    #[error("no route to {0}")]
    Unreachable(Ipv4Address),
    #[error("the source address does not belong to the egress interface")]
    SourceMismatch,
    #[error("the datagram exceeds the device MTU of {0}")]
    TooBig(Mtu),
    #[error("a handler is already registered for protocol {0}")]
    DuplicateProtocol(u8),
    #[error("{0}")]
    Device(#[from] crate::network::DeviceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dummy::Dummy;
    use std::sync::Mutex;

    struct Sink {
        received: Mutex<Vec<(Vec<u8>, Ipv4Address, Ipv4Address)>>,
    }

    impl IpProtocol for Sink {
        fn input(&self, data: &[u8], src: Ipv4Address, dst: Ipv4Address, _iface: &Arc<Iface>) {
            self.received.lock().unwrap().push((data.to_vec(), src, dst));
        }
    }

    fn setup() -> (Arc<Ipv4>, Arc<Dummy>, Arc<Iface>, Arc<Sink>) {
        let ip = Arc::new(Ipv4::new(Arc::new(Arp::new())));
        let device = Arc::new(Dummy::new("dummy0", 1500));
        let iface = ip.add_iface(
            device.clone(),
            "192.0.2.1".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
        );
        let sink = Arc::new(Sink {
            received: Default::default(),
        });
        ip.register_protocol(61, sink.clone()).unwrap();
        (ip, device, iface, sink)
    }

    #[test]
    fn output_then_input_round_trip() {
        let (ip, device, iface, sink) = setup();
        ip.output(
            61,
            b"payload",
            Ipv4Address::ANY,
            "192.0.2.2".parse().unwrap(),
        )
        .unwrap();

        let sent = device.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, FrameType::Ipv4);

        // Feed the datagram back in as though the peer had sent it to us
        let mut datagram = sent[0].1.clone();
        // Swap source and destination so it is addressed to this interface
        let (src, dst): (Vec<u8>, Vec<u8>) =
            (datagram[12..16].to_vec(), datagram[16..20].to_vec());
        datagram[12..16].copy_from_slice(&dst);
        datagram[16..20].copy_from_slice(&src);
        // Fix the checksum for the swap: the sum is commutative over the
        // swapped words, so it is unchanged.
        ip.input(&datagram, &iface);

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, b"payload");
        assert_eq!(received[0].2, "192.0.2.1".parse().unwrap());
    }

    #[test]
    fn fragments_are_rejected() {
        let (ip, device, iface, sink) = setup();
        ip.output(
            61,
            b"payload",
            Ipv4Address::ANY,
            "192.0.2.1".parse().unwrap(),
        )
        .unwrap();
        let mut datagram = device.take_sent().remove(0).1;
        // The checksum no longer matches once the fragment offset changes,
        // so recompute it: clear, set offset, then patch.
        datagram[6] = 0x00;
        datagram[7] = 0x10; // fragment offset 16
        datagram[10] = 0;
        datagram[11] = 0;
        let mut checksum = crate::protocols::utility::Checksum::new();
        checksum.accumulate_remainder(datagram[..20].iter().cloned());
        let sum = checksum.as_u16().to_be_bytes();
        datagram[10] = sum[0];
        datagram[11] = sum[1];

        ip.input(&datagram, &iface);
        assert!(sink.received.lock().unwrap().is_empty());
    }

    #[test]
    fn no_route_is_an_error() {
        let (ip, _device, _iface, _sink) = setup();
        assert_eq!(
            ip.output(
                61,
                b"payload",
                Ipv4Address::ANY,
                "203.0.113.9".parse().unwrap(),
            ),
            Err(IpError::Unreachable("203.0.113.9".parse().unwrap()))
        );
    }

    #[test]
    fn oversize_datagrams_are_refused() {
        let ip = Arc::new(Ipv4::new(Arc::new(Arp::new())));
        let device = Arc::new(Dummy::new("dummy0", 100));
        ip.add_iface(
            device,
            "192.0.2.1".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
        );
        assert_eq!(
            ip.output(
                61,
                &[0u8; 200],
                Ipv4Address::ANY,
                "192.0.2.2".parse().unwrap(),
            ),
            Err(IpError::TooBig(100))
        );
    }
}
