//! The Address Resolution Protocol: maps next-hop IPv4 addresses to
//! hardware addresses for devices that need them.
//!
//! The contract exposed to the IP layer is deliberately small:
//! [`Arp::resolve`] either returns the hardware address from the cache or
//! reports that a request is in flight. A pending resolution is never
//! propagated upward as an error; the caller drops its datagram and relies
//! on retransmission, by which time the reply has usually landed.

use crate::network::{Device, FrameType, Mac};
use crate::protocols::ipv4::{Iface, Ipv4Address};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod arp_parsing;
use arp_parsing::{ArpPacket, Operation};

/// The most cache entries kept at once; the stalest is evicted on overflow.
const CACHE_SIZE: usize = 32;
/// Entries unrefreshed for this long are dropped by the aging scan.
const CACHE_TIMEOUT: Duration = Duration::from_secs(30);

/// The outcome of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The cache held the answer.
    Resolved(Mac),
    /// A request has been transmitted; the answer is not in yet.
    Pending,
}

#[derive(Debug, Clone, Copy)]
enum EntryState {
    Incomplete,
    Resolved(Mac),
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    state: EntryState,
    updated: Instant,
}

/// The ARP cache and resolver.
#[derive(Default)]
pub struct Arp {
    cache: DashMap<Ipv4Address, CacheEntry>,
}

impl Arp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks `target` up in the cache, transmitting a request when the
    /// answer is missing or still outstanding.
    pub fn resolve(&self, iface: &Arc<Iface>, target: Ipv4Address) -> Resolution {
        if let Some(entry) = self.cache.get(&target) {
            if let EntryState::Resolved(mac) = entry.state {
                return Resolution::Resolved(mac);
            }
            // Still incomplete; nudge the peer again
            drop(entry);
            self.request(iface, target);
            return Resolution::Pending;
        }

        self.evict_for_room();
        self.cache.insert(
            target,
            CacheEntry {
                state: EntryState::Incomplete,
                updated: Instant::now(),
            },
        );
        self.request(iface, target);
        Resolution::Pending
    }

    /// Processes a received ARP packet: merges the sender mapping into the
    /// cache and answers requests that target one of our addresses.
    pub fn input(&self, data: &[u8], iface: &Arc<Iface>) {
        let packet = match ArpPacket::from_bytes(data.iter().cloned()) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(dev = iface.device.name(), %e, "dropped arp packet");
                return;
            }
        };

        // Update an existing mapping regardless of the target so that a
        // moved host is corrected promptly
        let merged = match self.cache.get_mut(&packet.sender_ip) {
            Some(mut entry) => {
                entry.state = EntryState::Resolved(packet.sender_mac);
                entry.updated = Instant::now();
                tracing::debug!(pa = %packet.sender_ip, ha = %packet.sender_mac, "cache updated");
                true
            }
            None => false,
        };

        if packet.target_ip != iface.unicast {
            return;
        }
        if !merged {
            self.evict_for_room();
            self.cache.insert(
                packet.sender_ip,
                CacheEntry {
                    state: EntryState::Resolved(packet.sender_mac),
                    updated: Instant::now(),
                },
            );
            tracing::debug!(pa = %packet.sender_ip, ha = %packet.sender_mac, "cache inserted");
        }
        if packet.operation == Operation::Request {
            let reply = ArpPacket::new_reply(
                iface.device.mac(),
                iface.unicast,
                packet.sender_mac,
                packet.sender_ip,
            );
            if let Err(e) =
                iface
                    .device
                    .transmit(FrameType::Arp, &reply.build(), packet.sender_mac)
            {
                tracing::error!(%e, "failed to transmit arp reply");
            }
        }
    }

    /// Drops entries that have not been refreshed within the cache timeout.
    pub fn age_tick(&self, now: Instant) {
        self.cache
            .retain(|_, entry| now.duration_since(entry.updated) < CACHE_TIMEOUT);
    }

    fn request(&self, iface: &Arc<Iface>, target: Ipv4Address) {
        let request = ArpPacket::new_request(iface.device.mac(), iface.unicast, target);
        tracing::debug!(dev = iface.device.name(), %target, "arp request");
        if let Err(e) = iface
            .device
            .transmit(FrameType::Arp, &request.build(), Mac::BROADCAST)
        {
            tracing::error!(%e, "failed to transmit arp request");
        }
    }

    fn evict_for_room(&self) {
        if self.cache.len() < CACHE_SIZE {
            return;
        }
        let oldest = self
            .cache
            .iter()
            .min_by_key(|entry| entry.updated)
            .map(|entry| *entry.key());
        if let Some(key) = oldest {
            self.cache.remove(&key);
            tracing::debug!(pa = %key, "cache entry evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dummy::Dummy;
    use crate::network::Device;

    const OUR_MAC: Mac = Mac([2, 0, 0, 0, 0, 1]);
    const PEER_MAC: Mac = Mac([2, 0, 0, 0, 0, 2]);

    fn setup() -> (Arp, Arc<Dummy>, Arc<Iface>) {
        let device = Arc::new(Dummy::addressed("dummy0", 1500, OUR_MAC));
        let iface = Arc::new(Iface::new(
            device.clone(),
            "192.0.2.1".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
        ));
        (Arp::new(), device, iface)
    }

    #[test]
    fn resolve_misses_then_learns_from_the_reply() {
        let (arp, device, iface) = setup();
        let peer: Ipv4Address = "192.0.2.2".parse().unwrap();

        assert_eq!(arp.resolve(&iface, peer), Resolution::Pending);
        let sent = device.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, FrameType::Arp);
        assert_eq!(sent[0].2, Mac::BROADCAST);
        let request = ArpPacket::from_bytes(sent[0].1.iter().cloned()).unwrap();
        assert_eq!(request.operation, Operation::Request);
        assert_eq!(request.target_ip, peer);

        let reply = ArpPacket::new_reply(PEER_MAC, peer, OUR_MAC, iface.unicast);
        arp.input(&reply.build(), &iface);
        assert_eq!(arp.resolve(&iface, peer), Resolution::Resolved(PEER_MAC));
    }

    #[test]
    fn requests_for_our_address_are_answered() {
        let (arp, device, iface) = setup();
        let peer: Ipv4Address = "192.0.2.2".parse().unwrap();

        let request = ArpPacket::new_request(PEER_MAC, peer, iface.unicast);
        arp.input(&request.build(), &iface);

        let sent = device.take_sent();
        assert_eq!(sent.len(), 1);
        let reply = ArpPacket::from_bytes(sent[0].1.iter().cloned()).unwrap();
        assert_eq!(reply.operation, Operation::Reply);
        assert_eq!(reply.sender_mac, OUR_MAC);
        assert_eq!(reply.target_mac, PEER_MAC);

        // The exchange also taught us the peer's address
        assert_eq!(arp.resolve(&iface, peer), Resolution::Resolved(PEER_MAC));
    }

    #[test]
    fn requests_for_other_hosts_are_ignored() {
        let (arp, device, iface) = setup();
        let request = ArpPacket::new_request(
            PEER_MAC,
            "192.0.2.2".parse().unwrap(),
            "192.0.2.3".parse().unwrap(),
        );
        arp.input(&request.build(), &iface);
        assert!(device.take_sent().is_empty());
    }

    #[test]
    fn stale_entries_age_out() {
        let (arp, _device, iface) = setup();
        let peer: Ipv4Address = "192.0.2.2".parse().unwrap();
        let reply = ArpPacket::new_reply(PEER_MAC, peer, OUR_MAC, iface.unicast);
        arp.input(&reply.build(), &iface);
        assert_eq!(arp.resolve(&iface, peer), Resolution::Resolved(PEER_MAC));

        arp.age_tick(Instant::now() + CACHE_TIMEOUT);
        assert_eq!(arp.resolve(&iface, peer), Resolution::Pending);
    }
}
