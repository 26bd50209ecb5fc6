use crate::network::Mac;
use crate::protocols::ipv4::Ipv4Address;
use thiserror::Error as ThisError;

/// Hardware type for Ethernet-style six-octet addresses.
const HARDWARE_ETHERNET: u16 = 0x0001;
/// Protocol type for IPv4.
const PROTOCOL_IPV4: u16 = 0x0800;

/// The length of an IPv4-over-Ethernet ARP packet.
pub(crate) const PACKET_OCTETS: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Request,
    Reply,
}

impl TryFrom<u16> for Operation {
    type Error = ParseError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            op => Err(ParseError::Operation(op)),
        }
    }
}

impl From<Operation> for u16 {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Request => 1,
            Operation::Reply => 2,
        }
    }
}

/// An ARP packet for the Ethernet/IPv4 pair, the only combination this
/// stack speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArpPacket {
    pub operation: Operation,
    pub sender_mac: Mac,
    pub sender_ip: Ipv4Address,
    pub target_mac: Mac,
    pub target_ip: Ipv4Address,
}

impl ArpPacket {
    pub fn new_request(sender_mac: Mac, sender_ip: Ipv4Address, target_ip: Ipv4Address) -> Self {
        Self {
            operation: Operation::Request,
            sender_mac,
            sender_ip,
            target_mac: Mac::UNSPECIFIED,
            target_ip,
        }
    }

    pub fn new_reply(
        sender_mac: Mac,
        sender_ip: Ipv4Address,
        target_mac: Mac,
        target_ip: Ipv4Address,
    ) -> Self {
        Self {
            operation: Operation::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        let mut next = || -> Result<u8, ParseError> { bytes.next().ok_or(ParseError::TooShort) };

        let hardware = u16::from_be_bytes([next()?, next()?]);
        if hardware != HARDWARE_ETHERNET {
            Err(ParseError::Hardware(hardware))?
        }
        let protocol = u16::from_be_bytes([next()?, next()?]);
        if protocol != PROTOCOL_IPV4 {
            Err(ParseError::Protocol(protocol))?
        }
        let hardware_length = next()?;
        let protocol_length = next()?;
        if hardware_length != 6 || protocol_length != 4 {
            Err(ParseError::AddressLength)?
        }
        let operation = u16::from_be_bytes([next()?, next()?]).try_into()?;

        let sender_mac = Mac([next()?, next()?, next()?, next()?, next()?, next()?]);
        let sender_ip = Ipv4Address::new([next()?, next()?, next()?, next()?]);
        let target_mac = Mac([next()?, next()?, next()?, next()?, next()?, next()?]);
        let target_ip = Ipv4Address::new([next()?, next()?, next()?, next()?]);

        Ok(Self {
            operation,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_OCTETS);
        out.extend_from_slice(&HARDWARE_ETHERNET.to_be_bytes());
        out.extend_from_slice(&PROTOCOL_IPV4.to_be_bytes());
        out.push(6);
        out.push(4);
        out.extend_from_slice(&u16::from(self.operation).to_be_bytes());
        out.extend_from_slice(&self.sender_mac.0);
        out.extend_from_slice(&self.sender_ip.to_bytes());
        out.extend_from_slice(&self.target_mac.0);
        out.extend_from_slice(&self.target_ip.to_bytes());
        out
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("the packet is shorter than an ARP message")]
    TooShort,
    #[error("unsupported hardware type {0:#06x}")]
    Hardware(u16),
    #[error("unsupported protocol type {0:#06x}")]
    Protocol(u16),
    #[error("unexpected hardware or protocol address length")]
    AddressLength,
    #[error("unknown operation {0}")]
    Operation(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = ArpPacket::new_request(
            Mac([2, 0, 0, 0, 0, 1]),
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
        );
        let serial = request.build();
        assert_eq!(serial.len(), PACKET_OCTETS);
        let parsed = ArpPacket::from_bytes(serial.iter().cloned()).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.operation, Operation::Request);
        assert_eq!(parsed.target_mac, Mac::UNSPECIFIED);
    }

    #[test]
    fn rejects_foreign_address_families() {
        let mut serial = ArpPacket::new_request(
            Mac([2, 0, 0, 0, 0, 1]),
            "192.0.2.1".parse().unwrap(),
            "192.0.2.2".parse().unwrap(),
        )
        .build();
        serial[1] = 0x06; // IEEE 802 hardware type
        assert_eq!(
            ArpPacket::from_bytes(serial.iter().cloned()),
            Err(ParseError::Hardware(0x0006))
        );
    }
}
