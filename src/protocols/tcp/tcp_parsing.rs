use crate::protocols::ipv4::Ipv4Address;
use crate::protocols::utility::{Checksum, Endpoint};
use std::fmt::{self, Display};
use std::ops::BitOr;
use thiserror::Error as ThisError;

/// The length of the fixed TCP header. Nothing longer is ever emitted;
/// received segments may carry options, located via the data offset field.
pub const HEADER_OCTETS: u16 = 20;

/// The control bits of a segment, in wire order: FIN is the lowest bit and
/// URG the highest of the six. The two reserved bits above them are masked
/// out on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Control(u8);

impl Control {
    pub const FIN: Control = Control(0x01);
    pub const SYN: Control = Control(0x02);
    pub const RST: Control = Control(0x04);
    pub const PSH: Control = Control(0x08);
    pub const ACK: Control = Control(0x10);
    pub const URG: Control = Control(0x20);

    const MASK: u8 = 0x3f;

    /// No more data from sender
    pub fn fin(self) -> bool {
        self.0 & Self::FIN.0 != 0
    }

    /// Synchronize sequence numbers
    pub fn syn(self) -> bool {
        self.0 & Self::SYN.0 != 0
    }

    /// Reset the connection
    pub fn rst(self) -> bool {
        self.0 & Self::RST.0 != 0
    }

    /// Push function
    pub fn psh(self) -> bool {
        self.0 & Self::PSH.0 != 0
    }

    /// Acknowledgment field significant
    pub fn ack(self) -> bool {
        self.0 & Self::ACK.0 != 0
    }

    /// Urgent pointer field significant
    pub fn urg(self) -> bool {
        self.0 & Self::URG.0 != 0
    }
}

impl BitOr for Control {
    type Output = Control;

    fn bitor(self, rhs: Control) -> Control {
        Control(self.0 | rhs.0)
    }
}

impl From<u8> for Control {
    fn from(byte: u8) -> Self {
        Self(byte & Self::MASK)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

impl Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{}{}",
            if self.urg() { 'U' } else { '-' },
            if self.ack() { 'A' } else { '-' },
            if self.psh() { 'P' } else { '-' },
            if self.rst() { 'R' } else { '-' },
            if self.syn() { 'S' } else { '-' },
            if self.fin() { 'F' } else { '-' },
        )
    }
}

/// A parsed TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words. Five for every segment this stack
    /// emits; larger values locate the payload past received options.
    pub data_offset: u8,
    pub ctl: Control,
    pub wnd: u16,
    pub checksum: u16,
    pub up: u16,
}

impl TcpHeader {
    /// Parses a segment's header from a byte iterator, verifying the
    /// checksum over the pseudo-header, header, options, and payload. The
    /// iterator should cover the whole segment.
    pub fn from_bytes(
        mut bytes: impl Iterator<Item = u8>,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
    ) -> Result<Self, ParseError> {
        let mut next = || -> Result<u8, ParseError> { bytes.next().ok_or(ParseError::TooShort) };
        let mut checksum = Checksum::new();

        let src_port = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(src_port);

        let dst_port = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(dst_port);

        let seq_bytes = [next()?, next()?, next()?, next()?];
        let seq = u32::from_be_bytes(seq_bytes);
        checksum.add_u32(seq_bytes);

        let ack_bytes = [next()?, next()?, next()?, next()?];
        let ack = u32::from_be_bytes(ack_bytes);
        checksum.add_u32(ack_bytes);

        let offset_and_control = [next()?, next()?];
        checksum.add_u8(offset_and_control[0], offset_and_control[1]);
        let data_offset = offset_and_control[0] >> 4;
        let ctl = Control::from(offset_and_control[1]);
        if data_offset < 5 {
            Err(ParseError::DataOffset(data_offset))?
        }

        let wnd = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(wnd);

        let expected_checksum = u16::from_be_bytes([next()?, next()?]);

        let up = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(up);

        // Options and payload together, padded to an even length
        let remainder = checksum.accumulate_remainder(&mut bytes);

        let segment_length = HEADER_OCTETS + remainder;
        if data_offset as u16 * 4 > segment_length {
            Err(ParseError::TooShort)?
        }

        // Pseudo-header
        checksum.add_u32(src_address.into());
        checksum.add_u32(dst_address.into());
        checksum.add_u8(0, 6);
        checksum.add_u16(segment_length);

        let actual_checksum = checksum.as_u16();
        if actual_checksum != expected_checksum {
            return Err(ParseError::Checksum {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        Ok(Self {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset,
            ctl,
            wnd,
            checksum: expected_checksum,
            up,
        })
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("the segment is shorter than its header claims")]
    TooShort,
    #[error("the data offset {0} is smaller than the fixed header")]
    DataOffset(u8),
    #[error("the checksum {expected:#06x} does not match the calculated checksum {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },
}

/// A builder for outgoing segments. Produces the serialized segment —
/// fixed header plus payload — with the checksum computed over the
/// pseudo-header for the endpoints given at construction.
pub(crate) struct TcpHeaderBuilder {
    local: Endpoint,
    remote: Endpoint,
    seq: u32,
    ack: u32,
    ctl: Control,
    wnd: u16,
}

impl TcpHeaderBuilder {
    pub fn new(local: Endpoint, remote: Endpoint, seq: u32) -> Self {
        Self {
            local,
            remote,
            seq,
            ack: 0,
            ctl: Control::default(),
            wnd: 0,
        }
    }

    /// Sets the control bits wholesale.
    pub fn control(mut self, ctl: Control) -> Self {
        self.ctl = ctl;
        self
    }

    /// Sets the acknowledgment number. Meaningful only when the control
    /// bits carry ACK.
    pub fn acknowledgment(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    /// Sets the advertised receive window.
    pub fn window(mut self, wnd: u16) -> Self {
        self.wnd = wnd;
        self
    }

    pub fn build(self, payload: &[u8]) -> Result<Vec<u8>, BuildError> {
        let segment_length = (HEADER_OCTETS as usize)
            .checked_add(payload.len())
            .filter(|&length| length <= u16::MAX as usize)
            .ok_or(BuildError::OverlyLongPayload)? as u16;
        let offset_byte = 5u8 << 4;
        let control_byte = u8::from(self.ctl);

        let mut checksum = Checksum::new();
        checksum.add_u16(self.local.port);
        checksum.add_u16(self.remote.port);
        checksum.add_u32(self.seq.to_be_bytes());
        checksum.add_u32(self.ack.to_be_bytes());
        checksum.add_u8(offset_byte, control_byte);
        checksum.add_u16(self.wnd);
        checksum.add_u16(0); // urgent pointer
        checksum.accumulate_remainder(payload.iter().cloned());
        checksum.add_u32(self.local.address.into());
        checksum.add_u32(self.remote.address.into());
        checksum.add_u8(0, 6);
        checksum.add_u16(segment_length);

        let mut out = Vec::with_capacity(segment_length as usize);
        out.extend_from_slice(&self.local.port.to_be_bytes());
        out.extend_from_slice(&self.remote.port.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(offset_byte);
        out.push(control_byte);
        out.extend_from_slice(&self.wnd.to_be_bytes());
        out.extend_from_slice(&checksum.as_u16().to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    #[error("the payload does not fit in a segment")]
    OverlyLongPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Address = Ipv4Address::new([127, 0, 0, 1]);
    const DST: Ipv4Address = Ipv4Address::new([123, 45, 67, 89]);

    #[test]
    fn parses_a_reference_segment() -> anyhow::Result<()> {
        let payload = b"Hello, world!";
        let mut expected = etherparse::TcpHeader::new(0xcafe, 0xbabe, 123456789, 1024);
        expected.acknowledgment_number = 10;
        expected.ack = true;
        expected.psh = true;
        let ip_header =
            etherparse::Ipv4Header::new(payload.len() as u16, 30, 6, SRC.into(), DST.into());
        expected.checksum = expected.calc_checksum_ipv4(&ip_header, payload)?;
        let serial = {
            let mut serial = vec![];
            expected.write(&mut serial)?;
            serial.extend_from_slice(payload);
            serial
        };

        let actual = TcpHeader::from_bytes(serial.iter().cloned(), SRC, DST)?;
        assert_eq!(actual.src_port, 0xcafe);
        assert_eq!(actual.dst_port, 0xbabe);
        assert_eq!(actual.seq, 123456789);
        assert_eq!(actual.ack, 10);
        assert_eq!(actual.data_offset, 5);
        assert!(actual.ctl.ack());
        assert!(actual.ctl.psh());
        assert!(!actual.ctl.syn());
        assert_eq!(actual.wnd, 1024);
        assert_eq!(actual.checksum, expected.checksum);
        assert_eq!(actual.up, 0);
        Ok(())
    }

    #[test]
    fn builder_output_matches_the_reference() -> anyhow::Result<()> {
        let payload = b"Hello, world!";
        let local = Endpoint::new(SRC, 0xcafe);
        let remote = Endpoint::new(DST, 0xbabe);
        let actual = TcpHeaderBuilder::new(local, remote, 123456789)
            .control(Control::ACK | Control::PSH)
            .acknowledgment(10)
            .window(1024)
            .build(payload)?;

        let mut expected = etherparse::TcpHeader::new(0xcafe, 0xbabe, 123456789, 1024);
        expected.acknowledgment_number = 10;
        expected.ack = true;
        expected.psh = true;
        let ip_header =
            etherparse::Ipv4Header::new(payload.len() as u16, 30, 6, SRC.into(), DST.into());
        expected.checksum = expected.calc_checksum_ipv4(&ip_header, payload)?;
        let serial = {
            let mut serial = vec![];
            expected.write(&mut serial)?;
            serial.extend_from_slice(payload);
            serial
        };

        assert_eq!(actual, serial);
        Ok(())
    }

    #[test]
    fn options_are_skipped_via_the_data_offset() -> anyhow::Result<()> {
        // Hand-build a segment with a six-word header: one maximum segment
        // size option follows the fixed fields.
        let payload = b"hi";
        let base = TcpHeaderBuilder::new(Endpoint::new(SRC, 80), Endpoint::new(DST, 81), 1)
            .control(Control::ACK)
            .acknowledgment(2)
            .build(payload)?;
        let mut serial = base[..20].to_vec();
        serial.extend_from_slice(&[0x02, 0x04, 0x05, 0xb4]);
        serial.extend_from_slice(&base[20..]);
        serial[12] = 6 << 4;
        // Patch the checksum: zero it, then recompute over the new bytes
        serial[16] = 0;
        serial[17] = 0;
        let mut checksum = Checksum::new();
        let length = checksum.accumulate_remainder(serial.iter().cloned());
        checksum.add_u32(SRC.into());
        checksum.add_u32(DST.into());
        checksum.add_u8(0, 6);
        checksum.add_u16(length);
        let sum = checksum.as_u16().to_be_bytes();
        serial[16] = sum[0];
        serial[17] = sum[1];

        let header = TcpHeader::from_bytes(serial.iter().cloned(), SRC, DST)?;
        assert_eq!(header.data_offset, 6);
        assert_eq!(&serial[header.data_offset as usize * 4..], payload);
        Ok(())
    }

    #[test]
    fn corrupted_segments_are_rejected() -> anyhow::Result<()> {
        let local = Endpoint::new(SRC, 80);
        let remote = Endpoint::new(DST, 81);
        let mut serial = TcpHeaderBuilder::new(local, remote, 1)
            .control(Control::ACK)
            .acknowledgment(2)
            .build(b"data")?;
        serial[22] ^= 0x01;
        assert!(matches!(
            TcpHeader::from_bytes(serial.iter().cloned(), SRC, DST),
            Err(ParseError::Checksum { .. })
        ));
        Ok(())
    }

    #[test]
    fn reserved_control_bits_are_masked() {
        let ctl = Control::from(0b1101_0010);
        assert!(ctl.ack());
        assert!(ctl.syn());
        assert!(!ctl.fin());
        assert_eq!(u8::from(ctl), 0b0001_0010);
    }
}
