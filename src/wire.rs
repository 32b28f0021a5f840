//! Packet formatting and parsing.
//!
//! The engine emits complete IPv4/IPv6 + TCP packets; link-layer framing is
//! the transmit thread's business. [`PacketTemplate`] holds the fields that
//! are fixed per run (TTL, advertised windows, the MSS we offer on SYNs) and
//! stamps out packets from the per-connection values. [`parse`] is the
//! inverse and exists for ingress shims and for the exchange tests, which
//! reparse every emitted packet to assert on it.

use crate::endpoint::{Endpoint, Endpoints};
use std::fmt;
use std::net::IpAddr;
use std::ops::BitOr;
use thiserror::Error;

/// TCP control bits, in wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    pub fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn syn(self) -> bool {
        self.0 & 0x02 != 0
    }

    pub fn rst(self) -> bool {
        self.0 & 0x04 != 0
    }

    pub fn psh(self) -> bool {
        self.0 & 0x08 != 0
    }

    pub fn ack(self) -> bool {
        self.0 & 0x10 != 0
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl From<u8> for TcpFlags {
    fn from(bits: u8) -> Self {
        TcpFlags(bits & 0x3f)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (Self::SYN, "SYN"),
            (Self::ACK, "ACK"),
            (Self::PSH, "PSH"),
            (Self::FIN, "FIN"),
            (Self::RST, "RST"),
            (Self::URG, "URG"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("the packet is too short to hold its headers")]
    Truncated,
    #[error("unsupported IP version {0}")]
    Version(u8),
    #[error("not a TCP packet (protocol {0})")]
    Protocol(u8),
    #[error("invalid checksum: expected {expected:#06x}, got {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },
}

/// A calculator for the ones-complement checksum used by TCP and IP.
#[derive(Debug, Default, Clone, Copy)]
struct Checksum(u16);

impl Checksum {
    fn add_u16(&mut self, value: u16) {
        let (sum, carry) = self.0.overflowing_add(value);
        self.0 = sum + carry as u16;
    }

    fn add_u8_pair(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    fn add_u32(&mut self, value: u32) {
        let bytes = value.to_be_bytes();
        self.add_u8_pair(bytes[0], bytes[1]);
        self.add_u8_pair(bytes[2], bytes[3]);
    }

    fn add_slice(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            self.add_u8_pair(pair[0], pair[1]);
        }
        if let [last] = chunks.remainder() {
            self.add_u8_pair(*last, 0);
        }
    }

    fn finish(self) -> u16 {
        match self.0 {
            // There are two ones-complement representations of zero; emit
            // the nonzero one so the field never reads as "unset".
            0xffff => 0xffff,
            sum => !sum,
        }
    }
}

/// Per-run packet parameters plus the formatter that stamps out packets.
#[derive(Debug, Clone)]
pub struct PacketTemplate {
    /// TTL / hop limit on everything we send
    pub ttl: u8,
    /// Window advertised on ordinary connections
    pub window: u16,
    /// Window advertised when the connection is flagged small-window
    pub small_window: u16,
    /// The MSS offered in the option on outgoing SYNs
    pub mss: u16,
}

impl Default for PacketTemplate {
    fn default() -> Self {
        Self {
            ttl: 64,
            window: 65535,
            small_window: 600,
            mss: 1460,
        }
    }
}

impl PacketTemplate {
    /// Formats a full IP + TCP packet from `endpoints.local` to
    /// `endpoints.remote`. SYN packets carry the MSS option; everything else
    /// is a bare 20-byte TCP header.
    pub fn format(
        &self,
        endpoints: &Endpoints,
        seqno: u32,
        ackno: u32,
        flags: TcpFlags,
        small_window: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let window = if small_window {
            self.small_window
        } else {
            self.window
        };
        let tcp = self.format_tcp(endpoints, seqno, ackno, flags, window, payload);

        match (endpoints.local.address, endpoints.remote.address) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let total_len = 20 + tcp.len() + payload.len();
                let mut packet = Vec::with_capacity(total_len);
                packet.push(0x45);
                packet.push(0);
                packet.extend_from_slice(&(total_len as u16).to_be_bytes());
                // id, flags, fragment offset
                packet.extend_from_slice(&[0, 0, 0, 0]);
                packet.push(self.ttl);
                packet.push(6);
                packet.extend_from_slice(&[0, 0]);
                packet.extend_from_slice(&src.octets());
                packet.extend_from_slice(&dst.octets());
                let mut checksum = Checksum::default();
                checksum.add_slice(&packet);
                packet[10..12].copy_from_slice(&checksum.finish().to_be_bytes());
                packet.extend_from_slice(&tcp);
                packet.extend_from_slice(payload);
                packet
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                let payload_len = tcp.len() + payload.len();
                let mut packet = Vec::with_capacity(40 + payload_len);
                packet.extend_from_slice(&[0x60, 0, 0, 0]);
                packet.extend_from_slice(&(payload_len as u16).to_be_bytes());
                packet.push(6);
                packet.push(self.ttl);
                packet.extend_from_slice(&src.octets());
                packet.extend_from_slice(&dst.octets());
                packet.extend_from_slice(&tcp);
                packet.extend_from_slice(payload);
                packet
            }
            _ => unreachable!("mixed address families in one connection"),
        }
    }

    fn format_tcp(
        &self,
        endpoints: &Endpoints,
        seqno: u32,
        ackno: u32,
        flags: TcpFlags,
        window: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let header_len: usize = if flags.syn() { 24 } else { 20 };
        let mut tcp = Vec::with_capacity(header_len);
        tcp.extend_from_slice(&endpoints.local.port.to_be_bytes());
        tcp.extend_from_slice(&endpoints.remote.port.to_be_bytes());
        tcp.extend_from_slice(&seqno.to_be_bytes());
        tcp.extend_from_slice(&ackno.to_be_bytes());
        tcp.push(((header_len / 4) as u8) << 4);
        tcp.push(flags.bits());
        tcp.extend_from_slice(&window.to_be_bytes());
        // checksum placeholder, urgent pointer
        tcp.extend_from_slice(&[0, 0, 0, 0]);
        if flags.syn() {
            tcp.push(2);
            tcp.push(4);
            tcp.extend_from_slice(&self.mss.to_be_bytes());
        }

        let mut checksum = Checksum::default();
        checksum.add_slice(&tcp);
        checksum.add_slice(payload);
        add_pseudo_header(
            &mut checksum,
            endpoints.local.address,
            endpoints.remote.address,
            (tcp.len() + payload.len()) as u32,
        );
        tcp[16..18].copy_from_slice(&checksum.finish().to_be_bytes());
        tcp
    }
}

fn add_pseudo_header(checksum: &mut Checksum, src: IpAddr, dst: IpAddr, tcp_len: u32) {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            checksum.add_u32(src.into());
            checksum.add_u32(dst.into());
            checksum.add_u16(6);
            checksum.add_u16(tcp_len as u16);
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            checksum.add_slice(&src.octets());
            checksum.add_slice(&dst.octets());
            checksum.add_u32(tcp_len);
            checksum.add_u16(6);
        }
        _ => unreachable!("mixed address families in one connection"),
    }
}

/// A parsed IP + TCP packet. Endpoints are from the sender's perspective:
/// `local` is the source.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub endpoints: Endpoints,
    pub seqno: u32,
    pub ackno: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub ttl: u8,
    pub payload: Vec<u8>,
}

/// Parses and checksum-verifies a packet previously produced by
/// [`PacketTemplate::format`] (or anything wire-compatible with it).
pub fn parse(bytes: &[u8]) -> Result<ParsedPacket, WireError> {
    let version = bytes.first().ok_or(WireError::Truncated)? >> 4;
    let (src, dst, ttl, tcp): (IpAddr, IpAddr, u8, &[u8]) = match version {
        4 => {
            if bytes.len() < 20 {
                return Err(WireError::Truncated);
            }
            let ihl = (bytes[0] & 0x0f) as usize * 4;
            if bytes[9] != 6 {
                return Err(WireError::Protocol(bytes[9]));
            }
            let total_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
            if bytes.len() < total_len || total_len < ihl {
                return Err(WireError::Truncated);
            }
            let src: [u8; 4] = bytes[12..16].try_into().unwrap();
            let dst: [u8; 4] = bytes[16..20].try_into().unwrap();
            (
                IpAddr::from(src),
                IpAddr::from(dst),
                bytes[8],
                &bytes[ihl..total_len],
            )
        }
        6 => {
            if bytes.len() < 40 {
                return Err(WireError::Truncated);
            }
            if bytes[6] != 6 {
                return Err(WireError::Protocol(bytes[6]));
            }
            let payload_len = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
            if bytes.len() < 40 + payload_len {
                return Err(WireError::Truncated);
            }
            let src: [u8; 16] = bytes[8..24].try_into().unwrap();
            let dst: [u8; 16] = bytes[24..40].try_into().unwrap();
            (
                IpAddr::from(src),
                IpAddr::from(dst),
                bytes[7],
                &bytes[40..40 + payload_len],
            )
        }
        other => return Err(WireError::Version(other)),
    };

    if tcp.len() < 20 {
        return Err(WireError::Truncated);
    }
    let data_offset = (tcp[12] >> 4) as usize * 4;
    if data_offset < 20 || tcp.len() < data_offset {
        return Err(WireError::Truncated);
    }

    let mut checksum = Checksum::default();
    checksum.add_slice(&tcp[..16]);
    checksum.add_slice(&tcp[18..]);
    add_pseudo_header(&mut checksum, src, dst, tcp.len() as u32);
    let expected = checksum.finish();
    let actual = u16::from_be_bytes([tcp[16], tcp[17]]);
    if actual != expected {
        return Err(WireError::Checksum { expected, actual });
    }

    Ok(ParsedPacket {
        endpoints: Endpoints::new(
            Endpoint::new(src, u16::from_be_bytes([tcp[0], tcp[1]])),
            Endpoint::new(dst, u16::from_be_bytes([tcp[2], tcp[3]])),
        ),
        seqno: u32::from_be_bytes(tcp[4..8].try_into().unwrap()),
        ackno: u32::from_be_bytes(tcp[8..12].try_into().unwrap()),
        flags: TcpFlags::from(tcp[13]),
        window: u16::from_be_bytes([tcp[14], tcp[15]]),
        ttl,
        payload: tcp[data_offset..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;

    fn endpoints() -> Endpoints {
        Endpoints::new(
            Endpoint::new("10.0.0.1".parse().unwrap(), 0xcafe),
            Endpoint::new("1.2.3.4".parse().unwrap(), 0xbabe),
        )
    }

    #[test]
    fn round_trip_ipv4() -> anyhow::Result<()> {
        let template = PacketTemplate::default();
        let packet = template.format(
            &endpoints(),
            123_456_789,
            10,
            TcpFlags::PSH | TcpFlags::ACK,
            false,
            b"Hello, world!",
        );
        let parsed = parse(&packet)?;
        assert_eq!(parsed.endpoints, endpoints());
        assert_eq!(parsed.seqno, 123_456_789);
        assert_eq!(parsed.ackno, 10);
        assert!(parsed.flags.psh() && parsed.flags.ack());
        assert!(!parsed.flags.syn());
        assert_eq!(parsed.window, 65535);
        assert_eq!(parsed.ttl, 64);
        assert_eq!(parsed.payload, b"Hello, world!");
        Ok(())
    }

    #[test]
    fn round_trip_ipv6() -> anyhow::Result<()> {
        let endpoints = Endpoints::new(
            Endpoint::new("fd00::1".parse().unwrap(), 40000),
            Endpoint::new("2001:db8::2".parse().unwrap(), 443),
        );
        let template = PacketTemplate::default();
        let packet = template.format(&endpoints, 77, 0, TcpFlags::SYN, false, &[]);
        let parsed = parse(&packet)?;
        assert_eq!(parsed.endpoints, endpoints);
        assert_eq!(parsed.seqno, 77);
        assert!(parsed.flags.syn());
        Ok(())
    }

    #[test]
    fn small_window_is_advertised() -> anyhow::Result<()> {
        let template = PacketTemplate::default();
        let packet = template.format(&endpoints(), 1, 2, TcpFlags::ACK, true, &[]);
        assert_eq!(parse(&packet)?.window, 600);
        Ok(())
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let template = PacketTemplate::default();
        let mut packet = template.format(&endpoints(), 1, 2, TcpFlags::ACK, false, b"x");
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        assert!(matches!(
            parse(&packet),
            Err(WireError::Checksum { .. })
        ));
    }

    #[test]
    fn agrees_with_etherparse() -> anyhow::Result<()> {
        let payload = b"Hello, world!";
        let template = PacketTemplate::default();
        let packet = template.format(
            &endpoints(),
            123_456_789,
            10,
            TcpFlags::PSH | TcpFlags::ACK,
            false,
            payload,
        );

        let ip = etherparse::Ipv4HeaderSlice::from_slice(&packet)?;
        assert_eq!(ip.protocol(), 6);
        assert_eq!(ip.ttl(), 64);
        let tcp = etherparse::TcpHeaderSlice::from_slice(&packet[20..])?;
        assert_eq!(tcp.source_port(), 0xcafe);
        assert_eq!(tcp.destination_port(), 0xbabe);
        assert_eq!(tcp.sequence_number(), 123_456_789);
        assert_eq!(tcp.acknowledgment_number(), 10);
        assert!(tcp.psh());
        assert!(tcp.ack());
        assert_eq!(tcp.window_size(), 65535);

        let expected = tcp
            .to_header()
            .calc_checksum_ipv4(&ip.to_header(), payload)?;
        assert_eq!(tcp.checksum(), expected);
        Ok(())
    }

    #[test]
    fn syn_carries_mss_option() -> anyhow::Result<()> {
        let template = PacketTemplate::default();
        let packet = template.format(&endpoints(), 7777, 0, TcpFlags::SYN, false, &[]);
        let tcp = etherparse::TcpHeaderSlice::from_slice(&packet[20..])?;
        assert!(tcp.syn());
        let mss = tcp.options_iterator().find_map(|option| match option {
            Ok(etherparse::TcpOptionElement::MaximumSegmentSize(mss)) => Some(mss),
            _ => None,
        });
        assert_eq!(mss, Some(1460));
        Ok(())
    }
}
