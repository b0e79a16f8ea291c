//! IPv4/UDP framing for DNS traffic on the virtual interface side
//!
//! Queries arrive as raw IPv4 packets from the IP stack and answers leave the
//! same way. Only the framing lives here; DNS payloads are handled by
//! `hickory-proto` in the session and server modules.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

use crate::error::FakeDnsError;

const UDP_HEADER_LEN: usize = 8;
const DEFAULT_HOP_LIMIT: u8 = 64;

/// Largest UDP payload that fits an IPv4 packet
pub const MAX_UDP_PAYLOAD: usize = 65_535 - 20 - UDP_HEADER_LEN;

/// A UDP datagram borrowed from an IPv4 packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    /// Sender
    pub source: SocketAddrV4,
    /// Receiver
    pub destination: SocketAddrV4,
    /// UDP payload
    pub payload: &'a [u8],
}

/// Parse an IPv4 packet carrying an unfragmented UDP datagram
///
/// # Errors
///
/// Returns `FakeDnsError::MalformedPacket` for truncated packets, fragments,
/// and protocols other than UDP.
pub fn parse_ipv4_udp(packet: &[u8]) -> Result<UdpDatagram<'_>, FakeDnsError> {
    let ip = Ipv4Packet::new_checked(packet)
        .map_err(|e| FakeDnsError::malformed(format!("ipv4: {e}")))?;

    if ip.next_header() != IpProtocol::Udp {
        return Err(FakeDnsError::malformed(format!(
            "not udp: {}",
            ip.next_header()
        )));
    }
    if ip.more_frags() || ip.frag_offset() != 0 {
        return Err(FakeDnsError::malformed("fragmented datagram"));
    }

    let src_addr = to_std(ip.src_addr());
    let dst_addr = to_std(ip.dst_addr());

    let udp = UdpPacket::new_checked(ip.payload())
        .map_err(|e| FakeDnsError::malformed(format!("udp: {e}")))?;

    Ok(UdpDatagram {
        source: SocketAddrV4::new(src_addr, udp.src_port()),
        destination: SocketAddrV4::new(dst_addr, udp.dst_port()),
        payload: udp.payload(),
    })
}

/// Build an IPv4 packet carrying `payload` in a UDP datagram
///
/// Header and UDP checksums are filled in.
///
/// # Errors
///
/// Returns `FakeDnsError::ResponseBuild` if the payload does not fit.
pub fn build_ipv4_udp(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    payload: &[u8],
) -> Result<Bytes, FakeDnsError> {
    if payload.len() > MAX_UDP_PAYLOAD {
        return Err(FakeDnsError::ResponseBuild(format!(
            "payload of {} bytes does not fit a UDP datagram",
            payload.len()
        )));
    }

    let src_addr = to_smoltcp(*source.ip());
    let dst_addr = to_smoltcp(*destination.ip());

    let udp_repr = UdpRepr {
        src_port: source.port(),
        dst_port: destination.port(),
    };
    let ip_repr = Ipv4Repr {
        src_addr,
        dst_addr,
        next_header: IpProtocol::Udp,
        payload_len: UDP_HEADER_LEN + payload.len(),
        hop_limit: DEFAULT_HOP_LIMIT,
    };

    let caps = ChecksumCapabilities::default();
    let mut buffer = vec![0u8; ip_repr.buffer_len() + ip_repr.payload_len];

    let mut ip_packet = Ipv4Packet::new_unchecked(&mut buffer[..]);
    ip_repr.emit(&mut ip_packet, &caps);

    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &IpAddress::Ipv4(src_addr),
        &IpAddress::Ipv4(dst_addr),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &caps,
    );

    Ok(Bytes::from(buffer))
}

fn to_std(addr: Ipv4Address) -> Ipv4Addr {
    Ipv4Addr::from(addr.0)
}

fn to_smoltcp(addr: Ipv4Addr) -> Ipv4Address {
    Ipv4Address(addr.octets())
}
