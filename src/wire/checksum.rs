//! The UDP-over-IPv4 checksum: an RFC 1071 ones'-complement sum over the
//! pseudo-header, the UDP header, and the payload.

use std::net::Ipv4Addr;

use super::{Header, HEADER_SIZE};

const PROTOCOL_UDP: u8 = 17;

fn propagate_carries(word: u32) -> u16 {
    let sum = (word >> 16) + (word & 0xffff);
    ((sum >> 16) as u16) + (sum as u16)
}

/// Computes an RFC 1071 compliant checksum of `bytes` (without the final
/// complement). An odd trailing byte is padded with zero.
pub fn data(mut bytes: &[u8]) -> u16 {
    let mut accum: u32 = 0;

    while bytes.len() >= 2 {
        accum += ((bytes[0] as u32) << 8) | bytes[1] as u32;
        bytes = &bytes[2..];
    }

    if let Some(&value) = bytes.first() {
        accum += (value as u32) << 8;
    }

    propagate_carries(accum)
}

/// Combines several RFC 1071 compliant checksums.
pub fn combine(checksums: &[u16]) -> u16 {
    let mut accum: u32 = 0;

    for &word in checksums {
        accum += word as u32;
    }

    propagate_carries(accum)
}

/// Computes the IPv4 pseudo-header checksum for a UDP datagram of
/// `udp_length` bytes (header plus payload).
pub fn pseudo_header(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, udp_length: u16) -> u16 {
    let mut proto_len = [0u8; 4];
    proto_len[1] = PROTOCOL_UDP;
    proto_len[2] = (udp_length >> 8) as u8;
    proto_len[3] = udp_length as u8;

    combine(&[
        data(&src_addr.octets()),
        data(&dst_addr.octets()),
        data(&proto_len),
    ])
}

/// Computes the checksum field value for one datagram. The header's checksum
/// field is ignored; a result of zero is substituted with 0xFFFF, since zero
/// on the wire means "no checksum supplied".
pub fn datagram(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, header: &Header, payload: &[u8]) -> u16 {
    let mut header_bytes = [0u8; HEADER_SIZE];

    Header {
        checksum: 0,
        ..*header
    }
    .write(&mut header_bytes);

    let folded = combine(&[
        pseudo_header(src_addr, dst_addr, header.length),
        data(&header_bytes),
        data(payload),
    ]);

    match !folded {
        0 => 0xFFFF,
        value => value,
    }
}

/// Validates the checksum field of a received datagram. Callers are expected
/// to skip validation entirely when the field is zero.
pub fn verify(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, header: &Header, payload: &[u8]) -> bool {
    header.checksum == datagram(src_addr, dst_addr, header, payload)
}
