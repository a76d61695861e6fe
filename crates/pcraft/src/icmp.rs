//! A minimal real [`Packet`] implementation: ICMP echo request/reply,
//! built and parsed with `pnet::packet::icmp`.
//!
//! This exists so `pcraft-send` has something concrete to drive without
//! pulling in a general-purpose packet dissector (see crate-level
//! Non-goals). The request/reply bookkeeping — matching by identifier and
//! sequence number — mirrors the `Destination`/`PacketSent` tracking in
//! `deavid-zzping`'s transport layer.

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{IcmpCodes, MutableEchoRequestPacket};
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::{Ipv4Flags, MutableIpv4Packet};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::Packet as PnetPacket;
use pnet::util::checksum;

use crate::packet::{Packet, RouteHint};
use std::net::Ipv4Addr;

const IPV4_HEADER_LEN: usize = 20;
const ICMP_HEADER_LEN: usize = 8;

/// An ICMP echo request or reply, carried over raw IPv4.
///
/// `build()` produces a full IPv4 + ICMP frame suitable for
/// [`crate::socket::IpSocket`]; `parse` does the reverse for frames read
/// back off the wire.
#[derive(Debug, Clone)]
pub struct IcmpEchoPacket {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub identifier: u16,
    pub sequence: u16,
    pub is_reply: bool,
    pub payload: Vec<u8>,
    pub time: f64,
}

impl IcmpEchoPacket {
    pub fn echo_request(src: Ipv4Addr, dst: Ipv4Addr, identifier: u16, sequence: u16, time: f64) -> Self {
        Self {
            src,
            dst,
            identifier,
            sequence,
            is_reply: false,
            payload: b"pcraft".to_vec(),
            time,
        }
    }

    /// Parse a captured IPv4 frame as an ICMP echo request/reply. Returns
    /// `None` for anything else (not IPv4, not ICMP, not an echo type).
    pub fn parse(frame: &[u8], time: f64) -> Option<Self> {
        let ipv4 = pnet::packet::ipv4::Ipv4Packet::new(frame)?;
        if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
            return None;
        }
        let icmp = IcmpPacket::new(ipv4.payload())?;
        let (is_reply, identifier, sequence, payload) = match icmp.get_icmp_type() {
            IcmpTypes::EchoReply => {
                let reply = EchoReplyPacket::new(ipv4.payload())?;
                (true, reply.get_identifier(), reply.get_sequence_number(), reply.payload().to_vec())
            }
            IcmpTypes::EchoRequest => {
                let req = pnet::packet::icmp::echo_request::EchoRequestPacket::new(ipv4.payload())?;
                (false, req.get_identifier(), req.get_sequence_number(), req.payload().to_vec())
            }
            _ => return None,
        };

        Some(Self {
            src: ipv4.get_source(),
            dst: ipv4.get_destination(),
            identifier,
            sequence,
            is_reply,
            payload,
            time,
        })
    }
}

impl Packet for IcmpEchoPacket {
    /// Identifier and sequence number together uniquely pair a request
    /// with its reply, independent of direction.
    fn hashret(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(4);
        key.extend_from_slice(&self.identifier.to_be_bytes());
        key.extend_from_slice(&self.sequence.to_be_bytes());
        key
    }

    fn answers(&self, stimulus: &Self) -> bool {
        self.is_reply
            && !stimulus.is_reply
            && self.identifier == stimulus.identifier
            && self.sequence == stimulus.sequence
            && self.src == stimulus.dst
    }

    fn route(&self) -> RouteHint {
        RouteHint {
            iface: None,
            src: Some(self.src.to_string()),
            dst: Some(self.dst.to_string()),
        }
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn build(&self) -> Vec<u8> {
        let icmp_len = ICMP_HEADER_LEN + self.payload.len();
        let mut icmp_buf = vec![0u8; icmp_len];
        {
            let mut icmp_packet = MutableEchoRequestPacket::new(&mut icmp_buf).expect("buffer sized for ICMP echo header");
            icmp_packet.set_icmp_type(IcmpTypes::EchoRequest);
            icmp_packet.set_icmp_code(IcmpCodes::NoCode);
            icmp_packet.set_identifier(self.identifier);
            icmp_packet.set_sequence_number(self.sequence);
            icmp_packet.set_payload(&self.payload);
            let csum = checksum(icmp_packet.packet(), 1);
            icmp_packet.set_checksum(csum);
        }

        let total_len = IPV4_HEADER_LEN + icmp_len;
        let mut ip_buf = vec![0u8; total_len];
        {
            let mut ip_packet = MutableIpv4Packet::new(&mut ip_buf).expect("buffer sized for IPv4 header + ICMP");
            ip_packet.set_version(4);
            ip_packet.set_header_length(5);
            ip_packet.set_total_length(total_len as u16);
            ip_packet.set_ttl(64);
            ip_packet.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
            ip_packet.set_flags(Ipv4Flags::DontFragment);
            ip_packet.set_source(self.src);
            ip_packet.set_destination(self.dst);
            ip_packet.set_payload(&icmp_buf);
            let csum = pnet::packet::ipv4::checksum(&ip_packet.to_immutable());
            ip_packet.set_checksum(csum);
        }

        ip_buf
    }

    fn summary(&self) -> String {
        let kind = if self.is_reply { "echo-reply" } else { "echo-request" };
        format!(
            "{} {} > {} id={} seq={}",
            kind, self.src, self.dst, self.identifier, self.sequence
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_reply_share_a_hashret() {
        let req = IcmpEchoPacket::echo_request(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            42,
            1,
            0.0,
        );
        let reply = IcmpEchoPacket {
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::new(10, 0, 0, 1),
            identifier: 42,
            sequence: 1,
            is_reply: true,
            payload: req.payload.clone(),
            time: 0.1,
        };
        assert_eq!(req.hashret(), reply.hashret());
        assert!(reply.answers(&req));
        assert!(!req.answers(&reply));
    }

    #[test]
    fn reply_from_wrong_source_does_not_answer() {
        let req = IcmpEchoPacket::echo_request(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            42,
            1,
            0.0,
        );
        let reply = IcmpEchoPacket {
            src: Ipv4Addr::new(10, 0, 0, 99),
            dst: Ipv4Addr::new(10, 0, 0, 1),
            identifier: 42,
            sequence: 1,
            is_reply: true,
            payload: Vec::new(),
            time: 0.1,
        };
        assert!(!reply.answers(&req));
    }

    #[test]
    fn build_then_parse_round_trips() {
        let req = IcmpEchoPacket::echo_request(
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(127, 0, 0, 1),
            7,
            3,
            0.0,
        );
        let frame = req.build();
        let parsed = IcmpEchoPacket::parse(&frame, 0.0).expect("frame should parse as ICMP echo");
        assert_eq!(parsed.identifier, 7);
        assert_eq!(parsed.sequence, 3);
        assert!(!parsed.is_reply);
        assert_eq!(parsed.payload, req.payload);
    }
}
