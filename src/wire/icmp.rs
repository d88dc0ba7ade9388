//! Classification of the ICMP errors that can refer to a previously sent
//! datagram.

use std::fmt;

pub const TYPE_DEST_UNREACHABLE: u8 = 3;
pub const TYPE_SOURCE_QUENCH: u8 = 4;
pub const TYPE_TIME_EXCEEDED: u8 = 11;
pub const TYPE_PARAMETER_PROBLEM: u8 = 12;

pub const CODE_NET_UNREACHABLE: u8 = 0;
pub const CODE_HOST_UNREACHABLE: u8 = 1;
pub const CODE_PROTOCOL_UNREACHABLE: u8 = 2;
pub const CODE_PORT_UNREACHABLE: u8 = 3;
pub const CODE_FRAGMENTATION_NEEDED: u8 = 4;
pub const CODE_SOURCE_ROUTE_FAILED: u8 = 5;

/// The abstract classification of an ICMP error message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcmpKind {
    NetUnreachable,
    HostUnreachable,
    ProtocolUnreachable,
    PortUnreachable,
    FragmentationNeeded,
    SourceRouteFailed,
    SourceQuench,
    TtlExceeded,
    ParameterProblem,
}

impl IcmpKind {
    /// Translates a raw ICMP type/code pair. Returns `None` for messages that
    /// do not describe a delivery error.
    pub fn classify(icmp_type: u8, icmp_code: u8) -> Option<IcmpKind> {
        match (icmp_type, icmp_code) {
            (TYPE_DEST_UNREACHABLE, CODE_NET_UNREACHABLE) => Some(IcmpKind::NetUnreachable),
            (TYPE_DEST_UNREACHABLE, CODE_HOST_UNREACHABLE) => Some(IcmpKind::HostUnreachable),
            (TYPE_DEST_UNREACHABLE, CODE_PROTOCOL_UNREACHABLE) => {
                Some(IcmpKind::ProtocolUnreachable)
            }
            (TYPE_DEST_UNREACHABLE, CODE_PORT_UNREACHABLE) => Some(IcmpKind::PortUnreachable),
            (TYPE_DEST_UNREACHABLE, CODE_FRAGMENTATION_NEEDED) => {
                Some(IcmpKind::FragmentationNeeded)
            }
            (TYPE_DEST_UNREACHABLE, CODE_SOURCE_ROUTE_FAILED) => Some(IcmpKind::SourceRouteFailed),
            (TYPE_SOURCE_QUENCH, _) => Some(IcmpKind::SourceQuench),
            (TYPE_TIME_EXCEEDED, _) => Some(IcmpKind::TtlExceeded),
            (TYPE_PARAMETER_PROBLEM, _) => Some(IcmpKind::ParameterProblem),
            _ => None,
        }
    }
}

impl fmt::Display for IcmpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpKind::NetUnreachable => write!(f, "network unreachable"),
            IcmpKind::HostUnreachable => write!(f, "host unreachable"),
            IcmpKind::ProtocolUnreachable => write!(f, "protocol unreachable"),
            IcmpKind::PortUnreachable => write!(f, "port unreachable"),
            IcmpKind::FragmentationNeeded => write!(f, "fragmentation needed"),
            IcmpKind::SourceRouteFailed => write!(f, "source route failed"),
            IcmpKind::SourceQuench => write!(f, "source quench"),
            IcmpKind::TtlExceeded => write!(f, "time to live exceeded"),
            IcmpKind::ParameterProblem => write!(f, "parameter problem"),
        }
    }
}
