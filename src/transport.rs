use std::net::Ipv4Addr;

use crate::wire::Session;

/// Identifies one in-flight transmit request between the service and the
/// transport substrate.
pub type TransmitId = u64;

/// A fully assembled UDP datagram handed to the transport for transmission.
/// The frame holds the UDP header (checksum filled in) followed by the
/// payload; the IPv4 header is the transport's business.
#[derive(Clone, Debug)]
pub struct OutboundDatagram {
    pub frame: Box<[u8]>,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub type_of_service: u8,
    pub time_to_live: u8,
    pub do_not_fragment: bool,
}

/// The IPv4 substrate below the service.
///
/// Implementations must not call back into the [`Service`](crate::Service)
/// from within these methods; the service holds its internal lock while
/// invoking them. Transmit completions are reported afterwards, from the
/// host's event loop, through
/// [`Service::complete_transmit`](crate::Service::complete_transmit).
pub trait Transport {
    /// Queues one datagram for transmission. Exactly one completion for `id`
    /// must eventually be reported, whether the send succeeds, fails, or is
    /// aborted.
    fn send_datagram(&mut self, datagram: OutboundDatagram, id: TransmitId);

    /// Requests that an in-flight send be abandoned. The completion for `id`
    /// still arrives through the ordinary completion path, typically with
    /// [`Error::Aborted`](crate::Error::Aborted).
    fn abort_send(&mut self, id: TransmitId);

    /// Emits an ICMP port-unreachable notification toward the sender of an
    /// undeliverable datagram. Best-effort.
    fn send_port_unreachable(&mut self, session: Session);

    /// Programs the link-layer multicast receive filter. `groups` is the
    /// union of every endpoint's joined groups.
    fn set_multicast_filter(&mut self, groups: &[Ipv4Addr]);

    /// The interface address used as the source of sends from endpoints
    /// bound to the wildcard station address.
    fn local_address(&self) -> Ipv4Addr;

    /// Manual pump for hosts without an event-driven transport.
    fn poll(&mut self) {}
}
