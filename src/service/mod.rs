pub mod instance;

mod port;

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};
use std::time;

use crate::token::Token;
use crate::transport::{Transport, TransmitId};
use crate::wire::{self, checksum, Header, Session};
use crate::Error;

use instance::{Datagram, Endpoint, EndpointInfo, Instance, InstanceRef};

/// Granularity of the receive-timeout sweep. Hosts drive [`Service::tick`]
/// at this interval.
pub const TICK_INTERVAL_MS: u64 = 50;

/// First port of the ephemeral range. Ports below this are the well-known
/// range and are never assigned automatically.
pub const EPHEMERAL_PORT_FIRST: u16 = 1024;

/// A completion signal drained through [`Service::poll_event`].
#[derive(Debug)]
pub enum Event {
    /// A receive token completed; the result is stored in the token.
    RxComplete(Token),
    /// A transmit token completed; the result is stored in the token.
    TxComplete(Token),
}

// Source of millisecond arrival timestamps
struct Epoch {
    time_base: time::Instant,
}

impl Epoch {
    fn new() -> Self {
        Self {
            time_base: time::Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.time_base.elapsed().as_millis() as u64
    }
}

struct InflightTransmit {
    id: TransmitId,
    instance: InstanceRef,
    token: Token,
}

pub(crate) struct ServiceCore {
    // Shared transmit path and link-layer filter control
    transport: Box<dyn Transport + Send>,
    // Every endpoint of this interface, configured or not, in creation order
    instances: Vec<InstanceRef>,
    // Rotating ephemeral-port cursor
    ports: port::PortAllocator,
    // Sends handed to the transport and not yet completed
    inflight: Vec<InflightTransmit>,
    next_transmit_id: TransmitId,
    next_instance_id: u64,
    // Queue of pending completion signals
    events: VecDeque<Event>,
    // Arrival timestamps are computed relative to service creation
    epoch: Epoch,
}

/// One UDP multiplexing service bound to one IPv4 interface.
///
/// The service owns the endpoint table and serializes every operation,
/// inbound datagram, completion, and timeout sweep under one internal lock.
/// It is cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Service {
    core: Arc<Mutex<ServiceCore>>,
}

impl Service {
    /// Creates a service on top of the given transport substrate.
    pub fn new(transport: Box<dyn Transport + Send>) -> Self {
        Self {
            core: Arc::new(Mutex::new(ServiceCore {
                transport,
                instances: Vec::new(),
                ports: port::PortAllocator::new(),
                inflight: Vec::new(),
                next_transmit_id: 1,
                next_instance_id: 1,
                events: VecDeque::new(),
                epoch: Epoch::new(),
            })),
        }
    }

    /// Creates a new, unconfigured endpoint.
    pub fn create_endpoint(&self) -> Endpoint {
        let ref mut core = *self.core.lock().unwrap();

        let id = core.next_instance_id;
        core.next_instance_id += 1;

        let instance = Arc::new(RwLock::new(Instance::new(id)));
        core.instances.push(Arc::clone(&instance));

        Endpoint::new(Arc::clone(&self.core), instance)
    }

    /// Processes one inbound datagram. `frame` holds the UDP header followed
    /// by the payload; the addresses come from the enclosing IPv4 header.
    ///
    /// Returns the number of endpoints that accepted the datagram. Malformed
    /// or checksum-invalid datagrams are dropped silently; a valid datagram
    /// that no endpoint accepts is answered with an ICMP port-unreachable
    /// notification unless it was addressed to a broadcast or multicast
    /// destination.
    pub fn handle_datagram(&self, src_addr: Ipv4Addr, dst_addr: Ipv4Addr, frame: &[u8]) -> usize {
        let ref mut core = *self.core.lock().unwrap();

        let Some(header) = Header::read(frame) else {
            log::debug!("dropping truncated datagram from {}", src_addr);
            return 0;
        };

        let length = header.length as usize;

        if length < wire::HEADER_SIZE || length > frame.len() {
            log::debug!("dropping datagram with bad length field from {}", src_addr);
            return 0;
        }

        let payload = &frame[wire::HEADER_SIZE..length];

        // A checksum field of zero means the sender supplied none
        if header.checksum != 0 && !checksum::verify(src_addr, dst_addr, &header, payload) {
            log::debug!(
                "dropping datagram with bad checksum from {}:{}",
                src_addr,
                header.src_port
            );
            return 0;
        }

        let session = Session {
            src_addr,
            src_port: header.src_port,
            dst_addr,
            dst_port: header.dst_port,
        };

        let datagram = Arc::new(Datagram {
            session,
            timestamp_ms: core.epoch.now_ms(),
            payload: payload.to_vec().into_boxed_slice(),
        });

        // Collect matches first, then mutate the accepting queues
        let matched: Vec<InstanceRef> = core
            .instances
            .iter()
            .filter(|instance_ref| instance_ref.read().unwrap().matches(&session))
            .cloned()
            .collect();

        for instance_ref in &matched {
            let ref mut inst = *instance_ref.write().unwrap();

            inst.enqueue(Arc::clone(&datagram));
            instance::deliver(inst, &mut core.events);
        }

        if matched.is_empty() {
            drop(datagram);

            if !broadcast_or_multicast(core, dst_addr) {
                log::debug!(
                    "no endpoint for {}:{}, notifying {}:{}",
                    dst_addr,
                    session.dst_port,
                    src_addr,
                    session.src_port
                );
                core.transport.send_port_unreachable(session);
            }

            return 0;
        }

        log::trace!(
            "datagram for {}:{} accepted by {} endpoint(s)",
            dst_addr,
            session.dst_port,
            matched.len()
        );

        matched.len()
    }

    /// Routes an inbound ICMP error message to the endpoint whose traffic
    /// caused it. `session` is the addressing tuple of the offending original
    /// datagram, source being the local endpoint.
    pub fn handle_icmp_error(&self, icmp_type: u8, icmp_code: u8, session: Session) {
        let Some(kind) = wire::icmp::IcmpKind::classify(icmp_type, icmp_code) else {
            return;
        };

        let ref mut core = *self.core.lock().unwrap();

        // The local side of the tuple identifies the owner. Only a fully
        // bound endpoint can be correlated; wildcard-address, any-port and
        // promiscuous endpoints are ambiguous.
        let owner = core
            .instances
            .iter()
            .find(|instance_ref| {
                let inst = instance_ref.read().unwrap();

                match &inst.config {
                    Some(config) => {
                        !config.accept_promiscuous
                            && !config.accept_any_port
                            && !config.station_address.is_unspecified()
                            && config.station_address == session.src_addr
                            && config.station_port == session.src_port
                    }
                    None => false,
                }
            })
            .cloned();

        let Some(owner) = owner else {
            log::debug!(
                "dropping {} for unowned session {}:{}",
                kind,
                session.src_addr,
                session.src_port
            );
            return;
        };

        let ref mut inst = *owner.write().unwrap();

        inst.pending_icmp = Some(kind);
        instance::report_icmp(inst, &mut core.events);
    }

    /// Reports the outcome of a transmit previously handed to the transport.
    /// Removes the corresponding token from its endpoint and signals it.
    pub fn complete_transmit(&self, id: TransmitId, status: Result<(), Error>) {
        let ref mut core = *self.core.lock().unwrap();

        let Some(position) = core.inflight.iter().position(|entry| entry.id == id) else {
            return;
        };

        let entry = core.inflight.remove(position);

        {
            let ref mut inst = *entry.instance.write().unwrap();

            if let Some(position) = inst.tx_tokens.iter().position(|t| *t == entry.token) {
                inst.tx_tokens.remove(position);
            }
        }

        entry
            .token
            .complete(crate::token::Completion::Transmit(status));
        core.events.push_back(Event::TxComplete(entry.token));
    }

    /// Runs one timeout sweep. Hosts call this every [`TICK_INTERVAL_MS`]
    /// milliseconds; buffered datagrams whose remaining timeout elapses are
    /// dropped without delivery.
    pub fn tick(&self) {
        let ref mut core = *self.core.lock().unwrap();

        for instance_ref in &core.instances {
            let ref mut inst = *instance_ref.write().unwrap();

            if inst.config.is_none() {
                continue;
            }

            inst.pending.retain_mut(|entry| match entry.remaining_ms {
                None => true,
                Some(remaining) if remaining > TICK_INTERVAL_MS => {
                    entry.remaining_ms = Some(remaining - TICK_INTERVAL_MS);
                    true
                }
                Some(_) => {
                    log::trace!(
                        "expiring buffered datagram from {}:{}",
                        entry.datagram.session.src_addr,
                        entry.datagram.session.src_port
                    );
                    false
                }
            });
        }
    }

    /// Pumps the transport substrate once.
    pub fn poll(&self) {
        self.core.lock().unwrap().transport.poll();
    }

    /// Returns the next pending completion signal, if any.
    pub fn poll_event(&self) -> Option<Event> {
        self.core.lock().unwrap().events.pop_front()
    }

    /// Enumerates the currently configured endpoints.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let core = self.core.lock().unwrap();

        core.instances
            .iter()
            .filter_map(|instance_ref| instance_ref.read().unwrap().info())
            .collect()
    }
}

// Reprograms the link-layer filter with the union of all joined groups.
pub(crate) fn refresh_multicast_filter(core: &mut ServiceCore) {
    let mut groups: Vec<Ipv4Addr> = Vec::new();

    for instance_ref in &core.instances {
        for &group in &instance_ref.read().unwrap().groups {
            if !groups.contains(&group) {
                groups.push(group);
            }
        }
    }

    core.transport.set_multicast_filter(&groups);
}

// Hands one assembled datagram to the transport, tracking the token until
// the completion callback fires.
pub(crate) fn submit_transmit(
    core: &mut ServiceCore,
    instance_ref: &InstanceRef,
    token: &Token,
    datagram: crate::transport::OutboundDatagram,
) {
    let id = core.next_transmit_id;
    core.next_transmit_id += 1;

    core.inflight.push(InflightTransmit {
        id,
        instance: Arc::clone(instance_ref),
        token: token.clone(),
    });

    core.transport.send_datagram(datagram, id);
}

// Asks the transport to abort every in-flight send of `token`. The tokens
// stay in their set until the completion callback removes them.
pub(crate) fn abort_transmit(core: &mut ServiceCore, instance_ref: &InstanceRef, token: &Token) {
    let ids: Vec<TransmitId> = core
        .inflight
        .iter()
        .filter(|entry| entry.token == *token && Arc::ptr_eq(&entry.instance, instance_ref))
        .map(|entry| entry.id)
        .collect();

    for id in ids {
        core.transport.abort_send(id);
    }
}

pub(crate) fn local_address(core: &ServiceCore) -> Ipv4Addr {
    core.transport.local_address()
}

pub(crate) fn push_event(core: &mut ServiceCore, event: Event) {
    core.events.push_back(event);
}

// True if `dst_addr` is a multicast group, the limited broadcast, or the
// subnet-directed broadcast of any configured endpoint.
fn broadcast_or_multicast(core: &ServiceCore, dst_addr: Ipv4Addr) -> bool {
    if wire::is_multicast(dst_addr) || wire::is_limited_broadcast(dst_addr) {
        return true;
    }

    core.instances.iter().any(|instance_ref| {
        let inst = instance_ref.read().unwrap();

        match &inst.config {
            Some(config) => {
                !config.station_address.is_unspecified()
                    && dst_addr == wire::subnet_broadcast(config.station_address, config.subnet_mask)
            }
            None => false,
        }
    })
}
