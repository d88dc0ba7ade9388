use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};

use crate::token::{Completion, ReceivedDatagram, Token};
use crate::transport::OutboundDatagram;
use crate::wire::icmp::IcmpKind;
use crate::wire::{self, checksum, Header, Session};
use crate::Error;

use super::{Event, ServiceCore};

pub(crate) type InstanceRef = Arc<RwLock<Instance>>;

/// Configuration of one endpoint.
///
/// A zero `station_address` binds the wildcard address; a zero
/// `station_port` requests an ephemeral port, assigned during
/// [`Endpoint::configure`]. Zero remote fields leave the corresponding
/// inbound filter open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Accept datagrams regardless of their destination port.
    pub accept_any_port: bool,
    /// Accept datagrams addressed to a broadcast destination.
    pub accept_broadcast: bool,
    /// Accept every datagram seen by the interface, bypassing all filters.
    pub accept_promiscuous: bool,
    /// Share the station port with other endpoints instead of reserving it.
    pub allow_duplicate_port: bool,
    /// Type-of-service byte applied to sent datagrams.
    pub type_of_service: u8,
    /// Time-to-live applied to sent datagrams.
    pub time_to_live: u8,
    /// Forbid the transport from fragmenting sent datagrams.
    pub do_not_fragment: bool,
    /// How long a buffered datagram waits for a receive token before it is
    /// silently dropped, in milliseconds. Zero disables the timeout.
    pub receive_timeout_ms: u64,
    /// Attach arrival timestamps from the receive hardware. Not implemented.
    pub receive_timestamps: bool,
    pub station_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub station_port: u16,
    pub remote_address: Ipv4Addr,
    pub remote_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accept_any_port: false,
            accept_broadcast: false,
            accept_promiscuous: false,
            allow_duplicate_port: false,
            type_of_service: 0,
            time_to_live: 64,
            do_not_fragment: false,
            receive_timeout_ms: 0,
            receive_timestamps: false,
            station_address: Ipv4Addr::UNSPECIFIED,
            subnet_mask: Ipv4Addr::UNSPECIFIED,
            station_port: 0,
            remote_address: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        if self.receive_timestamps {
            return Err(Error::Unsupported);
        }

        if !wire::is_valid_netmask(self.subnet_mask) {
            return Err(Error::InvalidConfiguration);
        }

        if !self.station_address.is_unspecified()
            && !wire::is_unicast(self.station_address, self.subnet_mask)
        {
            return Err(Error::InvalidConfiguration);
        }

        if !self.remote_address.is_unspecified()
            && !wire::is_unicast(self.remote_address, Ipv4Addr::UNSPECIFIED)
        {
            return Err(Error::InvalidConfiguration);
        }

        Ok(())
    }

    // Whether a configured endpoint may switch from `old` to `new` without a
    // reset. The filter identity (flags, bound addresses and ports) must
    // survive; pass-through fields like ToS, TTL and the receive timeout may
    // change freely.
    fn reconfigurable(old: &Config, new: &Config) -> bool {
        if old.accept_any_port != new.accept_any_port
            || old.accept_broadcast != new.accept_broadcast
            || old.accept_promiscuous != new.accept_promiscuous
            || old.allow_duplicate_port != new.allow_duplicate_port
        {
            return false;
        }

        if !old.accept_any_port && new.station_port != old.station_port {
            return false;
        }

        if !old.accept_promiscuous {
            if new.station_address.is_unspecified() != old.station_address.is_unspecified() {
                return false;
            }

            if !old.station_address.is_unspecified()
                && (new.station_address != old.station_address
                    || new.subnet_mask != old.subnet_mask)
            {
                return false;
            }
        }

        if new.remote_address != old.remote_address {
            return false;
        }

        if !old.remote_address.is_unspecified() && new.remote_port != old.remote_port {
            return false;
        }

        true
    }
}

/// Description of one sent datagram, validated by [`Endpoint::transmit`].
#[derive(Clone, Debug, Default)]
pub struct TransmitData {
    /// Overrides the configured remote addressing for this datagram only.
    pub session: Option<TransmitSession>,
    /// Next-hop override handed through to the transport.
    pub gateway: Option<Ipv4Addr>,
    /// Payload fragments, concatenated in order into one datagram.
    pub fragments: Vec<Box<[u8]>>,
    /// Total payload length; must equal the sum of the fragment lengths.
    pub data_length: usize,
}

/// Per-datagram addressing override.
#[derive(Clone, Copy, Debug)]
pub struct TransmitSession {
    /// Source address override. Must be unicast when present.
    pub source_address: Option<Ipv4Addr>,
    /// Source port override; zero uses the station port.
    pub source_port: u16,
    pub destination_address: Ipv4Addr,
    /// Destination port; zero falls back to the configured remote port.
    pub destination_port: u16,
}

// One buffered inbound datagram, shared between every accepting endpoint.
pub(crate) struct Datagram {
    pub session: Session,
    pub timestamp_ms: u64,
    pub payload: Box<[u8]>,
}

// One queue slot of an endpoint. `remaining_ms` counts down under the
// timeout sweep; `None` never expires.
pub(crate) struct PendingEntry {
    pub datagram: Arc<Datagram>,
    pub remaining_ms: Option<u64>,
}

pub(crate) struct Instance {
    pub id: u64,
    pub config: Option<Config>,
    pub groups: Vec<Ipv4Addr>,
    // Received datagrams awaiting a receive token, oldest first
    pub pending: VecDeque<PendingEntry>,
    // Outstanding tokens, oldest first
    pub tx_tokens: VecDeque<Token>,
    pub rx_tokens: VecDeque<Token>,
    // One parked network error awaiting the next receive completion
    pub pending_icmp: Option<IcmpKind>,
}

impl Instance {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            config: None,
            groups: Vec::new(),
            pending: VecDeque::new(),
            tx_tokens: VecDeque::new(),
            rx_tokens: VecDeque::new(),
            pending_icmp: None,
        }
    }

    // The receive filter. Evaluation order matters: promiscuous endpoints
    // accept before any port or address comparison is made.
    pub fn matches(&self, session: &Session) -> bool {
        let Some(config) = &self.config else {
            return false;
        };

        if config.accept_promiscuous {
            return true;
        }

        if !config.accept_any_port && session.dst_port != config.station_port {
            return false;
        }

        if config.remote_port != 0 && session.src_port != config.remote_port {
            return false;
        }

        if !config.remote_address.is_unspecified() && session.src_addr != config.remote_address {
            return false;
        }

        if config.station_address.is_unspecified() {
            return true;
        }

        if session.dst_addr == config.station_address {
            return true;
        }

        if config.accept_broadcast && self.is_broadcast_destination(session.dst_addr, config) {
            return true;
        }

        if wire::is_multicast(session.dst_addr) && self.groups.contains(&session.dst_addr) {
            return true;
        }

        false
    }

    fn is_broadcast_destination(&self, dst_addr: Ipv4Addr, config: &Config) -> bool {
        wire::is_limited_broadcast(dst_addr)
            || dst_addr == wire::subnet_broadcast(config.station_address, config.subnet_mask)
    }

    pub fn enqueue(&mut self, datagram: Arc<Datagram>) {
        let remaining_ms = match &self.config {
            Some(config) if config.receive_timeout_ms != 0 => Some(config.receive_timeout_ms),
            _ => None,
        };

        self.pending.push_back(PendingEntry {
            datagram,
            remaining_ms,
        });
    }

    pub fn info(&self) -> Option<EndpointInfo> {
        self.config.as_ref().map(|config| EndpointInfo {
            id: self.id,
            station_address: config.station_address,
            station_port: config.station_port,
            remote_address: config.remote_address,
            remote_port: config.remote_port,
        })
    }
}

/// One row of [`Service::endpoints`](crate::Service::endpoints): the bound
/// identity of a configured endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
    pub id: u64,
    pub station_address: Ipv4Addr,
    pub station_port: u16,
    pub remote_address: Ipv4Addr,
    pub remote_port: u16,
}

/// Handle to one endpoint of a [`Service`](crate::Service).
pub struct Endpoint {
    core: Arc<Mutex<ServiceCore>>,
    instance: InstanceRef,
}

impl Endpoint {
    pub(crate) fn new(core: Arc<Mutex<ServiceCore>>, instance: InstanceRef) -> Self {
        Self { core, instance }
    }

    /// Binds, reconfigures, or resets this endpoint.
    ///
    /// `Some(config)` on an unconfigured endpoint validates the
    /// configuration and reserves the station port. On a configured endpoint
    /// it applies in place when only pass-through fields changed, and fails
    /// with [`Error::AlreadyStarted`] otherwise; reset first in that case.
    /// `None` cancels all tokens, flushes buffered datagrams, leaves every
    /// multicast group, and returns the endpoint to the unconfigured state.
    pub fn configure(&self, config: Option<Config>) -> Result<(), Error> {
        let ref mut core = *self.core.lock().unwrap();
        configure(core, &self.instance, config)
    }

    /// Validates and sends one datagram. The token completes through the
    /// transport's completion callback.
    pub fn transmit(&self, token: &Token, data: TransmitData) -> Result<(), Error> {
        let ref mut core = *self.core.lock().unwrap();
        transmit(core, &self.instance, token, data)
    }

    /// Registers a receive token. Completes immediately if a datagram (or a
    /// parked network error) is already waiting, in submission order
    /// otherwise.
    pub fn receive(&self, token: &Token) -> Result<(), Error> {
        let ref mut core = *self.core.lock().unwrap();
        receive(core, &self.instance, token)
    }

    /// Cancels one outstanding token, or all of them when `token` is `None`.
    /// Buffered datagrams stay queued either way.
    pub fn cancel(&self, token: Option<&Token>) -> Result<(), Error> {
        let ref mut core = *self.core.lock().unwrap();
        cancel(core, &self.instance, token)
    }

    /// Joins a multicast group and reprograms the link-layer filter.
    pub fn join(&self, group: Ipv4Addr) -> Result<(), Error> {
        let ref mut core = *self.core.lock().unwrap();
        join(core, &self.instance, group)
    }

    /// Leaves one multicast group, or all of them when `group` is `None`.
    pub fn leave(&self, group: Option<Ipv4Addr>) -> Result<(), Error> {
        let ref mut core = *self.core.lock().unwrap();
        leave(core, &self.instance, group)
    }

    /// The bound identity of this endpoint, if configured.
    pub fn info(&self) -> Option<EndpointInfo> {
        self.instance.read().unwrap().info()
    }

    /// Tears the endpoint down and removes it from the service.
    pub fn close(self) {
        let ref mut core = *self.core.lock().unwrap();

        teardown(core, &self.instance);
        core.instances
            .retain(|instance_ref| !Arc::ptr_eq(instance_ref, &self.instance));
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }
}

impl Eq for Endpoint {}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.instance.read().unwrap().id)
            .finish()
    }
}

pub(crate) fn configure(
    core: &mut ServiceCore,
    instance_ref: &InstanceRef,
    config: Option<Config>,
) -> Result<(), Error> {
    let Some(mut new_config) = config else {
        teardown(core, instance_ref);
        return Ok(());
    };

    new_config.validate()?;

    let current = instance_ref.read().unwrap().config.clone();

    if let Some(current) = current {
        // The compatibility rule keeps the bound identity (and with it the
        // port reservation) intact; only pass-through fields may differ
        if !Config::reconfigurable(&current, &new_config) {
            return Err(Error::AlreadyStarted);
        }
    } else {
        core.ports
            .bind(&core.instances, instance_ref, &mut new_config)?;
    }

    instance_ref.write().unwrap().config = Some(new_config);

    Ok(())
}

pub(crate) fn teardown(core: &mut ServiceCore, instance_ref: &InstanceRef) {
    cancel_all(core, instance_ref);

    let had_groups = {
        let ref mut inst = *instance_ref.write().unwrap();

        inst.pending.clear();
        inst.pending_icmp = None;
        inst.config = None;

        let had_groups = !inst.groups.is_empty();
        inst.groups.clear();
        had_groups
    };

    if had_groups {
        super::refresh_multicast_filter(core);
    }
}

pub(crate) fn transmit(
    core: &mut ServiceCore,
    instance_ref: &InstanceRef,
    token: &Token,
    data: TransmitData,
) -> Result<(), Error> {
    let config = match &instance_ref.read().unwrap().config {
        Some(config) => config.clone(),
        None => return Err(Error::NotStarted),
    };

    if data.fragments.is_empty() || data.fragments.iter().any(|fragment| fragment.is_empty()) {
        return Err(Error::InvalidConfiguration);
    }

    let total: usize = data.fragments.iter().map(|fragment| fragment.len()).sum();

    if total != data.data_length || total > wire::PAYLOAD_SIZE_MAX {
        return Err(Error::InvalidConfiguration);
    }

    if let Some(gateway) = data.gateway {
        if !wire::is_unicast(gateway, Ipv4Addr::UNSPECIFIED) {
            return Err(Error::InvalidConfiguration);
        }
    }

    // Resolve the datagram's addressing from the override and the
    // configured remote, rejecting ambiguous destinations
    let (dst_addr, dst_port, src_override, src_port_override) = match &data.session {
        Some(session) => {
            if session.destination_address.is_unspecified() {
                return Err(Error::InvalidConfiguration);
            }

            if let Some(source) = session.source_address {
                if !wire::is_unicast(source, Ipv4Addr::UNSPECIFIED) {
                    return Err(Error::InvalidConfiguration);
                }
            }

            let dst_port = if session.destination_port != 0 {
                session.destination_port
            } else {
                config.remote_port
            };

            (
                session.destination_address,
                dst_port,
                session.source_address,
                session.source_port,
            )
        }
        None => {
            if config.remote_address.is_unspecified() {
                return Err(Error::InvalidConfiguration);
            }

            (config.remote_address, config.remote_port, None, 0)
        }
    };

    if dst_port == 0 {
        return Err(Error::InvalidConfiguration);
    }

    let src_addr = src_override.unwrap_or(if config.station_address.is_unspecified() {
        super::local_address(core)
    } else {
        config.station_address
    });

    let src_port = if src_port_override != 0 {
        src_port_override
    } else {
        config.station_port
    };

    let mut frame = vec![0u8; wire::HEADER_SIZE + total];
    let mut offset = wire::HEADER_SIZE;

    for fragment in &data.fragments {
        frame[offset..offset + fragment.len()].copy_from_slice(fragment);
        offset += fragment.len();
    }

    let mut header = Header {
        src_port,
        dst_port,
        length: (wire::HEADER_SIZE + total) as u16,
        checksum: 0,
    };

    header.checksum = checksum::datagram(src_addr, dst_addr, &header, &frame[wire::HEADER_SIZE..]);
    header.write(&mut frame[..wire::HEADER_SIZE]);

    token.submit()?;
    instance_ref.write().unwrap().tx_tokens.push_back(token.clone());

    super::submit_transmit(
        core,
        instance_ref,
        token,
        OutboundDatagram {
            frame: frame.into_boxed_slice(),
            src_addr,
            dst_addr,
            gateway: data.gateway,
            type_of_service: config.type_of_service,
            time_to_live: config.time_to_live,
            do_not_fragment: config.do_not_fragment,
        },
    );

    Ok(())
}

pub(crate) fn receive(
    core: &mut ServiceCore,
    instance_ref: &InstanceRef,
    token: &Token,
) -> Result<(), Error> {
    if instance_ref.read().unwrap().config.is_none() {
        return Err(Error::NotStarted);
    }

    token.submit()?;

    let ref mut inst = *instance_ref.write().unwrap();

    inst.rx_tokens.push_back(token.clone());

    // Queued data first, then any parked network error
    deliver(inst, &mut core.events);
    report_icmp(inst, &mut core.events);

    Ok(())
}

pub(crate) fn cancel(
    core: &mut ServiceCore,
    instance_ref: &InstanceRef,
    token: Option<&Token>,
) -> Result<(), Error> {
    match token {
        Some(token) => cancel_one(core, instance_ref, token),
        None => {
            cancel_all(core, instance_ref);
            Ok(())
        }
    }
}

// The send set is searched before the receive set. A send abort completes
// through the transport's completion callback; a receive abort completes
// here, immediately.
fn cancel_one(
    core: &mut ServiceCore,
    instance_ref: &InstanceRef,
    token: &Token,
) -> Result<(), Error> {
    let in_tx_set = instance_ref
        .read()
        .unwrap()
        .tx_tokens
        .iter()
        .any(|t| t == token);

    if in_tx_set {
        super::abort_transmit(core, instance_ref, token);
        return Ok(());
    }

    let removed = {
        let ref mut inst = *instance_ref.write().unwrap();

        match inst.rx_tokens.iter().position(|t| t == token) {
            Some(position) => inst.rx_tokens.remove(position),
            None => None,
        }
    };

    match removed {
        Some(token) => {
            token.complete(Completion::Receive(Err(Error::Aborted)));
            super::push_event(core, Event::RxComplete(token));
            Ok(())
        }
        None => Err(Error::NotFound),
    }
}

pub(crate) fn cancel_all(core: &mut ServiceCore, instance_ref: &InstanceRef) {
    let tx_tokens: Vec<Token> = instance_ref
        .read()
        .unwrap()
        .tx_tokens
        .iter()
        .cloned()
        .collect();

    for token in &tx_tokens {
        super::abort_transmit(core, instance_ref, token);
    }

    let rx_tokens: Vec<Token> = {
        let ref mut inst = *instance_ref.write().unwrap();
        inst.rx_tokens.drain(..).collect()
    };

    for token in rx_tokens {
        token.complete(Completion::Receive(Err(Error::Aborted)));
        super::push_event(core, Event::RxComplete(token));
    }
}

pub(crate) fn join(
    core: &mut ServiceCore,
    instance_ref: &InstanceRef,
    group: Ipv4Addr,
) -> Result<(), Error> {
    {
        let ref mut inst = *instance_ref.write().unwrap();

        if inst.config.is_none() {
            return Err(Error::NotStarted);
        }

        if !wire::is_multicast(group) {
            return Err(Error::InvalidConfiguration);
        }

        if inst.groups.contains(&group) {
            return Err(Error::AlreadyStarted);
        }

        inst.groups.push(group);
    }

    super::refresh_multicast_filter(core);

    Ok(())
}

pub(crate) fn leave(
    core: &mut ServiceCore,
    instance_ref: &InstanceRef,
    group: Option<Ipv4Addr>,
) -> Result<(), Error> {
    {
        let ref mut inst = *instance_ref.write().unwrap();

        if inst.config.is_none() {
            return Err(Error::NotStarted);
        }

        match group {
            Some(group) => {
                let Some(position) = inst.groups.iter().position(|g| *g == group) else {
                    return Err(Error::NotFound);
                };

                inst.groups.remove(position);
            }
            None => inst.groups.clear(),
        }
    }

    super::refresh_multicast_filter(core);

    Ok(())
}

// Pairs buffered datagrams with receive tokens, oldest with oldest, until
// either side runs dry. The payload is copied only when other endpoints
// still hold references to the same datagram.
pub(crate) fn deliver(inst: &mut Instance, events: &mut VecDeque<Event>) {
    while !inst.pending.is_empty() && !inst.rx_tokens.is_empty() {
        let entry = inst.pending.pop_front().expect("pending queue is non-empty");
        let token = inst.rx_tokens.pop_front().expect("token set is non-empty");

        let received = match Arc::try_unwrap(entry.datagram) {
            Ok(datagram) => ReceivedDatagram {
                session: datagram.session,
                timestamp_ms: datagram.timestamp_ms,
                payload: datagram.payload,
            },
            Err(shared) => ReceivedDatagram {
                session: shared.session,
                timestamp_ms: shared.timestamp_ms,
                payload: shared.payload.clone(),
            },
        };

        token.complete(Completion::Receive(Ok(received)));
        events.push_back(Event::RxComplete(token));
    }
}

// Hands a parked network error to the oldest receive token, if both exist.
pub(crate) fn report_icmp(inst: &mut Instance, events: &mut VecDeque<Event>) {
    if inst.pending_icmp.is_none() || inst.rx_tokens.is_empty() {
        return;
    }

    let kind = inst.pending_icmp.take().expect("pending error is present");
    let token = inst.rx_tokens.pop_front().expect("token set is non-empty");

    token.complete(Completion::Receive(Err(Error::Icmp(kind))));
    events.push_back(Event::RxComplete(token));
}
