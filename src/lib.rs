/*

udpmux turns the single datagram receive path of one IPv4 interface into any number of
independently configured UDP endpoints, and funnels their sends back into a single transmit
path. It sits between an IPv4 transport below (routing, fragmentation and delivery belong to
that layer) and an event-driven consumer above.

# Endpoints and demultiplexing

Each endpoint carries its own filter: a station address and port, optional remote address and
port, and the accept flags (any port, broadcast, promiscuous, duplicate port). An inbound
datagram is checked against every configured endpoint, and every endpoint whose filter accepts
it receives its own reference to the shared payload buffer. The payload is only copied at the
moment an endpoint actually consumes a datagram that other endpoints still reference, so the
common single-listener case never copies.

A datagram that no endpoint accepts is answered with an ICMP port-unreachable notification
through the transport, unless it was addressed to a broadcast or multicast destination.

# Ports

Station ports are reserved per (station address, station port) pair. Binding an explicit port
fails while another endpoint owns the same pair, unless the new endpoint opts into duplicate
ports. Requesting port zero draws from the ephemeral range (1024 and up) using a rotating
cursor seeded randomly at service creation.

# Tokens

Sends and receives are asynchronous. The caller allocates a Token, submits it with transmit()
or receive(), and is signaled through the service event queue once the token completes. Receive
tokens pair with buffered datagrams in strict FIFO order on both sides. Tokens are cancellable;
cancelling a send asks the transport to abort the in-flight datagram and the completion still
arrives through the transport's completion callback, exactly once.

Buffered datagrams that no receive token claims are expired by the periodic timeout sweep,
silently, after the endpoint's configured receive timeout.

# ICMP errors

An ICMP error returned by the network for a previously sent datagram is routed back to the
endpoint that owns the offending session tuple. The error is parked in a per-endpoint slot and
completes the oldest outstanding receive token, or the next one submitted.

# Threading

The service serializes all work (API calls, inbound datagrams, transmit completions, timeout
sweeps) under one internal lock, processing one event at a time. Handles and tokens may be
cloned and used from any thread; within one endpoint, ordering follows the serialization of
those events.

*/

pub mod service;
pub mod wire;

mod token;
mod transport;

use std::error;
use std::fmt;

pub use service::instance::{Config, Endpoint, EndpointInfo, TransmitData, TransmitSession};
pub use service::{Event, Service, TICK_INTERVAL_MS};
pub use token::{Completion, ReceivedDatagram, Token};
pub use transport::{OutboundDatagram, Transport, TransmitId};
pub use wire::icmp::IcmpKind;
pub use wire::Session;

/// Represents a service, configuration, or token error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A configuration or transmit parameter is malformed or inconsistent.
    InvalidConfiguration,
    /// The requested station port is owned by another endpoint, or the token
    /// is already submitted.
    AccessDenied,
    /// The ephemeral port space is exhausted.
    OutOfResources,
    /// A requested feature is not implemented.
    Unsupported,
    /// The cancel target or correlated endpoint does not exist.
    NotFound,
    /// The token was cancelled before it could complete.
    Aborted,
    /// The endpoint is not configured.
    NotStarted,
    /// The endpoint is already configured in a way that conflicts with the
    /// request.
    AlreadyStarted,
    /// The transport substrate failed to deliver a datagram.
    Transport,
    /// The network returned an ICMP error for a previously sent datagram.
    Icmp(IcmpKind),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfiguration => write!(f, "invalid configuration"),
            Error::AccessDenied => write!(f, "access denied"),
            Error::OutOfResources => write!(f, "out of resources"),
            Error::Unsupported => write!(f, "unsupported"),
            Error::NotFound => write!(f, "not found"),
            Error::Aborted => write!(f, "aborted"),
            Error::NotStarted => write!(f, "endpoint not configured"),
            Error::AlreadyStarted => write!(f, "endpoint already configured"),
            Error::Transport => write!(f, "transport error"),
            Error::Icmp(kind) => write!(f, "icmp error: {}", kind),
        }
    }
}

impl error::Error for Error {}
