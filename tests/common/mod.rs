use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use udpmux::wire::{checksum, Header, HEADER_SIZE};
use udpmux::{
    Completion, Config, OutboundDatagram, ReceivedDatagram, Service, Session, Token, Transport,
    TransmitId,
};

/// Everything the service asked of the transport, in order.
#[derive(Default)]
pub struct TransportLog {
    pub sent: Vec<(TransmitId, OutboundDatagram)>,
    pub aborted: Vec<TransmitId>,
    pub unreachable: Vec<Session>,
    pub filters: Vec<Vec<Ipv4Addr>>,
    pub polls: usize,
}

/// A transport that records every call for inspection. Transmit completions
/// are driven explicitly by the test through `Service::complete_transmit`.
pub struct MockTransport {
    pub log: Arc<Mutex<TransportLog>>,
    pub local_address: Ipv4Addr,
}

impl Transport for MockTransport {
    fn send_datagram(&mut self, datagram: OutboundDatagram, id: TransmitId) {
        self.log.lock().unwrap().sent.push((id, datagram));
    }

    fn abort_send(&mut self, id: TransmitId) {
        self.log.lock().unwrap().aborted.push(id);
    }

    fn send_port_unreachable(&mut self, session: Session) {
        self.log.lock().unwrap().unreachable.push(session);
    }

    fn set_multicast_filter(&mut self, groups: &[Ipv4Addr]) {
        self.log.lock().unwrap().filters.push(groups.to_vec());
    }

    fn local_address(&self) -> Ipv4Addr {
        self.local_address
    }

    fn poll(&mut self) {
        self.log.lock().unwrap().polls += 1;
    }
}

pub const LOCAL_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

pub fn new_service() -> (Service, Arc<Mutex<TransportLog>>) {
    let log = Arc::new(Mutex::new(TransportLog::default()));

    let transport = MockTransport {
        log: Arc::clone(&log),
        local_address: LOCAL_ADDRESS,
    };

    (Service::new(Box::new(transport)), log)
}

pub fn addr(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

pub fn session(
    src_addr: Ipv4Addr,
    src_port: u16,
    dst_addr: Ipv4Addr,
    dst_port: u16,
) -> Session {
    Session {
        src_addr,
        src_port,
        dst_addr,
        dst_port,
    }
}

/// A configuration bound to an explicit station address on a /24 subnet.
pub fn station_config(address: Ipv4Addr, port: u16) -> Config {
    Config {
        station_address: address,
        subnet_mask: addr(255, 255, 255, 0),
        station_port: port,
        ..Default::default()
    }
}

/// Serializes one datagram with a valid checksum.
pub fn udp_frame(session: &Session, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_SIZE + payload.len()];
    frame[HEADER_SIZE..].copy_from_slice(payload);

    let mut header = Header {
        src_port: session.src_port,
        dst_port: session.dst_port,
        length: frame.len() as u16,
        checksum: 0,
    };

    header.checksum = checksum::datagram(session.src_addr, session.dst_addr, &header, payload);
    header.write(&mut frame[..HEADER_SIZE]);

    frame
}

/// Serializes one datagram with a zero checksum field ("no checksum
/// supplied").
pub fn udp_frame_unchecksummed(session: &Session, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_SIZE + payload.len()];
    frame[HEADER_SIZE..].copy_from_slice(payload);

    Header {
        src_port: session.src_port,
        dst_port: session.dst_port,
        length: frame.len() as u16,
        checksum: 0,
    }
    .write(&mut frame[..HEADER_SIZE]);

    frame
}

/// Serializes one datagram whose checksum field is valid-looking but wrong.
pub fn udp_frame_corrupted(session: &Session, payload: &[u8]) -> Vec<u8> {
    let mut frame = udp_frame(session, payload);

    // Flip a payload bit after the checksum was computed
    frame[HEADER_SIZE] ^= 0x01;

    frame
}

/// Unwraps a token's completion as a successful delivery.
pub fn delivered(token: &Token) -> ReceivedDatagram {
    match token.take_completion() {
        Some(Completion::Receive(Ok(datagram))) => datagram,
        other => panic!("expected a delivered datagram, got {:?}", other),
    }
}

/// Unwraps a token's completion as a failed receive.
pub fn receive_error(token: &Token) -> udpmux::Error {
    match token.take_completion() {
        Some(Completion::Receive(Err(error))) => error,
        other => panic!("expected a receive error, got {:?}", other),
    }
}

/// Unwraps a token's completion as a transmit outcome.
pub fn transmit_status(token: &Token) -> Result<(), udpmux::Error> {
    match token.take_completion() {
        Some(Completion::Transmit(status)) => status,
        other => panic!("expected a transmit completion, got {:?}", other),
    }
}
