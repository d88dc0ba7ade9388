#[allow(dead_code)]
mod common;

use common::{
    addr, delivered, new_service, receive_error, session, station_config, transmit_status,
    udp_frame,
};

use udpmux::{Config, Error, Event, Token, TransmitData};

fn transmit_data(payload: &[u8]) -> TransmitData {
    TransmitData {
        fragments: vec![payload.to_vec().into_boxed_slice()],
        data_length: payload.len(),
        ..Default::default()
    }
}

fn connected_config() -> Config {
    Config {
        remote_address: addr(10, 0, 0, 5),
        remote_port: 5000,
        ..station_config(addr(10, 0, 0, 9), 9999)
    }
}

#[test]
fn cancel_receive_token() {
    let (service, _log) = new_service();

    let endpoint = service.create_endpoint();
    endpoint
        .configure(Some(station_config(addr(10, 0, 0, 5), 5000)))
        .unwrap();

    let token = Token::new();
    endpoint.receive(&token).unwrap();

    assert_eq!(endpoint.cancel(Some(&token)), Ok(()));
    assert_eq!(receive_error(&token), Error::Aborted);

    match service.poll_event() {
        Some(Event::RxComplete(completed)) => assert_eq!(completed, token),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn cancel_absent_token() {
    let (service, _log) = new_service();

    let endpoint = service.create_endpoint();
    endpoint
        .configure(Some(station_config(addr(10, 0, 0, 5), 5000)))
        .unwrap();

    assert_eq!(endpoint.cancel(Some(&Token::new())), Err(Error::NotFound));
}

#[test]
fn cancel_completed_token() {
    let (service, _log) = new_service();

    let endpoint = service.create_endpoint();
    endpoint
        .configure(Some(station_config(addr(10, 0, 0, 5), 5000)))
        .unwrap();

    let session = session(addr(10, 0, 0, 9), 9999, addr(10, 0, 0, 5), 5000);
    let frame = udp_frame(&session, b"ping");
    service.handle_datagram(session.src_addr, session.dst_addr, &frame);

    let token = Token::new();
    endpoint.receive(&token).unwrap();
    delivered(&token);

    // Already out of the token set; cancellation finds nothing
    assert_eq!(endpoint.cancel(Some(&token)), Err(Error::NotFound));
}

#[test]
fn cancel_clone_cancels_the_same_token() {
    let (service, _log) = new_service();

    let endpoint = service.create_endpoint();
    endpoint
        .configure(Some(station_config(addr(10, 0, 0, 5), 5000)))
        .unwrap();

    let token = Token::new();
    endpoint.receive(&token).unwrap();

    // A clone shares the underlying completion state, so it names the same
    // outstanding request
    let alias = token.clone();
    assert_eq!(endpoint.cancel(Some(&alias)), Ok(()));
    assert_eq!(receive_error(&token), Error::Aborted);
}

#[test]
fn cancel_transmit_aborts_through_the_transport() {
    let (service, log) = new_service();

    let endpoint = service.create_endpoint();
    endpoint.configure(Some(connected_config())).unwrap();

    let token = Token::new();
    endpoint.transmit(&token, transmit_data(b"ping")).unwrap();

    assert_eq!(endpoint.cancel(Some(&token)), Ok(()));

    // Not completed yet; the transport was asked to abort instead
    assert!(token.is_pending());

    let id = {
        let log = log.lock().unwrap();
        assert_eq!(log.aborted, vec![log.sent[0].0]);
        log.sent[0].0
    };

    service.complete_transmit(id, Err(Error::Aborted));

    assert_eq!(transmit_status(&token), Err(Error::Aborted));
    assert!(matches!(service.poll_event(), Some(Event::TxComplete(_))));
    assert!(service.poll_event().is_none());
}

#[test]
fn cancel_all_empties_both_sets_and_keeps_the_queue() {
    let (service, log) = new_service();

    let endpoint = service.create_endpoint();
    endpoint.configure(Some(connected_config())).unwrap();

    // One buffered datagram with no token to claim it
    let session = session(addr(10, 0, 0, 5), 5000, addr(10, 0, 0, 9), 9999);
    let frame = udp_frame(&session, b"kept");
    assert_eq!(
        service.handle_datagram(session.src_addr, session.dst_addr, &frame),
        1
    );

    let tx_token = Token::new();
    endpoint.transmit(&tx_token, transmit_data(b"ping")).unwrap();

    assert_eq!(endpoint.cancel(None), Ok(()));

    let id = log.lock().unwrap().sent[0].0;
    service.complete_transmit(id, Err(Error::Aborted));
    assert_eq!(transmit_status(&tx_token), Err(Error::Aborted));

    // The buffered datagram survived the sweep; a fresh token drains it
    let rx_kept = Token::new();
    endpoint.receive(&rx_kept).unwrap();
    assert_eq!(&delivered(&rx_kept).payload[..], b"kept");

    // With the queue dry, outstanding receive tokens are aborted in place
    let rx_a = Token::new();
    let rx_b = Token::new();
    endpoint.receive(&rx_a).unwrap();
    endpoint.receive(&rx_b).unwrap();

    assert_eq!(endpoint.cancel(None), Ok(()));
    assert_eq!(receive_error(&rx_a), Error::Aborted);
    assert_eq!(receive_error(&rx_b), Error::Aborted);
}

#[test]
fn cancel_all_on_idle_endpoint() {
    let (service, _log) = new_service();

    let endpoint = service.create_endpoint();
    endpoint
        .configure(Some(station_config(addr(10, 0, 0, 5), 5000)))
        .unwrap();

    assert_eq!(endpoint.cancel(None), Ok(()));
    assert!(service.poll_event().is_none());
}

#[test]
fn reset_cancels_tokens_and_flushes_the_queue() {
    let (service, _log) = new_service();

    let endpoint = service.create_endpoint();
    endpoint
        .configure(Some(station_config(addr(10, 0, 0, 5), 5000)))
        .unwrap();

    let session = session(addr(10, 0, 0, 9), 9999, addr(10, 0, 0, 5), 5000);
    let frame = udp_frame(&session, b"flushed");
    service.handle_datagram(session.src_addr, session.dst_addr, &frame);

    endpoint.configure(None).unwrap();

    // Rebind: the queue was flushed along with the reset
    endpoint
        .configure(Some(station_config(addr(10, 0, 0, 5), 5000)))
        .unwrap();

    let token = Token::new();
    endpoint.receive(&token).unwrap();
    assert!(token.is_pending());
}
