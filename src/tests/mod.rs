use std::io;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use super::*;

mod util;
use util::*;

#[test]
fn simple_get_piggybacked() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/temperature");
    let t0 = pair.time;
    let handle = pair.client.get(t0, &uri).unwrap();
    pair.drive();

    let sent = pair.server.take_inbound();
    assert_eq!(sent.len(), 1);
    let req = &sent[0];
    assert_eq!(req.ty, Type::Con);
    assert_eq!(req.code, Code::GET);
    assert_eq!(req.id, MessageId(1));
    assert_eq!(req.uri_path(), "temperature");

    pair.advance(Duration::from_millis(50));
    pair.recv(ack_response(req, Code::CONTENT, b"22.3 C"));

    let events = pair.request_events(handle);
    assert_matches!(
        &events[..],
        [
            RequestEvent::Acknowledged { message: ack },
            RequestEvent::Response { message },
        ] if &ack.payload[..] == b"22.3 C" && &message.payload[..] == b"22.3 C"
    );

    // No retransmission afterwards
    pair.advance(Duration::from_secs(120));
    assert!(pair.server.take_inbound().is_empty());
}

#[test]
fn con_timeout() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/temperature");
    let t0 = pair.time;
    let handle = pair.client.get(t0, &uri).unwrap();
    pair.drive();
    assert_eq!(pair.server.take_inbound().len(), 1);

    // Doubling backoff: copies at 2, 6, 14, and 30 seconds
    for at in [2000u64, 6000, 14000, 30000] {
        pair.advance_to(t0 + Duration::from_millis(at - 1));
        assert!(
            pair.server.take_inbound().is_empty(),
            "early copy before {at} ms"
        );
        pair.advance_to(t0 + Duration::from_millis(at));
        assert_eq!(
            pair.server.take_inbound().len(),
            1,
            "missing copy at {at} ms"
        );
    }

    // The budget runs out at 62 s with no further copies
    pair.advance_to(t0 + Duration::from_millis(62_000));
    assert!(pair.server.take_inbound().is_empty());
    let events = pair.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Request(h, RequestEvent::Timeout) if *h == handle)));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Client(ClientEvent::TransactionTimeout { request: Some(h), .. }) if *h == handle
    )));
}

#[test]
fn blockwise_get_early_negotiation() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/data");
    let mut msg = Message::request(Code::GET);
    msg.set_uri(&uri).unwrap();
    let options = RequestOptions {
        block_size: Some(64),
        ..RequestOptions::default()
    };
    let handle = pair.client.request(pair.time, msg, options).unwrap();
    pair.drive();

    let sent = pair.server.take_inbound();
    let req = &sent[0];
    assert_eq!(req.block2(), Some(BlockOption::new(0, false, 2)));

    // Three blocks, the last without the more flag
    let mut response = ack_response(req, Code::CONTENT, &[0x41; 64]);
    response.set_block2(Some(BlockOption::new(0, true, 2)));
    pair.recv(response);

    let follow = pair.server.take_inbound();
    assert_eq!(follow.len(), 1);
    assert_eq!(follow[0].block2(), Some(BlockOption::new(1, false, 2)));
    assert_ne!(follow[0].id, req.id);
    let mut response = ack_response(&follow[0], Code::CONTENT, &[0x42; 64]);
    response.set_block2(Some(BlockOption::new(1, true, 2)));
    pair.recv(response);

    let follow = pair.server.take_inbound();
    assert_eq!(follow[0].block2(), Some(BlockOption::new(2, false, 2)));
    let mut response = ack_response(&follow[0], Code::CONTENT, &[0x43; 30]);
    response.set_block2(Some(BlockOption::new(2, false, 2)));
    pair.recv(response);

    let events = pair.request_events(handle);
    let acks = events
        .iter()
        .filter(|e| matches!(e, RequestEvent::Acknowledged { .. }))
        .count();
    let blocks = events
        .iter()
        .filter(|e| matches!(e, RequestEvent::BlockReceived { .. }))
        .count();
    assert_eq!((acks, blocks), (1, 3));
    let response = events
        .iter()
        .find_map(|e| match e {
            RequestEvent::Response { message } => Some(message),
            _ => None,
        })
        .expect("no response");
    let mut expected = vec![0x41; 64];
    expected.extend_from_slice(&[0x42; 64]);
    expected.extend_from_slice(&[0x43; 30]);
    assert_eq!(&response.payload[..], &expected[..]);
}

#[test]
fn blockwise_put_with_retransmission() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/firmware");
    let mut msg = Message::request(Code::PUT);
    msg.set_uri(&uri).unwrap();
    msg.payload = Bytes::from(vec![0x50; 319]);
    let options = RequestOptions {
        block_size: Some(128),
        ..RequestOptions::default()
    };
    let handle = pair.client.request(pair.time, msg, options).unwrap();
    pair.drive();

    let sent = pair.server.take_inbound();
    let b0 = &sent[0];
    assert_eq!(b0.block1(), Some(BlockOption::new(0, true, 3)));
    assert_eq!(b0.payload.len(), 128);

    let mut continue_0 = Message::new(Type::Ack, Code::CONTINUE);
    continue_0.id = b0.id;
    continue_0.token = b0.token;
    continue_0.set_block1(Some(BlockOption::new(0, true, 3)));
    pair.recv(continue_0);

    let sent = pair.server.take_inbound();
    let b1 = &sent[0];
    assert_eq!(b1.block1(), Some(BlockOption::new(1, true, 3)));
    assert_eq!(b1.payload.len(), 128);

    // Server stays silent for the first 2 s: exactly one extra copy
    pair.advance(Duration::from_millis(2000));
    let copies = pair.server.take_inbound();
    assert_eq!(copies.len(), 1);
    assert_eq!(&copies[0], b1);

    let mut continue_1 = Message::new(Type::Ack, Code::CONTINUE);
    continue_1.id = b1.id;
    continue_1.token = b1.token;
    continue_1.set_block1(Some(BlockOption::new(1, true, 3)));
    pair.recv(continue_1);

    let sent = pair.server.take_inbound();
    let b2 = &sent[0];
    assert_eq!(b2.block1(), Some(BlockOption::new(2, false, 3)));
    assert_eq!(b2.payload.len(), 63);

    let mut changed = Message::new(Type::Ack, Code::CHANGED);
    changed.id = b2.id;
    changed.token = b2.token;
    changed.set_block1(Some(BlockOption::new(2, false, 3)));
    pair.recv(changed);

    let events = pair.request_events(handle);
    let blocks = events
        .iter()
        .filter_map(|e| match e {
            RequestEvent::BlockSent { block } => Some(block.num),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(blocks, vec![0, 1, 2]);
    assert!(events
        .iter()
        .any(|e| matches!(e, RequestEvent::Response { message } if message.code == Code::CHANGED)));
}

#[test]
fn observe_simple() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/state");
    let handle = pair.client.observe(pair.time, &uri).unwrap();
    pair.drive();

    let sent = pair.server.take_inbound();
    let req = &sent[0];
    assert_eq!(req.observe(), Some(0));

    let mut response = ack_response(req, Code::CONTENT, b"1");
    response.set_observe(Some(1));
    pair.recv(response);

    pair.advance(Duration::from_secs(2));
    let mut notification = Message::new(Type::Non, Code::CONTENT);
    notification.id = MessageId(0x7001);
    notification.token = req.token;
    notification.set_observe(Some(2));
    notification.payload = Bytes::from_static(b"2");
    pair.recv(notification);

    pair.client.cancel(pair.time, handle);
    let events = pair.request_events(handle);
    assert_matches!(
        &events[..],
        [
            RequestEvent::Acknowledged { .. },
            RequestEvent::Response { message: first },
            RequestEvent::Response { message: second },
            RequestEvent::Cancelled,
        ] if &first.payload[..] == b"1" && &second.payload[..] == b"2"
    );

    // Nothing further after cancellation
    let mut late = Message::new(Type::Non, Code::CONTENT);
    late.id = MessageId(0x7002);
    late.token = req.token;
    late.set_observe(Some(3));
    late.payload = Bytes::from_static(b"3");
    pair.recv(late);
    assert!(pair.request_events(handle).is_empty());
    assert!(pair.server.take_inbound().is_empty());
}

#[test]
fn observe_late_notification() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/state");
    let handle = pair.client.observe(pair.time, &uri).unwrap();
    pair.drive();
    let req = pair.server.take_inbound().remove(0);
    let mut response = ack_response(&req, Code::CONTENT, b"10");
    response.set_observe(Some(10));
    pair.recv(response);

    let mut newer = Message::new(Type::Con, Code::CONTENT);
    newer.id = MessageId(0x9001);
    newer.token = req.token;
    newer.set_observe(Some(12));
    newer.payload = Bytes::from_static(b"12");
    pair.recv(newer);

    pair.advance(Duration::from_secs(1));
    let mut older = Message::new(Type::Con, Code::CONTENT);
    older.id = MessageId(0x9002);
    older.token = req.token;
    older.set_observe(Some(11));
    older.payload = Bytes::from_static(b"11");
    pair.recv(older);

    // Both confirmables were acknowledged, only the newer one surfaced
    let acks = pair.server.take_inbound();
    assert_eq!(acks.len(), 2);
    assert!(acks.iter().all(|a| a.ty == Type::Ack && a.code.is_empty()));
    assert_eq!(acks[0].id, MessageId(0x9001));
    assert_eq!(acks[1].id, MessageId(0x9002));

    let responses = pair
        .request_events(handle)
        .into_iter()
        .filter_map(|e| match e {
            RequestEvent::Response { message } => Some(message.payload.clone()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(responses, vec![Bytes::from_static(b"10"), Bytes::from_static(b"12")]);
}

#[test]
fn observe_reregisters_after_max_age() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/state");
    let handle = pair.client.observe(pair.time, &uri).unwrap();
    pair.drive();
    let req = pair.server.take_inbound().remove(0);

    let mut response = ack_response(&req, Code::CONTENT, b"v");
    response.set_observe(Some(1));
    response.push_option(CoapOption::MaxAge(5));
    pair.recv(response);
    pair.request_events(handle);

    // No notification within Max-Age: the registration is reissued
    pair.advance(Duration::from_secs(5));
    let reissued = pair.server.take_inbound();
    assert_eq!(reissued.len(), 1);
    let renewal = &reissued[0];
    assert_eq!(renewal.ty, Type::Con);
    assert_eq!(renewal.code, Code::GET);
    assert_eq!(renewal.observe(), Some(0));
    assert_eq!(renewal.uri_path(), "state");
    assert_ne!(renewal.id, req.id);
    assert_ne!(renewal.token, req.token);
    assert!(pair
        .client_events()
        .iter()
        .any(|e| matches!(e, ClientEvent::ExchangeTimeout { request } if *request == handle)));

    // The renewed registration works like the first one
    let mut response = ack_response(renewal, Code::CONTENT, b"w");
    response.set_observe(Some(1));
    pair.recv(response);
    let events = pair.request_events(handle);
    assert!(events
        .iter()
        .any(|e| matches!(e, RequestEvent::Response { message } if &message.payload[..] == b"w")));
}

#[test]
fn separate_response() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/slow");
    let handle = pair.client.get(pair.time, &uri).unwrap();
    pair.drive();
    let req = pair.server.take_inbound().remove(0);

    let mut empty_ack = Message::new(Type::Ack, Code::EMPTY);
    empty_ack.id = req.id;
    pair.recv(empty_ack);

    pair.advance(Duration::from_secs(3));
    let mut response = Message::new(Type::Con, Code::CONTENT);
    response.id = MessageId(0x8001);
    response.token = req.token;
    response.payload = Bytes::from_static(b"done");
    pair.recv(response);

    // The separate confirmable response is acknowledged
    let acks = pair.server.take_inbound();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ty, Type::Ack);
    assert_eq!(acks[0].id, MessageId(0x8001));

    let events = pair.request_events(handle);
    assert_matches!(
        &events[..],
        [
            RequestEvent::Acknowledged { .. },
            RequestEvent::Response { message },
        ] if &message.payload[..] == b"done"
    );

    // No retransmission of the request in between
    pair.advance(Duration::from_secs(120));
    assert!(pair.server.take_inbound().is_empty());
}

#[test]
fn rst_finishes_request() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/nope");
    let handle = pair.client.get(pair.time, &uri).unwrap();
    pair.drive();
    let req = pair.server.take_inbound().remove(0);

    let mut rst = Message::new(Type::Rst, Code::EMPTY);
    rst.id = req.id;
    pair.recv(rst);

    let events = pair.request_events(handle);
    assert_matches!(&events[..], [RequestEvent::Reset { .. }]);

    // The exchange is gone; a late response is unmatched and reset
    let mut late = Message::new(Type::Con, Code::CONTENT);
    late.id = MessageId(0x8888);
    late.token = req.token;
    late.payload = Bytes::from_static(b"?");
    pair.recv(late);
    let replies = pair.server.take_inbound();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].ty, Type::Rst);
    assert_eq!(replies[0].id, MessageId(0x8888));
}

#[test]
fn duplicates_replay_the_cached_reply() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/state");
    let handle = pair.client.observe(pair.time, &uri).unwrap();
    pair.drive();
    let req = pair.server.take_inbound().remove(0);
    let mut response = ack_response(&req, Code::CONTENT, b"1");
    response.set_observe(Some(1));
    pair.recv(response);
    pair.request_events(handle);

    let mut notification = Message::new(Type::Con, Code::CONTENT);
    notification.id = MessageId(0x7100);
    notification.token = req.token;
    notification.set_observe(Some(5));
    notification.payload = Bytes::from_static(b"n");
    pair.recv(notification.clone());
    // Retransmitted by the server: the same ACK goes back out, once per copy
    pair.recv(notification);

    let acks = pair.server.take_inbound();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0], acks[1]);

    // ...but the application sees the notification only once
    let responses = pair
        .request_events(handle)
        .into_iter()
        .filter(|e| matches!(e, RequestEvent::Response { .. }))
        .count();
    assert_eq!(responses, 1);
}

#[test]
fn unsolicited_messages_are_rejected() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());

    // A confirmable request: we are not a server
    let mut request = Message::new(Type::Con, Code::GET);
    request.id = MessageId(0x1111);
    pair.recv(request);
    let replies = pair.server.take_inbound();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].ty, Type::Rst);
    assert_eq!(replies[0].id, MessageId(0x1111));

    // A non-confirmable request is dropped silently
    let mut request = Message::new(Type::Non, Code::GET);
    request.id = MessageId(0x1112);
    pair.recv(request);
    assert!(pair.server.take_inbound().is_empty());
}

#[test]
fn cancel_is_idempotent() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/state");

    let plain = pair.client.get(pair.time, &uri).unwrap();
    pair.drive();
    pair.server.take_inbound();
    pair.client.cancel(pair.time, plain);
    pair.client.cancel(pair.time, plain);
    assert!(pair.request_events(plain).is_empty());

    let observed = pair.client.observe(pair.time, &uri).unwrap();
    pair.drive();
    pair.server.take_inbound();
    pair.client.cancel(pair.time, observed);
    pair.client.cancel(pair.time, observed);
    let cancelled = pair
        .request_events(observed)
        .into_iter()
        .filter(|e| matches!(e, RequestEvent::Cancelled))
        .count();
    assert_eq!(cancelled, 1);
}

#[test]
fn identifiers_are_distinct() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/a");
    pair.client.get(pair.time, &uri).unwrap();
    pair.client.get(pair.time, &uri).unwrap();
    pair.drive();
    let sent = pair.server.take_inbound();
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].id, sent[1].id);
    assert_ne!(sent[0].token, sent[1].token);
}

#[test]
fn non_confirmable_request_times_out() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/quiet");
    let mut msg = Message::request(Code::GET);
    msg.set_uri(&uri).unwrap();
    let options = RequestOptions {
        confirmable: false,
        ..RequestOptions::default()
    };
    let handle = pair.client.request(pair.time, msg, options).unwrap();
    pair.drive();
    let sent = pair.server.take_inbound();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ty, Type::Non);

    pair.advance(Duration::from_secs(96));
    // never retransmitted, but the exchange window closes
    assert!(pair.server.take_inbound().is_empty());
    let events = pair.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Request(h, RequestEvent::Timeout) if *h == handle)));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Client(ClientEvent::ExchangeTimeout { request }) if *request == handle
    )));
}

#[test]
fn send_failure_surfaces_on_the_request() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/x");
    let handle = pair.client.get(pair.time, &uri).unwrap();
    let transmit = pair.client.poll_transmit().unwrap();
    assert_eq!(transmit.request, Some(handle));
    pair.client.send_failed(
        &transmit,
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no route"),
    );
    let events = pair.request_events(handle);
    assert!(events
        .iter()
        .any(|e| matches!(e, RequestEvent::Error { .. })));
}

#[test]
fn observer_replaced_by_newer_subscription() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/state");

    let first = pair.client.observe(pair.time, &uri).unwrap();
    pair.drive();
    let req1 = pair.server.take_inbound().remove(0);
    let mut response = ack_response(&req1, Code::CONTENT, b"1");
    response.set_observe(Some(1));
    pair.recv(response);
    pair.request_events(first);

    let second = pair.client.observe(pair.time, &uri).unwrap();
    pair.drive();
    let req2 = pair.server.take_inbound().remove(0);
    assert_ne!(req2.token, req1.token);
    let mut response = ack_response(&req2, Code::CONTENT, b"2");
    response.set_observe(Some(1));
    pair.recv(response);

    // The older subscription is finished in favor of the new one
    let first_events = pair.request_events(first);
    assert_matches!(&first_events[..], [RequestEvent::Cancelled]);

    // Notifications for the old token are now unmatched
    let mut stale = Message::new(Type::Con, Code::CONTENT);
    stale.id = MessageId(0x6001);
    stale.token = req1.token;
    stale.set_observe(Some(2));
    stale.payload = Bytes::from_static(b"x");
    pair.recv(stale);
    let replies = pair.server.take_inbound();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].ty, Type::Rst);
    let _ = second;
}

#[test]
fn observation_ends_on_error_response() {
    let _guard = subscribe();
    let mut pair = Pair::new(deterministic_config());
    let uri = pair.uri("/state");
    let handle = pair.client.observe(pair.time, &uri).unwrap();
    pair.drive();
    let req = pair.server.take_inbound().remove(0);
    let mut response = ack_response(&req, Code::CONTENT, b"1");
    response.set_observe(Some(1));
    pair.recv(response);
    pair.request_events(handle);

    // The server tears the observation down with an error notification
    let mut error = Message::new(Type::Con, Code::NOT_FOUND);
    error.id = MessageId(0x6100);
    error.token = req.token;
    pair.recv(error);

    let events = pair.request_events(handle);
    assert_matches!(
        &events[..],
        [
            RequestEvent::Response { message },
            RequestEvent::Cancelled,
        ] if message.code == Code::NOT_FOUND
    );
    // The error was acknowledged
    let acks = pair.server.take_inbound();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ty, Type::Ack);
}
