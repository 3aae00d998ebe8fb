//! Simulated-clock harness: a client under test wired to a scripted
//! server peer, with time advanced explicitly.

use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeFrom;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lazy_static::lazy_static;

use crate::{
    Client, ClientConfig, ClientEvent, Code, Event, Message, RequestEvent, RequestHandle, Type,
};

lazy_static! {
    static ref SERVER_PORTS: Mutex<RangeFrom<u16>> = Mutex::new(4433..);
}

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

/// A client configuration with the retransmission jitter pinned, so tests
/// can assert exact times
pub(super) fn deterministic_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.ack_random_factor(1.0).rng_seed(Some([0; 32]));
    config
}

pub(super) struct Pair {
    pub(super) client: Client,
    pub(super) server: TestServer,
    pub(super) time: Instant,
}

pub(super) struct TestServer {
    pub(super) addr: SocketAddr,
    /// Datagrams the client sent, decoded, in order
    pub(super) inbound: Vec<Message>,
}

impl TestServer {
    pub(super) fn take_inbound(&mut self) -> Vec<Message> {
        mem::take(&mut self.inbound)
    }
}

impl Pair {
    pub(super) fn new(config: ClientConfig) -> Self {
        let addr = SocketAddr::new(
            Ipv4Addr::LOCALHOST.into(),
            SERVER_PORTS.lock().unwrap().next().unwrap(),
        );
        Self {
            client: Client::new(config).unwrap(),
            server: TestServer {
                addr,
                inbound: Vec::new(),
            },
            time: Instant::now(),
        }
    }

    /// A URI on the test server
    pub(super) fn uri(&self, path_and_query: &str) -> String {
        format!("coap://{}{}", self.server.addr, path_and_query)
    }

    /// Move the client's outbound datagrams over to the server
    pub(super) fn drive(&mut self) {
        while let Some(x) = self.client.poll_transmit() {
            assert_eq!(x.destination, self.server.addr);
            self.server
                .inbound
                .push(Message::decode(&x.contents).unwrap());
        }
    }

    /// Advance the clock to `target`, firing every timer on the way
    pub(super) fn advance_to(&mut self, target: Instant) {
        loop {
            self.drive();
            match self.client.poll_timeout() {
                Some(deadline) if deadline <= target => {
                    self.time = self.time.max(deadline);
                    self.client.handle_timeout(deadline);
                }
                _ => break,
            }
        }
        self.time = self.time.max(target);
        self.drive();
    }

    pub(super) fn advance(&mut self, duration: Duration) {
        self.advance_to(self.time + duration);
    }

    /// Deliver a server message to the client at the current time
    pub(super) fn recv(&mut self, msg: Message) {
        let encoded = msg.encode();
        self.client
            .handle_datagram(self.time, self.server.addr, &encoded);
        self.drive();
    }

    /// Drain all pending events
    pub(super) fn events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(event) = self.client.poll_event() {
            out.push(event);
        }
        out
    }

    /// Drain pending events, keeping only those for `handle`
    pub(super) fn request_events(&mut self, handle: RequestHandle) -> Vec<RequestEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Request(h, e) if h == handle => Some(e),
                _ => None,
            })
            .collect()
    }

    /// Drain pending events, keeping only the client-level ones
    pub(super) fn client_events(&mut self) -> Vec<ClientEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Client(e) => Some(e),
                _ => None,
            })
            .collect()
    }
}

/// A piggy-backed response to `req`
pub(super) fn ack_response(req: &Message, code: Code, payload: &[u8]) -> Message {
    let mut msg = Message::new(Type::Ack, code);
    msg.id = req.id;
    msg.token = req.token;
    msg.payload = Bytes::copy_from_slice(payload);
    msg
}
