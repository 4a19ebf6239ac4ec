//! Loopback DNS servers for integration tests
//!
//! A [`TestServer`] binds an ephemeral UDP port (and optionally a TCP
//! listener on the same port) and answers with whatever the supplied handler
//! returns. Returning `None` silently drops the query, which is how the
//! timeout tests simulate an unresponsive upstream.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Arc, Once};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

static TRACING: Once = Once::new();

/// Install a fmt subscriber once so `RUST_LOG` controls test output
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builds a response for a query; `None` drops the query on the floor.
pub type Handler = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

pub struct TestServer {
    pub addr: std::net::SocketAddr,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Spawn a UDP-only server on an ephemeral loopback port
    pub async fn udp(handler: Handler) -> Self {
        init_tracing();
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind UDP");
        let addr = socket.local_addr().expect("local addr");
        let shutdown = CancellationToken::new();

        tokio::spawn(udp_loop(socket, handler, shutdown.clone()));
        Self { addr, shutdown }
    }

    /// Spawn UDP and TCP servers sharing one port, with separate handlers
    pub async fn udp_with_tcp(udp_handler: Handler, tcp_handler: Handler) -> Self {
        init_tracing();
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind UDP");
        let addr = socket.local_addr().expect("local addr");
        let listener = TcpListener::bind(addr).await.expect("bind TCP");
        let shutdown = CancellationToken::new();

        tokio::spawn(udp_loop(socket, udp_handler, shutdown.clone()));
        tokio::spawn(tcp_loop(listener, tcp_handler, shutdown.clone()));
        Self { addr, shutdown }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn udp_loop(socket: UdpSocket, handler: Handler, shutdown: CancellationToken) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = tokio::select! {
            () = shutdown.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(_) => continue,
            },
        };

        let Ok(query) = Message::from_vec(&buf[..len]) else {
            continue;
        };
        if let Some(response) = handler(&query) {
            if let Ok(bytes) = response.to_vec() {
                let _ = socket.send_to(&bytes, peer).await;
            }
        }
    }
}

async fn tcp_loop(listener: TcpListener, handler: Handler, shutdown: CancellationToken) {
    loop {
        let (mut stream, _) = tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(_) => continue,
            },
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let mut len_buf = [0u8; 2];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return;
            }
            let len = usize::from(u16::from_be_bytes(len_buf));
            let mut msg_buf = vec![0u8; len];
            if stream.read_exact(&mut msg_buf).await.is_err() {
                return;
            }

            let Ok(query) = Message::from_vec(&msg_buf) else {
                return;
            };
            let Some(response) = handler(&query) else {
                return;
            };
            let Ok(bytes) = response.to_vec() else {
                return;
            };
            let prefix = u16::try_from(bytes.len()).expect("response fits").to_be_bytes();
            let _ = stream.write_all(&prefix).await;
            let _ = stream.write_all(&bytes).await;
        });
    }
}

/// Start an empty reply mirroring the query's id and question section
pub fn reply(query: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(query.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(query.op_code());
    msg.set_recursion_desired(query.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::NoError);
    for question in query.queries() {
        msg.add_query(question.clone());
    }
    msg
}

/// An A record for `name` with a zero TTL
pub fn a_record(name: &Name, ip: Ipv4Addr) -> Record {
    let mut record = Record::new();
    record.set_name(name.clone());
    record.set_record_type(RecordType::A);
    record.set_dns_class(DNSClass::IN);
    record.set_ttl(0);
    record.set_data(Some(RData::A(A(ip))));
    record
}

/// Reply with a single A record answering the first question
pub fn a_reply(query: &Message, ip: Ipv4Addr) -> Option<Message> {
    let name = query.queries().first()?.name().clone();
    let mut msg = reply(query);
    msg.add_answer(a_record(&name, ip));
    Some(msg)
}

/// Reply with the given response code and no answers
pub fn rcode_reply(query: &Message, rcode: ResponseCode) -> Option<Message> {
    let mut msg = reply(query);
    msg.set_response_code(rcode);
    Some(msg)
}

/// The authoritative fixture used by the wildcard scenarios
///
/// - `www.domain.com` → `A 192.168.1.14`
/// - `ns.wildcard.domain.com` → `A 192.168.1.2`
/// - any other `*.wildcard.domain.com` → `A 192.168.1.64`
/// - everything else → `NXDOMAIN`
pub fn wildcard_handler(query: &Message) -> Option<Message> {
    let name = query.queries().first()?.name().to_string().to_lowercase();

    let addr = if name == "www.domain.com." {
        Some(Ipv4Addr::new(192, 168, 1, 14))
    } else if name == "ns.wildcard.domain.com." {
        Some(Ipv4Addr::new(192, 168, 1, 2))
    } else if name.ends_with(".wildcard.domain.com.") {
        Some(Ipv4Addr::new(192, 168, 1, 64))
    } else {
        None
    };

    match addr {
        Some(ip) => a_reply(query, ip),
        None => rcode_reply(query, ResponseCode::NXDomain),
    }
}

/// Parse a name, panicking on failure; test fixtures only
pub fn name(s: &str) -> Name {
    Name::from_str(s).expect("valid test name")
}
