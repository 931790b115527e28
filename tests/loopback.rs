//! End-to-end loopback tests: a raw UDP client against a full `MessageLoop`,
//! including the one-shot TCP fallback for oversized replies.

use setu_link::config::{AppConfig, NetworkConfig};
use setu_link::dispatch::MessageLoop;
use setu_link::host::{HostControl, TestAdapter, TestEventSink, TestFilter, TestListReply, TestMode};
use setu_link::protocol::{Message, MessageKind, decode, encode};
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;

struct LoopbackHost;

impl HostControl for LoopbackHost {
    fn start_play(&mut self) {}
    fn stop_play(&mut self) {}
    fn pause(&mut self) {}
    fn resume(&mut self) {}
    fn is_playing(&self) -> bool {
        false
    }
    fn version(&self) -> String {
        "2023.2.0".to_string()
    }
    fn project_path(&self) -> String {
        "/tmp/loopback".to_string()
    }
    fn package_name(&self) -> String {
        "com.setulink.loopback".to_string()
    }
    fn refresh(&mut self) -> Result<(), String> {
        Ok(())
    }
}

/// Adapter whose test list is far larger than any datagram, forcing the
/// reply through the streaming fallback.
struct BigListAdapter {
    json: String,
}

impl BigListAdapter {
    fn new(size: usize) -> Self {
        let mut json = String::with_capacity(size + 16);
        json.push_str(r#"{"tests":""#);
        while json.len() < size {
            json.push('x');
        }
        json.push_str(r#""}"#);
        Self { json }
    }
}

impl TestAdapter for BigListAdapter {
    fn set_event_sink(&mut self, _sink: TestEventSink) {}
    fn retrieve_test_list(&mut self, _mode: TestMode, reply: TestListReply) {
        reply(self.json.clone());
    }
    fn execute_tests(&mut self, _mode: TestMode, _filter: TestFilter) {}
}

fn loopback_config() -> AppConfig {
    AppConfig {
        network: NetworkConfig {
            port: Some(0),
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Client {
    socket: UdpSocket,
    server: SocketAddr,
}

impl Client {
    fn connect(message_loop: &MessageLoop) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = message_loop.local_port().expect("endpoint not bound");
        Self {
            socket,
            server: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }

    fn send(&self, kind: MessageKind, payload: &str) {
        let frame = encode(&Message::new(kind, payload));
        self.socket.send_to(&frame, self.server).unwrap();
    }

    fn recv(&self) -> Message {
        let mut buf = [0u8; 65536];
        let (n, _) = self.socket.recv_from(&mut buf).expect("no reply");
        decode(&buf[..n]).unwrap()
    }
}

fn pump(message_loop: &mut MessageLoop) {
    thread::sleep(Duration::from_millis(150));
    message_loop.tick();
}

#[test]
fn full_client_session() {
    let mut message_loop = MessageLoop::new(
        loopback_config(),
        Box::new(LoopbackHost),
        Box::new(BigListAdapter::new(64)),
    );
    message_loop.tick();
    let client = Client::connect(&message_loop);

    // First contact: state push, then the Pong.
    client.send(MessageKind::Ping, "");
    pump(&mut message_loop);
    assert_eq!(client.recv().kind, MessageKind::PlayStateChanged);
    assert_eq!(client.recv().kind, MessageKind::Pong);

    // Value query.
    client.send(MessageKind::Version, "");
    pump(&mut message_loop);
    let version = client.recv();
    assert_eq!(version.kind, MessageKind::Version);
    assert_eq!(version.payload, "2023.2.0");

    // Refresh resolves with the empty success payload.
    client.send(MessageKind::Refresh, "");
    pump(&mut message_loop);
    let refresh = client.recv();
    assert_eq!(refresh.kind, MessageKind::Refresh);
    assert_eq!(refresh.payload, "");

    // Teardown notifies the registered client.
    message_loop.shutdown();
    assert_eq!(client.recv().kind, MessageKind::Offline);
}

#[test]
fn oversized_reply_streams_over_tcp_fallback() {
    let mut message_loop = MessageLoop::new(
        loopback_config(),
        Box::new(LoopbackHost),
        Box::new(BigListAdapter::new(20 * 1024)),
    );
    message_loop.tick();
    let client = Client::connect(&message_loop);

    client.send(MessageKind::RetrieveTestList, "EditMode");
    pump(&mut message_loop);

    // Skip the new-client state push.
    assert_eq!(client.recv().kind, MessageKind::PlayStateChanged);

    // The reply itself arrives as a control frame pointing at the parked
    // body, not as the body.
    let control = client.recv();
    assert_eq!(control.kind, MessageKind::Tcp);
    let (port_str, len_str) = control.payload.split_once(':').expect("port:length");
    let port: u16 = port_str.parse().unwrap();
    let length: usize = len_str.parse().unwrap();
    assert!(length > 20 * 1024);

    // Fetch and decode the parked frame.
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();

    let msg = decode(&body).unwrap();
    assert_eq!(msg.kind, MessageKind::TestListRetrieved);
    assert!(msg.payload.starts_with("EditMode:"));
    assert!(msg.payload.len() > 20 * 1024);

    message_loop.shutdown();
}

#[test]
fn two_endpoints_coexist_on_one_machine() {
    // Ephemeral ports stand in for the pid-offset scheme; the point is that
    // two live endpoints never share a socket or cross-deliver.
    let mut a = MessageLoop::new(
        loopback_config(),
        Box::new(LoopbackHost),
        Box::new(BigListAdapter::new(64)),
    );
    let mut b = MessageLoop::new(
        loopback_config(),
        Box::new(LoopbackHost),
        Box::new(BigListAdapter::new(64)),
    );
    a.tick();
    b.tick();
    assert_ne!(a.local_port(), b.local_port());

    let client_a = Client::connect(&a);
    client_a.send(MessageKind::Ping, "");
    pump(&mut a);
    pump(&mut b);

    assert_eq!(a.clients().len(), 1);
    assert!(b.clients().is_empty());

    a.shutdown();
    b.shutdown();
}
