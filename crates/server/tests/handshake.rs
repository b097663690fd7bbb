use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use biribit::{
    NetworkEndpoint, Packet, PacketHeader, PacketType, Reliability, ReliableChannel,
};
use biribit_server::{Server, ServerConfig};

struct TestServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(config: ServerConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut server = Server::new("127.0.0.1:0", config).unwrap();
        let addr = server.local_addr();
        let running = server.running();
        let handle = thread::spawn(move || server.run());

        Self {
            addr,
            running,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn wait_for_packet(
    endpoint: &mut NetworkEndpoint,
    timeout_ms: u64,
) -> Option<Vec<(Packet, SocketAddr)>> {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        let received = endpoint.receive().unwrap();
        if !received.is_empty() {
            return Some(received);
        }
        thread::sleep(Duration::from_millis(1));
    }
    None
}

#[test]
fn test_discover_probe_is_answered() {
    let server = TestServer::start(ServerConfig {
        name: "Basement LAN".to_string(),
        password: Some("hunter2".to_string()),
        ..Default::default()
    });

    let mut endpoint = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
    let probe = Packet::new(PacketHeader::new(0, 0, 0), PacketType::DiscoverProbe);
    endpoint.send_to(&probe, server.addr).unwrap();

    let received = wait_for_packet(&mut endpoint, 2000).expect("no discovery response");
    let (packet, from_addr) = &received[0];
    assert_eq!(*from_addr, server.addr);
    match &packet.payload {
        PacketType::DiscoverResponse {
            name,
            password_protected,
        } => {
            assert_eq!(name, "Basement LAN");
            assert!(*password_protected);
        }
        other => panic!("expected DiscoverResponse, got {:?}", other),
    }
}

#[test]
fn test_wrong_password_is_denied() {
    let server = TestServer::start(ServerConfig {
        password: Some("secret".to_string()),
        ..Default::default()
    });

    let mut endpoint = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
    let mut channel = ReliableChannel::new();

    let request = PacketType::ConnectionRequest {
        client_salt: 42,
        password: Some("not-it".to_string()),
    };
    let bytes = channel
        .frame(request, Reliability::UNRELIABLE, Instant::now())
        .unwrap();
    endpoint.send_bytes(&bytes, server.addr).unwrap();

    let received = wait_for_packet(&mut endpoint, 2000).expect("no denial");
    match &received[0].0.payload {
        PacketType::ConnectionDenied { reason } => {
            assert!(reason.contains("password"));
        }
        other => panic!("expected ConnectionDenied, got {:?}", other),
    }
}

#[test]
fn test_full_handshake_against_real_server() {
    let server = TestServer::start(ServerConfig {
        name: "Handshake Test".to_string(),
        ..Default::default()
    });

    let mut endpoint = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
    let mut channel = ReliableChannel::new();
    let client_salt = 0xA1B2_C3D4_E5F6_0789u64;

    let bytes = channel
        .frame(
            PacketType::ConnectionRequest {
                client_salt,
                password: None,
            },
            Reliability::UNRELIABLE,
            Instant::now(),
        )
        .unwrap();
    endpoint.send_bytes(&bytes, server.addr).unwrap();

    let received = wait_for_packet(&mut endpoint, 2000).expect("no challenge");
    let (packet, _) = received.into_iter().next().unwrap();
    let absorbed = channel.absorb(packet, Instant::now());
    let payload = &absorbed.delivered[0].payload;
    let combined_salt = match payload {
        PacketType::ConnectionChallenge {
            server_salt,
            challenge,
        } => {
            assert_eq!(*challenge, client_salt ^ server_salt);
            client_salt ^ server_salt
        }
        other => panic!("expected ConnectionChallenge, got {:?}", other),
    };

    let bytes = channel
        .frame(
            PacketType::ChallengeResponse { combined_salt },
            Reliability::RELIABLE,
            Instant::now(),
        )
        .unwrap();
    endpoint.send_bytes(&bytes, server.addr).unwrap();

    // The server answers with acceptance plus the initial client list.
    let deadline = Instant::now() + Duration::from_millis(2000);
    let mut accepted_id = None;
    while accepted_id.is_none() && Instant::now() < deadline {
        if let Some(received) = wait_for_packet(&mut endpoint, 100) {
            for (packet, _) in received {
                let absorbed = channel.absorb(packet, Instant::now());
                for delivered in absorbed.delivered {
                    if let PacketType::ConnectionAccepted {
                        client_id,
                        server_name,
                    } = delivered.payload
                    {
                        assert_eq!(server_name, "Handshake Test");
                        accepted_id = Some(client_id);
                    }
                }
            }
        }
    }

    assert!(accepted_id.is_some_and(|id| id > 0), "never accepted");
}
