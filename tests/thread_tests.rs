//! Thread DFU server tests over loopback UDP: a socket-backed fake
//! mesh client receives the multicast push, reports missing blocks,
//! and watches the repair round terminate.

use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use coap_lite::{CoapOption, CoapRequest, MessageType, Packet, RequestType};
use nrfdfu::thread_dfu::{ThreadDfuConfig, ThreadDfuServer, TriggerPayload};

/// A block pushed by the server, as seen on the client socket.
struct Pushed {
    path: String,
    num: u32,
    more: bool,
    payload: Vec<u8>,
}

fn parse_push(bytes: &[u8], source: SocketAddr) -> Pushed {
    let packet = Packet::from_bytes(bytes).unwrap();
    let request = CoapRequest::from_packet(packet, source);
    let path = request.get_path();
    // Block1 value is a big-endian uint: num << 4 | more << 3 | szx.
    let value = request
        .message
        .get_option(CoapOption::Block1)
        .and_then(|v| v.front().cloned())
        .unwrap_or_default();
    let mut raw = 0u32;
    for &b in &value {
        raw = (raw << 8) | u32::from(b);
    }
    Pushed {
        path,
        num: raw >> 4,
        more: raw & 0x8 != 0,
        payload: request.message.payload.clone(),
    }
}

fn coap_request(method: RequestType, path: &str, payload: Vec<u8>) -> Vec<u8> {
    let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
    request.set_method(method);
    request.set_path(path);
    request.message.header.set_type(MessageType::NonConfirmable);
    request.message.header.message_id = 0x4242;
    request.message.payload = payload;
    request.message.to_bytes().unwrap()
}

fn client_socket() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

#[test]
fn multicast_repair_retransmits_reported_blocks() {
    let (client, client_addr) = client_socket();

    // One 64-byte init block, two 64-byte image blocks.
    let init: Vec<u8> = (0..64).map(|i| i as u8).collect();
    let image: Vec<u8> = (0..128).map(|i| (i as u8).wrapping_mul(5)).collect();

    let config = ThreadDfuConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        multicast_addr: client_addr,
        rate: 200.0,
        block_szx: 2,
        multicast: true,
        reset_delay_ms: Some(50),
    };
    let mut server = ThreadDfuServer::new(init.clone(), image.clone(), config);
    let handle = thread::spawn(move || server.run());

    // Initial pass: /i block 0, then /f blocks 0 and 1.
    let mut buf = [0u8; 1500];
    let mut server_addr = None;
    let mut pushed = Vec::new();
    while pushed.len() < 3 {
        let (len, source) = client.recv_from(&mut buf).unwrap();
        server_addr = Some(source);
        pushed.push(parse_push(&buf[..len], source));
    }
    let server_addr = server_addr.unwrap();

    assert_eq!(pushed[0].path, "i");
    assert_eq!((pushed[0].num, pushed[0].more), (0, false));
    assert_eq!(pushed[0].payload, init);
    assert_eq!(pushed[1].path, "f");
    assert_eq!((pushed[1].num, pushed[1].more), (0, true));
    assert_eq!(pushed[1].payload, &image[..64]);
    assert_eq!(pushed[2].path, "f");
    assert_eq!((pushed[2].num, pushed[2].more), (1, false));
    assert_eq!(pushed[2].payload, &image[64..]);

    // Report image block 1 of superblock 0 as missed (bits are
    // most-significant first).
    let mut bitmap = vec![0u8; 10];
    BigEndian::write_u64(&mut bitmap[2..10], 1u64 << 62);
    client
        .send_to(&coap_request(RequestType::Put, "b/f/0", bitmap), server_addr)
        .unwrap();

    let (len, source) = client.recv_from(&mut buf).unwrap();
    let repaired = parse_push(&buf[..len], source);
    assert_eq!(repaired.path, "f");
    assert_eq!((repaired.num, repaired.more), (1, false));
    assert_eq!(repaired.payload, &image[64..]);

    // No further bitmaps: the repair round times out and the server
    // broadcasts the reset request before shutting down.
    let (len, source) = client.recv_from(&mut buf).unwrap();
    let reset = parse_push(&buf[..len], source);
    assert_eq!(reset.path, "r");
    assert_eq!(reset.payload, 50u32.to_be_bytes());

    handle.join().unwrap().unwrap();
}

#[test]
fn mesh_trigger_starts_the_push() {
    let (client, client_addr) = client_socket();

    // Reserve a local port for the server so the client can reach it.
    let server_addr = UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let init: Vec<u8> = vec![0xA5; 48];
    let image: Vec<u8> = (0..64).map(|i| i as u8).collect();

    let config = ThreadDfuConfig {
        bind: server_addr,
        multicast_addr: client_addr,
        rate: 200.0,
        block_szx: 2,
        multicast: false,
        reset_delay_ms: None,
    };
    let mut server = ThreadDfuServer::new(init.clone(), image.clone(), config);
    let handle = thread::spawn(move || server.run());
    thread::sleep(Duration::from_millis(100));

    let trigger = TriggerPayload::new(&init, &image, true, false);
    client
        .send_to(
            &coap_request(RequestType::Post, "t", trigger.to_bytes().to_vec()),
            server_addr,
        )
        .unwrap();

    // Skip the 2.01 acknowledgement; collect the pushed blocks.
    let mut buf = [0u8; 1500];
    let mut pushed = Vec::new();
    while pushed.len() < 2 {
        let (len, source) = client.recv_from(&mut buf).unwrap();
        let push = parse_push(&buf[..len], source);
        if push.path == "i" || push.path == "f" {
            pushed.push(push);
        }
    }
    assert_eq!(pushed[0].path, "i");
    assert_eq!(pushed[0].payload, init);
    assert_eq!(pushed[1].path, "f");
    assert_eq!((pushed[1].num, pushed[1].more), (0, false));
    assert_eq!(pushed[1].payload, image);

    // Nothing reported missing: the push winds down on its own.
    handle.join().unwrap().unwrap();
}
