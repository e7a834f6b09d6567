//! protocol scenarios driven over in-memory pipes
//!
//! one side is a real connection, the other writes raw frame bytes.
//! client-to-server frames use an all-zero mask key so the expected
//! bytes stay readable (xor with zero is the identity).

use bytes::BytesMut;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Decoder;
use ws_engine::codec::{FrameCodec, FrameConfig, Role};
use ws_engine::frame::OpCode;
use ws_engine::{ClientBuilder, Connection, ConnectionState, Message, ServerBuilder, WsError};

const ZERO_MASK: [u8; 4] = [0, 0, 0, 0];

/// masked frame with a zero key, payload bytes unchanged on the wire
fn masked(b0: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 125);
    let mut frame = vec![b0, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&ZERO_MASK);
    frame.extend_from_slice(payload);
    frame
}

fn server_conn(buffer: usize) -> (DuplexStream, Connection<DuplexStream>) {
    let (peer, end) = duplex(buffer);
    (peer, Connection::new(end, Role::Server))
}

#[tokio::test]
async fn masked_client_frame_yields_text() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58])
        .await
        .unwrap();
    assert_eq!(conn.recv().await, Some(Message::Text("Hello".into())));
}

#[tokio::test]
async fn unmasked_client_frame_fails_with_1002() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f])
        .await
        .unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1002));
    assert_eq!(conn.state(), ConnectionState::Closed);
    // the failure went out as an unmasked close frame carrying 1002
    let mut head = [0u8; 2];
    peer.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x88);
    let mut payload = vec![0u8; head[1] as usize];
    peer.read_exact(&mut payload).await.unwrap();
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);
}

#[tokio::test]
async fn fragmented_text_reassembles_across_codepoint_boundary() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x01, &[0xc3])).await.unwrap();
    peer.write_all(&masked(0x80, &[0xa9])).await.unwrap();
    assert_eq!(conn.recv().await, Some(Message::Text("é".into())));
}

#[tokio::test]
async fn invalid_continuation_byte_closes_1007() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x01, &[0xc3])).await.unwrap();
    peer.write_all(&masked(0x80, &[0x28])).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1007));
}

#[tokio::test]
async fn text_ending_mid_codepoint_closes_1007() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x81, &[0xc3])).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1007));
}

#[tokio::test]
async fn empty_messages_are_legal() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x81, &[])).await.unwrap();
    peer.write_all(&masked(0x82, &[])).await.unwrap();
    assert_eq!(conn.recv().await, Some(Message::Text(String::new())));
    assert_eq!(conn.recv().await, Some(Message::Binary(Default::default())));
}

#[tokio::test]
async fn ping_is_answered_before_further_data() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x89, &[])).await.unwrap();
    peer.write_all(&masked(0x81, b"hi")).await.unwrap();
    assert_eq!(conn.recv().await, Some(Message::Text("hi".into())));
    let mut pong = [0u8; 2];
    peer.read_exact(&mut pong).await.unwrap();
    assert_eq!(pong, [0x8a, 0x00]);
}

#[tokio::test]
async fn ping_between_fragments_does_not_corrupt_assembly() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x01, b"a")).await.unwrap();
    peer.write_all(&masked(0x89, b"p")).await.unwrap();
    peer.write_all(&masked(0x80, b"b")).await.unwrap();
    assert_eq!(conn.recv().await, Some(Message::Text("ab".into())));
    let mut pong = [0u8; 3];
    peer.read_exact(&mut pong).await.unwrap();
    assert_eq!(pong, [0x8a, 0x01, b'p']);
}

#[tokio::test]
async fn continuation_without_start_closes_1002() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x80, b"x")).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1002));
}

#[tokio::test]
async fn new_data_frame_during_fragmented_message_closes_1002() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x01, b"a")).await.unwrap();
    peer.write_all(&masked(0x81, b"b")).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1002));
}

#[tokio::test]
async fn oversize_assembled_message_closes_1009() {
    let (peer, end) = duplex(1024);
    let mut peer = peer;
    let config = FrameConfig {
        max_message_size: 8,
        ..Default::default()
    };
    let mut conn = Connection::with_config(end, Role::Server, config);
    peer.write_all(&masked(0x02, b"abcdef")).await.unwrap();
    peer.write_all(&masked(0x80, b"ghijkl")).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1009));
}

#[tokio::test]
async fn local_close_emits_expected_bytes_and_finishes() {
    let (mut peer, mut conn) = server_conn(1024);
    conn.close(1000, "bye").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::ClosingLocal);
    let mut frame = [0u8; 7];
    peer.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, [0x88, 0x05, 0x03, 0xe8, b'b', b'y', b'e']);
    peer.write_all(&masked(0x88, &[0x03, 0xe8])).await.unwrap();
    conn.wait_closed().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.close_code(), Some(1000));
}

#[tokio::test(start_paused = true)]
async fn close_handshake_times_out_without_peer_close() {
    let (_peer, mut conn) = server_conn(1024);
    conn.close(1000, "").await.unwrap();
    conn.wait_closed().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.close_code(), Some(1006));
}

#[tokio::test]
async fn data_after_sending_close_is_discarded() {
    let (mut peer, mut conn) = server_conn(1024);
    conn.close(1000, "").await.unwrap();
    peer.write_all(&masked(0x81, b"late")).await.unwrap();
    peer.write_all(&masked(0x88, &[0x03, 0xe8])).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1000));
}

#[tokio::test]
async fn peer_close_is_echoed_and_recv_ends() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x88, &[0x03, 0xe9])).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1001));
    let mut echo = [0u8; 4];
    peer.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, [0x88, 0x02, 0x03, 0xe9]);
}

#[tokio::test]
async fn close_without_code_reads_as_1005() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x88, &[])).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1005));
    // the echo then carries no code either
    let mut echo = [0u8; 2];
    peer.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, [0x88, 0x00]);
}

#[tokio::test]
async fn one_byte_close_payload_closes_1002() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x88, &[0x03])).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1002));
}

#[tokio::test]
async fn reserved_peer_close_code_closes_1002() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x88, &1006u16.to_be_bytes())).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1002));
}

#[tokio::test]
async fn forbidden_local_close_codes_are_rejected() {
    let (_peer, mut conn) = server_conn(1024);
    for code in [0u16, 999, 1004, 1005, 1006, 1015, 2999] {
        assert!(
            matches!(conn.close(code, "").await, Err(WsError::InvalidCloseCode(_))),
            "{code}"
        );
    }
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn oversize_ping_payload_is_rejected() {
    let (_peer, mut conn) = server_conn(1024);
    let payload = vec![0u8; 126];
    assert!(matches!(
        conn.ping(&payload).await,
        Err(WsError::ControlPayloadTooBig(126))
    ));
}

#[tokio::test]
async fn ping_resolves_on_matching_pong() {
    let (mut peer, mut conn) = server_conn(1024);
    // a stray pong with the wrong payload must not satisfy the ping
    peer.write_all(&masked(0x8a, b"xx")).await.unwrap();
    peer.write_all(&masked(0x8a, b"hi")).await.unwrap();
    conn.ping(b"hi").await.unwrap();
}

#[tokio::test]
async fn messages_arriving_during_ping_are_kept_for_recv() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x81, b"early")).await.unwrap();
    peer.write_all(&masked(0x8a, b"k")).await.unwrap();
    conn.ping(b"k").await.unwrap();
    assert_eq!(conn.recv().await, Some(Message::Text("early".into())));
}

#[tokio::test]
async fn send_fragments_messages_beyond_the_frame_limit() {
    let (mut peer, end) = duplex(64 * 1024);
    let config = FrameConfig {
        max_frame_size: 4,
        ..Default::default()
    };
    let mut conn = Connection::with_config(end, Role::Client, config);
    conn.send("abcdefghij").await.unwrap();
    drop(conn);

    let mut raw = Vec::new();
    peer.read_to_end(&mut raw).await.unwrap();
    let mut buf = BytesMut::from(&raw[..]);
    let mut codec = FrameCodec::new(Role::Server, FrameConfig::default());
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(&mut buf).unwrap() {
        frames.push(frame);
    }
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].opcode(), OpCode::Text);
    assert!(!frames[0].fin());
    assert_eq!(frames[0].payload(), b"abcd");
    assert_eq!(frames[1].opcode(), OpCode::Continue);
    assert!(!frames[1].fin());
    assert_eq!(frames[2].opcode(), OpCode::Continue);
    assert!(frames[2].fin());
    assert_eq!(frames[2].payload(), b"ij");
}

#[tokio::test]
async fn send_fails_once_closed() {
    let (mut peer, mut conn) = server_conn(1024);
    peer.write_all(&masked(0x88, &[0x03, 0xe8])).await.unwrap();
    assert_eq!(conn.recv().await, None);
    assert!(matches!(
        conn.send("nope").await,
        Err(WsError::InvalidConnState(ConnectionState::Closed))
    ));
}

#[tokio::test(start_paused = true)]
async fn keepalive_ping_fires_on_inbound_silence() {
    let (mut peer, mut conn) = server_conn(1024);
    conn.set_keepalive_interval(Some(std::time::Duration::from_secs(5)));
    let task = tokio::spawn(async move {
        let msg = conn.recv().await;
        (msg, conn)
    });
    let mut ping = [0u8; 2];
    peer.read_exact(&mut ping).await.unwrap();
    assert_eq!(ping, [0x89, 0x00]);
    peer.write_all(&masked(0x88, &[0x03, 0xe8])).await.unwrap();
    let (msg, conn) = task.await.unwrap();
    assert_eq!(msg, None);
    assert_eq!(conn.close_code(), Some(1000));
}

#[tokio::test]
async fn transport_death_surfaces_as_1006() {
    let (peer, mut conn) = server_conn(1024);
    drop(peer);
    assert_eq!(conn.recv().await, None);
    assert_eq!(conn.close_code(), Some(1006));
}

async fn echo_until_closed(mut conn: Connection<DuplexStream>) -> Connection<DuplexStream> {
    while let Some(msg) = conn.recv().await {
        if conn.send(msg).await.is_err() {
            break;
        }
    }
    conn
}

#[tokio::test]
async fn handshake_echo_roundtrip() {
    let (client_end, server_end) = duplex(64 * 1024);
    let server = tokio::spawn(async move {
        let conn = ServerBuilder::new()
            .protocols(vec!["chat".to_string()])
            .accept(server_end)
            .await
            .unwrap();
        echo_until_closed(conn).await
    });

    let uri: http::Uri = "ws://example.com/chat".parse().unwrap();
    let mut client = ClientBuilder::new()
        .protocol("chat".to_string())
        .connect_on(uri, client_end)
        .await
        .unwrap();
    assert_eq!(client.subprotocol(), Some("chat"));

    client.send("Hello").await.unwrap();
    assert_eq!(client.recv().await, Some(Message::Text("Hello".into())));

    let blob: Vec<u8> = (0u8..=255).collect();
    client.send(blob.clone()).await.unwrap();
    match client.recv().await {
        Some(Message::Binary(data)) => assert_eq!(&data[..], &blob[..]),
        other => panic!("expected binary echo, got {other:?}"),
    }

    client.ping(b"are you there").await.unwrap();

    client.close(1000, "bye").await.unwrap();
    client.wait_closed().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.close_code(), Some(1000));

    let server_conn = server.await.unwrap();
    assert_eq!(server_conn.close_code(), Some(1000));
    assert_eq!(server_conn.close_reason(), Some("bye"));
}

#[tokio::test]
async fn start_server_echoes_over_tcp() {
    let handle = ws_engine::start_server(
        |mut conn| async move {
            while let Some(msg) = conn.recv().await {
                if conn.send(msg).await.is_err() {
                    break;
                }
            }
        },
        "127.0.0.1",
        0,
    )
    .await
    .unwrap();
    let port = handle.local_addr().port();

    let uri: http::Uri = format!("ws://127.0.0.1:{port}/echo").parse().unwrap();
    let mut client = ClientBuilder::new().connect(uri).await.unwrap();
    assert!(client.remote_address().is_some());
    client.send("over tcp").await.unwrap();
    assert_eq!(client.recv().await, Some(Message::Text("over tcp".into())));
    client.close(1000, "").await.unwrap();
    client.wait_closed().await;

    handle.stop().await;
}
