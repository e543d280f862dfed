//! Wire-level behavior checked against a hand-driven peer.

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use quickcheck::{quickcheck, TestResult};
use smux::{Codec, Command, Config, Frame, Session, SmuxError};
use std::{collections::HashSet, time::Duration};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

type RawPeer = Framed<DuplexStream, Codec>;

fn quiet_config() -> Config {
    Config {
        enable_keep_alive: false,
        ..Default::default()
    }
}

fn client_with_peer(config: Config) -> (Session, RawPeer) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let session = Session::client(local, config.clone()).unwrap();
    (session, Framed::new(remote, Codec::new(config)))
}

fn server_with_peer(config: Config) -> (Session, RawPeer) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let session = Session::server(local, config.clone()).unwrap();
    (session, Framed::new(remote, Codec::new(config)))
}

fn server_with_raw_bytes(config: Config) -> (Session, DuplexStream) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    (Session::server(local, config).unwrap(), remote)
}

fn raw_header(version: u8, cmd: u8, length: u16, stream_id: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(version);
    buf.put_u8(cmd);
    buf.put_u16(length);
    buf.put_u32(stream_id);
    buf
}

async fn next_frame(peer: &mut RawPeer) -> Frame {
    tokio::time::timeout(Duration::from_secs(1), peer.next())
        .await
        .expect("frame in time")
        .expect("peer open")
        .expect("valid frame")
}

async fn death_cause(session: &Session) -> SmuxError {
    tokio::time::timeout(Duration::from_secs(1), session.closed())
        .await
        .expect("session died in time")
}

#[tokio::test]
async fn test_write_is_fragmented_by_max_frame_size() {
    let config = Config {
        max_frame_size: 8,
        ..quiet_config()
    };
    let (session, mut peer) = client_with_peer(config);

    let stream = session.open_stream().await.unwrap();
    let payload: Vec<u8> = (0..20).collect();
    assert_eq!(stream.send(&payload).await.unwrap(), 20);

    assert_eq!(next_frame(&mut peer).await, Frame::syn(1, 1));
    let mut received = Vec::new();
    for expected_len in [8, 8, 4] {
        let frame = next_frame(&mut peer).await;
        assert_eq!(frame.cmd, Command::Psh);
        assert_eq!(frame.stream_id, 1);
        assert_eq!(frame.data.len(), expected_len);
        received.extend_from_slice(&frame.data);
    }
    assert_eq!(received, payload);
}

#[test]
fn test_fragment_count_property() {
    fn prop(len: u16, frame_size: u8) -> TestResult {
        if frame_size == 0 {
            return TestResult::discard();
        }
        let len = len as usize % 4096;
        let frame_size = frame_size as usize;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let config = Config {
                max_frame_size: frame_size,
                ..quiet_config()
            };
            let (session, mut peer) = client_with_peer(config);
            let stream = session.open_stream().await.unwrap();
            stream.send(&vec![0xAB; len]).await.unwrap();
            stream.close().await.unwrap();

            let mut frames = 0;
            let mut total = 0;
            loop {
                let frame = next_frame(&mut peer).await;
                match frame.cmd {
                    Command::Syn => continue,
                    Command::Psh => {
                        if frame.stream_id != 1 || frame.data.len() > frame_size {
                            return TestResult::failed();
                        }
                        frames += 1;
                        total += frame.data.len();
                    }
                    Command::Fin => break,
                    _ => return TestResult::failed(),
                }
            }
            TestResult::from_bool(total == len && frames == len.div_ceil(frame_size))
        })
    }
    quickcheck(prop as fn(u16, u8) -> TestResult);
}

#[tokio::test]
async fn test_stream_ids_have_local_parity() {
    let (client, mut client_peer) = client_with_peer(quiet_config());
    let (server, mut server_peer) = server_with_peer(quiet_config());

    for expected in [1, 3, 5] {
        let stream = client.open_stream().await.unwrap();
        assert_eq!(stream.stream_id(), expected);
        assert_eq!(next_frame(&mut client_peer).await, Frame::syn(1, expected));
    }
    for expected in [2, 4, 6] {
        let stream = server.open_stream().await.unwrap();
        assert_eq!(stream.stream_id(), expected);
        assert_eq!(next_frame(&mut server_peer).await, Frame::syn(1, expected));
    }
}

#[tokio::test]
async fn test_data_with_wrong_parity_kills_session() {
    let (session, mut peer) = server_with_peer(quiet_config());

    peer.send(Frame::syn(1, 1)).await.unwrap();
    let stream = session.accept_stream().await.unwrap();

    // Even IDs belong to the server, which never opened stream 2
    peer.send(Frame::psh(1, 2, Bytes::from_static(b"bogus")))
        .await
        .unwrap();

    let cause = death_cause(&session).await;
    assert!(cause.is_protocol_error(), "unexpected cause {cause:?}");
    assert_eq!(session.num_streams(), 0);

    // Every stream reports the same cause
    let mut buf = [0u8; 8];
    let err = stream.recv(&mut buf).await.unwrap_err();
    assert!(matches!(err, SmuxError::ProtocolViolation(_)));
    assert!(matches!(
        stream.send(b"x").await,
        Err(SmuxError::ProtocolViolation(_))
    ));
    assert!(matches!(
        session.open_stream().await,
        Err(SmuxError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_version_mismatch_kills_session() {
    let (session, mut peer) = {
        let (local, remote) = tokio::io::duplex(8192);
        let session = Session::server(local, quiet_config()).unwrap();
        let peer_config = Config {
            version: 2,
            ..quiet_config()
        };
        (session, Framed::new(remote, Codec::new(peer_config)))
    };

    peer.send(Frame::syn(2, 1)).await.unwrap();

    assert!(matches!(
        death_cause(&session).await,
        SmuxError::InvalidVersion {
            expected: 1,
            actual: 2
        }
    ));
}

#[tokio::test]
async fn test_unknown_command_kills_session() {
    let (session, mut remote) = server_with_raw_bytes(quiet_config());

    remote.write_all(&raw_header(1, 9, 0, 1)).await.unwrap();

    assert!(matches!(
        death_cause(&session).await,
        SmuxError::UnknownCommand(9)
    ));
}

#[tokio::test]
async fn test_window_update_rejected_in_v1() {
    let (session, mut remote) = server_with_raw_bytes(quiet_config());

    let mut frame = raw_header(1, Command::UPD, 8, 1);
    frame.put_u32(0);
    frame.put_u32(1024);
    remote.write_all(&frame).await.unwrap();

    assert!(death_cause(&session).await.is_protocol_error());
}

#[tokio::test]
async fn test_oversized_frame_kills_session() {
    let config = Config {
        max_frame_size: 16,
        ..quiet_config()
    };
    let (session, mut remote) = server_with_raw_bytes(config);

    remote.write_all(&raw_header(1, Command::SYN, 0, 1)).await.unwrap();
    remote.write_all(&raw_header(1, Command::PSH, 17, 1)).await.unwrap();

    assert!(matches!(
        death_cause(&session).await,
        SmuxError::FrameTooLarge { size: 17, max: 16 }
    ));
}

#[tokio::test]
async fn test_truncated_frame_at_eof() {
    let (session, mut remote) = server_with_raw_bytes(quiet_config());

    remote.write_all(&raw_header(1, Command::SYN, 0, 1)).await.unwrap();
    let stream = session.accept_stream().await.unwrap();

    let mut partial = raw_header(1, Command::PSH, 10, 1);
    partial.put_slice(b"abc");
    remote.write_all(&partial).await.unwrap();
    remote.shutdown().await.unwrap();

    assert!(matches!(death_cause(&session).await, SmuxError::Truncated));

    let mut buf = [0u8; 8];
    assert!(matches!(
        stream.recv(&mut buf).await,
        Err(SmuxError::Truncated)
    ));
}

#[tokio::test]
async fn test_clean_eof_between_frames() {
    let (session, mut remote) = server_with_raw_bytes(quiet_config());

    remote.write_all(&raw_header(1, Command::SYN, 0, 1)).await.unwrap();
    drop(remote);

    assert!(matches!(death_cause(&session).await, SmuxError::CarrierEof));
}

#[tokio::test]
async fn test_nop_is_not_echoed() {
    let (session, mut peer) = server_with_peer(quiet_config());

    peer.send(Frame::nop(1)).await.unwrap();
    peer.send(Frame::nop(1)).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_millis(100), peer.next()).await;
    assert!(reply.is_err(), "unexpected reply {reply:?}");
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_fin_for_unknown_stream_is_ignored() {
    let (session, mut peer) = server_with_peer(quiet_config());

    peer.send(Frame::fin(1, 41)).await.unwrap();
    peer.send(Frame::syn(1, 1)).await.unwrap();

    let stream = session.accept_stream().await.unwrap();
    assert_eq!(stream.stream_id(), 1);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_stale_syn_is_duplicate() {
    let (session, mut peer) = server_with_peer(quiet_config());

    peer.send(Frame::syn(1, 5)).await.unwrap();
    let _stream = session.accept_stream().await.unwrap();

    // Peer IDs only grow
    peer.send(Frame::syn(1, 3)).await.unwrap();
    assert!(matches!(
        death_cause(&session).await,
        SmuxError::DuplicateStream(3)
    ));
}

#[tokio::test]
async fn test_window_update_sent_on_read() {
    let config = Config {
        version: 2,
        max_stream_buffer: 1024,
        max_frame_size: 1024,
        ..quiet_config()
    };
    let (session, mut peer) = server_with_peer(config);

    peer.send(Frame::syn(2, 1)).await.unwrap();
    peer.send(Frame::psh(2, 1, Bytes::from(vec![1u8; 600])))
        .await
        .unwrap();

    // Accepting advertises the whole window
    let stream = session.accept_stream().await.unwrap();
    assert_eq!(next_frame(&mut peer).await, Frame::upd(2, 1, 0, 1024));

    let mut buf = [0u8; 600];
    assert_eq!(stream.recv(&mut buf).await.unwrap(), 600);

    let upd = next_frame(&mut peer).await;
    assert_eq!(upd.stream_id, 1);
    assert_eq!(
        upd.cmd,
        Command::Upd {
            consumed: 600,
            window: 1024
        }
    );
}

#[tokio::test]
async fn test_abandoned_open_is_announced_then_closed() {
    let config = Config {
        write_queue_size: 1,
        ..quiet_config()
    };
    let (local, remote) = tokio::io::duplex(64);
    let session = Session::client(local, config.clone()).unwrap();
    let mut peer = Framed::new(remote, Codec::new(config));

    // Nobody reads the carrier yet, so the writer queue eventually fills up
    // and an open has to give up
    let mut opened = Vec::new();
    let mut abandoned = 0;
    while abandoned == 0 {
        match tokio::time::timeout(Duration::from_millis(20), session.open_stream()).await {
            Ok(stream) => opened.push(stream.unwrap()),
            Err(_) => abandoned += 1,
        }
        assert!(opened.len() < 10_000, "writer queue never filled");
    }

    let expected = opened.len() + abandoned;
    drop(opened);

    // Every stream, abandoned or not, is announced before it is closed
    let mut announced = HashSet::new();
    let mut closed = HashSet::new();
    while closed.len() < expected {
        let frame = next_frame(&mut peer).await;
        match frame.cmd {
            Command::Syn => {
                announced.insert(frame.stream_id);
            }
            Command::Fin => {
                assert!(
                    announced.contains(&frame.stream_id),
                    "FIN before SYN on stream {}",
                    frame.stream_id
                );
                closed.insert(frame.stream_id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(announced, closed);

    // Once the peer closes its halves nothing is left in the table
    for stream_id in closed {
        peer.send(Frame::fin(1, stream_id)).await.unwrap();
    }
    for _ in 0..100 {
        if session.num_streams() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.num_streams(), 0);
    assert!(!session.is_closed());
}
