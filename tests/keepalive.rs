use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use smux::{Codec, Command, Config, ConfigBuilder, Frame, Session, SmuxError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::Framed;

fn keepalive_config(interval_ms: u64, max_ms: u64, timeout_ms: u64) -> Config {
    ConfigBuilder::new()
        .keep_alive_interval(Duration::from_millis(interval_ms))
        .keep_alive_interval_max(Duration::from_millis(max_ms))
        .keep_alive_timeout(Duration::from_millis(timeout_ms))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let config = keepalive_config(40, 60, 30);
    let threshold = config.keep_alive_interval_max + config.keep_alive_timeout;

    let (local, remote) = tokio::io::duplex(64 * 1024);
    let session = Session::client(local, config.clone()).unwrap();
    // The peer accepts the stream and then goes quiet
    let mut peer = Framed::new(remote, Codec::new(config));

    let started = Instant::now();
    let stream = session.open_stream().await.unwrap();
    let mut buf = [0u8; 8];
    let err = tokio::time::timeout(Duration::from_secs(2), stream.recv(&mut buf))
        .await
        .expect("read should fail once the peer is declared dead")
        .unwrap_err();

    assert!(matches!(err, SmuxError::KeepAliveTimeout));
    assert!(matches!(session.close_cause(), Some(SmuxError::KeepAliveTimeout)));
    let elapsed = started.elapsed();
    assert!(elapsed > threshold, "died too early: {elapsed:?}");
    assert!(
        elapsed < threshold + Duration::from_millis(200),
        "died too late: {elapsed:?}"
    );

    // The peer saw our keep-alives the whole time
    let mut nops = 0;
    while let Ok(Some(Ok(frame))) =
        tokio::time::timeout(Duration::from_millis(10), peer.next()).await
    {
        if frame.cmd == Command::Nop {
            nops += 1;
        }
    }
    assert!(nops >= 1);
}

#[tokio::test]
async fn test_any_inbound_frame_counts_as_activity() {
    let config = keepalive_config(40, 60, 30);
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let session = Session::server(local, config.clone()).unwrap();
    let mut peer = Framed::new(remote, Codec::new(config));

    peer.send(Frame::syn(1, 1)).await.unwrap();
    let stream = session.accept_stream().await.unwrap();

    // Data instead of NOPs keeps the session alive well past the threshold
    for _ in 0..20 {
        peer.send(Frame::psh(1, 1, Bytes::from_static(b"x")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!session.is_closed());

    let mut buf = [0u8; 64];
    let mut total = 0;
    while total < 20 {
        total += stream.recv(&mut buf).await.unwrap();
    }
    assert_eq!(total, 20);
}

#[tokio::test]
async fn test_idle_sessions_stay_alive() {
    let config = keepalive_config(100, 150, 80);
    let (client_transport, server_transport) = tokio::io::duplex(64 * 1024);
    let client = Session::client(client_transport, config.clone()).unwrap();
    let server = Session::server(server_transport, config).unwrap();

    let stream = client.open_stream().await.unwrap();
    let accepted = server.accept_stream().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(!client.is_closed());
    assert!(!server.is_closed());

    stream.send(b"still here").await.unwrap();
    let mut buf = [0u8; 16];
    let n = accepted.recv(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"still here");
}

/// Keeps the local liveness monitor satisfied while the test watches the
/// other direction.
fn spawn_nop_feeder<S>(mut sink: S) -> tokio::task::JoinHandle<()>
where
    S: futures::Sink<Frame> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while sink.send(Frame::nop(1)).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}

#[tokio::test]
async fn test_nop_cadence_when_idle() {
    let config = keepalive_config(30, 50, 10);
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let session = Session::client(local, config.clone()).unwrap();
    let (peer_tx, mut peer_rx) = Framed::new(remote, Codec::new(config)).split();
    let feeder = spawn_nop_feeder(peer_tx);

    let mut last = Instant::now();
    for _ in 0..3 {
        let frame = tokio::time::timeout(Duration::from_secs(1), peer_rx.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.cmd, Command::Nop);
        assert!(last.elapsed() >= Duration::from_millis(25));
        last = Instant::now();
    }

    assert!(!session.is_closed());
    feeder.abort();
}

#[tokio::test]
async fn test_no_nop_while_data_flows() {
    let config = keepalive_config(50, 60, 10);
    let (local, remote) = tokio::io::duplex(1024 * 1024);
    let session = Session::client(local, config.clone()).unwrap();
    let (peer_tx, mut peer_rx) = Framed::new(remote, Codec::new(config)).split();
    let feeder = spawn_nop_feeder(peer_tx);

    let stream = session.open_stream().await.unwrap();
    let writer = tokio::spawn(async move {
        for _ in 0..30 {
            stream.send(b"tick").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stream
    });

    let mut frames = Vec::new();
    while let Ok(Some(Ok(frame))) =
        tokio::time::timeout(Duration::from_millis(40), peer_rx.next()).await
    {
        frames.push(frame.cmd);
        if frames.iter().filter(|cmd| **cmd == Command::Psh).count() == 30 {
            break;
        }
    }
    let _stream = writer.await.unwrap();

    assert_eq!(frames.iter().filter(|cmd| **cmd == Command::Psh).count(), 30);
    assert!(!frames.contains(&Command::Nop), "unexpected NOP in {frames:?}");
    assert!(!session.is_closed());
    feeder.abort();
}
