//! End-to-end scenarios over loopback TCP.
//!
//! These run on the real clock, so timing assertions stay coarse: exact
//! schedules are pinned down by the per-module unit tests under a paused
//! clock.

use std::time::{Duration, Instant};

use futures::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use flowcap::{Error, Throttled, ThrottledListener};

/// Accept one throttled connection and its raw client end.
async fn pair(
    listener: &ThrottledListener<flowcap::TcpListener>,
) -> (Throttled<flowcap::TcpStream>, tokio::net::TcpStream) {
    let addr = listener.local_addr().expect("local addr");
    let (accepted, client) = tokio::join!(
        listener.accept(),
        tokio::net::TcpStream::connect(addr)
    );
    let (conn, _peer) = accepted.expect("accept");
    (conn, client.expect("connect"))
}

#[tokio::test]
async fn listen_rejects_conn_limit_over_global() {
    assert!(matches!(
        flowcap::listen("127.0.0.1:0", 10, 20).await,
        Err(Error::LocalOverGlobal {
            requested: 20,
            global: 10
        })
    ));
}

#[tokio::test]
async fn short_message_rides_the_burst() {
    let listener = flowcap::listen("127.0.0.1:0", 10, 10).await.expect("listen");
    let (mut conn, mut client) = pair(&listener).await;

    let start = Instant::now();
    client.write_all(b"8 bytes!").await.expect("client write");

    let peer = flowcap::peer_addr(conn.get_ref()).expect("peer addr");
    assert_eq!(peer, client.local_addr().expect("client addr"));

    // An eleven-byte buffer, a ten-byte grant, eight bytes on the wire.
    let mut buf = [0_u8; 11];
    let n = conn.read(&mut buf).await.expect("read");
    assert_eq!(n, 8);
    assert_eq!(&buf[..n], b"8 bytes!");
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn limit_ladder_grants_each_step_in_full() {
    let listener = flowcap::listen("127.0.0.1:0", 10, 1).await.expect("listen");
    let (mut conn, mut client) = pair(&listener).await;

    for step in [1_usize, 5, 7] {
        listener.set_local_limit(step as u64).expect("set limit");
        let payload = vec![b'x'; step];
        conn.write_all(&payload).await.expect("write");
        conn.flush().await.expect("flush");

        let mut buf = vec![0_u8; step];
        client.read_exact(&mut buf).await.expect("client read");
        assert_eq!(buf, payload, "step {step}");
    }
}

#[tokio::test]
async fn refused_local_limit_leaves_connections_untouched() {
    let listener = flowcap::listen("127.0.0.1:0", 10, 5).await.expect("listen");
    let (mut conn, mut client) = pair(&listener).await;

    assert!(matches!(
        listener.set_local_limit(20),
        Err(Error::LocalOverGlobal {
            requested: 20,
            global: 10
        })
    ));
    assert_eq!(listener.conn_limit(), 5);

    // The refused call changed no allocator state: a five-byte burst still
    // goes through at once.
    let start = Instant::now();
    conn.write_all(b"still").await.expect("write");
    let mut buf = [0_u8; 5];
    client.read_exact(&mut buf).await.expect("client read");
    assert_eq!(&buf, b"still");
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn connections_share_the_global_budget() {
    let listener = flowcap::listen("127.0.0.1:0", 10, 10).await.expect("listen");
    let (mut first, _client_a) = pair(&listener).await;
    let (mut second, _client_b) = pair(&listener).await;

    let start = Instant::now();
    assert_eq!(first.write(&[1_u8; 10]).await.expect("first write"), 10);
    assert!(start.elapsed() < Duration::from_millis(500));

    // The shared burst is spent; the second connection waits out a period
    // even though its own bucket is full.
    assert_eq!(second.write(&[2_u8; 10]).await.expect("second write"), 10);
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(900) && elapsed < Duration::from_secs(5),
        "elapsed {elapsed:?}"
    );
}

#[tokio::test]
async fn closing_a_connection_is_terminal() {
    let listener = flowcap::listen("127.0.0.1:0", 10, 10).await.expect("listen");
    let (mut conn, _client) = pair(&listener).await;

    conn.close().await.expect("close");
    assert!(conn.write(b"nope").await.is_err());
    assert_eq!(listener.active_connections(), 0);
}
