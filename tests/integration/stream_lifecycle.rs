//! Stream creation, reading, writing and closing between two transports.
//!
//! Run with: `cargo test --test stream_lifecycle`

use std::time::Duration;

use quicmux::identity::Origin;
use quicmux::{
    Config, Listener, ReadOutcome, StreamHandle, StreamWriteParameters, Transport, TransportError,
    TransportTuning,
};
use tokio::sync::mpsc;

/// Helper: bind a listener and connect one client, returning (dialer, acceptor, listener).
async fn create_connected_pair() -> (Transport, Transport, Listener) {
    create_connected_pair_with(TransportTuning::default()).await
}

/// Same as [`create_connected_pair`], with `server_tuning` applied to the listener.
async fn create_connected_pair_with(server_tuning: TransportTuning) -> (Transport, Transport, Listener) {
    let server_config = Config::self_signed(&Origin::random().expect("origin"))
        .expect("identity")
        .with_tuning(server_tuning);
    let listener = Listener::bind("127.0.0.1:0", &server_config)
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr").to_string();

    let client_config = Config::self_signed(&Origin::random().expect("origin")).expect("identity");
    let dial = tokio::spawn(async move { Transport::connect(&addr, &client_config).await });
    let acceptor = listener.accept().await.expect("accept");
    let dialer = dial.await.expect("dial task").expect("connect");
    (dialer, acceptor, listener)
}

/// Forward every inbound stream of `transport` into a channel.
fn inbound(transport: &Transport) -> mpsc::UnboundedReceiver<StreamHandle> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.on_bidirectional_stream(move |stream| {
        let _ = tx.send(stream);
    });
    rx
}

/// Open a stream, retrying while the peer has not yet granted new credit.
async fn open_when_credited(transport: &Transport) -> StreamHandle {
    for _ in 0..250 {
        match transport.create_bidirectional_stream().await {
            Ok(stream) => return stream,
            Err(TransportError::StreamLimit) => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(e) => panic!("open failed: {e}"),
        }
    }
    panic!("peer never granted new stream credit");
}

/// Open a stream on `dialer`, write `first`, and return both ends.
async fn open_pair(
    dialer: &Transport,
    streams: &mut mpsc::UnboundedReceiver<StreamHandle>,
    first: &[u8],
) -> (StreamHandle, StreamHandle) {
    let local = dialer.create_bidirectional_stream().await.expect("open");
    local
        .write(StreamWriteParameters::new(first))
        .await
        .expect("write");
    let remote = tokio::time::timeout(Duration::from_secs(5), streams.recv())
        .await
        .expect("inbound stream delivered")
        .expect("channel open");
    (local, remote)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_reads_reassemble_payload() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let payload = b"0123456789abcdefghij";
    let (local, remote) = open_pair(&dialer, &mut streams, payload).await;
    local.close_write().await.expect("close write");

    let mut collected = Vec::new();
    let mut buf = [0u8; 3];
    loop {
        match remote.read_into(&mut buf).await.expect("read") {
            ReadOutcome::Data(n) => {
                assert!(n <= buf.len());
                collected.extend_from_slice(&buf[..n]);
            }
            ReadOutcome::EndOfStream => break,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(collected, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn end_of_stream_is_sticky() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (local, remote) = open_pair(&dialer, &mut streams, b"done").await;
    local.close_write().await.expect("close write");

    assert_eq!(remote.read_to_end(64).await.expect("read"), b"done");
    let mut buf = [0u8; 8];
    assert_eq!(
        remote.read_into(&mut buf).await.expect("read"),
        ReadOutcome::EndOfStream
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn end_of_stream_is_sticky_after_local_fin() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (local, remote) = open_pair(&dialer, &mut streams, b"req").await;
    local.close_write().await.expect("close write");

    assert_eq!(remote.read_to_end(64).await.expect("request"), b"req");
    remote
        .write(StreamWriteParameters::new("resp").finish())
        .await
        .expect("reply");
    assert_eq!(acceptor.open_stream_count(), 0);

    let mut buf = [0u8; 8];
    assert_eq!(
        remote.read_into(&mut buf).await.expect("read after both directions ended"),
        ReadOutcome::EndOfStream
    );
    assert_eq!(local.read_to_end(64).await.expect("reply read"), b"resp");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_buffer_returns_immediately() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (_local, remote) = open_pair(&dialer, &mut streams, b"x").await;

    let outcome = tokio::time::timeout(Duration::from_millis(500), remote.read_into(&mut []))
        .await
        .expect("zero-length read does not block")
        .expect("read");
    assert_eq!(outcome, ReadOutcome::Data(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn both_directions_carry_data() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (local, remote) = open_pair(&dialer, &mut streams, b"ping").await;

    let mut buf = [0u8; 16];
    assert_eq!(remote.read_into(&mut buf).await.expect("read"), ReadOutcome::Data(4));
    remote
        .write(StreamWriteParameters::new("pong").finish())
        .await
        .expect("reply");

    assert_eq!(local.read_to_end(64).await.expect("reply read"), b"pong");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_after_fin_is_stream_closed() {
    let (dialer, _acceptor, _listener) = create_connected_pair().await;
    let stream = dialer.create_bidirectional_stream().await.expect("open");
    stream
        .write(StreamWriteParameters::new("last").finish())
        .await
        .expect("write with fin");

    let result = stream.write(StreamWriteParameters::new("more")).await;
    assert!(matches!(result, Err(TransportError::StreamClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_is_observed_with_code() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (local, remote) = open_pair(&dialer, &mut streams, b"partial").await;

    let mut buf = [0u8; 16];
    assert_eq!(remote.read_into(&mut buf).await.expect("read"), ReadOutcome::Data(7));
    local.reset(42).await.expect("reset");

    let outcome = tokio::time::timeout(Duration::from_secs(5), remote.read_into(&mut buf))
        .await
        .expect("reset observed")
        .expect("read");
    assert_eq!(outcome, ReadOutcome::Reset(42));
    assert!(matches!(
        remote.read_to_end(16).await,
        Err(TransportError::StreamReset(42))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_one_stream_leaves_siblings_open() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (first_local, first_remote) = open_pair(&dialer, &mut streams, b"a").await;
    let (second_local, second_remote) = open_pair(&dialer, &mut streams, b"b").await;

    first_local.close().await.expect("close first");
    assert!(matches!(
        first_local.write(StreamWriteParameters::new("x")).await,
        Err(TransportError::StreamClosed)
    ));
    assert_eq!(first_remote.read_to_end(16).await.expect("first drained"), b"a");

    second_local
        .write(StreamWriteParameters::new("c").finish())
        .await
        .expect("sibling still writable");
    assert_eq!(second_remote.read_to_end(16).await.expect("second"), b"bc");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_interrupts_pending_read() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (local, _remote) = open_pair(&dialer, &mut streams, b"x").await;

    let reader = {
        let local = local.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            local.read_into(&mut buf).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    local.close().await.expect("close");

    let result = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("read unblocked")
        .expect("task");
    assert!(matches!(result, Err(TransportError::StreamClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_close_surfaces_as_stream_closed_on_write() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (local, remote) = open_pair(&dialer, &mut streams, b"x").await;
    remote.close().await.expect("peer closes");

    let mut last = Ok(());
    for _ in 0..100 {
        last = local.write(StreamWriteParameters::new(vec![0u8; 1024])).await;
        if last.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(matches!(last, Err(TransportError::StreamClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_read_does_not_stall_other_streams() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (idle_local, _idle_remote) = open_pair(&dialer, &mut streams, b"i").await;
    let (busy_local, busy_remote) = open_pair(&dialer, &mut streams, b"b").await;

    let blocked = {
        let idle_local = idle_local.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            idle_local.read_into(&mut buf).await
        })
    };

    busy_remote
        .write(StreamWriteParameters::new("reply").finish())
        .await
        .expect("write");
    let reply = tokio::time::timeout(Duration::from_secs(2), busy_local.read_to_end(64))
        .await
        .expect("busy stream not stalled")
        .expect("read");
    assert_eq!(reply, b"reply");
    assert!(!blocked.is_finished());
    blocked.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_to_end_enforces_limit() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (local, remote) = open_pair(&dialer, &mut streams, &[7u8; 100]).await;
    local.close_write().await.expect("close write");

    assert!(matches!(
        remote.read_to_end(10).await,
        Err(TransportError::PayloadTooLarge { limit: 10 })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handles_report_identity() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (local, remote) = open_pair(&dialer, &mut streams, b"x").await;

    assert_eq!(local.id(), remote.id());
    assert_eq!(local.transport_id(), dialer.id());
    assert_eq!(remote.transport_id(), acceptor.id());
    assert!(local.is_local());
    assert!(!remote.is_local());
    assert_eq!(dialer.open_stream_count(), 1);
    assert_eq!(acceptor.open_stream_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_handles_return_stream_credit() {
    let server = TransportTuning {
        max_concurrent_bidi_streams: 4,
        ..TransportTuning::default()
    };
    let (dialer, acceptor, _listener) = create_connected_pair_with(server).await;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    acceptor.on_bidirectional_stream(move |stream| {
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let result = stream.read_to_end(16).await;
            drop(stream);
            let _ = done_tx.send(result);
        });
    });

    // Several times the limit: each round only succeeds if the previous
    // streams were released on both sides.
    for round in 0..20 {
        let stream = open_when_credited(&dialer).await;
        stream
            .write(StreamWriteParameters::new("x").finish())
            .await
            .expect("write");
        let received = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("acceptor read the stream")
            .expect("channel open");
        assert_eq!(received.expect("read"), b"x", "round {round}");
        drop(stream);
    }

    assert_eq!(acceptor.open_stream_count(), 0);
    assert_eq!(dialer.open_stream_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_stop_releases_unwritten_send_direction() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let (local, remote) = open_pair(&dialer, &mut streams, b"x").await;
    remote.close().await.expect("peer closes");

    assert_eq!(local.read_to_end(16).await.expect("peer finished"), b"");
    // No write follows, so only the peer's stop request can release the
    // send direction.
    for _ in 0..100 {
        if dialer.open_stream_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(dialer.open_stream_count(), 0);
    assert!(matches!(
        local.write(StreamWriteParameters::new("late")).await,
        Err(TransportError::StreamClosed)
    ));
    let mut buf = [0u8; 4];
    assert_eq!(
        local.read_into(&mut buf).await.expect("read"),
        ReadOutcome::EndOfStream
    );
}
