//! `Transport::stop` behaviour: unblocking, flushing and idempotence.
//!
//! Run with: `cargo test --test graceful_shutdown`

use std::time::Duration;

use quicmux::identity::Origin;
use quicmux::{
    Config, ConnectionState, Listener, ReadOutcome, StreamHandle, StreamWriteParameters, Transport,
    TransportError, TransportStopInfo, TransportTuning,
};
use tokio::sync::mpsc;

/// Helper: bind a listener and connect one client, returning (dialer, acceptor, listener).
async fn create_connected_pair() -> (Transport, Transport, Listener) {
    create_connected_pair_with(TransportTuning::default()).await
}

/// Same as [`create_connected_pair`], with `dialer_tuning` applied to the dialer.
async fn create_connected_pair_with(dialer_tuning: TransportTuning) -> (Transport, Transport, Listener) {
    let server_config = Config::self_signed(&Origin::random().expect("origin")).expect("identity");
    let listener = Listener::bind("127.0.0.1:0", &server_config)
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr").to_string();

    let client_config = Config::self_signed(&Origin::random().expect("origin"))
        .expect("identity")
        .with_tuning(dialer_tuning);
    let dial = tokio::spawn(async move { Transport::connect(&addr, &client_config).await });
    let acceptor = listener.accept().await.expect("accept");
    let dialer = dial.await.expect("dial task").expect("connect");
    (dialer, acceptor, listener)
}

fn inbound(transport: &Transport) -> mpsc::UnboundedReceiver<StreamHandle> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.on_bidirectional_stream(move |stream| {
        let _ = tx.send(stream);
    });
    rx
}

fn pending_read(stream: &StreamHandle) -> tokio::task::JoinHandle<Result<ReadOutcome, TransportError>> {
    let stream = stream.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        stream.read_into(&mut buf).await
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_unblocks_every_pending_read() {
    let (dialer, _acceptor, _listener) = create_connected_pair().await;
    let a = dialer.create_bidirectional_stream().await.expect("open a");
    let b = dialer.create_bidirectional_stream().await.expect("open b");
    let readers = [pending_read(&a), pending_read(&b)];
    tokio::time::sleep(Duration::from_millis(50)).await;

    dialer.stop(TransportStopInfo::default()).await.expect("stop");

    for reader in readers {
        let outcome = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("read unblocked")
            .expect("task")
            .expect("read");
        assert_eq!(outcome, ReadOutcome::TransportStopped);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn written_data_survives_stop() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let payload: Vec<u8> = (0..256 * 1024u32).map(|i| (i % 253) as u8).collect();

    let stream = dialer.create_bidirectional_stream().await.expect("open");
    stream
        .write(StreamWriteParameters::new(payload.clone()))
        .await
        .expect("write");
    dialer.stop(TransportStopInfo::default()).await.expect("stop");

    let remote = tokio::time::timeout(Duration::from_secs(5), streams.recv())
        .await
        .expect("stream delivered")
        .expect("channel open");
    let received = remote.read_to_end(payload.len()).await.expect("drain");
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_read_ends_cleanly_when_other_side_stops() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let stream = acceptor.create_bidirectional_stream().await.expect("open");
    let mut streams = inbound(&dialer);
    stream.write(StreamWriteParameters::new("hi")).await.expect("write");
    let remote = streams.recv().await.expect("inbound");
    let mut buf = [0u8; 8];
    assert_eq!(remote.read_into(&mut buf).await.expect("read"), ReadOutcome::Data(2));

    let reader = pending_read(&stream);
    tokio::time::sleep(Duration::from_millis(50)).await;
    dialer.stop(TransportStopInfo::default()).await.expect("stop");

    let outcome = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("peer read completes")
        .expect("task")
        .expect("read");
    assert_eq!(outcome, ReadOutcome::EndOfStream);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_stops_both_succeed() {
    let (dialer, _acceptor, _listener) = create_connected_pair().await;
    let _stream = dialer.create_bidirectional_stream().await.expect("open");

    let (first, second) = tokio::join!(
        dialer.stop(TransportStopInfo::default()),
        dialer.stop(TransportStopInfo {
            error_code: Some(9),
            reason: Some("second".into()),
        }),
    );
    first.expect("first stop");
    second.expect("second stop");
    assert_eq!(dialer.state(), ConnectionState::Stopped);
    assert_eq!(dialer.open_stream_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handles_fail_after_stop() {
    let (dialer, _acceptor, _listener) = create_connected_pair().await;
    let stream = dialer.create_bidirectional_stream().await.expect("open");
    dialer.stop(TransportStopInfo::default()).await.expect("stop");

    assert!(matches!(
        stream.write(StreamWriteParameters::new("late")).await,
        Err(TransportError::TransportStopped)
    ));
    let mut buf = [0u8; 4];
    assert_eq!(
        stream.read_into(&mut buf).await.expect("read"),
        ReadOutcome::TransportStopped
    );
    assert!(matches!(
        dialer.create_bidirectional_stream().await,
        Err(TransportError::NotEstablished)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_outlives_its_transports() {
    let (dialer, acceptor, listener) = create_connected_pair().await;
    dialer.stop(TransportStopInfo::default()).await.expect("stop dialer");
    acceptor.stop(TransportStopInfo::default()).await.expect("stop acceptor");

    let addr = listener.local_addr().expect("addr").to_string();
    let config = Config::self_signed(&Origin::random().expect("origin")).expect("identity");
    let dial = tokio::spawn(async move { Transport::connect(&addr, &config).await });
    let second = listener.accept().await.expect("second accept");
    let dialer = dial.await.expect("task").expect("second connect");
    assert_eq!(second.state(), ConnectionState::Established);
    dialer.stop(TransportStopInfo::default()).await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_cut_short_by_stop_resets_instead_of_truncating() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    let mut streams = inbound(&acceptor);
    let payload = vec![0x5a_u8; 8 * 1024 * 1024];
    let payload_len = payload.len();

    let stream = dialer.create_bidirectional_stream().await.expect("open");
    let remote = tokio::time::timeout(Duration::from_secs(5), streams.recv())
        .await
        .expect("stream delivered")
        .expect("channel open");

    // The peer is not reading yet, so the write stalls on flow control.
    let writer = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(StreamWriteParameters::new(payload)).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished(), "write should still be waiting for credit");

    let stopped = dialer.stop(TransportStopInfo::default()).await;
    assert!(
        matches!(stopped, Err(TransportError::StreamsAborted(1))),
        "expected StreamsAborted(1), got {stopped:?}"
    );
    assert!(matches!(
        writer.await.expect("writer task"),
        Err(TransportError::TransportStopped)
    ));
    assert_eq!(dialer.state(), ConnectionState::Stopped);
    assert_eq!(dialer.open_stream_count(), 0);

    let received = tokio::time::timeout(Duration::from_secs(5), remote.read_to_end(payload_len))
        .await
        .expect("peer read completes");
    assert!(
        matches!(
            received,
            Err(TransportError::StreamReset(_) | TransportError::ConnectionLost(_))
        ),
        "peer must not see a clean end of stream, got {:?}",
        received.map(|data| data.len())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missed_flush_deadline_is_reported_and_still_stops() {
    let tuning = TransportTuning {
        shutdown_timeout: Duration::ZERO,
        ..TransportTuning::default()
    };
    let (dialer, acceptor, _listener) = create_connected_pair_with(tuning).await;
    let mut streams = inbound(&acceptor);

    let stream = dialer.create_bidirectional_stream().await.expect("open");
    let _remote = streams.recv().await.expect("inbound");
    // Fits the peer's window, so it is queued at once but not yet acknowledged.
    stream
        .write(StreamWriteParameters::new(vec![7u8; 512 * 1024]))
        .await
        .expect("write");

    let result = dialer.stop(TransportStopInfo::default()).await;
    assert!(
        matches!(result, Err(TransportError::ShutdownTimeout(timeout)) if timeout == Duration::ZERO),
        "expected ShutdownTimeout, got {result:?}"
    );
    assert_eq!(dialer.state(), ConnectionState::Stopped);
    assert_eq!(dialer.open_stream_count(), 0);
    assert!(matches!(
        dialer.create_bidirectional_stream().await,
        Err(TransportError::NotEstablished)
    ));
    dialer.stop(TransportStopInfo::default()).await.expect("second stop is a no-op");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_error_code_moves_acceptor_to_failed() {
    let (dialer, acceptor, _listener) = create_connected_pair().await;
    dialer
        .stop(TransportStopInfo {
            error_code: Some(42),
            reason: Some("going away".into()),
        })
        .await
        .expect("stop");

    let state = tokio::time::timeout(Duration::from_secs(5), acceptor.closed())
        .await
        .expect("close observed");
    assert_eq!(state, ConnectionState::Failed);
    assert_eq!(acceptor.state(), ConnectionState::Failed);

    acceptor.stop(TransportStopInfo::default()).await.expect("stop after failure");
    assert_eq!(acceptor.state(), ConnectionState::Failed);
}
