//! End-to-end tests of `ClientStream` over the in-process loopback channel.
//!
//! The loopback worker resolves requests on its own thread, so these tests
//! cover the cross-thread paths: out-of-order completion, blocking reads
//! woken by callbacks, and shutdown of a blocked reader.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=pullstream=trace cargo test --test stream_loopback -- --nocapture
//! ```

use std::io::{self, Read, Write};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use pullstream::channel::loopback::{LoopbackChannel, Reply};
use pullstream::{ClientStream, Failure, State, StreamConfig, Timeout};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        pullstream::init_tracing();
    });
}

fn config(write_buffer_size: usize) -> StreamConfig {
    StreamConfig {
        write_buffer_size,
        read_timeout: Timeout::Duration(Duration::from_secs(10)),
    }
}

#[test]
fn echo_round_trip() {
    init_test_tracing();

    let mut stream = ClientStream::connect(config(4), LoopbackChannel::echo).unwrap();
    stream.write_all(b"hello world!").unwrap();

    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello world!");

    let stats = stream.stats();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.received, 3);
    assert_eq!(stats.failed, 0);
}

#[test]
fn order_survives_reversed_completion() {
    init_test_tracing();

    // Each request resolves sooner than the one before it.
    let mut remaining = 10u64;
    let mut stream = ClientStream::connect(config(1), |responder| {
        LoopbackChannel::spawn(responder, move |payload| {
            remaining = remaining.saturating_sub(1);
            Reply::data(payload.clone()).after(Duration::from_millis(remaining * 15))
        })
    })
    .unwrap();

    stream.write_all(b"0123456789").unwrap();

    let mut buf = [0u8; 10];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"0123456789");
}

#[test]
fn split_halves_across_threads_with_random_delays() {
    init_test_tracing();

    let stream = ClientStream::connect(config(7), |responder| {
        LoopbackChannel::spawn(responder, |payload| {
            let delay = rand::random_range(0..5u64);
            Reply::data(payload.clone()).after(Duration::from_millis(delay))
        })
    })
    .unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let input: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let expected = input.clone();

    let producer = thread::spawn(move || -> io::Result<()> {
        for chunk in input.chunks(33) {
            writer.write_all(chunk)?;
        }
        writer.close()
    });

    let mut output = vec![0u8; expected.len()];
    reader.read_exact(&mut output).unwrap();
    producer.join().unwrap().unwrap();

    assert_eq!(output, expected);
}

#[test]
fn failed_requests_are_skipped() {
    init_test_tracing();

    let mut stream = ClientStream::connect(config(1), |responder| {
        LoopbackChannel::spawn(responder, |payload| {
            if payload.as_ref() == b"x" {
                Reply::fail(Failure::TimedOut)
            } else {
                Reply::data(payload.clone())
            }
        })
    })
    .unwrap();

    stream.write_all(b"axbxxc").unwrap();

    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"abc");
    assert_eq!(stream.stats().failed, 3);
}

#[test]
fn read_times_out_while_request_pending() {
    init_test_tracing();

    let mut stream = ClientStream::connect(config(8), |responder| {
        LoopbackChannel::spawn(responder, |payload| {
            Reply::data(payload.clone()).after(Duration::from_secs(60))
        })
    })
    .unwrap();
    stream
        .reader()
        .set_read_timeout(Timeout::Duration(Duration::from_millis(50)));

    let started = Instant::now();
    let mut buf = [0u8; 4];
    let err = stream.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(50));

    // The solicitation stays outstanding.
    assert_eq!(stream.stats().pending, 1);
}

#[test]
fn shutdown_unblocks_reader() {
    init_test_tracing();

    let stream = ClientStream::connect(StreamConfig::default(), |responder| {
        LoopbackChannel::spawn(responder, |payload| {
            Reply::data(payload.clone()).after(Duration::from_secs(60))
        })
    })
    .unwrap();
    let (mut reader, mut writer) = stream.into_split();
    let shutdown = reader.shutdown_handle();

    let blocked = thread::spawn(move || {
        let mut buf = [0u8; 16];
        reader.read(&mut buf)
    });

    thread::sleep(Duration::from_millis(50));
    assert!(shutdown.shutdown());
    assert_eq!(blocked.join().unwrap().unwrap(), 0);

    let err = writer.flush().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
}

#[test]
fn late_responses_after_close_are_discarded() {
    init_test_tracing();

    let mut stream = ClientStream::connect(config(2), |responder| {
        LoopbackChannel::spawn(responder, |payload| {
            Reply::data(payload.clone()).after(Duration::from_millis(30))
        })
    })
    .unwrap();
    stream.write_all(b"ok").unwrap();
    stream.close().unwrap();

    let stats = stream.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.failed, 1);

    // Let the delayed echo arrive after the close.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(stream.stats().unmatched, 1);

    let mut buf = [0u8; 2];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn responder_outlives_stream() {
    init_test_tracing();

    let stream = ClientStream::connect(StreamConfig::default(), LoopbackChannel::echo).unwrap();
    let responder = stream.responder();
    drop(stream);

    let token = pullstream::Token::generate();
    assert!(!responder.complete(&token, Bytes::from_static(b"orphan")));
}

#[test]
fn direct_send_resolves_in_order_with_writes() {
    init_test_tracing();

    let mut stream = ClientStream::connect(config(4), LoopbackChannel::echo).unwrap();
    stream.write_all(b"abcd").unwrap();
    let submitted = stream.send(Bytes::from_static(b"ef")).unwrap();

    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"abcdef");
    assert_eq!(stream.state_of(submitted.seq), Some(State::Consumed));
}
