// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::{sync::Arc, time::Duration};

use common::{identity, EndBehavior, MockStream};
use feed_stream::{
    transport::{EventKind, StreamEvent},
    DuplexPullIterator, StreamError, StreamOptions,
};
use futures::poll;
use tonic::{Code, Status};

fn open(
    stream: &Arc<MockStream>,
    options: &StreamOptions,
) -> DuplexPullIterator<String, String, String> {
    match DuplexPullIterator::new(stream.clone(), identity, options) {
        Ok(iterator) => iterator,
        Err(error) => panic!("failed to attach: {error}"),
    }
}

#[tokio::test]
async fn write_resolves_on_acknowledgement() {
    let stream = MockStream::new();
    stream.manual_acks();
    let iterator = open(&stream, &StreamOptions::default());

    let mut write = Box::pin(iterator.write("ping".to_string()));
    assert!(poll!(&mut write).is_pending());
    assert_eq!(stream.listeners(EventKind::Error), 2);

    stream.ack_next(Ok(()));
    write.await.unwrap();

    assert_eq!(*stream.writes.lock().unwrap(), vec!["ping"]);
    assert_eq!(stream.listeners(EventKind::Error), 1);
}

#[tokio::test]
async fn rejected_acknowledgement_fails_write() {
    let stream = MockStream::new();
    stream.manual_acks();
    let iterator = open(&stream, &StreamOptions::default());

    let mut write = Box::pin(iterator.write("ping".to_string()));
    assert!(poll!(&mut write).is_pending());
    stream.ack_next(Err(Status::resource_exhausted("slow down")));

    assert!(matches!(
        write.await,
        Err(StreamError::Transport(status)) if status.code() == Code::ResourceExhausted
    ));
}

#[tokio::test]
async fn error_before_acknowledgement_fails_write() {
    let stream = MockStream::new();
    stream.manual_acks();
    let iterator = open(&stream, &StreamOptions::default());

    let mut write = Box::pin(iterator.write("ping".to_string()));
    assert!(poll!(&mut write).is_pending());
    stream.error(Status::unavailable("connection reset"));

    assert!(matches!(
        write.await,
        Err(StreamError::Transport(status)) if status.code() == Code::Unavailable
    ));

    // A late acknowledgement is ignored.
    stream.ack_next(Ok(()));
    assert_eq!(stream.listeners(EventKind::Error), 1);
}

#[tokio::test(start_paused = true)]
async fn waiting_for_writable_times_out() {
    let stream = MockStream::new();
    stream.set_writable(false);
    let iterator = open(
        &stream,
        &StreamOptions::default().with_drain_timeout(Duration::from_millis(50)),
    );

    assert!(matches!(
        iterator.wait_for_writable().await,
        Err(StreamError::WritableTimeout(limit)) if limit == Duration::from_millis(50)
    ));
    assert_eq!(stream.listeners(EventKind::Drain), 0);
}

#[tokio::test]
async fn drain_resolves_wait_for_writable() {
    let stream = MockStream::new();
    stream.set_writable(false);
    let iterator = open(&stream, &StreamOptions::default());

    let mut wait = Box::pin(iterator.wait_for_writable());
    assert!(poll!(&mut wait).is_pending());
    assert_eq!(stream.listeners(EventKind::Drain), 1);

    stream.set_writable(true);
    stream.emit(StreamEvent::Drain);
    wait.await.unwrap();
    assert_eq!(stream.listeners(EventKind::Drain), 0);
}

#[tokio::test]
async fn write_after_drain_requires_writable_stream() {
    let stream = MockStream::new();
    stream.set_writable(false);
    let iterator = open(&stream, &StreamOptions::default());

    let mut write = Box::pin(iterator.write("ping".to_string()));
    assert!(poll!(&mut write).is_pending());
    stream.emit(StreamEvent::Drain);

    assert!(matches!(write.await, Err(StreamError::NotWritable)));
    assert!(stream.writes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn end_sends_final_message() {
    let stream = MockStream::new();
    let iterator = open(&stream, &StreamOptions::default());

    iterator.end(Some("bye".to_string())).await.unwrap();

    assert_eq!(*stream.writes.lock().unwrap(), vec!["bye"]);
    assert_eq!(MockStream::count(&stream.ends), 1);
    assert!(!iterator.is_writable());
}

#[tokio::test(start_paused = true)]
async fn end_without_acknowledgement_times_out() {
    let stream = MockStream::new();
    stream.set_end_behavior(EndBehavior::Hang);
    let iterator = open(
        &stream,
        &StreamOptions::default().with_end_timeout(Duration::from_millis(20)),
    );

    assert!(matches!(
        iterator.end(None).await,
        Err(StreamError::EndTimeout(limit)) if limit == Duration::from_millis(20)
    ));
}

#[tokio::test]
async fn synchronous_end_failure_is_reported() {
    let stream = MockStream::new();
    stream.set_end_behavior(EndBehavior::Fail);
    let iterator = open(&stream, &StreamOptions::default());

    assert!(matches!(
        iterator.end(None).await,
        Err(StreamError::Transport(status)) if status.code() == Code::Internal
    ));
}

#[tokio::test]
async fn close_ends_write_side_first() {
    let stream = MockStream::new();
    let iterator = open(&stream, &StreamOptions::default());

    iterator.close().await.unwrap();

    assert_eq!(MockStream::count(&stream.ends), 1);
    assert_eq!(MockStream::count(&stream.cancels), 1);
    assert_eq!(stream.listeners(EventKind::Data), 0);
}

#[tokio::test]
async fn close_without_auto_end_leaves_write_side_alone() {
    let stream = MockStream::new();
    let iterator = open(&stream, &StreamOptions::default().with_auto_end(false));

    iterator.close().await.unwrap();

    assert_eq!(MockStream::count(&stream.ends), 0);
    assert_eq!(MockStream::count(&stream.cancels), 1);
}

#[tokio::test]
async fn close_releases_read_side_when_end_fails() {
    let stream = MockStream::new();
    stream.set_end_behavior(EndBehavior::Fail);
    let iterator = open(&stream, &StreamOptions::default());

    assert!(iterator.close().await.is_err());
    assert_eq!(MockStream::count(&stream.cancels), 1);
    assert_eq!(iterator.next().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn completion_does_not_wait_for_end() {
    let stream = MockStream::new();
    stream.set_end_behavior(EndBehavior::Hang);
    let iterator = open(&stream, &StreamOptions::default());

    stream.emit(StreamEvent::End);

    assert_eq!(iterator.next().await.unwrap(), None);
    assert_eq!(MockStream::count(&stream.ends), 0);
    assert_eq!(MockStream::count(&stream.cancels), 1);
}

#[tokio::test]
async fn failure_does_not_end_write_side() {
    let stream = MockStream::new();
    stream.set_end_behavior(EndBehavior::Hang);
    let iterator = open(&stream, &StreamOptions::default());

    stream.error(Status::internal("server crashed"));

    assert!(iterator.next().await.is_err());
    assert_eq!(MockStream::count(&stream.ends), 0);
}

#[tokio::test]
async fn request_response_round_trip() {
    let stream = MockStream::new();
    let iterator = open(&stream, &StreamOptions::default());

    iterator.write("ping".to_string()).await.unwrap();
    stream.data("pong");
    iterator.end(None).await.unwrap();
    stream.emit(StreamEvent::Finish);

    assert_eq!(iterator.next().await.unwrap(), Some("pong".to_string()));
    assert_eq!(iterator.next().await.unwrap(), None);
    assert_eq!(*stream.writes.lock().unwrap(), vec!["ping"]);
    assert_eq!(MockStream::count(&stream.ends), 1);
    assert_eq!(MockStream::count(&stream.cancels), 1);
}

#[tokio::test]
async fn transport_error_fails_reads() {
    let stream = MockStream::new();
    let iterator = open(&stream, &StreamOptions::default());

    stream.error(Status::internal("server crashed"));

    assert!(matches!(
        iterator.next().await,
        Err(StreamError::Transport(status)) if status.code() == Code::Internal
    ));
    assert_eq!(MockStream::count(&stream.cancels), 1);
}
