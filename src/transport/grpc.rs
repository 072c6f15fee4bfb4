// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Adapts tonic streaming calls to the push-based stream contract.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{Stream, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Response, Status};
use tracing::{debug, error, trace};

use super::{
    DuplexStream, EventEmitter, EventKind, Listener, ListenerId, ReadableStream, StreamControl,
    StreamEvent, WriteAck,
};

const CANCELLED_ON_CLIENT: &str = "Cancelled on client";

#[derive(Default)]
struct CallState {
    /// Set once the terminal events were emitted.
    finished: bool,
    /// A drain watcher is already waiting for channel capacity.
    draining: bool,
}

/// A tonic call driven by a background task that re-emits everything it
/// receives as [`StreamEvent`]s.
///
/// The task first awaits the call itself and emits the response headers as
/// [`StreamEvent::Metadata`], then forwards every message as
/// [`StreamEvent::Data`] until the server ends the stream or fails it.
/// Pausing stops the task from polling the response stream, which lets
/// HTTP/2 flow control push back on the server.
///
/// Requests of a bidirectional call travel through a bounded channel; the
/// stream is writable while that channel has capacity.
pub struct GrpcStream<Resp, Req = ()> {
    emitter: Arc<EventEmitter<Resp>>,
    state: Arc<Mutex<CallState>>,
    paused: watch::Sender<bool>,
    requests: Mutex<Option<mpsc::Sender<Req>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<Resp> GrpcStream<Resp>
where
    Resp: Send + 'static,
{
    /// Drives a server streaming call, e.g. `client.subscribe_to_slot_status(request)`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn server_streaming<Call, Messages>(call: Call) -> Arc<Self>
    where
        Call: Future<Output = Result<Response<Messages>, Status>> + Send + 'static,
        Messages: Stream<Item = Result<Resp, Status>> + Send + Unpin + 'static,
    {
        Self::spawn(call, None)
    }
}

impl<Resp, Req> GrpcStream<Resp, Req>
where
    Resp: Send + 'static,
    Req: Send + 'static,
{
    /// Drives a bidirectional call. `call` receives the request stream to hand
    /// to the generated client method, e.g. `|requests| client.subscribe(requests)`.
    ///
    /// At most `buffer` requests are queued before the stream stops being
    /// writable. Must be called from within a tokio runtime.
    pub fn bidirectional<F, Call, Messages>(buffer: usize, call: F) -> Arc<Self>
    where
        F: FnOnce(ReceiverStream<Req>) -> Call,
        Call: Future<Output = Result<Response<Messages>, Status>> + Send + 'static,
        Messages: Stream<Item = Result<Resp, Status>> + Send + Unpin + 'static,
    {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        Self::spawn(call(ReceiverStream::new(receiver)), Some(sender))
    }

    fn spawn<Call, Messages>(call: Call, requests: Option<mpsc::Sender<Req>>) -> Arc<Self>
    where
        Call: Future<Output = Result<Response<Messages>, Status>> + Send + 'static,
        Messages: Stream<Item = Result<Resp, Status>> + Send + Unpin + 'static,
    {
        let emitter = Arc::new(EventEmitter::new());
        let state = Arc::new(Mutex::new(CallState::default()));
        let (paused, paused_rx) = watch::channel(false);

        let task = tokio::spawn(pump(call, emitter.clone(), state.clone(), paused_rx));

        Arc::new(Self {
            emitter,
            state,
            paused,
            requests: Mutex::new(requests),
            task: Mutex::new(Some(task)),
        })
    }

    fn abort_task(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        lock(&self.requests).take();
    }

    fn request_sender(&self) -> Option<mpsc::Sender<Req>> {
        lock(&self.requests).clone()
    }

    /// Emits [`StreamEvent::Drain`] once the request channel has room again.
    fn watch_drain(&self, sender: mpsc::Sender<Req>) {
        {
            let mut state = lock(&self.state);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        let emitter = self.emitter.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let reserved = sender.reserve().await.is_ok();
            lock(&state).draining = false;
            if reserved {
                trace!("request channel drained");
                emitter.emit(StreamEvent::Drain);
            }
        });
    }
}

async fn pump<Resp, Call, Messages>(
    call: Call,
    emitter: Arc<EventEmitter<Resp>>,
    state: Arc<Mutex<CallState>>,
    mut paused: watch::Receiver<bool>,
) where
    Call: Future<Output = Result<Response<Messages>, Status>>,
    Messages: Stream<Item = Result<Resp, Status>> + Unpin,
{
    let mut messages = match call.await {
        Ok(response) => {
            let (metadata, messages, _) = response.into_parts();
            emitter.emit(StreamEvent::Metadata(metadata));
            messages
        }
        Err(status) => {
            error!("Failed to open stream: {:?}", status);
            return finish(&emitter, &state, Some(status));
        }
    };

    let mut received: u64 = 0;
    loop {
        if paused.wait_for(|paused| !*paused).await.is_err() {
            return;
        }

        match messages.next().await {
            Some(Ok(message)) => {
                received += 1;
                if received % 100 == 0 {
                    trace!("Messages received: {}", received);
                }
                if lock(&state).finished {
                    return;
                }
                emitter.emit(StreamEvent::Data(message));
            }
            Some(Err(status)) => {
                error!("Stream failed: {:?}", status);
                return finish(&emitter, &state, Some(status));
            }
            None => {
                debug!(received, "stream ended by server");
                if !lock(&state).finished {
                    emitter.emit(StreamEvent::End);
                }
                return finish(&emitter, &state, None);
            }
        }
    }
}

/// Emits the terminal events of a call exactly once.
fn finish<Resp>(emitter: &EventEmitter<Resp>, state: &Mutex<CallState>, status: Option<Status>) {
    {
        let mut state = lock(state);
        if state.finished {
            return;
        }
        state.finished = true;
    }

    if let Some(status) = status {
        emitter.emit(StreamEvent::Error(status));
    }
    emitter.emit(StreamEvent::Close);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<Resp, Req> StreamControl for GrpcStream<Resp, Req>
where
    Resp: Send + 'static,
    Req: Send + 'static,
{
    /// Readable until the call finished and every event it produced was
    /// delivered to a listener.
    fn is_readable(&self) -> bool {
        !lock(&self.state).finished || self.emitter.queued() > 0
    }

    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }

    fn cancel(&self) -> Result<(), Status> {
        self.abort_task();
        finish(
            &self.emitter,
            &self.state,
            Some(Status::cancelled(CANCELLED_ON_CLIENT)),
        );
        Ok(())
    }

    fn destroy(&self) {
        self.abort_task();
        finish(&self.emitter, &self.state, None);
    }

    fn off(&self, id: ListenerId) {
        self.emitter.off(id);
    }
}

impl<Resp, Req> ReadableStream<Resp> for GrpcStream<Resp, Req>
where
    Resp: Send + 'static,
    Req: Send + 'static,
{
    fn on(&self, kind: EventKind, listener: Listener<Resp>) -> ListenerId {
        self.emitter.on(kind, listener)
    }
}

impl<Resp, Req> DuplexStream<Req, Resp> for GrpcStream<Resp, Req>
where
    Resp: Send + 'static,
    Req: Send + 'static,
{
    fn is_writable(&self) -> bool {
        self.request_sender()
            .is_some_and(|sender| !sender.is_closed() && sender.capacity() > 0)
    }

    fn write(&self, message: Req, ack: WriteAck) {
        let Some(sender) = self.request_sender() else {
            return ack(Err(Status::failed_precondition("write after end")));
        };

        match sender.try_send(message) {
            Ok(()) => {
                ack(Ok(()));
                if sender.capacity() == 0 {
                    self.watch_drain(sender);
                }
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                let emitter = self.emitter.clone();
                tokio::spawn(async move {
                    match sender.send(message).await {
                        Ok(()) => {
                            ack(Ok(()));
                            emitter.emit(StreamEvent::Drain);
                        }
                        Err(_) => ack(Err(Status::unavailable("request stream closed"))),
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                ack(Err(Status::unavailable("request stream closed")))
            }
        }
    }

    fn end(&self, message: Option<Req>, ack: WriteAck) -> Result<(), Status> {
        let Some(sender) = lock(&self.requests).take() else {
            return Err(Status::failed_precondition("stream already ended"));
        };

        let emitter = self.emitter.clone();
        tokio::spawn(async move {
            let sent = match message {
                Some(message) => sender
                    .send(message)
                    .await
                    .map_err(|_| Status::unavailable("request stream closed")),
                None => Ok(()),
            };
            // Dropping the sender completes the request stream.
            drop(sender);
            ack(sent);
            emitter.emit(StreamEvent::Finish);
        });
        Ok(())
    }
}

impl<Resp, Req> Drop for GrpcStream<Resp, Req> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}
