// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Opening a subscription and waiting for the server to accept it.
//!
//! Some feeds only confirm a subscription by sending initial metadata. The
//! functions here open the call, wait for that acknowledgment and only then
//! hand out an iterator. Anything the server sends in the meantime stays
//! queued on the transport until the iterator attaches.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{sync::oneshot, time::timeout};
use tonic::metadata::MetadataMap;
use tracing::debug;

use crate::{
    error::{BoxError, StreamError},
    iterator::{DuplexPullIterator, PullIterator},
    options::StreamOptions,
    transport::{
        DuplexStream, EventKind, Listener, ListenerId, ReadableStream, StreamControl, StreamEvent,
    },
};

type Acknowledgment = oneshot::Sender<Result<MetadataMap, StreamError>>;

/// Opens a server streaming call and returns an iterator once the server
/// acknowledged it.
///
/// ```rust,ignore
/// let transactions = subscribe(
///     || async { Ok(GrpcStream::server_streaming(client.subscribe_to_transactions(Empty {}))) },
///     |response: &StreamResponse| Ok(Transaction::decode(response.data.as_slice())?),
///     StreamOptions::default(),
/// )
/// .await?;
/// ```
pub async fn subscribe<Resp, T, S, F, Fut, D>(
    open: F,
    decode: D,
    options: StreamOptions,
) -> Result<PullIterator<T>, StreamError>
where
    Resp: 'static,
    T: Send + 'static,
    S: ReadableStream<Resp> + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<S>, StreamError>>,
    D: Fn(&Resp) -> Result<T, BoxError> + Send + Sync + 'static,
{
    let stream = open().await?;
    acknowledged::<Resp, S>(&stream, &options).await?;
    PullIterator::new(stream, decode, &options)
}

/// Bidirectional counterpart of [`subscribe`].
pub async fn subscribe_duplex<Req, Resp, T, S, F, Fut, D>(
    open: F,
    decode: D,
    options: StreamOptions,
) -> Result<DuplexPullIterator<Req, Resp, T>, StreamError>
where
    Req: 'static,
    Resp: 'static,
    T: Send + 'static,
    S: DuplexStream<Req, Resp> + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<S>, StreamError>>,
    D: Fn(&Resp) -> Result<T, BoxError> + Send + Sync + 'static,
{
    let stream = open().await?;
    acknowledged::<Resp, S>(&stream, &options).await?;
    DuplexPullIterator::new(stream, decode, &options)
}

struct Pending {
    sender: Option<Acknowledgment>,
    listeners: Vec<ListenerId>,
}

/// Waits for initial metadata, an error, the abort signal or the timeout,
/// whichever comes first.
///
/// The first of these detaches the handshake listeners on the spot, so an
/// event sent right behind the metadata stays queued for the iterator.
async fn acknowledged<Resp, S>(
    stream: &Arc<S>,
    options: &StreamOptions,
) -> Result<MetadataMap, StreamError>
where
    Resp: 'static,
    S: ReadableStream<Resp> + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let pending = Arc::new(Mutex::new(Pending {
        sender: Some(sender),
        listeners: Vec::new(),
    }));
    let weak = Arc::downgrade(stream);

    let abort = options.signal.as_ref().and_then(|signal| {
        let (target, control) = (pending.clone(), weak.clone());
        let id = signal.on_abort(move |reason| {
            settle(&target, &control, Err(StreamError::Aborted { reason }))
        });
        if id.is_none() {
            let reason = signal.reason();
            settle(&pending, &weak, Err(StreamError::Aborted { reason }));
        }
        id.map(|id| (signal, id))
    });

    let listener: Listener<Resp> = {
        let (target, control) = (pending.clone(), weak.clone());
        Arc::new(move |event: &StreamEvent<Resp>| match event {
            StreamEvent::Metadata(metadata) => settle(&target, &control, Ok(metadata.clone())),
            StreamEvent::Error(status) => settle(&target, &control, Err(status.clone().into())),
            _ => {}
        })
    };
    for kind in [EventKind::Metadata, EventKind::Error] {
        if lock(&pending).sender.is_none() {
            break;
        }
        let id = stream.on(kind, listener.clone());
        track(&pending, &**stream, id);
    }

    let outcome = wait(receiver, options.metadata_timeout).await;

    detach(&pending, &**stream);
    if let Some((signal, id)) = abort {
        signal.remove_listener(id);
    }

    match &outcome {
        Ok(metadata) => debug!(entries = metadata.len(), "subscription acknowledged"),
        Err(error @ (StreamError::HandshakeTimeout(_) | StreamError::Aborted { .. })) => {
            debug!(%error, "subscription not acknowledged, cancelling");
            if stream.cancel().is_err() {
                stream.destroy();
            }
        }
        Err(_) => {}
    }
    outcome
}

async fn wait(
    receiver: oneshot::Receiver<Result<MetadataMap, StreamError>>,
    limit: Duration,
) -> Result<MetadataMap, StreamError> {
    match timeout(limit, receiver).await {
        Ok(Ok(outcome)) => outcome,
        // The sender lives until `detach`, which runs after this returns.
        Ok(Err(_)) | Err(_) => Err(StreamError::HandshakeTimeout(limit)),
    }
}

/// Resolves the handshake once and detaches its stream listeners.
fn settle<S: StreamControl>(
    pending: &Mutex<Pending>,
    stream: &Weak<S>,
    outcome: Result<MetadataMap, StreamError>,
) {
    let (sender, listeners) = {
        let mut pending = lock(pending);
        (pending.sender.take(), std::mem::take(&mut pending.listeners))
    };
    if let Some(stream) = stream.upgrade() {
        for id in listeners {
            stream.off(id);
        }
    }
    if let Some(sender) = sender {
        let _ = sender.send(outcome);
    }
}

/// Keeps a listener id for later removal, or removes it right away when the
/// handshake settled while the listener was being attached.
fn track<S: StreamControl>(pending: &Mutex<Pending>, stream: &S, id: ListenerId) {
    let settled = {
        let mut pending = lock(pending);
        if pending.sender.is_none() {
            true
        } else {
            pending.listeners.push(id);
            false
        }
    };
    if settled {
        stream.off(id);
    }
}

fn detach<S: StreamControl>(pending: &Mutex<Pending>, stream: &S) {
    let listeners = {
        let mut pending = lock(pending);
        pending.sender = None;
        std::mem::take(&mut pending.listeners)
    };
    for id in listeners {
        stream.off(id);
    }
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
