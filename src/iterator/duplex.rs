// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::Stream;
use tokio::{
    sync::{oneshot, Notify},
    time::timeout,
};
use tonic::Status;
use tracing::{debug, warn};

use super::read::{Pull, ReadSide};
use crate::{
    error::{BoxError, StreamError},
    options::StreamOptions,
    transport::{DuplexStream, EventKind, Listener, ListenerGuard, StreamEvent},
};

/// Write half of a bidirectional call.
struct WriteSide<Req, Resp> {
    stream: Arc<dyn DuplexStream<Req, Resp>>,
    end_timeout: Duration,
    drain_timeout: Duration,
    auto_end: bool,
}

impl<Req, Resp: 'static> WriteSide<Req, Resp> {
    async fn write(&self, message: Req) -> Result<(), StreamError> {
        self.wait_for_writable().await?;
        if !self.stream.is_writable() {
            return Err(StreamError::NotWritable);
        }

        let (sender, receiver) = oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(sender)));

        // Errors emitted before the ack fail this write.
        let on_error: Listener<Resp> = {
            let sender = sender.clone();
            Arc::new(move |event: &StreamEvent<Resp>| {
                if let StreamEvent::Error(status) = event {
                    settle(&sender, Err(status.clone()));
                }
            })
        };
        let _error = ListenerGuard::new(
            &*self.stream,
            self.stream.on(EventKind::Error, on_error),
        );

        self.stream
            .write(message, Box::new(move |result| settle(&sender, result)));

        match receiver.await {
            Ok(result) => result.map_err(StreamError::from),
            Err(_) => Err(Status::unavailable("write dropped without acknowledgement").into()),
        }
    }

    async fn wait_for_writable(&self) -> Result<(), StreamError> {
        if self.stream.is_writable() {
            return Ok(());
        }

        let drained = Arc::new(Notify::new());
        let on_drain: Listener<Resp> = {
            let drained = drained.clone();
            Arc::new(move |event: &StreamEvent<Resp>| {
                if matches!(event, StreamEvent::Drain) {
                    drained.notify_one();
                }
            })
        };
        let _drain = ListenerGuard::new(
            &*self.stream,
            self.stream.on(EventKind::Drain, on_drain),
        );

        if self.stream.is_writable() {
            return Ok(());
        }

        debug!(timeout = ?self.drain_timeout, "waiting for stream to drain");
        timeout(self.drain_timeout, drained.notified())
            .await
            .map_err(|_| StreamError::WritableTimeout(self.drain_timeout))
    }

    async fn end(&self, message: Option<Req>) -> Result<(), StreamError> {
        let (sender, receiver) = oneshot::channel();
        self.stream.end(
            message,
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        )?;

        match timeout(self.end_timeout, receiver).await {
            Ok(Ok(result)) => result.map_err(StreamError::from),
            Ok(Err(_)) => Err(Status::unavailable("end dropped without acknowledgement").into()),
            Err(_) => Err(StreamError::EndTimeout(self.end_timeout)),
        }
    }
}

fn settle(
    sender: &Mutex<Option<oneshot::Sender<Result<(), Status>>>>,
    result: Result<(), Status>,
) {
    let sender = sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(result);
    }
}

/// Pull-based view of a bidirectional call that can also send messages.
///
/// Closing ends the write side first (unless `auto_end` is off), so the call
/// is never left half open.
pub struct DuplexPullIterator<Req, Resp, T> {
    read: ReadSide<T>,
    write: WriteSide<Req, Resp>,
}

impl<Req, Resp, T> DuplexPullIterator<Req, Resp, T>
where
    Req: 'static,
    Resp: 'static,
    T: Send + 'static,
{
    pub fn new<S, D>(stream: Arc<S>, decode: D, options: &StreamOptions) -> Result<Self, StreamError>
    where
        S: DuplexStream<Req, Resp> + 'static,
        D: Fn(&Resp) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        let read = ReadSide::attach(stream.clone(), Arc::new(decode), options)?;
        Ok(Self {
            read,
            write: WriteSide {
                stream,
                end_timeout: options.end_timeout,
                drain_timeout: options.drain_timeout,
                auto_end: options.auto_end,
            },
        })
    }

    pub async fn next(&self) -> Result<Option<T>, StreamError> {
        match self.read.pull().await {
            Pull::Item(item) => Ok(Some(item)),
            Pull::Done => {
                // Already logged by close; completion is reported regardless.
                let _ = self.close().await;
                Ok(None)
            }
            Pull::Failed(error) => self.throw(error).await.map(|()| None),
        }
    }

    /// Sends a message once the stream is writable and resolves when the
    /// transport acknowledged it.
    pub async fn write(&self, message: Req) -> Result<(), StreamError> {
        self.write.write(message).await
    }

    pub async fn wait_for_writable(&self) -> Result<(), StreamError> {
        self.write.wait_for_writable().await
    }

    /// Sends an optional final message and half-closes the write side.
    pub async fn end(&self, message: Option<Req>) -> Result<(), StreamError> {
        self.write.end(message).await
    }

    pub fn is_writable(&self) -> bool {
        self.write.stream.is_writable()
    }

    /// Ends the write side when needed, then closes the read side. The read
    /// side is closed even when ending fails; that failure is returned.
    ///
    /// Once the read side has completed or failed, the call is torn down
    /// without ending the write side first.
    pub async fn close(&self) -> Result<(), StreamError> {
        let ended = if self.write.auto_end && self.is_writable() && !self.read.is_settled() {
            self.end(None).await
        } else {
            Ok(())
        };

        if let Err(error) = &ended {
            warn!(%error, "failed to end write side before closing");
        }
        self.read.close();
        ended
    }

    pub async fn throw(&self, error: StreamError) -> Result<(), StreamError> {
        let _ = self.close().await;
        Err(error)
    }

    pub fn buffered(&self) -> usize {
        self.read.buffered()
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<T, StreamError>> {
        futures::stream::unfold(Some(self), |iterator| async move {
            let iterator = iterator?;
            match iterator.next().await {
                Ok(Some(item)) => Some((Ok(item), Some(iterator))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}
