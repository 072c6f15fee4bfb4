// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The push-based stream contract the iterators are built on.
//!
//! A transport reports what happens on a call through [`StreamEvent`]s
//! delivered to registered listeners, and accepts flow control and teardown
//! through [`StreamControl`]. [`GrpcStream`] adapts a tonic call to this
//! contract; [`EventEmitter`] is the listener registry transports embed.

mod emitter;
pub mod grpc;

use std::sync::Arc;

use tonic::{metadata::MetadataMap, Status};

pub use emitter::EventEmitter;
pub use grpc::GrpcStream;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Error,
    End,
    Finish,
    Close,
    Metadata,
    Drain,
}

#[derive(Debug)]
pub enum StreamEvent<Resp> {
    /// A response message from the server.
    Data(Resp),
    Error(Status),
    /// The server finished the response stream.
    End,
    /// The write side finished after `end`.
    Finish,
    /// The call is gone; nothing follows.
    Close,
    /// Initial metadata, the server's acknowledgment of the call.
    Metadata(MetadataMap),
    /// Write pressure cleared.
    Drain,
}

impl<Resp> StreamEvent<Resp> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Error(_) => EventKind::Error,
            Self::End => EventKind::End,
            Self::Finish => EventKind::Finish,
            Self::Close => EventKind::Close,
            Self::Metadata(_) => EventKind::Metadata,
            Self::Drain => EventKind::Drain,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener<Resp> = Arc<dyn Fn(&StreamEvent<Resp>) + Send + Sync>;

/// Completion callback for a write or end, called exactly once.
pub type WriteAck = Box<dyn FnOnce(Result<(), Status>) + Send>;

/// Flow control and teardown of an underlying stream.
///
/// Implementations may emit events synchronously from any of these methods,
/// so callers must not hold locks that their listeners take.
pub trait StreamControl: Send + Sync {
    fn is_readable(&self) -> bool;

    fn pause(&self);

    fn resume(&self);

    /// Graceful cancel. The transport echoes it as an error carrying
    /// [`CANCELLED_DETAIL`](crate::error::CANCELLED_DETAIL).
    fn cancel(&self) -> Result<(), Status>;

    /// Forced teardown, used when `cancel` fails.
    fn destroy(&self);

    fn off(&self, id: ListenerId);
}

pub trait ReadableStream<Resp>: StreamControl {
    fn on(&self, kind: EventKind, listener: Listener<Resp>) -> ListenerId;
}

pub trait DuplexStream<Req, Resp>: ReadableStream<Resp> {
    fn is_writable(&self) -> bool;

    /// Queues a message. `ack` runs once the transport accepted or rejected it.
    fn write(&self, message: Req, ack: WriteAck);

    /// Sends an optional final message and half-closes the write side.
    fn end(&self, message: Option<Req>, ack: WriteAck) -> Result<(), Status>;
}

/// Detaches a listener when dropped.
pub(crate) struct ListenerGuard<'a, C: StreamControl + ?Sized> {
    control: &'a C,
    id: ListenerId,
}

impl<'a, C: StreamControl + ?Sized> ListenerGuard<'a, C> {
    pub(crate) fn new(control: &'a C, id: ListenerId) -> Self {
        Self { control, id }
    }
}

impl<C: StreamControl + ?Sized> Drop for ListenerGuard<'_, C> {
    fn drop(&mut self) {
        self.control.off(self.id);
    }
}
