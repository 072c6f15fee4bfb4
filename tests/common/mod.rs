// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use feed_stream::{
    transport::{
        DuplexStream, EventEmitter, EventKind, Listener, ListenerId, ReadableStream,
        StreamControl, StreamEvent, WriteAck,
    },
    BoxError,
};
use tonic::{metadata::MetadataMap, Status};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndBehavior {
    Ack,
    Hang,
    Fail,
}

/// Scripted transport: tests push events by hand and inspect the calls the
/// iterators made.
pub struct MockStream {
    emitter: EventEmitter<String>,
    readable: AtomicBool,
    writable: AtomicBool,
    fail_cancel: AtomicBool,
    auto_ack: AtomicBool,
    end_behavior: Mutex<EndBehavior>,
    pending_acks: Mutex<VecDeque<WriteAck>>,
    held_end: Mutex<Option<WriteAck>>,
    pub writes: Mutex<Vec<String>>,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    pub cancels: AtomicUsize,
    pub destroys: AtomicUsize,
    pub ends: AtomicUsize,
}

impl MockStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            emitter: EventEmitter::new(),
            readable: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            fail_cancel: AtomicBool::new(false),
            auto_ack: AtomicBool::new(true),
            end_behavior: Mutex::new(EndBehavior::Ack),
            pending_acks: Mutex::new(VecDeque::new()),
            held_end: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
        })
    }

    pub fn data(&self, message: &str) {
        self.emitter.emit(StreamEvent::Data(message.to_string()));
    }

    pub fn emit(&self, event: StreamEvent<String>) {
        self.emitter.emit(event);
    }

    pub fn error(&self, status: Status) {
        self.emit(StreamEvent::Error(status));
    }

    pub fn metadata(&self) {
        self.emit(StreamEvent::Metadata(MetadataMap::new()));
    }

    pub fn set_readable(&self, readable: bool) {
        self.readable.store(readable, Ordering::SeqCst);
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub fn fail_cancel(&self) {
        self.fail_cancel.store(true, Ordering::SeqCst);
    }

    pub fn manual_acks(&self) {
        self.auto_ack.store(false, Ordering::SeqCst);
    }

    pub fn set_end_behavior(&self, behavior: EndBehavior) {
        *self.end_behavior.lock().unwrap() = behavior;
    }

    /// Acknowledges the oldest write still waiting for one.
    pub fn ack_next(&self, result: Result<(), Status>) {
        let ack = self.pending_acks.lock().unwrap().pop_front();
        ack.expect("no write waiting for an ack")(result);
    }

    pub fn pending_acks(&self) -> usize {
        self.pending_acks.lock().unwrap().len()
    }

    pub fn listeners(&self, kind: EventKind) -> usize {
        self.emitter.listener_count(kind)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl StreamControl for MockStream {
    fn is_readable(&self) -> bool {
        self.readable.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel(&self) -> Result<(), Status> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(Status::internal("cancel failed"));
        }
        self.readable.store(false, Ordering::SeqCst);
        self.writable.store(false, Ordering::SeqCst);
        self.error(Status::cancelled("Cancelled on client"));
        self.emit(StreamEvent::Close);
        Ok(())
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.readable.store(false, Ordering::SeqCst);
        self.writable.store(false, Ordering::SeqCst);
        self.emit(StreamEvent::Close);
    }

    fn off(&self, id: ListenerId) {
        self.emitter.off(id);
    }
}

impl ReadableStream<String> for MockStream {
    fn on(&self, kind: EventKind, listener: Listener<String>) -> ListenerId {
        self.emitter.on(kind, listener)
    }
}

impl DuplexStream<String, String> for MockStream {
    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    fn write(&self, message: String, ack: WriteAck) {
        self.writes.lock().unwrap().push(message);
        if self.auto_ack.load(Ordering::SeqCst) {
            ack(Ok(()));
        } else {
            self.pending_acks.lock().unwrap().push_back(ack);
        }
    }

    fn end(&self, message: Option<String>, ack: WriteAck) -> Result<(), Status> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.end_behavior.lock().unwrap();
        match behavior {
            EndBehavior::Fail => Err(Status::internal("end failed")),
            EndBehavior::Hang => {
                *self.held_end.lock().unwrap() = Some(ack);
                Ok(())
            }
            EndBehavior::Ack => {
                if let Some(message) = message {
                    self.writes.lock().unwrap().push(message);
                }
                self.writable.store(false, Ordering::SeqCst);
                ack(Ok(()));
                Ok(())
            }
        }
    }
}

pub fn identity(message: &String) -> Result<String, BoxError> {
    Ok(message.clone())
}
