// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::{EventKind, Listener, ListenerId, StreamEvent};

struct Registered<Resp> {
    id: ListenerId,
    kind: EventKind,
    listener: Listener<Resp>,
}

struct Inner<Resp> {
    next_id: u64,
    listeners: Vec<Registered<Resp>>,
    queued: VecDeque<StreamEvent<Resp>>,
    flushing: Vec<EventKind>,
}

impl<Resp> Inner<Resp> {
    fn listeners_for(&self, kind: EventKind) -> Vec<Listener<Resp>> {
        self.listeners
            .iter()
            .filter(|registered| registered.kind == kind)
            .map(|registered| registered.listener.clone())
            .collect()
    }

    fn has_queued(&self, kind: EventKind) -> bool {
        self.queued.iter().any(|event| event.kind() == kind)
    }

    fn take_queued(&mut self, kind: EventKind) -> Option<StreamEvent<Resp>> {
        let position = self.queued.iter().position(|event| event.kind() == kind)?;
        self.queued.remove(position)
    }
}

/// Listener registry for transports.
///
/// Events are delivered in emission order. An event with no listener of its
/// kind is held back and delivered, still in order, as soon as one attaches,
/// so nothing a server sends is lost between opening a call and the iterator
/// registering. [`StreamEvent::Drain`] is the exception: it is dropped when
/// nobody waits for it.
///
/// No lock is held while listeners run; they may call back into the emitter.
pub struct EventEmitter<Resp> {
    inner: Mutex<Inner<Resp>>,
}

impl<Resp> Default for EventEmitter<Resp> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                listeners: Vec::new(),
                queued: VecDeque::new(),
                flushing: Vec::new(),
            }),
        }
    }
}

impl<Resp> EventEmitter<Resp> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: EventKind, listener: Listener<Resp>) -> ListenerId {
        let id = {
            let mut inner = self.lock();
            let id = ListenerId(inner.next_id);
            inner.next_id += 1;
            inner.listeners.push(Registered { id, kind, listener });

            if inner.flushing.contains(&kind) || !inner.has_queued(kind) {
                return id;
            }
            inner.flushing.push(kind);
            id
        };

        self.flush(kind);
        id
    }

    pub fn off(&self, id: ListenerId) {
        self.lock().listeners.retain(|registered| registered.id != id);
    }

    pub fn emit(&self, event: StreamEvent<Resp>) {
        let kind = event.kind();
        let targets = {
            let mut inner = self.lock();
            let targets = inner.listeners_for(kind);
            if kind == EventKind::Drain && targets.is_empty() {
                return;
            }
            if targets.is_empty() || inner.flushing.contains(&kind) || inner.has_queued(kind) {
                inner.queued.push_back(event);
                return;
            }
            targets
        };

        for listener in targets {
            listener(&event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock()
            .listeners
            .iter()
            .filter(|registered| registered.kind == kind)
            .count()
    }

    /// Number of events waiting for a listener.
    pub fn queued(&self) -> usize {
        self.lock().queued.len()
    }

    /// Delivers queued events of `kind` one at a time, re-reading the
    /// listeners before each.
    fn flush(&self, kind: EventKind) {
        loop {
            let (event, targets) = {
                let mut inner = self.lock();
                let targets = inner.listeners_for(kind);
                let event = if targets.is_empty() {
                    None
                } else {
                    inner.take_queued(kind)
                };
                let Some(event) = event else {
                    inner.flushing.retain(|flushing| *flushing != kind);
                    return;
                };
                (event, targets)
            };

            for listener in &targets {
                listener(&event);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<Resp>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
