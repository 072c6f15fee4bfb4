// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Read side shared by both iterator kinds.
//!
//! Producer events and consumer pulls meet in [`Shared`]: a bounded buffer,
//! a FIFO of suspended pulls and a one-way terminal state. Items go straight
//! to the oldest waiting pull when there is one and into the buffer
//! otherwise, so emission order is kept across that boundary.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::{
    abort::{AbortListenerId, AbortSignal},
    error::{is_self_cancellation, BoxError, StreamError},
    options::StreamOptions,
    transport::{EventKind, Listener, ListenerId, ReadableStream, StreamControl, StreamEvent},
};

/// Decodes one response message into the item handed to the consumer.
pub(crate) type Decoder<Resp, T> = Arc<dyn Fn(&Resp) -> Result<T, BoxError> + Send + Sync>;

const READ_EVENTS: [EventKind; 5] = [
    EventKind::Data,
    EventKind::Error,
    EventKind::End,
    EventKind::Finish,
    EventKind::Close,
];

/// Outcome of one pull before the owning iterator finalizes.
pub(crate) enum Pull<T> {
    Item(T),
    Done,
    Failed(StreamError),
}

enum Terminal {
    Open,
    Errored(StreamError),
    Closed,
}

struct ReadState<T> {
    terminal: Terminal,
    buffer: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<Pull<T>>>,
    paused: bool,
    released: bool,
    listeners: Vec<ListenerId>,
    abort: Option<(AbortSignal, AbortListenerId)>,
}

impl<T> ReadState<T> {
    fn terminal_pull(&self) -> Pull<T> {
        match &self.terminal {
            Terminal::Errored(error) => Pull::Failed(error.clone()),
            _ => Pull::Done,
        }
    }
}

struct Shared<T> {
    state: Mutex<ReadState<T>>,
    capacity: usize,
    control: Weak<dyn StreamControl>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, ReadState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_data(&self, decoded: Result<T, BoxError>) {
        let mut item = match decoded {
            Ok(item) => item,
            Err(error) => {
                warn!(%error, "failed to decode stream message");
                return self.settle(Terminal::Errored(StreamError::decode(error)));
            }
        };

        let pause = {
            let mut state = self.lock();
            if !matches!(state.terminal, Terminal::Open) {
                return;
            }

            // A waiter whose pull was dropped hands the item back.
            while let Some(waiter) = state.waiters.pop_front() {
                match waiter.send(Pull::Item(item)) {
                    Ok(()) => return,
                    Err(Pull::Item(returned)) => item = returned,
                    Err(_) => return,
                }
            }

            state.buffer.push_back(item);
            trace!(buffered = state.buffer.len(), "buffered stream item");
            if state.buffer.len() >= self.capacity && !state.paused {
                state.paused = true;
                true
            } else {
                false
            }
        };

        if pause {
            debug!(capacity = self.capacity, "buffer full, pausing stream");
            if let Some(control) = self.control.upgrade() {
                control.pause();
            }
        }
    }

    fn on_error(&self, status: &tonic::Status) {
        if is_self_cancellation(status) {
            debug!(message = status.message(), "stream cancelled by client");
            self.settle(Terminal::Closed);
        } else {
            self.settle(Terminal::Errored(StreamError::Transport(status.clone())));
        }
    }

    fn on_end(&self) {
        self.settle(Terminal::Closed);
        self.release();
    }

    fn on_abort(&self, reason: Option<String>) {
        self.settle(Terminal::Errored(StreamError::Aborted { reason }));
    }

    /// Moves to a terminal state and wakes every waiting pull with it. Only
    /// the first terminal signal counts.
    fn settle(&self, terminal: Terminal) {
        let (waiters, first) = {
            let mut state = self.lock();
            if !matches!(state.terminal, Terminal::Open) {
                return;
            }
            state.terminal = terminal;
            let waiters = std::mem::take(&mut state.waiters);
            (waiters, state.terminal_pull())
        };

        let mut outcome = Some(first);
        for waiter in waiters {
            let pull = outcome.take().unwrap_or_else(|| self.lock().terminal_pull());
            let _ = waiter.send(pull);
        }
    }

    /// Records a listener id, or reports that the read side was already
    /// released while listeners were still being attached.
    fn track(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        if state.released {
            return false;
        }
        state.listeners.push(id);
        true
    }

    /// Cancels the transport and detaches every listener, at most once.
    fn release(&self) {
        let (listeners, abort) = {
            let mut state = self.lock();
            if state.released {
                return;
            }
            state.released = true;
            (std::mem::take(&mut state.listeners), state.abort.take())
        };

        if let Some((signal, id)) = abort {
            signal.remove_listener(id);
        }

        let Some(control) = self.control.upgrade() else {
            return;
        };
        if let Err(status) = control.cancel() {
            debug!(%status, "cancel failed, destroying stream");
            control.destroy();
        }
        for id in listeners {
            control.off(id);
        }
        debug!("stream released");
    }
}

pub(crate) struct ReadSide<T> {
    shared: Arc<Shared<T>>,
    control: Arc<dyn StreamControl>,
    signal: Option<AbortSignal>,
}

impl<T: Send + 'static> ReadSide<T> {
    pub(crate) fn attach<Resp, S>(
        stream: Arc<S>,
        decode: Decoder<Resp, T>,
        options: &StreamOptions,
    ) -> Result<Self, StreamError>
    where
        Resp: 'static,
        S: ReadableStream<Resp> + 'static,
    {
        if !stream.is_readable() {
            return Err(StreamError::NotReadable);
        }
        if let Some(signal) = options.signal.as_ref().filter(|signal| signal.is_aborted()) {
            return Err(aborted(signal));
        }

        let control: Arc<dyn StreamControl> = stream.clone();
        let shared = Arc::new(Shared {
            state: Mutex::new(ReadState {
                terminal: Terminal::Open,
                buffer: VecDeque::new(),
                waiters: VecDeque::new(),
                paused: false,
                released: false,
                listeners: Vec::new(),
                abort: None,
            }),
            capacity: options.capacity(),
            control: Arc::downgrade(&control),
        });

        if let Some(signal) = &options.signal {
            let target = shared.clone();
            if let Some(id) = signal.on_abort(move |reason| target.on_abort(reason)) {
                shared.lock().abort = Some((signal.clone(), id));
            }
        }

        let target = shared.clone();
        let listener: Listener<Resp> = Arc::new(move |event: &StreamEvent<Resp>| match event {
            StreamEvent::Data(message) => target.on_data(decode(message)),
            StreamEvent::Error(status) => target.on_error(status),
            StreamEvent::End | StreamEvent::Finish => target.on_end(),
            StreamEvent::Close => target.settle(Terminal::Closed),
            StreamEvent::Metadata(_) | StreamEvent::Drain => {}
        });
        for kind in READ_EVENTS {
            let id = stream.on(kind, listener.clone());
            if !shared.track(id) {
                stream.off(id);
            }
        }

        Ok(Self {
            shared,
            control,
            signal: options.signal.clone(),
        })
    }

    pub(crate) async fn pull(&self) -> Pull<T> {
        if let Some(signal) = self.signal.as_ref().filter(|signal| signal.is_aborted()) {
            return Pull::Failed(aborted(signal));
        }

        let receiver = {
            let mut state = self.shared.lock();
            if let Terminal::Errored(error) = &state.terminal {
                return Pull::Failed(error.clone());
            }

            if let Some(item) = state.buffer.pop_front() {
                let resume = state.paused && state.buffer.len() < self.shared.capacity;
                if resume {
                    state.paused = false;
                }
                drop(state);

                if resume {
                    debug!("buffer below capacity, resuming stream");
                    self.control.resume();
                }
                return Pull::Item(item);
            }

            if matches!(state.terminal, Terminal::Closed) || !self.control.is_readable() {
                return Pull::Done;
            }

            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        // Waiters dropped by teardown count as completion.
        receiver.await.unwrap_or(Pull::Done)
    }

    /// Consumer-side teardown: the read side completes, buffered items and
    /// waiting pulls are discarded and the transport is released.
    pub(crate) fn close(&self) {
        let waiters = {
            let mut state = self.shared.lock();
            if matches!(state.terminal, Terminal::Open) {
                state.terminal = Terminal::Closed;
            }
            state.buffer.clear();
            std::mem::take(&mut state.waiters)
        };
        drop(waiters);

        self.shared.release();
    }

    /// The read side completed, failed or was closed.
    pub(crate) fn is_settled(&self) -> bool {
        !matches!(self.shared.lock().terminal, Terminal::Open)
    }

    pub(crate) fn buffered(&self) -> usize {
        self.shared.lock().buffer.len()
    }
}

impl<T> Drop for ReadSide<T> {
    fn drop(&mut self) {
        self.shared.release();
    }
}

fn aborted(signal: &AbortSignal) -> StreamError {
    StreamError::Aborted {
        reason: signal.reason(),
    }
}
