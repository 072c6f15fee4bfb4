// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cancellation token shared between a caller and the iterators it creates.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tracing::debug;

type AbortListener = Box<dyn FnOnce(Option<String>) + Send>;

/// Handle for a listener registered with [`AbortSignal::on_abort`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbortListenerId(u64);

#[derive(Default)]
struct SignalState {
    aborted: bool,
    reason: Option<String>,
    next_id: u64,
    listeners: Vec<(u64, AbortListener)>,
}

/// Read side of an [`AbortController`].
///
/// Clones observe the same state. Listeners run synchronously, in
/// registration order, on the thread that calls [`AbortController::abort`].
#[derive(Clone, Default)]
pub struct AbortSignal {
    state: Arc<Mutex<SignalState>>,
}

impl AbortSignal {
    /// A signal that is already aborted.
    pub fn aborted(reason: impl Into<String>) -> Self {
        let signal = Self::default();
        signal.trigger(Some(reason.into()));
        signal
    }

    /// A signal that aborts once `after` has elapsed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn timeout(after: Duration) -> Self {
        let signal = Self::default();
        let timer = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            timer.trigger(Some(format!("signal timed out after {after:?}")));
        });
        signal
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    /// Registers a one-shot listener.
    ///
    /// Returns `None` without registering when the signal has already fired.
    pub fn on_abort(
        &self,
        listener: impl FnOnce(Option<String>) + Send + 'static,
    ) -> Option<AbortListenerId> {
        let mut state = self.lock();
        if state.aborted {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, Box::new(listener)));
        Some(AbortListenerId(id))
    }

    pub fn remove_listener(&self, id: AbortListenerId) {
        self.lock().listeners.retain(|(listener, _)| *listener != id.0);
    }

    fn trigger(&self, reason: Option<String>) {
        let listeners = {
            let mut state = self.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.reason = reason.clone();
            std::mem::take(&mut state.listeners)
        };

        debug!(listeners = listeners.len(), ?reason, "abort signal fired");
        for (_, listener) in listeners {
            listener(reason.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("AbortSignal")
            .field("aborted", &state.aborted)
            .field("reason", &state.reason)
            .finish()
    }
}

/// Owner side of an [`AbortSignal`].
#[derive(Debug, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fires the signal. Only the first call has any effect.
    pub fn abort(&self, reason: impl Into<String>) {
        self.signal.trigger(Some(reason.into()));
    }
}
