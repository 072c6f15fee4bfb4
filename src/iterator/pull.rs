// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use futures::Stream;

use super::read::{Pull, ReadSide};
use crate::{
    error::{BoxError, StreamError},
    options::StreamOptions,
    transport::ReadableStream,
};

/// Pull-based view of a server streaming call.
///
/// Items come out of [`next`](Self::next) in the order the server sent them.
/// Once the stream completes or fails, every later call repeats that outcome.
///
/// ```rust,ignore
/// let iterator = PullIterator::new(stream, |update: &SubscribeUpdate| Ok(update.clone()), &options)?;
///
/// while let Some(update) = iterator.next().await? {
///     // Handle the update.
/// }
/// ```
pub struct PullIterator<T> {
    read: ReadSide<T>,
}

impl<T: Send + 'static> PullIterator<T> {
    /// Wraps a readable stream.
    ///
    /// Fails when the stream is no longer readable or the cancellation signal
    /// has already fired.
    pub fn new<Resp, S, D>(stream: Arc<S>, decode: D, options: &StreamOptions) -> Result<Self, StreamError>
    where
        Resp: 'static,
        S: ReadableStream<Resp> + 'static,
        D: Fn(&Resp) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        Ok(Self {
            read: ReadSide::attach(stream, Arc::new(decode), options)?,
        })
    }

    /// Next item, `None` once the stream completed.
    pub async fn next(&self) -> Result<Option<T>, StreamError> {
        match self.read.pull().await {
            Pull::Item(item) => Ok(Some(item)),
            Pull::Done => {
                self.close();
                Ok(None)
            }
            Pull::Failed(error) => self.throw(error).map(|()| None),
        }
    }

    /// Stops consuming: cancels the call, drops buffered items and detaches
    /// from the stream. Calling it again does nothing.
    pub fn close(&self) {
        self.read.close();
    }

    /// Closes the iterator, then hands `error` back to the caller.
    pub fn throw(&self, error: StreamError) -> Result<(), StreamError> {
        self.close();
        Err(error)
    }

    /// Items received but not yet pulled.
    pub fn buffered(&self) -> usize {
        self.read.buffered()
    }

    /// Adapts the iterator into a [`Stream`] that ends after the first error.
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
