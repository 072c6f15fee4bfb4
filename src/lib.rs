// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

//! # Feed Stream
//!
//! Pull-based, backpressured iterators over gRPC event feeds such as
//! Yellowstone Geyser, Jetstream or ThorStreamer.
//!
//! Streaming calls push messages at their own pace. This crate turns them
//! into sequences the consumer pulls from, with a bounded buffer that pauses
//! the call when the consumer falls behind, cooperative cancellation through
//! an [`AbortSignal`], and a handshake that waits for the server to accept a
//! subscription before handing out an iterator.
//!
//! ## Subscribing to a server stream
//!
//! ```rust,ignore
//! use feed_stream::{subscribe, GrpcStream, StreamOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = EventPublisherClient::connect("http://localhost:50051").await?;
//!     let slots = subscribe(
//!         move || async move {
//!             Ok(GrpcStream::server_streaming(async move {
//!                 client.subscribe_to_slot_status(Empty {}).await
//!             }))
//!         },
//!         |response: &StreamResponse| Ok(SlotStatus::decode(response.data.as_slice())?),
//!         StreamOptions::from_env()?,
//!     )
//!     .await?;
//!
//!     while let Some(slot) = slots.next().await? {
//!         // Do something with the slot update.
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Bidirectional subscriptions
//!
//! ```rust,ignore
//! use feed_stream::{subscribe_duplex, GrpcStream, StreamOptions};
//!
//! let updates = subscribe_duplex(
//!     move || async move {
//!         Ok(GrpcStream::bidirectional(64, |requests| async move {
//!             client.subscribe(requests).await
//!         }))
//!     },
//!     |update: &SubscribeUpdate| Ok(update.clone()),
//!     StreamOptions::default(),
//! )
//! .await?;
//!
//! updates.write(SubscribeRequest { slots, ..Default::default() }).await?;
//! while let Some(update) = updates.next().await? {
//!     // Do something with the update.
//! }
//! updates.close().await?;
//! ```

mod abort;
mod error;
mod handshake;
mod iterator;
mod options;
pub mod transport;

pub use crate::abort::{AbortController, AbortListenerId, AbortSignal};
pub use crate::error::{
    is_self_cancellation, BoxError, ConfigError, StreamError, CANCELLED_DETAIL,
};
pub use crate::handshake::{subscribe, subscribe_duplex};
pub use crate::iterator::{DuplexPullIterator, PullIterator};
pub use crate::options::{
    StreamOptions, DEFAULT_DRAIN_TIMEOUT, DEFAULT_END_TIMEOUT, DEFAULT_MAX_QUEUE_SIZE,
    DEFAULT_METADATA_TIMEOUT,
};
pub use crate::transport::GrpcStream;
