// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{error::Error, sync::Arc, time::Duration};

use thiserror::Error;
use tonic::Status;

/// Boxed error returned by decode functions.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Detail text the transport reports when a call was cancelled by this client.
pub const CANCELLED_DETAIL: &str = "Cancelled";

/// Errors surfaced by stream iterators and the subscription handshake.
///
/// Terminal errors are stored and handed out again on every later pull, so the
/// type is cheap to clone.
#[derive(Clone, Debug, Error)]
pub enum StreamError {
    #[error("the operation was aborted: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Aborted { reason: Option<String> },

    #[error(transparent)]
    Transport(#[from] Status),

    #[error("failed to decode stream message: {0}")]
    Decode(Arc<dyn Error + Send + Sync>),

    #[error("timed out after {0:?} while waiting for the stream to become writable")]
    WritableTimeout(Duration),

    #[error("timed out after {0:?} while waiting for the stream to end")]
    EndTimeout(Duration),

    #[error("the stream is not writable")]
    NotWritable,

    #[error("timed out after {0:?} while waiting for the subscription to be acknowledged")]
    HandshakeTimeout(Duration),

    #[error("the stream is not readable")]
    NotReadable,
}

impl StreamError {
    pub fn decode(error: impl Into<BoxError>) -> Self {
        Self::Decode(Arc::from(error.into()))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Returns `true` for a transport error echoing a cancel this client issued.
    pub fn is_self_cancellation(&self) -> bool {
        matches!(self, Self::Transport(status) if is_self_cancellation(status))
    }
}

/// A call cancelled from our side comes back as an error whose detail text
/// carries [`CANCELLED_DETAIL`]; that echo is a normal completion.
pub fn is_self_cancellation(status: &Status) -> bool {
    status.message().contains(CANCELLED_DETAIL)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for environment variable {var}")]
    Invalid { var: &'static str, value: String },
}
