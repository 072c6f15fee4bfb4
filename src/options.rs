// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use dotenvy::{dotenv, var};

use crate::{abort::AbortSignal, error::ConfigError};

/// Items buffered before the transport is paused.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;
/// How long the handshake waits for the server's initial metadata.
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `end` waits for the transport to confirm the half-close.
pub const DEFAULT_END_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a write waits for a drain signal.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_QUEUE_SIZE_VAR: &str = "FEED_STREAM_MAX_QUEUE_SIZE";
const METADATA_TIMEOUT_VAR: &str = "FEED_STREAM_METADATA_TIMEOUT_MS";
const END_TIMEOUT_VAR: &str = "FEED_STREAM_END_TIMEOUT_MS";
const DRAIN_TIMEOUT_VAR: &str = "FEED_STREAM_DRAIN_TIMEOUT_MS";
const AUTO_END_VAR: &str = "FEED_STREAM_AUTO_END";

/// Construction options shared by every iterator kind and the handshake.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub max_queue_size: usize,
    pub signal: Option<AbortSignal>,
    pub metadata_timeout: Duration,
    pub end_timeout: Duration,
    pub drain_timeout: Duration,
    /// End the write side of a duplex stream before closing it.
    pub auto_end: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            signal: None,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            end_timeout: DEFAULT_END_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            auto_end: true,
        }
    }
}

impl StreamOptions {
    /// Defaults overridden by `FEED_STREAM_*` variables from the process
    /// environment or a `.env` file.
    ///
    /// Timeouts are read in milliseconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine, the process environment still applies.
        let _ = dotenv();
        Self::from_lookup(|name| var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();

        if let Some(size) = parse(&lookup, MAX_QUEUE_SIZE_VAR, |v| v.parse::<usize>().ok())? {
            options.max_queue_size = size;
        }
        if let Some(timeout) = parse(&lookup, METADATA_TIMEOUT_VAR, millis)? {
            options.metadata_timeout = timeout;
        }
        if let Some(timeout) = parse(&lookup, END_TIMEOUT_VAR, millis)? {
            options.end_timeout = timeout;
        }
        if let Some(timeout) = parse(&lookup, DRAIN_TIMEOUT_VAR, millis)? {
            options.drain_timeout = timeout;
        }
        if let Some(auto_end) = parse(&lookup, AUTO_END_VAR, flag)? {
            options.auto_end = auto_end;
        }

        Ok(options)
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    pub fn with_end_timeout(mut self, timeout: Duration) -> Self {
        self.end_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_auto_end(mut self, auto_end: bool) -> Self {
        self.auto_end = auto_end;
        self
    }

    /// Buffer capacity actually enforced; a zero capacity could never resume.
    pub(crate) fn capacity(&self) -> usize {
        self.max_queue_size.max(1)
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    convert: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    convert(raw.trim())
        .map(Some)
        .ok_or(ConfigError::Invalid {
            var: name,
            value: raw,
        })
}

fn millis(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_millis)
}

fn flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
