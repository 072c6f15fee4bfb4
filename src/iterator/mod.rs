// Copyright 2024-, Semiotic AI, Inc.
// SPDX-License-Identifier: Apache-2.0

mod duplex;
mod pull;
mod read;

pub use duplex::DuplexPullIterator;
pub use pull::PullIterator;
