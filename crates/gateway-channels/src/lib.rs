// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod channel;
mod loopback;
mod registry;

pub use channel::{Channel, InboundCallback, NormalizedMessage};
pub use loopback::LoopbackChannel;
pub use registry::ChannelRegistry;
