// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

use async_trait::async_trait;
use loom_recoverer_core::Event;

use crate::error::TransportError;

/// Delivers a single event to a crash reporting backend.
///
/// Implementations own the wire format and the endpoint. `timeout` bounds
/// one delivery attempt; the caller never cancels a send on its own, so
/// implementations must honor it.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, event: &Event, timeout: Duration) -> Result<(), TransportError>;
}
