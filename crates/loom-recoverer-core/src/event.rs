// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Crash event types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::http::HttpMetadata;
use crate::stacktrace::Stacktrace;

/// Kind of events produced by intercepted panics.
pub const PANIC_KIND: &str = "panic";
/// Context key for [`Attachment::Http`].
pub const HTTP_REQUEST_KEY: &str = "http.request";
/// Context key for [`Attachment::Debug`].
pub const DEBUG_CONTEXT_KEY: &str = "http.ctx";

/// A captured fault, ready for delivery.
///
/// Events are handed to the delivery queue by value and are not modified
/// after that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
	pub kind: String,
	pub context: BTreeMap<String, Attachment>,
	pub stacktrace: Stacktrace,
}

impl Event {
	pub fn new(kind: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			..Default::default()
		}
	}

	pub fn with_stacktrace(mut self, stacktrace: Stacktrace) -> Self {
		self.stacktrace = stacktrace;
		self
	}

	pub fn attach(mut self, key: impl Into<String>, attachment: Attachment) -> Self {
		self.context.insert(key.into(), attachment);
		self
	}

	/// The request metadata stored under [`HTTP_REQUEST_KEY`], if any.
	pub fn http(&self) -> Option<&HttpMetadata> {
		match self.context.get(HTTP_REQUEST_KEY) {
			Some(Attachment::Http(http)) => Some(http),
			_ => None,
		}
	}

	/// The debug dump stored under [`DEBUG_CONTEXT_KEY`], if any.
	pub fn debug_context(&self) -> Option<&str> {
		match self.context.get(DEBUG_CONTEXT_KEY) {
			Some(Attachment::Debug(dump)) => Some(dump),
			_ => None,
		}
	}
}

/// Context attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Attachment {
	Http(HttpMetadata),
	/// Pretty-printed request-scoped value supplied by the host.
	Debug(String),
	None,
}
