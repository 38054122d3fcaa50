// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the recoverer SDK.

use thiserror::Error;

/// Result type alias for recoverer operations.
pub type Result<T> = std::result::Result<T, RecovererError>;

/// Errors surfaced to callers of the client.
///
/// Only construction and the synchronous [`send_now`](crate::Client::send_now)
/// path return these. The queued path never reports errors to the host.
#[derive(Debug, Error)]
pub enum RecovererError {
	/// No transport was configured.
	#[error("a transport is required")]
	MissingTransport,

	/// The client was built outside a tokio runtime.
	#[error("no tokio runtime is available to run delivery workers")]
	NoRuntime,

	/// The client has been closed.
	#[error("recoverer client has been closed")]
	ClientClosed,

	/// The transport failed to deliver an event.
	#[error("delivery failed: {0}")]
	Transport(#[from] TransportError),
}

/// Errors a [`Transport`](crate::Transport) can report for a single send.
#[derive(Debug, Error)]
pub enum TransportError {
	/// The event could not be encoded for the backend.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// The endpoint URL could not be parsed.
	#[error("invalid endpoint: {0}")]
	Endpoint(#[from] url::ParseError),

	/// The HTTP request failed (connect, timeout, body).
	#[error("HTTP request failed: {0}")]
	Request(#[from] reqwest::Error),

	/// The backend answered with a non-success status.
	#[error("server error (status {status}): {body}")]
	Status {
		/// HTTP status code.
		status: u16,
		/// Response body, for diagnostics.
		body: String,
	},

	/// Any other transport-specific failure.
	#[error("{0}")]
	Other(String),
}
