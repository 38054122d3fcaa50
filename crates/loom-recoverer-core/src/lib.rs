// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for Loom panic recovery.
//!
//! This crate holds the plain data that flows through the recoverer: crash
//! events, stacktraces and frames, captured HTTP request metadata, and the
//! sanitizer that scrubs credentials out of that metadata before it leaves the
//! process. It is used by the `loom-recoverer` SDK and by transports that
//! encode events for a specific backend.
//!
//! # Overview
//!
//! - [`Event`]: a captured fault with its [`Stacktrace`] and typed
//!   [`Attachment`]s
//! - [`Stacktrace::culprit`]: picks the frame shown as "where it happened"
//! - [`sanitize_query`], [`sanitize_headers`], [`sanitize_cookies`]: in-place
//!   redaction of request metadata

pub mod event;
pub mod http;
pub mod sanitize;
pub mod stacktrace;

pub use event::{Attachment, Event, DEBUG_CONTEXT_KEY, HTTP_REQUEST_KEY, PANIC_KIND};
pub use http::{canonical_header_name, Cookie, HttpMetadata, QueryParams};
pub use sanitize::{
	sanitize_cookies, sanitize_headers, sanitize_query, REDACTED, SENSITIVE_COOKIES,
	SENSITIVE_HEADERS, SENSITIVE_QUERY_FIELDS,
};
pub use stacktrace::{Frame, Stacktrace};
