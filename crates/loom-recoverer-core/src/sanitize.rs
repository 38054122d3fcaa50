// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Redaction of credentials from captured request metadata.
//!
//! All functions rewrite the caller's structure in place. Callers hand over
//! the values they captured and must not expect the originals to survive.

use std::collections::BTreeMap;

use crate::http::{Cookie, QueryParams};

/// Replacement for redacted values.
pub const REDACTED: &str = "[redacted]";

/// Query parameter name fragments that mark a parameter as sensitive.
/// Matching is a case-sensitive substring test.
pub const SENSITIVE_QUERY_FIELDS: &[&str] = &[
	"password",
	"passwd",
	"pass",
	"passphrase",
	"session",
	"token",
	"secret",
	"jwt",
];

/// Header names (canonical form) whose values are always redacted.
pub const SENSITIVE_HEADERS: &[&str] = &["Authorization", "X-Csrf-Token", "Cookie"];

/// Cookie names whose values are always redacted.
pub const SENSITIVE_COOKIES: &[&str] = &["session", "auth", "jwt"];

pub fn sanitize_query(params: &mut QueryParams) {
	for (name, values) in params.iter_mut() {
		if SENSITIVE_QUERY_FIELDS.iter().any(|field| name.contains(field)) {
			*values = vec![REDACTED.to_string()];
		}
	}
}

pub fn sanitize_headers(headers: &mut BTreeMap<String, String>) {
	for (name, value) in headers.iter_mut() {
		if SENSITIVE_HEADERS.contains(&name.as_str()) {
			*value = REDACTED.to_string();
		}
	}
}

pub fn sanitize_cookies(cookies: &mut [Cookie]) {
	for cookie in cookies.iter_mut() {
		if SENSITIVE_COOKIES.contains(&cookie.name.as_str()) {
			cookie.value = REDACTED.to_string();
		}
	}
}
