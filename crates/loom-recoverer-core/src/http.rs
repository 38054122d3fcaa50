// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP request metadata captured alongside a fault.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::form_urlencoded;

use crate::sanitize::REDACTED;

/// Request metadata attached to a crash event.
///
/// Built from the in-flight request at fault time. The query, headers and
/// cookies have already been through the sanitizer by the time this is
/// attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMetadata {
	pub method: String,
	/// `scheme://host/path`, without the query string.
	pub url: String,
	/// Encoded, sanitized query string.
	pub query: String,
	pub user_agent: String,
	/// Header name (canonical form) to comma-joined values.
	pub headers: BTreeMap<String, String>,
	pub cookies: Vec<Cookie>,
	/// `REMOTE_ADDR` / `REMOTE_PORT` when the peer address is known.
	pub env: BTreeMap<String, String>,
}

/// A request cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
	pub name: String,
	pub value: String,
}

impl Cookie {
	pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			value: value.into(),
		}
	}

	/// Parses a `Cookie` request header value (`a=1; b=2`).
	///
	/// Pairs without a name are skipped, surrounding double quotes on values
	/// are removed.
	pub fn parse_header(header: &str) -> Vec<Cookie> {
		header
			.split(';')
			.filter_map(|pair| {
				let pair = pair.trim();
				let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
				let name = name.trim();
				if name.is_empty() {
					return None;
				}
				let value = value.trim();
				let value = value
					.strip_prefix('"')
					.and_then(|v| v.strip_suffix('"'))
					.unwrap_or(value);
				Some(Cookie::new(name, value))
			})
			.collect()
	}
}

impl fmt::Display for Cookie {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}={}", self.name, self.value)
	}
}

/// Query parameters grouped by name, in the order names first appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
	params: Vec<(String, Vec<String>)>,
}

impl QueryParams {
	pub fn new() -> Self {
		Self::default()
	}

	/// Parses an `application/x-www-form-urlencoded` query string.
	pub fn parse(query: &str) -> Self {
		let mut params = Self::new();
		for (name, value) in form_urlencoded::parse(query.as_bytes()) {
			params.append(name.into_owned(), value.into_owned());
		}
		params
	}

	pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
		let name = name.into();
		let value = value.into();
		match self.params.iter_mut().find(|(n, _)| *n == name) {
			Some((_, values)) => values.push(value),
			None => self.params.push((name, vec![value])),
		}
	}

	pub fn get(&self, name: &str) -> Option<&[String]> {
		self.params
			.iter()
			.find(|(n, _)| n == name)
			.map(|(_, values)| values.as_slice())
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
		self.params.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Vec<String>)> {
		self.params.iter_mut().map(|(n, v)| (n.as_str(), v))
	}

	pub fn len(&self) -> usize {
		self.params.len()
	}

	pub fn is_empty(&self) -> bool {
		self.params.is_empty()
	}

	/// Encodes back into a query string.
	///
	/// Names and values are percent-encoded, except the redaction marker
	/// which is kept readable.
	pub fn encode(&self) -> String {
		let mut out = String::new();
		for (name, values) in &self.params {
			for value in values {
				if !out.is_empty() {
					out.push('&');
				}
				out.extend(form_urlencoded::byte_serialize(name.as_bytes()));
				out.push('=');
				if value == REDACTED {
					out.push_str(REDACTED);
				} else {
					out.extend(form_urlencoded::byte_serialize(value.as_bytes()));
				}
			}
		}
		out
	}
}

/// Canonicalizes a header name: `x-csrf-token` becomes `X-Csrf-Token`.
pub fn canonical_header_name(name: &str) -> String {
	let mut upper = true;
	name.chars()
		.map(|c| {
			let mapped = if upper {
				c.to_ascii_uppercase()
			} else {
				c.to_ascii_lowercase()
			};
			upper = c == '-';
			mapped
		})
		.collect()
}
