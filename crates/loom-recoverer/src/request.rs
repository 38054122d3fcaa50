// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Request context captured before a handler runs.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{COOKIE, HOST, USER_AGENT};
use http::{HeaderMap, Method, Request, Uri};
use loom_recoverer_core::{
	canonical_header_name, sanitize_cookies, sanitize_headers, sanitize_query, Cookie,
	HttpMetadata, QueryParams,
};

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Request extension marking a request that arrived over TLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsInfo;

/// Request extension carrying the peer address as `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

impl From<SocketAddr> for RemoteAddr {
	fn from(addr: SocketAddr) -> Self {
		Self(addr.to_string())
	}
}

/// Request extension with a value to attach to crash reports.
///
/// Read by [`Client::recoverer_with_context`](crate::Client::recoverer_with_context);
/// the value is pretty-printed with `{:#?}` only if the handler panics.
#[derive(Clone)]
pub struct DebugContext(Arc<dyn fmt::Debug + Send + Sync>);

impl DebugContext {
	pub fn new<T>(value: T) -> Self
	where
		T: fmt::Debug + Send + Sync + 'static,
	{
		Self(Arc::new(value))
	}

	pub fn dump(&self) -> String {
		format!("{:#?}", self.0)
	}
}

impl fmt::Debug for DebugContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("DebugContext").field(&self.0).finish()
	}
}

/// The parts of a request kept while its handler runs.
#[derive(Debug, Clone)]
pub struct RequestHead {
	pub method: Method,
	pub uri: Uri,
	pub headers: HeaderMap,
	pub tls: bool,
	pub remote_addr: Option<String>,
}

impl RequestHead {
	pub fn from_request<B>(request: &Request<B>) -> Self {
		let extensions = request.extensions();
		Self {
			method: request.method().clone(),
			uri: request.uri().clone(),
			headers: request.headers().clone(),
			tls: request.uri().scheme_str() == Some("https") || extensions.get::<TlsInfo>().is_some(),
			remote_addr: extensions.get::<RemoteAddr>().map(|addr| addr.0.clone()),
		}
	}

	/// `https` for TLS requests or when a proxy reports
	/// `X-Forwarded-Proto: https`, otherwise `http`.
	pub fn scheme(&self) -> &'static str {
		let forwarded_https = self
			.headers
			.get(FORWARDED_PROTO)
			.is_some_and(|v| v.as_bytes() == b"https");
		if self.tls || forwarded_https {
			"https"
		} else {
			"http"
		}
	}

	pub fn host(&self) -> &str {
		self.uri
			.authority()
			.map(|a| a.as_str())
			.or_else(|| self.headers.get(HOST).and_then(|v| v.to_str().ok()))
			.unwrap_or_default()
	}

	/// `scheme://host/path`, without the query string.
	pub fn url(&self) -> String {
		format!("{}://{}{}", self.scheme(), self.host(), self.uri.path())
	}

	pub fn user_agent(&self) -> &str {
		self.headers
			.get(USER_AGENT)
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
	}

	/// Cookies from every `Cookie` header, in order.
	pub fn cookies(&self) -> Vec<Cookie> {
		self.headers
			.get_all(COOKIE)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.flat_map(Cookie::parse_header)
			.collect()
	}

	/// Headers keyed by canonical name, repeated values joined with `,`.
	pub fn header_map(&self) -> BTreeMap<String, String> {
		let mut headers: BTreeMap<String, String> = BTreeMap::new();
		for (name, value) in &self.headers {
			let value = String::from_utf8_lossy(value.as_bytes());
			headers
				.entry(canonical_header_name(name.as_str()))
				.and_modify(|joined| {
					joined.push(',');
					joined.push_str(&value);
				})
				.or_insert_with(|| value.into_owned());
		}
		headers
	}

	/// `REMOTE_ADDR` and `REMOTE_PORT` when the peer address splits into
	/// host and port. Hostnames are kept as given.
	pub fn env(&self) -> BTreeMap<String, String> {
		self.remote_addr
			.as_deref()
			.and_then(split_host_port)
			.map(|(host, port)| {
				BTreeMap::from([
					("REMOTE_ADDR".to_string(), host.to_string()),
					("REMOTE_PORT".to_string(), port.to_string()),
				])
			})
			.unwrap_or_default()
	}

	/// Builds sanitized metadata for a crash report.
	pub fn to_metadata(&self) -> HttpMetadata {
		let mut query = QueryParams::parse(self.uri.query().unwrap_or_default());
		sanitize_query(&mut query);

		let mut headers = self.header_map();
		sanitize_headers(&mut headers);

		let mut cookies = self.cookies();
		sanitize_cookies(&mut cookies);

		HttpMetadata {
			method: self.method.to_string(),
			url: self.url(),
			query: query.encode(),
			user_agent: self.user_agent().to_string(),
			headers,
			cookies,
			env: self.env(),
		}
	}
}

/// Splits `host:port` or `[v6]:port`. Bare IPv6 addresses and values
/// without a port do not split.
fn split_host_port(addr: &str) -> Option<(&str, &str)> {
	if let Some(rest) = addr.strip_prefix('[') {
		let (host, tail) = rest.split_once(']')?;
		return Some((host, tail.strip_prefix(':')?));
	}

	let (host, port) = addr.rsplit_once(':')?;
	if host.contains(':') {
		return None;
	}
	Some((host, port))
}
