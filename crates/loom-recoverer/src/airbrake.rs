// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Airbrake v3 notice transport.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use loom_recoverer_core::{Event, Frame, QueryParams};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use crate::error::TransportError;
use crate::transport::Transport;

/// Default Airbrake API host.
pub const AIRBRAKE_HOST: &str = "https://airbrake.io";

/// SDK name reported in the notifier block and User-Agent.
const SDK_NAME: &str = "loom-recoverer";
/// SDK version reported in the notifier block and User-Agent.
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
const SDK_URL: &str = "https://github.com/ghuntley/loom";

/// Sends events as Airbrake notices.
#[derive(Debug, Clone)]
pub struct AirbrakeTransport {
	url: Url,
	http: Client,
}

impl AirbrakeTransport {
	/// Creates a transport for the hosted Airbrake service.
	pub fn new(project_id: &str, project_key: &str) -> Result<Self, TransportError> {
		Self::with_endpoint(AIRBRAKE_HOST, project_id, project_key)
	}

	/// Creates a transport for an Airbrake-compatible server at `base_url`.
	///
	/// The project id and key are percent-encoded into the notice URL.
	pub fn with_endpoint(
		base_url: impl AsRef<str>,
		project_id: &str,
		project_key: &str,
	) -> Result<Self, TransportError> {
		let url = notice_url(base_url.as_ref(), project_id, project_key)?;

		let http = Client::builder()
			.user_agent(format!("{SDK_NAME}/{SDK_VERSION}"))
			.build()?;

		Ok(Self { url, http })
	}
}

#[async_trait]
impl Transport for AirbrakeTransport {
	#[instrument(skip(self, event), fields(kind = %event.kind))]
	async fn send(&self, event: &Event, timeout: Duration) -> Result<(), TransportError> {
		let body = serde_json::to_vec(&Notice::from_event(event))?;

		let response = self
			.http
			.post(self.url.clone())
			.timeout(timeout)
			.header(CONTENT_TYPE, "application/json")
			.body(body)
			.send()
			.await?;

		let status = response.status().as_u16();
		if response.status().is_success() {
			debug!(status, "Notice delivered");
			return Ok(());
		}

		let body = response.text().await.unwrap_or_default();
		debug!(status, response = %body, "Notice rejected");
		Err(TransportError::Status { status, body })
	}
}

fn notice_url(base_url: &str, project_id: &str, project_key: &str) -> Result<Url, TransportError> {
	let mut url = Url::parse(base_url)?;
	url.path_segments_mut()
		.map_err(|()| TransportError::Other(format!("not a base URL: {base_url}")))?
		.pop_if_empty()
		.extend(["api", "v3", "projects", project_id, "notices"]);
	url.query_pairs_mut().clear().append_pair("key", project_key);
	Ok(url)
}

/// Airbrake v3 notice body.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
	pub notifier: Notifier,
	pub errors: Vec<NoticeError>,
	pub context: NoticeContext,
	#[serde(skip_serializing_if = "BTreeMap::is_empty")]
	pub environment: BTreeMap<String, String>,
	#[serde(skip_serializing_if = "BTreeMap::is_empty")]
	pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notifier {
	pub name: String,
	pub version: String,
	pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoticeError {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub message: String,
	pub backtrace: Vec<Frame>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeContext {
	#[serde(skip_serializing_if = "String::is_empty")]
	pub os: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub language: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub url: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub action: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub user_agent: String,
}

impl Notice {
	/// Maps an event onto a notice: one error whose message is the culprit
	/// and whose backtrace is the event's frames in capture order.
	pub fn from_event(event: &Event) -> Self {
		let error = NoticeError {
			kind: event.kind.clone(),
			message: event.stacktrace.culprit(),
			backtrace: event.stacktrace.frames().to_vec(),
		};

		let mut notice = Notice {
			notifier: Notifier {
				name: SDK_NAME.to_string(),
				version: SDK_VERSION.to_string(),
				url: SDK_URL.to_string(),
			},
			errors: vec![error],
			context: NoticeContext {
				os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
				language: "rust".to_string(),
				..Default::default()
			},
			environment: BTreeMap::new(),
			params: BTreeMap::new(),
		};

		if let Some(http) = event.http() {
			for (name, values) in QueryParams::parse(&http.query).iter() {
				notice.params.insert(name.to_string(), values.join(","));
			}
			for (name, value) in &http.headers {
				notice
					.params
					.insert(format!("request.header: {name}"), value.clone());
			}
			for cookie in &http.cookies {
				notice
					.params
					.insert(format!("request.cookie: {}", cookie.name), cookie.to_string());
			}
			notice.context.url = http.url.clone();
			notice.context.action = http.method.clone();
			notice.context.user_agent = http.user_agent.clone();
			notice.environment = http.env.clone();
		}

		if let Some(dump) = event.debug_context() {
			notice
				.params
				.insert("request.context".to_string(), dump.to_string());
		}

		notice
	}
}
