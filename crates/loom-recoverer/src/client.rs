// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Recoverer client and the request handler wrapper.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use loom_recoverer_core::{Attachment, Event, DEBUG_CONTEXT_KEY, HTTP_REQUEST_KEY, PANIC_KIND};
use tokio::runtime::Handle;
use tracing::{error, info};

use crate::airbrake::AirbrakeTransport;
use crate::config::Config;
use crate::error::{RecovererError, Result};
use crate::panic_hook::{install_panic_hook, observe_blocking, CaptureSettings, Fault, Observed};
use crate::queue::{DeliveryQueue, DropReason, QueueConfig, QueueStatsSnapshot};
use crate::request::{DebugContext, RequestHead};
use crate::stacktrace::{default_entry_package, StacktraceBuilder};
use crate::transport::Transport;

const INTERNAL_SERVER_ERROR_BODY: &str = "Internal Server Error\n";

/// Builder for constructing a [`Client`].
pub struct ClientBuilder {
	config: Config,
	airbrake: Option<(String, String)>,
}

impl ClientBuilder {
	/// Creates a new builder with default settings.
	pub fn new() -> Self {
		Self {
			config: Config::default(),
			airbrake: None,
		}
	}

	/// Sets the maximum number of events waiting for delivery.
	pub fn max_queue(mut self, max: usize) -> Self {
		self.config.max_queue = max;
		self
	}

	/// Sets the number of delivery workers.
	pub fn max_workers(mut self, workers: usize) -> Self {
		self.config.max_workers = workers;
		self
	}

	/// Sets the per-send timeout.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.config.timeout = timeout;
		self
	}

	/// Sets the delivery backend.
	pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
		self.config.transport = Some(Arc::new(transport));
		self.airbrake = None;
		self
	}

	/// Delivers to the hosted Airbrake service.
	pub fn airbrake(mut self, project_id: impl Into<String>, project_key: impl Into<String>) -> Self {
		self.airbrake = Some((project_id.into(), project_key.into()));
		self.config.transport = None;
		self
	}

	/// Sets the crate treated as the application entry point.
	///
	/// Example: `my_service`
	pub fn entry_package(mut self, package: impl Into<String>) -> Self {
		self.config.entry_package = Some(package.into());
		self
	}

	/// Adds a package prefix whose frames count as application code.
	pub fn app_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.config.app_prefixes.push(prefix.into());
		self
	}

	/// Sets the directories that display filenames are made relative to.
	pub fn source_roots(mut self, roots: Vec<PathBuf>) -> Self {
		self.config.source_roots = Some(roots);
		self
	}

	/// Sets the callback for events the queue refuses.
	pub fn on_drop<F>(mut self, handler: F) -> Self
	where
		F: Fn(&Event, DropReason) + Send + Sync + 'static,
	{
		self.config.on_drop = Arc::new(handler);
		self
	}

	/// Builds the client. Must be called inside a tokio runtime.
	pub fn build(self) -> Result<Client> {
		let mut config = self.config;
		if let Some((project_id, project_key)) = self.airbrake {
			config.transport = Some(Arc::new(AirbrakeTransport::new(&project_id, &project_key)?));
		}
		Client::new(config)
	}
}

impl Default for ClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct ClientInner {
	queue: DeliveryQueue,
	transport: Arc<dyn Transport>,
	timeout: Duration,
	capture: CaptureSettings,
}

/// Recovers panics in request handlers and reports them asynchronously.
///
/// Cloning is cheap; clones share the queue and workers.
///
/// # Example
///
/// ```ignore
/// let client = Client::builder()
///     .airbrake("12345", "project-key")
///     .max_queue(256)
///     .build()?;
///
/// let handler = client.recoverer(|req: Request<String>| async move {
///     Response::new(format!("hello {}", req.uri().path()))
/// });
///
/// // ... serve requests through `handler.call(req).await` ...
///
/// client.close().await;
/// ```
#[derive(Clone)]
pub struct Client {
	inner: Arc<ClientInner>,
}

impl Client {
	/// Creates a new builder for constructing a Client.
	pub fn builder() -> ClientBuilder {
		ClientBuilder::new()
	}

	/// Creates a client from `config`, starting its delivery workers on
	/// the current tokio runtime.
	pub fn new(config: Config) -> Result<Self> {
		let config = config.normalized();
		let transport = config.transport.clone().ok_or(RecovererError::MissingTransport)?;
		let runtime = Handle::try_current().map_err(|_| RecovererError::NoRuntime)?;

		let entry_package = config.entry_package.clone().unwrap_or_else(default_entry_package);
		let mut stacktraces = StacktraceBuilder::new(entry_package);
		if let Some(roots) = config.source_roots.clone() {
			stacktraces = stacktraces.with_source_roots(roots);
		}

		let queue = DeliveryQueue::new(
			QueueConfig {
				capacity: config.max_queue,
				workers: config.max_workers,
				timeout: config.timeout,
				on_drop: Arc::clone(&config.on_drop),
			},
			Arc::clone(&transport),
			&runtime,
		);

		install_panic_hook();

		info!(
			entry_package = stacktraces.entry_package(),
			max_queue = config.max_queue,
			max_workers = config.max_workers,
			timeout_ms = config.timeout.as_millis() as u64,
			"Recoverer client initialized"
		);

		Ok(Self {
			inner: Arc::new(ClientInner {
				queue,
				transport,
				timeout: config.timeout,
				capture: CaptureSettings {
					stacktraces: Arc::new(stacktraces),
					app_prefixes: Arc::from(config.app_prefixes),
				},
			}),
		})
	}

	/// The stacktrace builder shared by every capture of this client.
	pub fn stacktraces(&self) -> &StacktraceBuilder {
		&self.inner.capture.stacktraces
	}

	/// Wraps an async handler so that a panic becomes a 500 response and a
	/// queued crash report.
	pub fn recoverer<H>(&self, handler: H) -> Recoverer<H> {
		Recoverer {
			client: self.clone(),
			handler,
			with_context: false,
		}
	}

	/// Like [`recoverer`](Self::recoverer), but also attaches the request's
	/// [`DebugContext`] extension to reports.
	pub fn recoverer_with_context<H>(&self, handler: H) -> Recoverer<H> {
		Recoverer {
			client: self.clone(),
			handler,
			with_context: true,
		}
	}

	/// Runs `future`, turning a panic inside it into a [`Fault`].
	pub fn observe<F: Future>(&self, future: F) -> Observed<F> {
		Observed::new(future, self.inner.capture.clone())
	}

	/// Runs `f`, turning a panic inside it into a [`Fault`].
	pub fn observe_blocking<T>(&self, f: impl FnOnce() -> T) -> std::result::Result<T, Fault> {
		observe_blocking(&self.inner.capture, f)
	}

	/// Builds the panic event for a fault observed while handling `head`.
	pub fn capture_panic(
		&self,
		head: &RequestHead,
		fault: Fault,
		debug: Option<&DebugContext>,
	) -> Event {
		let mut event = Event::new(PANIC_KIND)
			.with_stacktrace(fault.stacktrace)
			.attach(HTTP_REQUEST_KEY, Attachment::Http(head.to_metadata()));
		if let Some(debug) = debug {
			event = event.attach(DEBUG_CONTEXT_KEY, Attachment::Debug(debug.dump()));
		}
		event
	}

	/// Queues `event` for delivery. Returns false if it was dropped.
	pub fn report(&self, event: Event) -> bool {
		self.inner.queue.enqueue(event)
	}

	/// Sends `event` immediately, bypassing the queue.
	pub async fn send_now(&self, event: &Event) -> Result<()> {
		if self.is_closed() {
			return Err(RecovererError::ClientClosed);
		}
		self.inner.transport.send(event, self.inner.timeout).await?;
		Ok(())
	}

	/// Stops accepting events and waits for queued events to be delivered.
	///
	/// Calling this more than once is harmless.
	pub async fn close(&self) {
		let was_open = !self.is_closed();
		self.inner.queue.close().await;
		if was_open {
			info!(stats = ?self.stats(), "Recoverer client closed");
		}
	}

	/// Returns true once [`close`](Self::close) has been called.
	pub fn is_closed(&self) -> bool {
		self.inner.queue.is_closed()
	}

	pub fn stats(&self) -> QueueStatsSnapshot {
		self.inner.queue.stats()
	}

	fn recover(&self, head: &RequestHead, fault: Fault, debug: Option<&DebugContext>) {
		error!(
			method = %head.method,
			path = head.uri.path(),
			panic = %fault,
			"Request handler panicked"
		);
		let event = self.capture_panic(head, fault, debug);
		self.report(event);
	}
}

impl fmt::Debug for Client {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Client")
			.field("queue", &self.inner.queue)
			.field("timeout", &self.inner.timeout)
			.field("entry_package", &self.stacktraces().entry_package())
			.finish_non_exhaustive()
	}
}

/// A request handler wrapped by [`Client::recoverer`].
#[derive(Clone)]
pub struct Recoverer<H> {
	client: Client,
	handler: H,
	with_context: bool,
}

impl<H> Recoverer<H> {
	/// Runs the wrapped handler.
	///
	/// If it completes, its response is returned unchanged and nothing is
	/// reported. If it panics, the panic is reported and a plain-text 500
	/// response is returned instead.
	pub async fn call<B, R, Fut>(&self, request: Request<B>) -> Response<R>
	where
		H: Fn(Request<B>) -> Fut,
		Fut: Future<Output = Response<R>>,
		R: From<&'static str>,
	{
		let head = RequestHead::from_request(&request);
		let debug = if self.with_context {
			request.extensions().get::<DebugContext>().cloned()
		} else {
			None
		};

		let handler = &self.handler;
		match self.client.observe(async move { handler(request).await }).await {
			Ok(response) => response,
			Err(fault) => {
				self.client.recover(&head, fault, debug.as_ref());
				internal_server_error()
			}
		}
	}

	pub fn client(&self) -> &Client {
		&self.client
	}
}

impl<H> fmt::Debug for Recoverer<H> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Recoverer")
			.field("client", &self.client)
			.field("with_context", &self.with_context)
			.finish_non_exhaustive()
	}
}

fn internal_server_error<R: From<&'static str>>() -> Response<R> {
	let mut response = Response::new(R::from(INTERNAL_SERVER_ERROR_BODY));
	*response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
	let headers = response.headers_mut();
	headers.insert(
		CONTENT_TYPE,
		HeaderValue::from_static("text/plain; charset=utf-8"),
	);
	headers.insert(
		"x-content-type-options",
		HeaderValue::from_static("nosniff"),
	);
	response
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::TransportError;
	use async_trait::async_trait;
	use std::sync::Mutex;

	#[derive(Default, Clone)]
	struct Recording {
		events: Arc<Mutex<Vec<Event>>>,
	}

	#[async_trait]
	impl Transport for Recording {
		async fn send(&self, event: &Event, _timeout: Duration) -> std::result::Result<(), TransportError> {
			self.events.lock().unwrap().push(event.clone());
			Ok(())
		}
	}

	struct Refusing;

	#[async_trait]
	impl Transport for Refusing {
		async fn send(&self, _event: &Event, _timeout: Duration) -> std::result::Result<(), TransportError> {
			Err(TransportError::Other("backend unavailable".to_string()))
		}
	}

	#[test]
	fn build_requires_transport() {
		let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
		let _guard = runtime.enter();
		let err = Client::builder().build().unwrap_err();
		assert!(matches!(err, RecovererError::MissingTransport));
	}

	#[test]
	fn build_requires_runtime() {
		let err = Client::builder().transport(Recording::default()).build().unwrap_err();
		assert!(matches!(err, RecovererError::NoRuntime));
	}

	#[tokio::test]
	async fn airbrake_builder_configures_transport() {
		let client = Client::builder().airbrake("1", "key").build().unwrap();
		assert!(!client.is_closed());
		client.close().await;
	}

	#[tokio::test]
	async fn send_now_surfaces_transport_errors() {
		let client = Client::builder().transport(Refusing).build().unwrap();
		let err = client.send_now(&Event::new(PANIC_KIND)).await.unwrap_err();
		assert!(matches!(err, RecovererError::Transport(TransportError::Other(_))));
	}

	#[tokio::test]
	async fn send_now_after_close_is_rejected() {
		let recording = Recording::default();
		let client = Client::builder().transport(recording.clone()).build().unwrap();
		client.send_now(&Event::new(PANIC_KIND)).await.unwrap();
		client.close().await;

		let err = client.send_now(&Event::new(PANIC_KIND)).await.unwrap_err();
		assert!(matches!(err, RecovererError::ClientClosed));
		assert_eq!(recording.events.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn report_after_close_is_dropped() {
		let client = Client::builder().transport(Recording::default()).build().unwrap();
		client.close().await;
		client.close().await;
		assert!(!client.report(Event::new(PANIC_KIND)));
		assert_eq!(client.stats().dropped, 1);
	}

	#[tokio::test]
	async fn capture_panic_attaches_request_and_context() {
		let client = Client::builder()
			.transport(Recording::default())
			.entry_package("loom_recoverer")
			.build()
			.unwrap();

		let request = Request::builder()
			.uri("/orders?api_token=abc&page=2")
			.header("Host", "shop.local")
			.body(())
			.unwrap();
		let head = RequestHead::from_request(&request);
		let fault = client
			.observe_blocking(|| {
				panic!("out of stock");
			})
			.unwrap_err();

		let event = client.capture_panic(&head, fault, Some(&DebugContext::new("order-9")));
		assert_eq!(event.kind, PANIC_KIND);
		assert!(!event.stacktrace.is_empty());

		let http = event.http().unwrap();
		assert_eq!(http.url, "http://shop.local/orders");
		assert_eq!(http.query, "api_token=[redacted]&page=2");
		assert_eq!(event.debug_context(), Some("\"order-9\""));
		client.close().await;
	}

	#[test]
	fn fallback_response_is_plain_500() {
		let response: Response<String> = internal_server_error();
		assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
		assert_eq!(response.body(), "Internal Server Error\n");
		assert_eq!(
			response.headers()[CONTENT_TYPE],
			"text/plain; charset=utf-8"
		);
	}
}
