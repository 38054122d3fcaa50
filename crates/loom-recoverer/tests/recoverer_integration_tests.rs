// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Integration tests for the request recoverer.
//!
//! Tests cover:
//! - Panicking handlers answer 500 and queue exactly one report
//! - Reports carry sanitized request metadata and an in-app stacktrace
//! - Handlers that return normally pass through untouched
//! - Debug context attachment through request extensions
//! - End-to-end delivery to an Airbrake-compatible server

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::{header::CONTENT_TYPE, Request, Response, StatusCode};
use loom_recoverer::{
	AirbrakeTransport, Client, DebugContext, Event, RemoteAddr, Transport, TransportError,
};
use loom_recoverer_core::REDACTED;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ENTRY_PACKAGE: &str = "recoverer_integration_tests";

#[derive(Default, Clone)]
struct RecordingTransport {
	events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingTransport {
	fn events(&self) -> Vec<Event> {
		self.events.lock().unwrap().clone()
	}
}

#[async_trait]
impl Transport for RecordingTransport {
	async fn send(&self, event: &Event, _timeout: Duration) -> Result<(), TransportError> {
		self.events.lock().unwrap().push(event.clone());
		Ok(())
	}
}

async fn checkout_handler(req: Request<String>) -> Response<String> {
	if req.uri().path() == "/checkout" {
		let cart: Vec<u32> = Vec::new();
		panic!("empty cart: {} items", cart.len());
	}
	Response::new(format!("ok {}", req.body()))
}

fn setup_client(transport: RecordingTransport) -> Client {
	Client::builder()
		.transport(transport)
		.entry_package(ENTRY_PACKAGE)
		.build()
		.unwrap()
}

fn checkout_request() -> Request<String> {
	Request::builder()
		.method("POST")
		.uri("/checkout?coupon=SPRING&token=abc123")
		.header("Host", "shop.example.com")
		.header("Authorization", "Bearer secret-token")
		.header("Cookie", "session=s3cr3t; locale=en")
		.header("User-Agent", "integration-test/1.0")
		.extension(RemoteAddr("203.0.113.9:41000".to_string()))
		.body(String::new())
		.unwrap()
}

// ============================================================================
// Panic recovery
// ============================================================================

#[tokio::test]
async fn panicking_handler_returns_500_and_reports_once() {
	let transport = RecordingTransport::default();
	let client = setup_client(transport.clone());
	let handler = client.recoverer(checkout_handler);

	let response = handler.call(checkout_request()).await;

	assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
	assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
	assert_eq!(response.body(), "Internal Server Error\n");

	client.close().await;

	let events = transport.events();
	assert_eq!(events.len(), 1);
	assert_eq!(events[0].kind, "panic");
	assert_eq!(client.stats().accepted, 1);
	assert_eq!(client.stats().delivered, 1);
}

#[tokio::test]
async fn report_carries_sanitized_request() {
	let transport = RecordingTransport::default();
	let client = setup_client(transport.clone());

	client.recoverer(checkout_handler).call(checkout_request()).await;
	client.close().await;

	let events = transport.events();
	let http = events[0].http().expect("request metadata attached");

	assert_eq!(http.method, "POST");
	assert_eq!(http.url, "http://shop.example.com/checkout");
	assert_eq!(http.query, "coupon=SPRING&token=[redacted]");
	assert_eq!(http.user_agent, "integration-test/1.0");
	assert_eq!(http.headers["Authorization"], REDACTED);
	assert_eq!(http.headers["Cookie"], REDACTED);
	assert_eq!(http.headers["Host"], "shop.example.com");
	assert!(http
		.cookies
		.iter()
		.any(|c| c.name == "session" && c.value == REDACTED));
	assert!(http.cookies.iter().any(|c| c.name == "locale" && c.value == "en"));
	assert_eq!(http.env["REMOTE_ADDR"], "203.0.113.9");
	assert_eq!(http.env["REMOTE_PORT"], "41000");
	assert!(events[0].debug_context().is_none());
}

#[tokio::test]
async fn report_stacktrace_points_at_handler() {
	let transport = RecordingTransport::default();
	let client = setup_client(transport.clone());

	client.recoverer(checkout_handler).call(checkout_request()).await;
	client.close().await;

	let events = transport.events();
	let stacktrace = &events[0].stacktrace;
	assert!(!stacktrace.is_empty());
	assert!(stacktrace
		.frames()
		.iter()
		.any(|f| f.in_app() && f.package().contains("checkout_handler")));
	assert!(stacktrace.culprit().starts_with(ENTRY_PACKAGE));
	assert!(stacktrace
		.frames()
		.iter()
		.all(|f| !f.package().starts_with("std::panicking")));
}

#[tokio::test]
async fn normal_handler_passes_through() {
	let transport = RecordingTransport::default();
	let client = setup_client(transport.clone());
	let handler = client.recoverer(checkout_handler);

	let request = Request::builder()
		.uri("/cart")
		.body("3 items".to_string())
		.unwrap();
	let response = handler.call(request).await;

	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(response.body(), "ok 3 items");

	client.close().await;
	assert!(transport.events().is_empty());
	assert_eq!(client.stats().accepted, 0);
}

#[tokio::test]
async fn context_recoverer_attaches_debug_dump() {
	#[derive(Debug)]
	#[allow(dead_code)]
	struct Session {
		user_id: u64,
	}

	let transport = RecordingTransport::default();
	let client = setup_client(transport.clone());
	let handler = client.recoverer_with_context(checkout_handler);

	let mut request = checkout_request();
	request
		.extensions_mut()
		.insert(DebugContext::new(Session { user_id: 42 }));
	handler.call(request).await;
	client.close().await;

	let events = transport.events();
	assert_eq!(
		events[0].debug_context(),
		Some("Session {\n    user_id: 42,\n}")
	);
}

#[tokio::test]
async fn plain_recoverer_ignores_debug_context() {
	let transport = RecordingTransport::default();
	let client = setup_client(transport.clone());

	let mut request = checkout_request();
	request.extensions_mut().insert(DebugContext::new("ignored"));
	client.recoverer(checkout_handler).call(request).await;
	client.close().await;

	assert!(transport.events()[0].debug_context().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_panics_are_each_reported() {
	let transport = RecordingTransport::default();
	let client = Client::builder()
		.transport(transport.clone())
		.entry_package(ENTRY_PACKAGE)
		.max_queue(64)
		.max_workers(3)
		.build()
		.unwrap();
	let handler = client.recoverer(checkout_handler);

	let mut tasks = Vec::new();
	for _ in 0..16 {
		let handler = handler.clone();
		tasks.push(tokio::spawn(async move {
			handler.call(checkout_request()).await.status()
		}));
	}
	for task in tasks {
		assert_eq!(task.await.unwrap(), StatusCode::INTERNAL_SERVER_ERROR);
	}

	client.close().await;
	assert_eq!(transport.events().len(), 16);
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn report_is_delivered_to_airbrake() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/api/v3/projects/77/notices"))
		.respond_with(ResponseTemplate::new(201))
		.expect(1)
		.mount(&server)
		.await;

	let transport = AirbrakeTransport::with_endpoint(server.uri(), "77", "key").unwrap();
	let client = Client::builder()
		.transport(transport)
		.entry_package(ENTRY_PACKAGE)
		.build()
		.unwrap();

	let response = client
		.recoverer(checkout_handler)
		.call(checkout_request())
		.await;
	assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
	client.close().await;

	let requests = server.received_requests().await.unwrap();
	let notice: serde_json::Value = requests[0].body_json().unwrap();
	assert_eq!(notice["errors"][0]["type"], "panic");
	assert_eq!(notice["params"]["request.header: Authorization"], REDACTED);
	assert_eq!(notice["params"]["token"], REDACTED);
	assert_eq!(notice["context"]["url"], "http://shop.example.com/checkout");
	assert_eq!(notice["environment"]["REMOTE_ADDR"], "203.0.113.9");
	assert_eq!(client.stats().delivered, 1);
}

#[tokio::test]
async fn rejected_delivery_does_not_affect_response() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(503))
		.mount(&server)
		.await;

	let transport = AirbrakeTransport::with_endpoint(server.uri(), "1", "key").unwrap();
	let client = Client::builder()
		.transport(transport)
		.entry_package(ENTRY_PACKAGE)
		.build()
		.unwrap();

	let response = client
		.recoverer(checkout_handler)
		.call(checkout_request())
		.await;
	assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

	client.close().await;
	assert_eq!(client.stats().failed, 1);
}
