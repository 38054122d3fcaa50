// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Example: Recover a panicking handler and report it to Airbrake.
//!
//! Run with:
//!   AIRBRAKE_PROJECT_ID=... AIRBRAKE_PROJECT_KEY=... \
//!   cargo run --example recover -p loom-recoverer

use http::{Request, Response};
use loom_recoverer::{Client, DebugContext, RemoteAddr};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
#[allow(dead_code)]
struct Order {
	id: u64,
	items: Vec<&'static str>,
}

async fn place_order(req: Request<String>) -> Response<String> {
	let quantity: u32 = req.body().parse().unwrap_or_default();
	if quantity == 0 {
		panic!("order quantity must be positive");
	}
	Response::new(format!("ordered {quantity}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let project_id =
		std::env::var("AIRBRAKE_PROJECT_ID").expect("AIRBRAKE_PROJECT_ID environment variable required");
	let project_key = std::env::var("AIRBRAKE_PROJECT_KEY")
		.expect("AIRBRAKE_PROJECT_KEY environment variable required");

	let client = Client::builder()
		.airbrake(project_id, project_key)
		.max_queue(16)
		.build()?;

	let handler = client.recoverer_with_context(place_order);

	for body in ["3", "0"] {
		let request = Request::builder()
			.method("POST")
			.uri("/orders?session_token=abc")
			.header("Host", "shop.example.com")
			.header("Authorization", "Bearer example")
			.extension(RemoteAddr("127.0.0.1:50000".to_string()))
			.extension(DebugContext::new(Order {
				id: 7,
				items: vec!["tea", "scones"],
			}))
			.body(body.to_string())?;

		let response = handler.call(request).await;
		println!("{} -> {} {:?}", body, response.status(), response.body());
	}

	client.close().await;
	println!("Stats: {:?}", client.stats());

	Ok(())
}
