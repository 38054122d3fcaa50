// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Panic recovery for Loom HTTP services.
//!
//! Wrap a request handler with [`Client::recoverer`]; if it panics, the
//! caller gets a plain-text 500 and a crash report is queued for
//! background delivery through a [`Transport`]. Reporting is best-effort:
//! a full queue drops events rather than slowing requests down, and
//! delivery failures are logged, never surfaced to the handler.
//!
//! # Example
//!
//! ```ignore
//! use loom_recoverer::Client;
//!
//! #[tokio::main]
//! async fn main() -> loom_recoverer::Result<()> {
//!     let client = Client::builder()
//!         .airbrake("12345", "project-key")
//!         .build()?;
//!
//!     let handler = client.recoverer(|req: http::Request<String>| async move {
//!         http::Response::new(req.into_body())
//!     });
//!
//!     // ... route requests to `handler.call(req).await` ...
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod airbrake;
pub mod client;
pub mod config;
pub mod error;
pub mod panic_hook;
pub mod queue;
pub mod request;
pub mod stacktrace;
pub mod transport;

pub use airbrake::AirbrakeTransport;
pub use client::{Client, ClientBuilder, Recoverer};
pub use config::Config;
pub use error::{RecovererError, Result, TransportError};
pub use panic_hook::{Fault, Observed};
pub use queue::{DropReason, QueueStatsSnapshot};
pub use request::{DebugContext, RemoteAddr, RequestHead, TlsInfo};
pub use stacktrace::{SourceContext, StacktraceBuilder};
pub use transport::Transport;

pub use loom_recoverer_core::{Attachment, Event, Frame, HttpMetadata, Stacktrace};
