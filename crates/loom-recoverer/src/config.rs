// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::queue::{log_drop, DropHandler};
use crate::transport::Transport;

/// Default number of events waiting for delivery.
pub const DEFAULT_MAX_QUEUE: usize = 100;
/// Default number of delivery workers.
pub const DEFAULT_MAX_WORKERS: usize = 1;
/// Default per-send timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeouts below this are treated as "as short as possible".
const MIN_TIMEOUT: Duration = Duration::from_millis(1);
const FLOOR_TIMEOUT: Duration = Duration::from_micros(1);

/// Configuration for the recoverer client.
///
/// Zero values mean "not set" and are replaced by the defaults in
/// [`Config::normalized`].
#[derive(Clone)]
pub struct Config {
	/// Maximum events waiting for delivery; extra events are dropped.
	pub max_queue: usize,
	/// Number of delivery workers.
	pub max_workers: usize,
	/// Timeout handed to the transport for each send.
	pub timeout: Duration,
	/// Delivery backend. Required.
	pub transport: Option<Arc<dyn Transport>>,
	/// Crate whose frames are always in-app. Defaults to the executable name.
	pub entry_package: Option<String>,
	/// Package prefixes treated as application code.
	pub app_prefixes: Vec<String>,
	/// Directories display filenames are made relative to.
	pub source_roots: Option<Vec<PathBuf>>,
	/// Called for every event the queue refuses.
	pub on_drop: DropHandler,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			max_queue: DEFAULT_MAX_QUEUE,
			max_workers: DEFAULT_MAX_WORKERS,
			timeout: DEFAULT_TIMEOUT,
			transport: None,
			entry_package: None,
			app_prefixes: Vec::new(),
			source_roots: None,
			on_drop: Arc::new(log_drop),
		}
	}
}

impl Config {
	/// Applies defaults to unset values and floors tiny timeouts to 1µs.
	pub fn normalized(mut self) -> Self {
		if self.max_queue == 0 {
			self.max_queue = DEFAULT_MAX_QUEUE;
		}
		if self.max_workers == 0 {
			self.max_workers = DEFAULT_MAX_WORKERS;
		}
		if self.timeout.is_zero() {
			self.timeout = DEFAULT_TIMEOUT;
		} else if self.timeout < MIN_TIMEOUT {
			self.timeout = FLOOR_TIMEOUT;
		}
		self
	}
}

impl fmt::Debug for Config {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Config")
			.field("max_queue", &self.max_queue)
			.field("max_workers", &self.max_workers)
			.field("timeout", &self.timeout)
			.field("transport", &self.transport.as_ref().map(|_| "<transport>"))
			.field("entry_package", &self.entry_package)
			.field("app_prefixes", &self.app_prefixes)
			.field("source_roots", &self.source_roots)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let config = Config::default();
		assert_eq!(config.max_queue, 100);
		assert_eq!(config.max_workers, 1);
		assert_eq!(config.timeout, Duration::from_secs(30));
		assert!(config.transport.is_none());
	}

	#[test]
	fn zero_values_fall_back_to_defaults() {
		let config = Config {
			max_queue: 0,
			max_workers: 0,
			timeout: Duration::ZERO,
			..Default::default()
		}
		.normalized();

		assert_eq!(config.max_queue, DEFAULT_MAX_QUEUE);
		assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
		assert_eq!(config.timeout, DEFAULT_TIMEOUT);
	}

	#[test]
	fn sub_millisecond_timeout_is_floored_not_disabled() {
		let config = Config {
			timeout: Duration::from_micros(500),
			..Default::default()
		}
		.normalized();
		assert_eq!(config.timeout, Duration::from_micros(1));

		let config = Config {
			timeout: Duration::from_millis(1),
			..Default::default()
		}
		.normalized();
		assert_eq!(config.timeout, Duration::from_millis(1));
	}

	#[test]
	fn explicit_values_are_kept() {
		let config = Config {
			max_queue: 7,
			max_workers: 3,
			timeout: Duration::from_secs(2),
			..Default::default()
		}
		.normalized();
		assert_eq!((config.max_queue, config.max_workers), (7, 3));
		assert_eq!(config.timeout, Duration::from_secs(2));
	}
}
