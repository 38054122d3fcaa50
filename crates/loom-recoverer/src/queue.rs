// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded event queue drained by a fixed pool of delivery workers.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use loom_recoverer_core::Event;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::Transport;

/// Why an event was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
	/// The queue was at capacity.
	QueueFull,
	/// The queue has been closed.
	Closed,
}

impl fmt::Display for DropReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::QueueFull => write!(f, "queue_full"),
			Self::Closed => write!(f, "closed"),
		}
	}
}

/// Called for every event the queue refuses.
pub type DropHandler = Arc<dyn Fn(&Event, DropReason) + Send + Sync>;

/// Default drop handler: a warning in the log.
pub fn log_drop(event: &Event, reason: DropReason) {
	warn!(kind = %event.kind, %reason, "Max queue backlog exceeded, dropping event");
}

/// Counters for queue activity.
#[derive(Debug, Default)]
pub struct QueueStats {
	accepted: AtomicU64,
	dropped: AtomicU64,
	delivered: AtomicU64,
	failed: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
	pub accepted: u64,
	pub dropped: u64,
	pub delivered: u64,
	pub failed: u64,
}

impl QueueStats {
	pub fn snapshot(&self) -> QueueStatsSnapshot {
		QueueStatsSnapshot {
			accepted: self.accepted.load(Ordering::Relaxed),
			dropped: self.dropped.load(Ordering::Relaxed),
			delivered: self.delivered.load(Ordering::Relaxed),
			failed: self.failed.load(Ordering::Relaxed),
		}
	}
}

/// Settings for a [`DeliveryQueue`].
#[derive(Clone)]
pub struct QueueConfig {
	pub capacity: usize,
	pub workers: usize,
	pub timeout: Duration,
	pub on_drop: DropHandler,
}

impl fmt::Debug for QueueConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("QueueConfig")
			.field("capacity", &self.capacity)
			.field("workers", &self.workers)
			.field("timeout", &self.timeout)
			.finish_non_exhaustive()
	}
}

/// Best-effort delivery queue.
///
/// `enqueue` never waits: when the queue is full the event is dropped and the
/// drop handler is told. Workers send one event at a time and discard the
/// result, so a failed delivery is never retried.
pub struct DeliveryQueue {
	tx: StdMutex<Option<mpsc::Sender<Event>>>,
	workers: Mutex<Vec<JoinHandle<()>>>,
	capacity: usize,
	on_drop: DropHandler,
	stats: Arc<QueueStats>,
}

impl DeliveryQueue {
	/// Creates the queue and spawns its workers on `runtime`.
	///
	/// `capacity` and `workers` are clamped to at least 1.
	pub fn new(config: QueueConfig, transport: Arc<dyn Transport>, runtime: &Handle) -> Self {
		let capacity = config.capacity.max(1);
		let worker_count = config.workers.max(1);
		let (tx, rx) = mpsc::channel(capacity);
		let rx = Arc::new(Mutex::new(rx));
		let stats = Arc::new(QueueStats::default());

		let workers = (0..worker_count)
			.map(|id| {
				runtime.spawn(worker(
					id,
					Arc::clone(&rx),
					Arc::clone(&transport),
					config.timeout,
					Arc::clone(&stats),
				))
			})
			.collect();

		info!(capacity, workers = worker_count, "Delivery queue started");

		Self {
			tx: StdMutex::new(Some(tx)),
			workers: Mutex::new(workers),
			capacity,
			on_drop: config.on_drop,
			stats,
		}
	}

	/// Queues an event for delivery without waiting.
	///
	/// Returns `true` if the event was queued, `false` if it was dropped.
	pub fn enqueue(&self, event: Event) -> bool {
		let result = {
			let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
			match tx.as_ref() {
				Some(tx) => tx.try_send(event),
				None => Err(TrySendError::Closed(event)),
			}
		};

		match result {
			Ok(()) => {
				self.stats.accepted.fetch_add(1, Ordering::Relaxed);
				true
			}
			Err(TrySendError::Full(event)) => {
				self.reject(&event, DropReason::QueueFull);
				false
			}
			Err(TrySendError::Closed(event)) => {
				self.reject(&event, DropReason::Closed);
				false
			}
		}
	}

	/// Stops accepting events, waits for the workers to drain everything
	/// already queued, and returns once all of them have exited.
	pub async fn close(&self) {
		let mut workers = self.workers.lock().await;

		let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
		if tx.is_none() && workers.is_empty() {
			return;
		}
		drop(tx);

		for handle in workers.drain(..) {
			if let Err(e) = handle.await {
				warn!(error = %e, "Delivery worker exited abnormally");
			}
		}

		let stats = self.stats.snapshot();
		info!(
			delivered = stats.delivered,
			failed = stats.failed,
			dropped = stats.dropped,
			"Delivery queue closed"
		);
	}

	pub fn is_closed(&self) -> bool {
		self.tx
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.is_none()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn stats(&self) -> QueueStatsSnapshot {
		self.stats.snapshot()
	}

	fn reject(&self, event: &Event, reason: DropReason) {
		self.stats.dropped.fetch_add(1, Ordering::Relaxed);
		(self.on_drop)(event, reason);
	}
}

impl fmt::Debug for DeliveryQueue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DeliveryQueue")
			.field("capacity", &self.capacity)
			.field("closed", &self.is_closed())
			.field("stats", &self.stats())
			.finish_non_exhaustive()
	}
}

async fn worker(
	id: usize,
	rx: Arc<Mutex<mpsc::Receiver<Event>>>,
	transport: Arc<dyn Transport>,
	timeout: Duration,
	stats: Arc<QueueStats>,
) {
	loop {
		// Hold the receiver only while waiting, never across a send.
		let next = rx.lock().await.recv().await;
		let Some(event) = next else {
			break;
		};

		let outcome = AssertUnwindSafe(transport.send(&event, timeout))
			.catch_unwind()
			.await;

		match outcome {
			Ok(Ok(())) => {
				stats.delivered.fetch_add(1, Ordering::Relaxed);
			}
			Ok(Err(e)) => {
				stats.failed.fetch_add(1, Ordering::Relaxed);
				debug!(worker = id, error = %e, "Event delivery failed, discarding");
			}
			Err(_) => {
				stats.failed.fetch_add(1, Ordering::Relaxed);
				warn!(worker = id, "Transport panicked, discarding event");
			}
		}
	}

	debug!(worker = id, "Delivery worker stopped");
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::TransportError;
	use async_trait::async_trait;
	use std::sync::atomic::AtomicUsize;

	#[derive(Default)]
	struct RecordingTransport {
		kinds: StdMutex<Vec<String>>,
	}

	impl RecordingTransport {
		fn kinds(&self) -> Vec<String> {
			self.kinds.lock().unwrap().clone()
		}
	}

	#[async_trait]
	impl Transport for RecordingTransport {
		async fn send(&self, event: &Event, _timeout: Duration) -> Result<(), TransportError> {
			tokio::task::yield_now().await;
			self.kinds.lock().unwrap().push(event.kind.clone());
			Ok(())
		}
	}

	struct FlakyTransport {
		calls: AtomicUsize,
		delivered: StdMutex<Vec<String>>,
	}

	#[async_trait]
	impl Transport for FlakyTransport {
		async fn send(&self, event: &Event, _timeout: Duration) -> Result<(), TransportError> {
			match self.calls.fetch_add(1, Ordering::SeqCst) {
				0 => Err(TransportError::Other("connection reset".to_string())),
				1 => panic!("transport bug"),
				_ => {
					self.delivered.lock().unwrap().push(event.kind.clone());
					Ok(())
				}
			}
		}
	}

	fn config(capacity: usize, workers: usize) -> QueueConfig {
		QueueConfig {
			capacity,
			workers,
			timeout: Duration::from_secs(1),
			on_drop: Arc::new(log_drop),
		}
	}

	fn event(n: usize) -> Event {
		Event::new(format!("event{n}"))
	}

	// The current-thread runtime does not run workers until the test yields,
	// so everything below is enqueued before any event is consumed.

	#[tokio::test]
	async fn overflow_drops_only_the_extra_event() {
		let transport = Arc::new(RecordingTransport::default());
		let dropped = Arc::new(StdMutex::new(Vec::new()));
		let dropped_clone = Arc::clone(&dropped);
		let queue = DeliveryQueue::new(
			QueueConfig {
				on_drop: Arc::new(move |e: &Event, reason: DropReason| {
					dropped_clone.lock().unwrap().push((e.kind.clone(), reason));
				}),
				..config(3, 1)
			},
			transport.clone(),
			&Handle::current(),
		);

		let accepted: Vec<bool> = (0..4).map(|n| queue.enqueue(event(n))).collect();
		assert_eq!(accepted, vec![true, true, true, false]);

		queue.close().await;

		assert_eq!(transport.kinds(), vec!["event0", "event1", "event2"]);
		assert_eq!(
			*dropped.lock().unwrap(),
			vec![("event3".to_string(), DropReason::QueueFull)]
		);
		let stats = queue.stats();
		assert_eq!(stats.accepted, 3);
		assert_eq!(stats.dropped, 1);
		assert_eq!(stats.delivered, 3);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn close_delivers_every_accepted_event_once() {
		let transport = Arc::new(RecordingTransport::default());
		let queue = DeliveryQueue::new(config(100, 4), transport.clone(), &Handle::current());

		let mut accepted = Vec::new();
		for n in 0..100 {
			if queue.enqueue(event(n)) {
				accepted.push(format!("event{n}"));
			}
		}

		queue.close().await;

		let mut delivered = transport.kinds();
		delivered.sort();
		accepted.sort();
		assert_eq!(delivered, accepted);
		assert_eq!(queue.stats().delivered as usize, accepted.len());
	}

	#[tokio::test]
	async fn enqueue_after_close_is_rejected() {
		let transport = Arc::new(RecordingTransport::default());
		let queue = DeliveryQueue::new(config(10, 2), transport.clone(), &Handle::current());

		assert!(queue.enqueue(event(0)));
		queue.close().await;
		assert!(queue.is_closed());
		assert!(!queue.enqueue(event(1)));

		assert_eq!(transport.kinds(), vec!["event0"]);
		assert_eq!(queue.stats().dropped, 1);
	}

	#[tokio::test]
	async fn close_twice_is_harmless() {
		let queue = DeliveryQueue::new(
			config(1, 1),
			Arc::new(RecordingTransport::default()),
			&Handle::current(),
		);
		queue.close().await;
		queue.close().await;
	}

	#[tokio::test]
	async fn failures_do_not_stop_the_worker() {
		let transport = Arc::new(FlakyTransport {
			calls: AtomicUsize::new(0),
			delivered: StdMutex::new(Vec::new()),
		});
		let queue = DeliveryQueue::new(config(10, 1), transport.clone(), &Handle::current());

		for n in 0..4 {
			assert!(queue.enqueue(event(n)));
		}
		queue.close().await;

		assert_eq!(*transport.delivered.lock().unwrap(), vec!["event2", "event3"]);
		let stats = queue.stats();
		assert_eq!(stats.failed, 2);
		assert_eq!(stats.delivered, 2);
	}

	#[tokio::test]
	async fn zero_sizes_are_clamped() {
		let transport = Arc::new(RecordingTransport::default());
		let queue = DeliveryQueue::new(config(0, 0), transport.clone(), &Handle::current());
		assert_eq!(queue.capacity(), 1);
		assert!(queue.enqueue(event(0)));
		assert!(!queue.enqueue(event(1)));
		queue.close().await;
		assert_eq!(transport.kinds(), vec!["event0"]);
	}
}
