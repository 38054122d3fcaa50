// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Panic observation for units of work.
//!
//! A process-wide hook is installed once and chains whatever hook was
//! registered before it. While a unit of work is being polled, its thread
//! carries an observation scope; a panic inside the scope captures the
//! stack at the panic site into that scope instead of printing. Panics
//! outside any scope go to the previous hook unchanged.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, Location};
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context, Poll};

use loom_recoverer_core::Stacktrace;
use pin_project_lite::pin_project;
use tracing::error;

use crate::stacktrace::{SourceContext, StacktraceBuilder};

/// Frames between the builder's capture and the panic machinery:
/// `record_panic` and the hook closure. Only used when the machinery
/// frames cannot be resolved.
const PANIC_HOOK_SKIP: usize = 2;
/// Source lines kept around each captured frame.
const PANIC_CONTEXT_LINES: i32 = 3;

static INSTALL: Once = Once::new();

thread_local! {
	static SCOPE: RefCell<Option<Scope>> = const { RefCell::new(None) };
}

/// What a panic inside an observed unit of work produced.
#[derive(Debug, Clone)]
pub struct Fault {
	pub message: String,
	pub location: Option<String>,
	pub stacktrace: Stacktrace,
}

impl fmt::Display for Fault {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.location {
			Some(location) => write!(f, "{} at {}", self.message, location),
			None => f.write_str(&self.message),
		}
	}
}

/// How panics inside a scope are captured.
#[derive(Clone)]
pub(crate) struct CaptureSettings {
	pub stacktraces: Arc<StacktraceBuilder>,
	pub app_prefixes: Arc<[String]>,
}

struct Scope {
	settings: CaptureSettings,
	fault: Option<Fault>,
}

/// Restores the enclosing scope when dropped, so nested observation works.
struct ScopeGuard {
	previous: Option<Option<Scope>>,
}

impl ScopeGuard {
	fn enter(settings: CaptureSettings) -> Self {
		let scope = Scope {
			settings,
			fault: None,
		};
		let previous = SCOPE.with(|slot| slot.replace(Some(scope)));
		Self {
			previous: Some(previous),
		}
	}

	/// Leaves the scope, returning the fault recorded inside it.
	fn finish(mut self) -> Option<Fault> {
		let previous = self.previous.take().unwrap_or_default();
		SCOPE
			.with(|slot| slot.replace(previous))
			.and_then(|scope| scope.fault)
	}
}

impl Drop for ScopeGuard {
	fn drop(&mut self) {
		if let Some(previous) = self.previous.take() {
			let _ = SCOPE.try_with(|slot| slot.replace(previous));
		}
	}
}

/// Installs the process-wide hook. Later calls do nothing.
pub(crate) fn install_panic_hook() {
	INSTALL.call_once(|| {
		let previous = panic::take_hook();
		panic::set_hook(Box::new(move |info| match active_settings() {
			Some(settings) => record_panic(&settings, info.payload(), info.location()),
			None => previous(info),
		}));
	});
}

fn active_settings() -> Option<CaptureSettings> {
	SCOPE
		.try_with(|slot| {
			let slot = slot.try_borrow().ok()?;
			slot.as_ref().map(|scope| scope.settings.clone())
		})
		.ok()
		.flatten()
}

#[inline(never)]
fn record_panic(
	settings: &CaptureSettings,
	payload: &(dyn Any + Send),
	location: Option<&Location<'_>>,
) {
	let stacktrace = settings.stacktraces.capture_panic_site(
		PANIC_HOOK_SKIP,
		SourceContext::from_radius(PANIC_CONTEXT_LINES),
		&settings.app_prefixes,
	);
	let fault = Fault {
		message: payload_message(payload),
		location: location.map(|l| l.to_string()),
		stacktrace,
	};

	error!(
		message = %fault.message,
		location = fault.location.as_deref().unwrap_or("unknown"),
		frames = fault.stacktrace.len(),
		"Panic recovered"
	);

	let _ = SCOPE.try_with(|slot| {
		if let Ok(mut slot) = slot.try_borrow_mut() {
			if let Some(scope) = slot.as_mut() {
				scope.fault = Some(fault);
			}
		}
	});
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"Box<dyn Any>".to_string()
	}
}

/// Fault for a panic the hook did not see, e.g. because another hook
/// replaced ours. The stack is taken where the unwind was caught.
#[inline(never)]
fn unobserved_fault(settings: &CaptureSettings, payload: &(dyn Any + Send)) -> Fault {
	Fault {
		message: payload_message(payload),
		location: None,
		stacktrace: settings.stacktraces.capture(
			1,
			SourceContext::from_radius(PANIC_CONTEXT_LINES),
			&settings.app_prefixes,
		),
	}
}

pin_project! {
	/// A future whose panics are caught and turned into a [`Fault`].
	#[must_use = "futures do nothing unless polled"]
	pub struct Observed<F> {
		#[pin]
		inner: F,
		settings: CaptureSettings,
	}
}

impl<F> Observed<F> {
	pub(crate) fn new(inner: F, settings: CaptureSettings) -> Self {
		Self { inner, settings }
	}
}

impl<F: Future> Future for Observed<F> {
	type Output = Result<F::Output, Fault>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();
		let inner = this.inner;

		let scope = ScopeGuard::enter(this.settings.clone());
		let result = panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx)));
		let recorded = scope.finish();

		match result {
			Ok(Poll::Pending) => Poll::Pending,
			Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
			Err(payload) => Poll::Ready(Err(
				recorded.unwrap_or_else(|| unobserved_fault(this.settings, payload.as_ref()))
			)),
		}
	}
}

/// Runs `f`, catching a panic the same way [`Observed`] does.
pub(crate) fn observe_blocking<T>(
	settings: &CaptureSettings,
	f: impl FnOnce() -> T,
) -> Result<T, Fault> {
	let scope = ScopeGuard::enter(settings.clone());
	let result = panic::catch_unwind(AssertUnwindSafe(f));
	let recorded = scope.finish();

	result.map_err(|payload| {
		recorded.unwrap_or_else(|| unobserved_fault(settings, payload.as_ref()))
	})
}
