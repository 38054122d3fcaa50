// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Stack capture, frame classification and source context.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use loom_recoverer_core::{Frame, Stacktrace};
use rustc_demangle::try_demangle;
use tracing::debug;

/// Package fragments that mark vendored or third-party code.
const VENDOR_MARKERS: &[&str] = &["vendor", "third_party"];

/// Panic machinery between the panicking frame and the panic hook.
const PANIC_TRAMPOLINE_PACKAGES: &[&str] = &["std::panicking", "core::panicking"];
/// Trampoline entry points; only matched inside [`TRAMPOLINE_HOSTS`] or
/// for unqualified symbols.
const PANIC_TRAMPOLINE_FUNCTIONS: &[&str] = &[
	"rust_begin_unwind",
	"rust_panic",
	"__rust_start_panic",
	"__rust_end_short_backtrace",
];

const TRAMPOLINE_HOSTS: &[&str] = &["std", "core", "__rustc"];

/// Crates that make up the runtime itself.
const RUNTIME_PACKAGES: &[&str] = &["std", "core", "alloc", "__rustc"];

/// OS and libc shims that start and tear down threads. Only matched for
/// unqualified symbols or inside `std::sys`.
const THREAD_EXIT_FUNCTIONS: &[&str] = &[
	"_start",
	"__libc_start_main",
	"__libc_start_call_main",
	"start_thread",
	"thread_start",
	"clone",
	"clone3",
	"_pthread_start",
	"thread_start_fn",
	"BaseThreadInitThunk",
	"RtlUserThreadStart",
];

/// How many source lines to attach to each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceContext {
	/// No source lines.
	#[default]
	None,
	/// Only the line the frame points at.
	Line,
	/// The frame's line plus up to this many lines on either side.
	Lines(usize),
}

impl SourceContext {
	/// Maps an integer radius: `> 0` is a window, `-1` a single line, anything
	/// else no context.
	pub fn from_radius(radius: i32) -> Self {
		match radius {
			r if r > 0 => Self::Lines(r as usize),
			-1 => Self::Line,
			_ => Self::None,
		}
	}
}

/// Source lines around a frame's line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceWindow {
	pub pre: Vec<String>,
	pub line: String,
	pub post: Vec<String>,
}

/// Lazily filled cache of source files, split into lines.
///
/// Entries are never evicted. Reads and inserts share one lock.
#[derive(Debug, Default)]
pub struct SourceLineCache {
	files: Mutex<HashMap<PathBuf, Arc<[Vec<u8>]>>>,
	loads: AtomicUsize,
}

impl SourceLineCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of files read from disk so far.
	pub fn loads(&self) -> usize {
		self.loads.load(Ordering::Relaxed)
	}

	/// Number of files held in the cache.
	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Returns up to `radius` lines on either side of the 1-based `line`,
	/// clamped to the file. `None` if the file cannot be read or the line is
	/// outside it.
	pub fn window(&self, path: &Path, line: u32, radius: usize) -> Option<SourceWindow> {
		let lines = self.lines(path)?;
		let idx = (line as usize).checked_sub(1)?;
		if idx >= lines.len() {
			return None;
		}

		let start = idx.saturating_sub(radius);
		let end = idx.saturating_add(radius).saturating_add(1).min(lines.len());
		let text = |l: &Vec<u8>| String::from_utf8_lossy(l).into_owned();

		Some(SourceWindow {
			pre: lines[start..idx].iter().map(text).collect(),
			line: text(&lines[idx]),
			post: lines[idx + 1..end].iter().map(text).collect(),
		})
	}

	fn lines(&self, path: &Path) -> Option<Arc<[Vec<u8>]>> {
		let mut files = self.lock();
		if let Some(lines) = files.get(path) {
			return Some(Arc::clone(lines));
		}

		let data = match std::fs::read(path) {
			Ok(data) => data,
			Err(e) => {
				debug!(path = %path.display(), error = %e, "source file unavailable");
				return None;
			}
		};
		self.loads.fetch_add(1, Ordering::Relaxed);

		let lines: Arc<[Vec<u8>]> = data.split(|b| *b == b'\n').map(<[u8]>::to_vec).collect();
		files.insert(path.to_path_buf(), Arc::clone(&lines));
		Some(lines)
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<[Vec<u8>]>>> {
		self.files.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// Captures stacktraces and classifies their frames.
///
/// One builder is shared by every capture of a client, so the source cache
/// is reused across events.
#[derive(Debug)]
pub struct StacktraceBuilder {
	entry_package: String,
	source_roots: Vec<PathBuf>,
	cache: SourceLineCache,
}

impl StacktraceBuilder {
	/// Creates a builder that treats `entry_package` (and its modules) as
	/// application code.
	pub fn new(entry_package: impl Into<String>) -> Self {
		Self {
			entry_package: entry_package.into(),
			source_roots: default_source_roots(),
			cache: SourceLineCache::new(),
		}
	}

	/// Replaces the directories that display filenames are made relative to.
	pub fn with_source_roots(mut self, roots: Vec<PathBuf>) -> Self {
		self.source_roots = roots;
		self
	}

	pub fn entry_package(&self) -> &str {
		&self.entry_package
	}

	pub fn cache(&self) -> &SourceLineCache {
		&self.cache
	}

	/// Captures the current call stack.
	///
	/// The first frame is the caller of `capture` when `skip` is 0, its
	/// caller when `skip` is 1, and so on. Frames are ordered innermost
	/// first.
	#[inline(never)]
	pub fn capture(
		&self,
		skip: usize,
		context: SourceContext,
		app_prefixes: &[String],
	) -> Stacktrace {
		let symbols = walk_stack();

		// Everything up to and including this function is capture machinery.
		let anchor = anchor_index(&symbols, "::capture");
		self.build(symbols, anchor + skip, context, app_prefixes)
	}

	/// Captures the stack from inside a panic hook.
	///
	/// Frames up to and including the last panic machinery frame (the hook
	/// dispatch shim, `std::panicking`, `core::panicking` and the short
	/// backtrace markers) are dropped, so the first frame is the function
	/// that panicked. If no machinery frame resolves, `fallback_skip` frames
	/// above the caller are skipped instead.
	#[inline(never)]
	pub fn capture_panic_site(
		&self,
		fallback_skip: usize,
		context: SourceContext,
		app_prefixes: &[String],
	) -> Stacktrace {
		let symbols = walk_stack();
		let anchor = anchor_index(&symbols, "::capture_panic_site");
		let start = panic_site_offset(&symbols[anchor..])
			.map_or(anchor + fallback_skip, |offset| anchor + offset);
		self.build(symbols, start, context, app_prefixes)
	}

	fn build(
		&self,
		symbols: Vec<RawSymbol>,
		start: usize,
		context: SourceContext,
		app_prefixes: &[String],
	) -> Stacktrace {
		symbols
			.into_iter()
			.skip(start)
			.filter_map(|s| {
				self.frame(&s.name, s.path.as_deref(), s.line, context, app_prefixes)
			})
			.collect()
	}

	/// Builds one frame from a demangled symbol and its location.
	///
	/// Returns `None` for panic trampoline and thread start frames.
	pub fn frame(
		&self,
		symbol: &str,
		path: Option<&Path>,
		line: u32,
		context: SourceContext,
		app_prefixes: &[String],
	) -> Option<Frame> {
		let (package, function) = split_symbol(symbol);
		if is_sentinel(package, function) {
			return None;
		}

		let in_app = self.is_in_app(package, app_prefixes);
		let filename = path.map(|p| self.display_path(p)).unwrap_or_default();
		let frame = Frame::new(filename, package, function, line, in_app);

		let Some(path) = path else {
			return Some(frame);
		};
		let frame = frame.with_abs_path(path.display().to_string());

		let window = match context {
			SourceContext::None => None,
			SourceContext::Line => self.cache.window(path, line, 0),
			SourceContext::Lines(radius) => self.cache.window(path, line, radius),
		};

		Some(match window {
			Some(w) => frame.with_context(w.pre, Some(w.line), w.post),
			None => frame,
		})
	}

	/// Whether frames in `package` count as application code.
	pub fn is_in_app(&self, package: &str, app_prefixes: &[String]) -> bool {
		let package = package.trim_start_matches('<');
		if is_module_of(package, &self.entry_package) {
			return true;
		}

		app_prefixes.iter().any(|prefix| {
			package.starts_with(prefix.as_str())
				&& !VENDOR_MARKERS.iter().any(|m| package.contains(m))
		})
	}

	fn display_path(&self, path: &Path) -> String {
		self.source_roots
			.iter()
			.find_map(|root| path.strip_prefix(root).ok())
			.unwrap_or(path)
			.display()
			.to_string()
	}
}

struct RawSymbol {
	name: String,
	path: Option<PathBuf>,
	line: u32,
}

/// Resolves every frame of the current stack. Inlined calls come out as
/// separate symbols; frames without a symbol are dropped.
fn walk_stack() -> Vec<RawSymbol> {
	let mut symbols = Vec::new();
	backtrace::trace(|frame| {
		backtrace::resolve_frame(frame, |symbol| {
			let Some(name) = symbol.name() else {
				return;
			};
			symbols.push(RawSymbol {
				name: demangle(name.as_str().unwrap_or_default()),
				path: symbol.filename().map(Path::to_path_buf),
				line: symbol.lineno().unwrap_or(0),
			});
		});
		true
	});
	symbols
}

fn demangle(raw: &str) -> String {
	match try_demangle(raw) {
		Ok(demangled) => format!("{demangled:#}"),
		Err(_) => raw.to_string(),
	}
}

/// Index just past the builder method named by `method`, or 0.
fn anchor_index(symbols: &[RawSymbol], method: &str) -> usize {
	symbols
		.iter()
		.position(|s| s.name.contains("StacktraceBuilder") && s.name.ends_with(method))
		.map_or(0, |idx| idx + 1)
}

/// Offset just past the innermost run of panic machinery. Runtime frames
/// inside the run (e.g. `core::result::unwrap_failed`) do not end it; the
/// first frame outside the runtime does.
fn panic_site_offset(symbols: &[RawSymbol]) -> Option<usize> {
	let mut last = None;
	for (idx, symbol) in symbols.iter().enumerate() {
		let (package, function) = split_symbol(&symbol.name);
		if is_panic_machinery(package, function) {
			last = Some(idx);
		} else if last.is_some() && !is_runtime_package(package) {
			break;
		}
	}
	last.map(|idx| idx + 1)
}

fn is_panic_machinery(package: &str, function: &str) -> bool {
	is_panic_trampoline(package, function) || is_hook_dispatch(package, function)
}

/// `<Box<dyn Fn(&PanicHookInfo)> as Fn<..>>::call`, the shim std uses to
/// invoke the installed hook.
fn is_hook_dispatch(package: &str, function: &str) -> bool {
	function == "call"
		&& package.trim_start_matches('<').starts_with("alloc::boxed::Box<")
		&& (package.contains("PanicHookInfo") || package.contains("PanicInfo"))
}

fn is_runtime_package(package: &str) -> bool {
	let package = package.trim_start_matches('<');
	RUNTIME_PACKAGES.iter().any(|p| is_module_of(package, p))
}

fn is_module_of(package: &str, module: &str) -> bool {
	!module.is_empty()
		&& package
			.strip_prefix(module)
			.is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

fn is_sentinel(package: &str, function: &str) -> bool {
	is_panic_trampoline(package, function) || is_thread_shim(package, function)
}

fn is_panic_trampoline(package: &str, function: &str) -> bool {
	PANIC_TRAMPOLINE_PACKAGES
		.iter()
		.any(|p| is_module_of(package, p))
		|| (PANIC_TRAMPOLINE_FUNCTIONS.contains(&function)
			&& (package.is_empty() || TRAMPOLINE_HOSTS.iter().any(|p| is_module_of(package, p))))
}

fn is_thread_shim(package: &str, function: &str) -> bool {
	THREAD_EXIT_FUNCTIONS.contains(&function)
		&& (package.is_empty() || is_module_of(package, "std::sys"))
}

/// Drops a trailing `::<..>` generic argument list, as in
/// `a::f::<T, U>`.
fn strip_trailing_generics(symbol: &str) -> &str {
	if !symbol.ends_with('>') {
		return symbol;
	}

	let bytes = symbol.as_bytes();
	let mut depth = 0usize;
	for i in (0..bytes.len()).rev() {
		match bytes[i] {
			b'>' if i == 0 || bytes[i - 1] != b'-' => depth += 1,
			b'<' => {
				depth = depth.saturating_sub(1);
				if depth == 0 {
					return symbol[..i].strip_suffix("::").unwrap_or(symbol);
				}
			}
			_ => {}
		}
	}
	symbol
}

/// Splits `a::b::<T as c::D>::f` into package and function at the last `::`
/// outside angle brackets. A trailing turbofish (`a::f::<T>`) is ignored.
/// Symbols without a path separator have no package.
pub fn split_symbol(symbol: &str) -> (&str, &str) {
	let symbol = strip_trailing_generics(symbol);
	let bytes = symbol.as_bytes();
	let mut depth = 0usize;
	let mut split = None;
	let mut i = 0;

	while i < bytes.len() {
		match bytes[i] {
			b'<' => depth += 1,
			// `->` inside fn pointer types is not a closing bracket
			b'>' if i == 0 || bytes[i - 1] != b'-' => depth = depth.saturating_sub(1),
			b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
				split = Some(i);
				i += 1;
			}
			_ => {}
		}
		i += 1;
	}

	match split {
		Some(idx) => (&symbol[..idx], &symbol[idx + 2..]),
		None => ("", symbol),
	}
}

/// Directories display paths are trimmed against: the working directory and
/// the cargo registry sources.
fn default_source_roots() -> Vec<PathBuf> {
	let mut roots = Vec::new();
	if let Ok(cwd) = std::env::current_dir() {
		roots.push(cwd);
	}
	let cargo_home = std::env::var_os("CARGO_HOME")
		.map(PathBuf::from)
		.or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cargo")));
	if let Some(cargo_home) = cargo_home {
		roots.push(cargo_home.join("registry").join("src"));
	}
	roots
}

/// Crate name of the running executable, used as the default entry package.
///
/// Cargo appends `-<16 hex digits>` to test and example binaries; that
/// suffix is dropped.
pub fn default_entry_package() -> String {
	let stem = std::env::current_exe()
		.ok()
		.and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()));

	let Some(stem) = stem else {
		return "main".to_string();
	};

	let name = match stem.rsplit_once('-') {
		Some((name, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {
			name
		}
		_ => stem.as_str(),
	};
	name.replace('-', "_")
}
