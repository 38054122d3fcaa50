// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Stacktrace and frame types.

use serde::{Deserialize, Serialize};

/// Stack trace, innermost frame (closest to the fault) first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stacktrace {
	frames: Vec<Frame>,
}

impl Stacktrace {
	pub fn new(frames: Vec<Frame>) -> Self {
		Self { frames }
	}

	pub fn frames(&self) -> &[Frame] {
		&self.frames
	}

	pub fn len(&self) -> usize {
		self.frames.len()
	}

	pub fn is_empty(&self) -> bool {
		self.frames.is_empty()
	}

	/// Returns `package.function` of the frame that best represents where the
	/// fault happened, or an empty string if no frame has both set.
	///
	/// The first frame with a package and a function is the fallback. The
	/// first in-app frame with both set wins as soon as it is seen.
	pub fn culprit(&self) -> String {
		let mut culprit: Option<&Frame> = None;

		for frame in self.frames.iter().filter(|f| f.is_qualified()) {
			if frame.in_app {
				culprit = Some(frame);
				break;
			}
			if culprit.is_none() {
				culprit = Some(frame);
			}
		}

		culprit
			.map(|f| format!("{}.{}", f.package, f.function))
			.unwrap_or_default()
	}
}

impl FromIterator<Frame> for Stacktrace {
	fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
		Self::new(iter.into_iter().collect())
	}
}

/// A single resolved stack frame.
///
/// Frames are immutable once built: `in_app` and the source context are
/// decided by whoever constructs the frame and cannot be changed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
	#[serde(rename = "file")]
	filename: String,
	function: String,
	line: u32,
	package: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	abs_path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	context_line: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pre_context: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	post_context: Vec<String>,
	#[serde(default)]
	in_app: bool,
}

impl Frame {
	pub fn new(
		filename: impl Into<String>,
		package: impl Into<String>,
		function: impl Into<String>,
		line: u32,
		in_app: bool,
	) -> Self {
		Self {
			filename: filename.into(),
			function: function.into(),
			line,
			package: package.into(),
			in_app,
			..Default::default()
		}
	}

	/// Records the path the frame's source was resolved to.
	pub fn with_abs_path(mut self, path: impl Into<String>) -> Self {
		self.abs_path = Some(path.into());
		self
	}

	/// Attaches source lines around [`Frame::line`].
	pub fn with_context(
		mut self,
		pre_context: Vec<String>,
		context_line: Option<String>,
		post_context: Vec<String>,
	) -> Self {
		self.pre_context = pre_context;
		self.context_line = context_line;
		self.post_context = post_context;
		self
	}

	/// Display path, relative to a source root when one matched.
	pub fn filename(&self) -> &str {
		&self.filename
	}

	pub fn abs_path(&self) -> Option<&str> {
		self.abs_path.as_deref()
	}

	pub fn function(&self) -> &str {
		&self.function
	}

	pub fn package(&self) -> &str {
		&self.package
	}

	/// 1-based line number, 0 when unknown.
	pub fn line(&self) -> u32 {
		self.line
	}

	pub fn in_app(&self) -> bool {
		self.in_app
	}

	pub fn context_line(&self) -> Option<&str> {
		self.context_line.as_deref()
	}

	pub fn pre_context(&self) -> &[String] {
		&self.pre_context
	}

	pub fn post_context(&self) -> &[String] {
		&self.post_context
	}

	fn is_qualified(&self) -> bool {
		!self.package.is_empty() && !self.function.is_empty()
	}
}
