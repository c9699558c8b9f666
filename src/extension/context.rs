/// Explicit ancestry of extension invocations, threaded through every handler
/// call in place of the ambient task-local state the original relied on.
///
/// A handler issuing nested pipeline calls passes its
/// [`HandlerArgs::context`](super::HandlerArgs) back in, which is how the
/// compact stage set suppresses a handler re-firing for a model an ancestor
/// invocation is already addressing.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
	frames: Vec<Frame>,
}

#[derive(Debug, Clone)]
struct Frame {
	slug: String,
	stage_index: usize,
}

impl InvocationContext {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_root(&self) -> bool {
		self.frames.is_empty()
	}

	pub fn depth(&self) -> usize {
		self.frames.len()
	}

	/// The context a handler invoked for `slug` at `stage_index` hands to its
	/// own nested pipeline calls.
	pub(crate) fn child(&self, slug: &str, stage_index: usize) -> Self {
		let mut frames = self.frames.clone();
		frames.push(Frame {
			slug: slug.to_string(),
			stage_index,
		});
		Self { frames }
	}

	/// True when an ancestor invocation at the same or a later stage index is
	/// already addressing `slug`.
	pub(crate) fn suppresses(&self, slug: &str, stage_index: usize) -> bool {
		self.frames
			.iter()
			.any(|frame| frame.slug == slug && frame.stage_index >= stage_index)
	}
}
