//! Context hooks and the warning sink supplied by the tracer's owner.

use crate::code::FrameContext;
use std::sync::Arc;

/// Hooks for tagging collected data with a logical context (e.g. the test
/// that produced it).
///
/// The tracer asks [`should_start_context`](ContextHooks::should_start_context)
/// on unit entry while no context is active, and switches back to `None` when
/// the unit that started a context returns.
pub trait ContextHooks: Send + Sync {
    /// Name of a context to start for the entered frame, if any
    fn should_start_context(&self, frame: &dyn FrameContext) -> Option<String>;

    /// Make `name` the active context (`None` ends it)
    fn switch_context(&self, name: Option<&str>);
}

/// Sink for non-fatal diagnostics
pub type WarnFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Warning sink used when the owner installs none: forwards to `tracing`.
pub fn log_warning() -> WarnFn {
    Arc::new(|message: &str| tracing::warn!("{}", message))
}
