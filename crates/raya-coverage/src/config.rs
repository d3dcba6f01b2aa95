//! Tracer configuration

use crate::data::TraceMode;
use crate::monitor::{ToolId, COVERAGE_ID};

/// Tracer configuration (immutable after creation).
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Record arcs instead of lines
    pub trace_arcs: bool,
    /// Tool slot claimed from the host (default: [`COVERAGE_ID`])
    pub tool_id: ToolId,
    /// Name registered with the tool slot
    pub tool_name: String,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            trace_arcs: false,
            tool_id: COVERAGE_ID,
            tool_name: "raya-coverage".to_string(),
        }
    }
}

impl TracerConfig {
    /// Line-recording configuration
    pub fn lines() -> Self {
        Self::default()
    }

    /// Arc-recording configuration
    pub fn arcs() -> Self {
        Self {
            trace_arcs: true,
            ..Self::default()
        }
    }

    /// Data store mode matching this configuration
    pub fn mode(&self) -> TraceMode {
        TraceMode::from_trace_arcs(self.trace_arcs)
    }
}
