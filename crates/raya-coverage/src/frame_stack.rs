//! Per-thread mirror of the VM call stack.

use crate::code::CodeId;
use crate::data::FileData;
use crate::error::{TraceError, TraceResult};
use std::sync::Arc;

/// Tracing state of one active frame.
///
/// The tracer keeps the executing frame's entry as its "current" state; the
/// stack holds the entries of its callers.
#[derive(Debug, Clone, Default)]
pub struct FrameEntry {
    /// Data entry this frame records into, `None` when not traced
    pub file_data: Option<FileData>,
    /// File name of the frame's code, `None` when not traced
    pub file_name: Option<Arc<str>>,
    /// Last line executed in this frame, or the entry sentinel
    pub last_line: i32,
    /// Whether entering this frame switched in a new context
    pub started_context: bool,
}

impl FrameEntry {
    /// Whether lines in this frame are recorded
    #[inline]
    pub fn is_traced(&self) -> bool {
        self.file_data.is_some()
    }
}

/// Saved caller entries, innermost last
#[derive(Debug, Default)]
pub struct FrameStack {
    entries: Vec<FrameEntry>,
}

impl FrameStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Save the caller's entry when control enters or resumes a frame
    #[inline]
    pub fn enter(&mut self, caller: FrameEntry) {
        self.entries.push(caller);
    }

    /// Restore the caller's entry when control leaves a frame.
    ///
    /// `code` is the unit being left, for the error report.
    #[inline]
    pub fn leave(&mut self, code: CodeId) -> TraceResult<FrameEntry> {
        self.entries
            .pop()
            .ok_or(TraceError::StackUnderflow { code })
    }

    /// Number of saved entries
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry is saved
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every saved entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
