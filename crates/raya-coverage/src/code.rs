//! Host-side view of compiled code and live frames.
//!
//! The tracer never owns the VM's code objects. It sees them through the
//! [`CodeUnit`] trait, identified by a stable [`CodeId`] handed out by the host,
//! and sees the executing frame through [`FrameContext`].

use crate::error::{TraceError, TraceResult};
use std::fmt;

/// Source line number (1-indexed)
pub type LineNo = u32;

/// A line number as an arc endpoint.
///
/// Lines above `i32::MAX` would wrap into the negative range reserved for
/// entry and exit sentinels, so they are rejected as malformed.
#[inline]
pub fn arc_point(code: CodeId, line: LineNo) -> TraceResult<i32> {
    i32::try_from(line)
        .map_err(|_| TraceError::malformed(code, format!("line {} out of range", line)))
}

/// Stable identity of a compiled function or module body.
///
/// Two handles refer to the same code unit iff their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub u64);

impl CodeId {
    /// Get the raw id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One instruction of a code unit, as far as line mapping is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Bytecode offset within the unit's code
    pub offset: u32,
    /// Line number if this instruction starts a new source line
    pub starts_line: Option<LineNo>,
}

impl Instruction {
    /// Instruction that starts `line`
    pub fn line_start(offset: u32, line: LineNo) -> Self {
        Self {
            offset,
            starts_line: Some(line),
        }
    }

    /// Instruction that continues the current line
    pub fn plain(offset: u32) -> Self {
        Self {
            offset,
            starts_line: None,
        }
    }
}

/// A compiled function or module body exposed by the host VM.
pub trait CodeUnit {
    /// Stable identity of this unit
    fn id(&self) -> CodeId;

    /// Function or module name (diagnostics only)
    fn name(&self) -> &str;

    /// Source file the unit was compiled from, as the VM reports it
    fn file_name(&self) -> &str;

    /// First source line of the unit (1-indexed)
    fn first_line(&self) -> LineNo;

    /// Instructions in offset order
    fn instructions(&self) -> &[Instruction];

    /// Entry sentinel for this unit: the negated first line.
    ///
    /// Fails for units that claim to start at line 0, which would make the
    /// sentinel collide with a real line.
    fn entry_sentinel(&self) -> TraceResult<i32> {
        let first = self.first_line();
        if first == 0 {
            return Err(TraceError::malformed(self.id(), "first line 0 out of range"));
        }
        Ok(-arc_point(self.id(), first)?)
    }
}

/// The executing frame at the moment an event is delivered.
pub trait FrameContext {
    /// Line the frame is currently on, if the host can tell
    fn line_number(&self) -> Option<LineNo>;
}

/// Frame context for hosts that have nothing to report
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFrame;

impl FrameContext for NoFrame {
    fn line_number(&self) -> Option<LineNo> {
        None
    }
}

/// Frame context that reports a fixed line
#[derive(Debug, Clone, Copy)]
pub struct AtLine(pub LineNo);

impl FrameContext for AtLine {
    fn line_number(&self) -> Option<LineNo> {
        Some(self.0)
    }
}

/// Owned code unit description.
///
/// Hosts that already keep a per-function line table can describe their
/// functions with this instead of implementing [`CodeUnit`] themselves.
#[derive(Debug, Clone)]
pub struct CodeObject {
    id: CodeId,
    name: String,
    file_name: String,
    first_line: LineNo,
    instructions: Vec<Instruction>,
}

impl CodeObject {
    /// Create a code object with an empty instruction list
    pub fn new(
        id: u64,
        name: impl Into<String>,
        file_name: impl Into<String>,
        first_line: LineNo,
    ) -> Self {
        Self {
            id: CodeId(id),
            name: name.into(),
            file_name: file_name.into(),
            first_line,
            instructions: Vec::new(),
        }
    }

    /// Append an instruction
    pub fn push_instruction(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Build from a sorted `(bytecode_offset, line)` line table.
    ///
    /// Each entry becomes a line-start instruction; `width` plain instructions
    /// follow each one so that offsets in between are covered too.
    pub fn with_line_table(mut self, table: &[(u32, LineNo)], width: u32) -> Self {
        for &(offset, line) in table {
            self.instructions.push(Instruction::line_start(offset, line));
            for step in 1..width {
                self.instructions.push(Instruction::plain(offset + step));
            }
        }
        self
    }
}

impl CodeUnit for CodeObject {
    fn id(&self) -> CodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn first_line(&self) -> LineNo {
        self.first_line
    }

    fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
}
