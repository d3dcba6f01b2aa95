//! Bytecode offset to source line mapping for a single code unit.

use crate::code::{arc_point, CodeUnit, LineNo};
use crate::error::{TraceError, TraceResult};

/// Offset → line table for one code unit.
///
/// Holds one entry per instruction, sorted by offset. Instructions between two
/// line-start markers carry the most recent line start; instructions ahead of
/// the first marker carry the unit's first line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineIndex {
    entries: Vec<(u32, LineNo)>,
}

impl LineIndex {
    /// Build the index for `code`.
    ///
    /// Fails if offsets are not strictly increasing, or a marker names line 0
    /// or a line too large to appear in an arc.
    pub fn build<C: CodeUnit + ?Sized>(code: &C) -> TraceResult<Self> {
        let instructions = code.instructions();
        let mut entries = Vec::with_capacity(instructions.len());
        let mut cur_line = code.first_line();
        let mut prev_offset: Option<u32> = None;

        for inst in instructions {
            if let Some(prev) = prev_offset {
                if inst.offset <= prev {
                    return Err(TraceError::malformed(
                        code.id(),
                        format!("offset {} follows offset {}", inst.offset, prev),
                    ));
                }
            }
            if let Some(line) = inst.starts_line {
                if line == 0 {
                    return Err(TraceError::malformed(
                        code.id(),
                        format!("instruction at offset {} starts line 0", inst.offset),
                    ));
                }
                arc_point(code.id(), line)?;
                cur_line = line;
            }
            entries.push((inst.offset, cur_line));
            prev_offset = Some(inst.offset);
        }

        Ok(Self { entries })
    }

    /// Line for an instruction offset.
    ///
    /// Offsets that fall between instructions resolve to the preceding
    /// instruction; offsets before the first instruction resolve to it.
    pub fn line_for_offset(&self, offset: u32) -> Option<LineNo> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.entries.partition_point(|&(o, _)| o <= offset);
        if idx == 0 {
            Some(self.entries[0].1)
        } else {
            Some(self.entries[idx - 1].1)
        }
    }

    /// Number of instructions covered
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the unit had no instructions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(offset, line)` pairs in offset order
    pub fn iter(&self) -> impl Iterator<Item = (u32, LineNo)> + '_ {
        self.entries.iter().copied()
    }
}
