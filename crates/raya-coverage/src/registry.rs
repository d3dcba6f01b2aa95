//! Code unit registry
//!
//! Remembers, for every code unit the tracer has seen start, whether it is
//! traced, where its data goes, and its line index. Entries live in an arena
//! indexed through a `CodeId → slot` map and are never recomputed.

use crate::code::{CodeId, CodeUnit, FrameContext};
use crate::data::{FileData, TraceData};
use crate::disposition::{DispositionCache, ShouldTrace};
use crate::error::TraceResult;
use crate::line_index::LineIndex;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Cached tracing state of one code unit
#[derive(Debug)]
pub struct CodeUnitInfo {
    /// Unit identity
    pub code: CodeId,
    /// Whether this unit's lines/arcs are recorded
    pub tracing: bool,
    /// Data entry the unit feeds (present iff `tracing`)
    pub file_data: Option<FileData>,
    /// Observed file name (present iff `tracing`)
    pub file_name: Option<Arc<str>>,
    /// Offset → line table (present iff `tracing`)
    pub line_index: Option<LineIndex>,
    /// Negated first line of the unit
    pub entry_sentinel: i32,
}

impl CodeUnitInfo {
    /// Source line of an instruction offset, if the unit is traced
    pub fn line_for_offset(&self, offset: u32) -> Option<u32> {
        self.line_index.as_ref()?.line_for_offset(offset)
    }
}

/// Result of [`CodeRegistry::lookup_or_build`]
#[derive(Debug, Clone)]
pub struct Resolved {
    /// The unit's entry
    pub info: Arc<CodeUnitInfo>,
    /// Whether this call created the entry
    pub created: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    slots: FxHashMap<CodeId, usize>,
    infos: Vec<Arc<CodeUnitInfo>>,
}

/// Arena of [`CodeUnitInfo`], one entry per code unit
#[derive(Debug, Default)]
pub struct CodeRegistry {
    inner: RwLock<RegistryInner>,
}

impl CodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing entry for `code`
    #[inline]
    pub fn lookup(&self, code: CodeId) -> Option<Arc<CodeUnitInfo>> {
        let inner = self.inner.read();
        inner.slots.get(&code).map(|&slot| inner.infos[slot].clone())
    }

    /// Existing entry for `code`, or a new one built from its file's disposition.
    ///
    /// Building consults `dispositions` (and through it `should_trace`), then,
    /// for traced units, creates or reuses the data entry for the canonical file
    /// name and builds the line index. If another thread registered the unit
    /// first, its entry wins and `created` is false.
    pub fn lookup_or_build<C: CodeUnit + ?Sized>(
        &self,
        code: &C,
        frame: &dyn FrameContext,
        dispositions: &DispositionCache,
        should_trace: &dyn ShouldTrace,
        data: &TraceData,
    ) -> TraceResult<Resolved> {
        if let Some(info) = self.lookup(code.id()) {
            return Ok(Resolved {
                info,
                created: false,
            });
        }

        let info = Arc::new(Self::build(code, frame, dispositions, should_trace, data)?);

        let mut inner = self.inner.write();
        if let Some(&slot) = inner.slots.get(&code.id()) {
            return Ok(Resolved {
                info: inner.infos[slot].clone(),
                created: false,
            });
        }
        let slot = inner.infos.len();
        inner.infos.push(info.clone());
        inner.slots.insert(code.id(), slot);

        Ok(Resolved {
            info,
            created: true,
        })
    }

    fn build<C: CodeUnit + ?Sized>(
        code: &C,
        frame: &dyn FrameContext,
        dispositions: &DispositionCache,
        should_trace: &dyn ShouldTrace,
        data: &TraceData,
    ) -> TraceResult<CodeUnitInfo> {
        let entry_sentinel = code.entry_sentinel()?;
        let file_name = code.file_name();
        let disp = dispositions.decide(file_name, frame, should_trace)?;

        let info = if disp.trace {
            let line_index = LineIndex::build(code)?;
            CodeUnitInfo {
                code: code.id(),
                tracing: true,
                file_data: Some(data.file_data(disp.storage_name(file_name))),
                file_name: Some(Arc::from(file_name)),
                line_index: Some(line_index),
                entry_sentinel,
            }
        } else {
            CodeUnitInfo {
                code: code.id(),
                tracing: false,
                file_data: None,
                file_name: None,
                line_index: None,
                entry_sentinel,
            }
        };

        tracing::debug!(
            code = %code.id(),
            name = code.name(),
            file = file_name,
            tracing = info.tracing,
            "registered code unit"
        );
        Ok(info)
    }

    /// Ids of every unit being traced, in registration order
    pub fn tracing_units(&self) -> Vec<CodeId> {
        self.inner
            .read()
            .infos
            .iter()
            .filter(|info| info.tracing)
            .map(|info| info.code)
            .collect()
    }

    /// Number of registered units
    pub fn len(&self) -> usize {
        self.inner.read().infos.len()
    }

    /// Whether no unit has been registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of registered units being traced
    pub fn tracing_count(&self) -> usize {
        self.inner.read().infos.iter().filter(|i| i.tracing).count()
    }
}
