//! Shared test harness: a recording host monitor, a counting trace policy and
//! a small driver that feeds VM events to a tracer.

#![allow(dead_code)]

use parking_lot::Mutex;
use raya_coverage::{
    AtLine, CodeId, CodeObject, CodeUnit, EventSet, FileDisposition, FrameContext, Monitor,
    NoFrame, ShouldTrace, ToolId, TraceData, TraceError, TraceEvent, TraceResult, Tracer,
    TracerConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Host monitor that records every subscription change
#[derive(Default)]
pub struct RecordingMonitor {
    pub global: Mutex<Vec<EventSet>>,
    pub local: Mutex<HashMap<CodeId, EventSet>>,
    pub local_requests: AtomicUsize,
    pub tool_in_use: Mutex<Option<ToolId>>,
}

impl RecordingMonitor {
    pub fn local_events(&self, code: CodeId) -> EventSet {
        self.local.lock().get(&code).copied().unwrap_or_default()
    }

    pub fn global_events(&self) -> EventSet {
        self.global.lock().last().copied().unwrap_or_default()
    }
}

impl Monitor for RecordingMonitor {
    fn use_tool_id(&self, tool: ToolId, _name: &str) -> TraceResult<()> {
        let mut slot = self.tool_in_use.lock();
        if slot.is_some() {
            return Err(TraceError::ToolUnavailable {
                tool,
                message: "slot taken".into(),
            });
        }
        *slot = Some(tool);
        Ok(())
    }

    fn free_tool_id(&self, _tool: ToolId) {
        *self.tool_in_use.lock() = None;
        self.local.lock().clear();
    }

    fn set_events(&self, _tool: ToolId, events: EventSet) {
        self.global.lock().push(events);
    }

    fn set_local_events(&self, _tool: ToolId, code: CodeId, events: EventSet) {
        self.local_requests.fetch_add(1, Ordering::SeqCst);
        self.local.lock().insert(code, events);
    }
}

/// Traces files under `src/`, storing them under `/project/src/...`.
/// Counts calls per file name.
#[derive(Default)]
pub struct CountingPolicy {
    pub calls: Mutex<HashMap<String, usize>>,
}

impl CountingPolicy {
    pub fn calls_for(&self, file: &str) -> usize {
        self.calls.lock().get(file).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

impl ShouldTrace for CountingPolicy {
    fn should_trace(
        &self,
        file_name: &str,
        _frame: &dyn FrameContext,
    ) -> Result<FileDisposition, String> {
        *self.calls.lock().entry(file_name.to_string()).or_insert(0) += 1;
        if file_name.starts_with("src/") {
            Ok(FileDisposition::traced(format!("/project/{}", file_name)))
        } else {
            Ok(FileDisposition::skipped("outside the project"))
        }
    }
}

/// A wired-up tracer plus its collaborators
pub struct Harness {
    pub tracer: Arc<Tracer>,
    pub monitor: Arc<RecordingMonitor>,
    pub policy: Arc<CountingPolicy>,
    pub data: Arc<TraceData>,
}

impl Harness {
    pub fn new(config: TracerConfig) -> Self {
        let monitor = Arc::new(RecordingMonitor::default());
        let policy = Arc::new(CountingPolicy::default());
        let data = Arc::new(TraceData::new(config.mode()));
        let mut tracer = Tracer::new(config, monitor.clone());
        tracer.set_should_trace(policy.clone());
        tracer.set_data(data.clone());
        Self {
            tracer: Arc::new(tracer),
            monitor,
            policy,
            data,
        }
    }

    pub fn lines() -> Self {
        Self::new(TracerConfig::lines())
    }

    pub fn arcs() -> Self {
        Self::new(TracerConfig::arcs())
    }

    pub fn started(self) -> Self {
        self.tracer.start().unwrap();
        self
    }

    pub fn call(&self, code: &dyn CodeUnit) {
        self.tracer
            .dispatch(TraceEvent::UnitStart { code, offset: 0 }, &NoFrame)
            .unwrap();
    }

    pub fn resume(&self, code: &dyn CodeUnit, line: u32) {
        self.tracer
            .dispatch(TraceEvent::UnitResume { code, offset: 0 }, &AtLine(line))
            .unwrap();
    }

    /// Deliver a line event the way the host would: only if the unit has
    /// fine-grained events enabled.
    pub fn line(&self, code: &dyn CodeUnit, line: u32) {
        if self
            .monitor
            .local_events(code.id())
            .contains(EventSet::LINE)
        {
            self.tracer
                .dispatch(TraceEvent::Line { code, line }, &NoFrame)
                .unwrap();
        }
    }

    pub fn ret(&self, code: &dyn CodeUnit) {
        self.tracer
            .dispatch(TraceEvent::UnitReturn { code, offset: 0 }, &NoFrame)
            .unwrap();
    }

    pub fn yield_(&self, code: &dyn CodeUnit) {
        self.tracer
            .dispatch(TraceEvent::UnitYield { code, offset: 0 }, &NoFrame)
            .unwrap();
    }
}

/// Code unit spanning `first..=last`, one line-start instruction per line
pub fn unit(id: u64, file: &str, first: u32, last: u32) -> CodeObject {
    let table: Vec<(u32, u32)> = (first..=last)
        .enumerate()
        .map(|(i, line)| (i as u32 * 2, line))
        .collect();
    CodeObject::new(id, format!("fn_{}", id), file, first).with_line_table(&table, 2)
}
