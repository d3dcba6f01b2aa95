//! Tracer core: turns VM monitoring events into collected lines and arcs.
//!
//! The host calls [`Tracer::dispatch`] synchronously on the thread that raised
//! the event. Each OS thread gets its own current frame entry and frame stack;
//! the code registry, disposition cache and data store are shared.
//!
//! # Event handling
//!
//! - **unit-start**: save the caller, resolve the unit (registering it on first
//!   sight and requesting fine-grained events if it is traced), and enter it
//!   with its entry sentinel as last line.
//! - **unit-resume**: save the caller and re-enter the unit at its live line.
//! - **unit-return**: record the exit arc (arc mode), restore the caller.
//! - **unit-yield**: restore the caller without an exit arc.
//! - **line**: record the line (or the arc from the last line) and move on.
//! - **branch / jump**: no recording; line granularity already covers them.
//!
//! Any handler error first revokes event delivery, then is returned to the
//! host. Data recorded so far stays in the store.

use crate::code::{arc_point, CodeUnit, FrameContext, LineNo};
use crate::config::TracerConfig;
use crate::context::{log_warning, ContextHooks, WarnFn};
use crate::data::TraceData;
use crate::disposition::{DispositionCache, ShouldTrace};
use crate::error::{TraceError, TraceResult};
use crate::frame_stack::{FrameEntry, FrameStack};
use crate::monitor::{EventSet, Monitor, ToolId};
use crate::registry::{CodeRegistry, CodeUnitInfo};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A monitoring event delivered by the host VM
#[derive(Clone, Copy)]
pub enum TraceEvent<'a> {
    /// A function or module body begins executing
    UnitStart {
        /// Unit being entered
        code: &'a dyn CodeUnit,
        /// Instruction offset of entry
        offset: u32,
    },
    /// A suspended body resumes
    UnitResume {
        /// Unit being resumed
        code: &'a dyn CodeUnit,
        /// Instruction offset of resumption
        offset: u32,
    },
    /// A body returns normally
    UnitReturn {
        /// Unit returning
        code: &'a dyn CodeUnit,
        /// Instruction offset of the return
        offset: u32,
    },
    /// A body suspends without finishing
    UnitYield {
        /// Unit yielding
        code: &'a dyn CodeUnit,
        /// Instruction offset of the yield
        offset: u32,
    },
    /// A source line starts executing
    Line {
        /// Unit the line belongs to
        code: &'a dyn CodeUnit,
        /// Line number
        line: LineNo,
    },
    /// A conditional branch is taken
    Branch {
        /// Unit the branch is in
        code: &'a dyn CodeUnit,
        /// Offset of the branch instruction
        from: u32,
        /// Offset of the destination
        to: u32,
    },
    /// An unconditional jump is taken
    Jump {
        /// Unit the jump is in
        code: &'a dyn CodeUnit,
        /// Offset of the jump instruction
        from: u32,
        /// Offset of the destination
        to: u32,
    },
}

impl TraceEvent<'_> {
    /// Event kind name
    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::UnitStart { .. } => "unit_start",
            TraceEvent::UnitResume { .. } => "unit_resume",
            TraceEvent::UnitReturn { .. } => "unit_return",
            TraceEvent::UnitYield { .. } => "unit_yield",
            TraceEvent::Line { .. } => "line",
            TraceEvent::Branch { .. } => "branch",
            TraceEvent::Jump { .. } => "jump",
        }
    }

    /// Unit the event was raised for
    pub fn code(&self) -> &dyn CodeUnit {
        match *self {
            TraceEvent::UnitStart { code, .. }
            | TraceEvent::UnitResume { code, .. }
            | TraceEvent::UnitReturn { code, .. }
            | TraceEvent::UnitYield { code, .. }
            | TraceEvent::Line { code, .. }
            | TraceEvent::Branch { code, .. }
            | TraceEvent::Jump { code, .. } => code,
        }
    }
}

// ---------------------------------------------------------------------------
// Handles and statistics
// ---------------------------------------------------------------------------

/// Returned by [`Tracer::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHandle {
    tool: ToolId,
    declined: bool,
}

impl TraceHandle {
    /// Tool slot the tracer runs under
    pub fn tool_id(&self) -> ToolId {
        self.tool
    }

    /// Whether the start request was declined (foreign thread)
    pub fn is_declined(&self) -> bool {
        self.declined
    }
}

/// Snapshot of tracer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TracerStats {
    /// unit-start events handled
    pub starts: u64,
    /// unit-resume events handled
    pub resumes: u64,
    /// unit-return events handled
    pub returns: u64,
    /// unit-yield events handled
    pub yields: u64,
    /// line events handled
    pub lines: u64,
    /// Registered code units
    pub codes: u64,
    /// Registered code units being traced
    pub codes_tracing: u64,
}

#[derive(Debug, Default)]
struct EventCounters {
    starts: AtomicU64,
    resumes: AtomicU64,
    returns: AtomicU64,
    yields: AtomicU64,
    lines: AtomicU64,
}

impl EventCounters {
    #[inline(always)]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;
const DISABLED: u8 = 2;

/// Per-thread tracing state
#[derive(Debug, Default)]
struct ThreadState {
    current: FrameEntry,
    stack: FrameStack,
    context_active: bool,
}

impl ThreadState {
    fn is_idle(&self) -> bool {
        self.stack.is_empty() && !self.current.is_traced() && !self.context_active
    }
}

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

/// Coverage tracer driven by host monitoring events.
///
/// Attach collaborators with the `set_*` methods, then share it (e.g. in an
/// `Arc`) with the host's event callbacks and call [`start`](Tracer::start).
pub struct Tracer {
    config: TracerConfig,
    monitor: Arc<dyn Monitor>,
    should_trace: Option<Arc<dyn ShouldTrace>>,
    data: Option<Arc<TraceData>>,
    dispositions: Arc<DispositionCache>,
    registry: CodeRegistry,
    hooks: Option<Arc<dyn ContextHooks>>,
    warn: WarnFn,

    state: AtomicU8,
    owner_thread: Mutex<Option<ThreadId>>,
    threads: DashMap<ThreadId, ThreadState>,
    activity: AtomicBool,
    in_shutdown: AtomicBool,
    counters: EventCounters,
}

impl Tracer {
    /// Create a stopped tracer talking to `monitor`
    pub fn new(config: TracerConfig, monitor: Arc<dyn Monitor>) -> Self {
        Self {
            config,
            monitor,
            should_trace: None,
            data: None,
            dispositions: Arc::new(DispositionCache::new()),
            registry: CodeRegistry::new(),
            hooks: None,
            warn: log_warning(),
            state: AtomicU8::new(STOPPED),
            owner_thread: Mutex::new(None),
            threads: DashMap::new(),
            activity: AtomicBool::new(false),
            in_shutdown: AtomicBool::new(false),
            counters: EventCounters::default(),
        }
    }

    /// Attach the trace-decision predicate
    pub fn set_should_trace(&mut self, should_trace: Arc<dyn ShouldTrace>) {
        self.should_trace = Some(should_trace);
    }

    /// Attach the data store to record into
    pub fn set_data(&mut self, data: Arc<TraceData>) {
        self.data = Some(data);
    }

    /// Share a disposition cache with other tracers of the same session
    pub fn set_disposition_cache(&mut self, dispositions: Arc<DispositionCache>) {
        self.dispositions = dispositions;
    }

    /// Attach context hooks
    pub fn set_context_hooks(&mut self, hooks: Arc<dyn ContextHooks>) {
        self.hooks = Some(hooks);
    }

    /// Replace the warning sink
    pub fn set_warn(&mut self, warn: WarnFn) {
        self.warn = warn;
    }

    /// Tracer configuration
    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Start receiving events.
    ///
    /// Repeated calls from the starting thread are no-ops. Calls from any other
    /// thread are declined: nothing is registered and the returned handle says
    /// so. Units registered before a previous [`stop`](Tracer::stop) get their
    /// fine-grained events requested again without re-deciding their files.
    pub fn start(&self) -> TraceResult<TraceHandle> {
        let tool = self.config.tool_id;
        self.validate()?;

        let current = thread::current().id();
        {
            let mut owner = self.owner_thread.lock();
            match *owner {
                None => *owner = Some(current),
                Some(owner) if owner != current => {
                    (self.warn)(&format!(
                        "Tracer started on {:?}, ignoring start from {:?}",
                        owner, current
                    ));
                    return Ok(TraceHandle {
                        tool,
                        declined: true,
                    });
                }
                Some(_) => {}
            }
        }

        let previous = self.state.load(Ordering::Acquire);
        if previous == RUNNING {
            return Ok(TraceHandle {
                tool,
                declined: false,
            });
        }
        // A disabled tracer still holds its tool slot.
        if previous == STOPPED {
            self.monitor.use_tool_id(tool, &self.config.tool_name)?;
        }

        self.threads.clear();
        self.monitor.set_events(tool, EventSet::CALL_LEVEL);
        let rearmed = self.registry.tracing_units();
        for code in &rearmed {
            self.monitor.set_local_events(tool, *code, EventSet::FINE_GRAINED);
        }
        self.state.store(RUNNING, Ordering::Release);

        tracing::debug!(
            tool = %tool,
            arcs = self.config.trace_arcs,
            rearmed = rearmed.len(),
            "tracer started"
        );
        Ok(TraceHandle {
            tool,
            declined: false,
        })
    }

    fn validate(&self) -> TraceResult<()> {
        if self.should_trace.is_none() {
            return Err(TraceError::MissingCollaborator("should_trace"));
        }
        let data = self
            .data
            .as_ref()
            .ok_or(TraceError::MissingCollaborator("data"))?;
        if data.mode() != self.config.mode() {
            return Err(TraceError::ModeMismatch {
                store: data.mode().as_str(),
                tracer: self.config.mode().as_str(),
            });
        }
        Ok(())
    }

    /// Stop receiving events and release the tool slot.
    ///
    /// A handler already running completes; nothing is dispatched afterwards.
    pub fn stop(&self) {
        let previous = self.state.swap(STOPPED, Ordering::AcqRel);
        if previous == STOPPED {
            return;
        }
        let tool = self.config.tool_id;
        self.monitor.set_events(tool, EventSet::NONE);
        self.monitor.free_tool_id(tool);
        tracing::debug!(tool = %tool, "tracer stopped");
    }

    /// Whether events are being processed
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Whether a handler fault disabled event processing
    pub fn is_disabled(&self) -> bool {
        self.state.load(Ordering::Acquire) == DISABLED
    }

    /// Mark process teardown: exit events without a matching entry are then
    /// ignored instead of reported.
    pub fn begin_shutdown(&self) {
        self.in_shutdown.store(true, Ordering::Release);
    }

    fn disable(&self, err: &TraceError) {
        if self
            .state
            .compare_exchange(RUNNING, DISABLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let tool = self.config.tool_id;
        self.monitor.set_events(tool, EventSet::NONE);
        for code in self.registry.tracing_units() {
            self.monitor.set_local_events(tool, code, EventSet::NONE);
        }
        tracing::error!(error = %err, "tracer disabled after handler fault");
    }

    // ── Data access ────────────────────────────────────────────────────

    /// The live data store
    pub fn collected_data(&self) -> Option<&Arc<TraceData>> {
        self.data.as_ref()
    }

    /// Disposition cache in use
    pub fn dispositions(&self) -> &Arc<DispositionCache> {
        &self.dispositions
    }

    /// Code unit registry
    pub fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    /// Whether any unit started since construction or the last reset
    pub fn activity(&self) -> bool {
        self.activity.load(Ordering::Relaxed)
    }

    /// Clear the activity flag
    pub fn reset_activity(&self) {
        self.activity.store(false, Ordering::Relaxed);
    }

    /// Counter snapshot
    pub fn stats(&self) -> TracerStats {
        TracerStats {
            starts: self.counters.starts.load(Ordering::Relaxed),
            resumes: self.counters.resumes.load(Ordering::Relaxed),
            returns: self.counters.returns.load(Ordering::Relaxed),
            yields: self.counters.yields.load(Ordering::Relaxed),
            lines: self.counters.lines.load(Ordering::Relaxed),
            codes: self.registry.len() as u64,
            codes_tracing: self.registry.tracing_count() as u64,
        }
    }

    /// Frame stack depth of the calling thread
    pub fn frame_depth(&self) -> usize {
        self.threads
            .get(&thread::current().id())
            .map(|s| s.stack.depth())
            .unwrap_or(0)
    }

    /// Number of threads with frames the tracer is following
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Last line of the calling thread's current frame
    pub fn last_line(&self) -> Option<i32> {
        self.threads
            .get(&thread::current().id())
            .map(|s| s.current.last_line)
    }

    // ── Dispatch ───────────────────────────────────────────────────────

    /// Handle one event from the host.
    ///
    /// Ignored unless the tracer is running. On error, event delivery is
    /// revoked before the error is returned.
    pub fn dispatch(&self, event: TraceEvent<'_>, frame: &dyn FrameContext) -> TraceResult<()> {
        if self.state.load(Ordering::Acquire) != RUNNING {
            return Ok(());
        }
        tracing::trace!(event = event.kind(), code = %event.code().id(), "dispatch");

        let result = match event {
            TraceEvent::UnitStart { code, .. } => self.unit_start(code, frame),
            TraceEvent::UnitResume { code, offset } => self.unit_resume(code, offset, frame),
            TraceEvent::UnitReturn { code, .. } => self.unit_return(code),
            TraceEvent::UnitYield { code, .. } => self.unit_yield(code),
            TraceEvent::Line { code, line } => self.line(code, line),
            TraceEvent::Branch { code, from, to } => {
                self.control_transfer("branch", code, from, to);
                Ok(())
            }
            TraceEvent::Jump { code, from, to } => {
                self.control_transfer("jump", code, from, to);
                Ok(())
            }
        };

        if let Err(err) = &result {
            self.disable(err);
        }
        result
    }

    fn resolve(
        &self,
        code: &dyn CodeUnit,
        frame: &dyn FrameContext,
    ) -> TraceResult<Arc<CodeUnitInfo>> {
        if let Some(info) = self.registry.lookup(code.id()) {
            return Ok(info);
        }

        let should_trace = self
            .should_trace
            .as_deref()
            .ok_or(TraceError::MissingCollaborator("should_trace"))?;
        let data = self
            .data
            .as_deref()
            .ok_or(TraceError::MissingCollaborator("data"))?;

        let resolved =
            self.registry
                .lookup_or_build(code, frame, &self.dispositions, should_trace, data)?;
        if resolved.created && resolved.info.tracing {
            self.monitor.set_local_events(
                self.config.tool_id,
                code.id(),
                EventSet::FINE_GRAINED,
            );
        }
        Ok(resolved.info)
    }

    fn unit_start(&self, code: &dyn CodeUnit, frame: &dyn FrameContext) -> TraceResult<()> {
        self.activity.store(true, Ordering::Relaxed);
        EventCounters::bump(&self.counters.starts);

        let info = self.resolve(code, frame)?;
        let tid = thread::current().id();
        let started_context = self.maybe_start_context(tid, frame);

        let mut state = self.threads.entry(tid).or_default();
        let callee = FrameEntry {
            file_data: info.file_data.clone(),
            file_name: info.file_name.clone(),
            last_line: info.entry_sentinel,
            started_context,
        };
        let caller = std::mem::replace(&mut state.current, callee);
        state.stack.enter(caller);
        if started_context {
            state.context_active = true;
        }
        Ok(())
    }

    fn maybe_start_context(&self, tid: ThreadId, frame: &dyn FrameContext) -> bool {
        let Some(hooks) = self.hooks.as_deref() else {
            return false;
        };
        let active = self
            .threads
            .get(&tid)
            .map(|s| s.context_active)
            .unwrap_or(false);
        if active {
            return false;
        }
        match hooks.should_start_context(frame) {
            Some(name) => {
                tracing::debug!(context = %name, "starting context");
                hooks.switch_context(Some(&name));
                true
            }
            None => false,
        }
    }

    fn unit_resume(
        &self,
        code: &dyn CodeUnit,
        offset: u32,
        frame: &dyn FrameContext,
    ) -> TraceResult<()> {
        EventCounters::bump(&self.counters.resumes);

        let info = self.resolve(code, frame)?;
        let last_line = match frame.line_number().or_else(|| info.line_for_offset(offset)) {
            Some(line) => arc_point(code.id(), line)?,
            None => info.entry_sentinel,
        };

        let mut state = self.threads.entry(thread::current().id()).or_default();
        let resumed = FrameEntry {
            file_data: info.file_data.clone(),
            file_name: info.file_name.clone(),
            last_line,
            started_context: false,
        };
        let caller = std::mem::replace(&mut state.current, resumed);
        state.stack.enter(caller);
        Ok(())
    }

    fn unit_return(&self, code: &dyn CodeUnit) -> TraceResult<()> {
        EventCounters::bump(&self.counters.returns);

        if self.config.trace_arcs {
            if let Some(state) = self.threads.get(&thread::current().id()) {
                if let Some(file_data) = &state.current.file_data {
                    file_data.add_arc(state.current.last_line, code.entry_sentinel()?);
                }
            }
        }
        self.leave(code)
    }

    fn unit_yield(&self, code: &dyn CodeUnit) -> TraceResult<()> {
        EventCounters::bump(&self.counters.yields);
        self.leave(code)
    }

    /// Pop the frame stack back to the caller of `code`.
    ///
    /// A thread whose stack unwinds to its outermost, untraced entry has no
    /// state left worth keeping; its map entry is dropped.
    fn leave(&self, code: &dyn CodeUnit) -> TraceResult<()> {
        let tid = thread::current().id();
        let popped = self.threads.get_mut(&tid).and_then(|mut state| {
            let caller = state.stack.leave(code.id()).ok()?;
            let finished = std::mem::replace(&mut state.current, caller);
            if finished.started_context {
                state.context_active = false;
            }
            Some((finished.started_context, state.is_idle()))
        });
        let Some((ended_context, idle)) = popped else {
            if self.in_shutdown.load(Ordering::Acquire) {
                tracing::trace!(code = %code.id(), "ignoring unmatched exit during shutdown");
                return Ok(());
            }
            return Err(TraceError::StackUnderflow { code: code.id() });
        };
        if idle {
            self.threads.remove_if(&tid, |_, state| state.is_idle());
        }

        if ended_context {
            if let Some(hooks) = self.hooks.as_deref() {
                hooks.switch_context(None);
            }
        }
        Ok(())
    }

    #[inline]
    fn line(&self, code: &dyn CodeUnit, line: LineNo) -> TraceResult<()> {
        EventCounters::bump(&self.counters.lines);

        let Some(mut state) = self.threads.get_mut(&thread::current().id()) else {
            return Ok(());
        };
        let current = &mut state.current;
        if let Some(file_data) = &current.file_data {
            let point = arc_point(code.id(), line)?;
            if self.config.trace_arcs {
                file_data.add_arc(current.last_line, point);
            } else {
                file_data.add_line(line);
            }
            current.last_line = point;
        }
        Ok(())
    }

    fn control_transfer(&self, kind: &'static str, code: &dyn CodeUnit, from: u32, to: u32) {
        if !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        if let Some(info) = self.registry.lookup(code.id()) {
            tracing::trace!(
                kind,
                code = %code.id(),
                from_line = ?info.line_for_offset(from),
                to_line = ?info.line_for_offset(to),
                "control transfer"
            );
        }
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("config", &self.config)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("codes", &self.registry.len())
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (points, files) = self
            .data
            .as_ref()
            .map(|d| (d.point_count(), d.file_count()))
            .unwrap_or((0, 0));
        write!(f, "<Tracer: {} data points in {} files>", points, files)
    }
}
