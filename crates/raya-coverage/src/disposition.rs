//! Per-file trace decisions and their cache.

use crate::code::FrameContext;
use crate::error::{TraceError, TraceResult};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Whether a source file is traced, and under which name its data is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDisposition {
    /// Record lines/arcs for code in this file
    pub trace: bool,
    /// Canonical name under which collected data is stored
    pub source_file_name: Option<String>,
    /// Why the file is not traced (empty when it is)
    pub reason: String,
}

impl FileDisposition {
    /// Trace the file, storing its data under `source_file_name`
    pub fn traced(source_file_name: impl Into<String>) -> Self {
        Self {
            trace: true,
            source_file_name: Some(source_file_name.into()),
            reason: String::new(),
        }
    }

    /// Do not trace the file
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            trace: false,
            source_file_name: None,
            reason: reason.into(),
        }
    }

    /// Name to store data under, falling back to the observed file name
    pub fn storage_name<'a>(&'a self, observed: &'a str) -> &'a str {
        self.source_file_name.as_deref().unwrap_or(observed)
    }
}

/// External policy deciding which files are traced.
///
/// Called at most once per file name per session. Errors are reported as
/// plain messages and are never cached.
pub trait ShouldTrace: Send + Sync {
    /// Decide whether `file_name` is traced
    fn should_trace(
        &self,
        file_name: &str,
        frame: &dyn FrameContext,
    ) -> Result<FileDisposition, String>;
}

impl<F> ShouldTrace for F
where
    F: Fn(&str, &dyn FrameContext) -> Result<FileDisposition, String> + Send + Sync,
{
    fn should_trace(
        &self,
        file_name: &str,
        frame: &dyn FrameContext,
    ) -> Result<FileDisposition, String> {
        self(file_name, frame)
    }
}

/// Decision state of one file name
#[derive(Debug)]
enum SlotState {
    /// The predicate is running on this thread
    Pending(ThreadId),
    Decided(Arc<FileDisposition>),
    /// The predicate failed; waiters retry
    Failed,
}

#[derive(Debug)]
struct DecisionSlot {
    state: Mutex<SlotState>,
    settled: Condvar,
}

impl DecisionSlot {
    fn pending(owner: ThreadId) -> Self {
        Self {
            state: Mutex::new(SlotState::Pending(owner)),
            settled: Condvar::new(),
        }
    }

    fn decided(&self) -> Option<Arc<FileDisposition>> {
        match &*self.state.lock() {
            SlotState::Decided(disp) => Some(disp.clone()),
            _ => None,
        }
    }

    fn settle(&self, state: SlotState) {
        *self.state.lock() = state;
        self.settled.notify_all();
    }
}

/// What a waiter found once a slot settled
enum Wait {
    Decided(Arc<FileDisposition>),
    Retry,
}

/// Memoized [`ShouldTrace`] answers, keyed by observed file name.
///
/// Shared between tracers of one session. The first thread to miss on a name
/// claims a pending slot and runs the predicate with no lock held; other
/// threads asking for that name wait for it. The predicate therefore runs at
/// most once per name, and may itself raise events for other files.
#[derive(Debug, Default)]
pub struct DispositionCache {
    entries: RwLock<FxHashMap<String, Arc<DecisionSlot>>>,
}

impl DispositionCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached disposition for `file_name`, consulting `predicate` on a miss.
    ///
    /// Fails with [`TraceError::ReentrantDecision`] if called for a name whose
    /// predicate call is still running on the current thread.
    pub fn decide(
        &self,
        file_name: &str,
        frame: &dyn FrameContext,
        predicate: &dyn ShouldTrace,
    ) -> TraceResult<Arc<FileDisposition>> {
        let me = thread::current().id();
        loop {
            let existing = self.entries.read().get(file_name).cloned();
            let (slot, claimed) = match existing {
                Some(slot) => (slot, false),
                None => {
                    let mut entries = self.entries.write();
                    match entries.get(file_name) {
                        Some(slot) => (slot.clone(), false),
                        None => {
                            let slot = Arc::new(DecisionSlot::pending(me));
                            entries.insert(file_name.to_string(), slot.clone());
                            (slot, true)
                        }
                    }
                }
            };

            if claimed {
                return self.run_predicate(&slot, file_name, frame, predicate);
            }
            match Self::wait(&slot, file_name, me)? {
                Wait::Decided(disp) => return Ok(disp),
                Wait::Retry => continue,
            }
        }
    }

    fn wait(slot: &DecisionSlot, file_name: &str, me: ThreadId) -> TraceResult<Wait> {
        let mut state = slot.state.lock();
        loop {
            match &*state {
                SlotState::Decided(disp) => return Ok(Wait::Decided(disp.clone())),
                SlotState::Failed => return Ok(Wait::Retry),
                SlotState::Pending(owner) if *owner == me => {
                    return Err(TraceError::ReentrantDecision {
                        file: file_name.to_string(),
                    });
                }
                SlotState::Pending(_) => slot.settled.wait(&mut state),
            }
        }
    }

    fn run_predicate(
        &self,
        slot: &Arc<DecisionSlot>,
        file_name: &str,
        frame: &dyn FrameContext,
        predicate: &dyn ShouldTrace,
    ) -> TraceResult<Arc<FileDisposition>> {
        match predicate.should_trace(file_name, frame) {
            Ok(disp) => {
                tracing::debug!(
                    file = file_name,
                    trace = disp.trace,
                    reason = %disp.reason,
                    "decided file disposition"
                );
                let disp = Arc::new(disp);
                slot.settle(SlotState::Decided(disp.clone()));
                Ok(disp)
            }
            Err(message) => {
                {
                    let mut entries = self.entries.write();
                    if entries
                        .get(file_name)
                        .is_some_and(|current| Arc::ptr_eq(current, slot))
                    {
                        entries.remove(file_name);
                    }
                }
                slot.settle(SlotState::Failed);
                Err(TraceError::ShouldTrace {
                    file: file_name.to_string(),
                    message,
                })
            }
        }
    }

    /// Cached disposition, without consulting anything
    pub fn get(&self, file_name: &str) -> Option<Arc<FileDisposition>> {
        let slot = self.entries.read().get(file_name).cloned()?;
        slot.decided()
    }

    /// Number of decided files
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|slot| slot.decided().is_some())
            .count()
    }

    /// Whether no file has been decided yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
