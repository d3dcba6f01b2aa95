//! Collected data store: executed lines or arcs, per source file.
//!
//! The store is append-only while tracing. Every mutation is a set insertion,
//! so repeated executions of a line (or traversals of an arc) are idempotent.
//! Each file's set sits behind its own mutex; writers on different files never
//! contend.

use crate::code::LineNo;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A line-to-line transition. Negative endpoints are entry/exit sentinels.
pub type LineArc = (i32, i32);

/// What the store records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceMode {
    /// Set of executed line numbers per file
    Lines,
    /// Set of executed arcs per file
    Arcs,
}

impl TraceMode {
    /// Mode for a `trace_arcs` flag
    pub fn from_trace_arcs(trace_arcs: bool) -> Self {
        if trace_arcs {
            TraceMode::Arcs
        } else {
            TraceMode::Lines
        }
    }

    /// Human-readable name
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceMode::Lines => "lines",
            TraceMode::Arcs => "arcs",
        }
    }
}

#[derive(Debug)]
enum FileSet {
    Lines(FxHashSet<LineNo>),
    Arcs(FxHashSet<LineArc>),
}

impl FileSet {
    fn new(mode: TraceMode) -> Self {
        match mode {
            TraceMode::Lines => FileSet::Lines(FxHashSet::default()),
            TraceMode::Arcs => FileSet::Arcs(FxHashSet::default()),
        }
    }

    fn len(&self) -> usize {
        match self {
            FileSet::Lines(lines) => lines.len(),
            FileSet::Arcs(arcs) => arcs.len(),
        }
    }
}

/// Handle to one file's entry in the store.
///
/// Cheap to clone; all clones write into the same set.
#[derive(Debug, Clone)]
pub struct FileData {
    name: Arc<str>,
    set: Arc<Mutex<FileSet>>,
}

impl FileData {
    fn new(name: &str, mode: TraceMode) -> Self {
        Self {
            name: Arc::from(name),
            set: Arc::new(Mutex::new(FileSet::new(mode))),
        }
    }

    /// Canonical file name this entry is stored under
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Record an executed line. Returns `true` if it was new.
    ///
    /// No-op on an arc-mode entry.
    #[inline]
    pub fn add_line(&self, line: LineNo) -> bool {
        match &mut *self.set.lock() {
            FileSet::Lines(lines) => lines.insert(line),
            FileSet::Arcs(_) => false,
        }
    }

    /// Record an executed arc. Returns `true` if it was new.
    ///
    /// No-op on a line-mode entry.
    #[inline]
    pub fn add_arc(&self, from: i32, to: i32) -> bool {
        match &mut *self.set.lock() {
            FileSet::Arcs(arcs) => arcs.insert((from, to)),
            FileSet::Lines(_) => false,
        }
    }

    /// Whether `line` has been recorded
    pub fn contains_line(&self, line: LineNo) -> bool {
        match &*self.set.lock() {
            FileSet::Lines(lines) => lines.contains(&line),
            FileSet::Arcs(_) => false,
        }
    }

    /// Whether the arc `(from, to)` has been recorded
    pub fn contains_arc(&self, from: i32, to: i32) -> bool {
        match &*self.set.lock() {
            FileSet::Arcs(arcs) => arcs.contains(&(from, to)),
            FileSet::Lines(_) => false,
        }
    }

    /// Number of recorded points
    pub fn len(&self) -> usize {
        self.set.lock().len()
    }

    /// Whether nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two handles write into the same set
    pub fn same_entry(&self, other: &FileData) -> bool {
        Arc::ptr_eq(&self.set, &other.set)
    }

    fn coverage(&self) -> FileCoverage {
        match &*self.set.lock() {
            FileSet::Lines(lines) => FileCoverage::Lines(lines.iter().copied().collect()),
            FileSet::Arcs(arcs) => FileCoverage::Arcs(arcs.iter().copied().collect()),
        }
    }
}

/// The live collected data store shared by every tracer of a session.
#[derive(Debug)]
pub struct TraceData {
    mode: TraceMode,
    files: RwLock<FxHashMap<String, FileData>>,
}

impl TraceData {
    /// Create an empty store
    pub fn new(mode: TraceMode) -> Self {
        Self {
            mode,
            files: RwLock::new(FxHashMap::default()),
        }
    }

    /// What this store records
    pub fn mode(&self) -> TraceMode {
        self.mode
    }

    /// Entry for `file_name`, created empty if absent
    pub fn file_data(&self, file_name: &str) -> FileData {
        if let Some(data) = self.files.read().get(file_name) {
            return data.clone();
        }
        self.files
            .write()
            .entry(file_name.to_string())
            .or_insert_with(|| FileData::new(file_name, self.mode))
            .clone()
    }

    /// Existing entry for `file_name`
    pub fn get(&self, file_name: &str) -> Option<FileData> {
        self.files.read().get(file_name).cloned()
    }

    /// Whether an entry exists for `file_name`
    pub fn contains_file(&self, file_name: &str) -> bool {
        self.files.read().contains_key(file_name)
    }

    /// Number of files with an entry
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Total recorded points across all files
    pub fn point_count(&self) -> usize {
        self.files.read().values().map(FileData::len).sum()
    }

    /// Copy the current contents into an owned, sorted form
    pub fn snapshot(&self) -> CollectedData {
        let files = self
            .files
            .read()
            .iter()
            .map(|(name, data)| (name.clone(), data.coverage()))
            .collect();
        CollectedData {
            mode: self.mode,
            files,
        }
    }
}

/// Recorded points for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCoverage {
    /// Executed lines
    Lines(BTreeSet<LineNo>),
    /// Executed arcs
    Arcs(BTreeSet<LineArc>),
}

/// Owned snapshot of a [`TraceData`] store, ready for persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedData {
    /// Recording mode
    pub mode: TraceMode,
    /// Canonical file name → recorded points
    pub files: BTreeMap<String, FileCoverage>,
}

impl CollectedData {
    /// Executed lines for a file (line mode only)
    pub fn lines(&self, file_name: &str) -> Option<&BTreeSet<LineNo>> {
        match self.files.get(file_name)? {
            FileCoverage::Lines(lines) => Some(lines),
            FileCoverage::Arcs(_) => None,
        }
    }

    /// Executed arcs for a file (arc mode only)
    pub fn arcs(&self, file_name: &str) -> Option<&BTreeSet<LineArc>> {
        match self.files.get(file_name)? {
            FileCoverage::Arcs(arcs) => Some(arcs),
            FileCoverage::Lines(_) => None,
        }
    }

    /// Serialize as JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a snapshot previously written by [`CollectedData::to_json`]
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
