//! Raya Coverage Tracer
//!
//! Collection engine for line and arc coverage. The host VM delivers monitoring
//! events (unit start/resume/return/yield, line, branch, jump) to a [`Tracer`],
//! which mirrors the call stack per thread, decides once per file whether to
//! trace it, and records executed lines or line-to-line arcs into a shared
//! [`TraceData`] store.
//!
//! - **Decisions**: [`DispositionCache`] memoizes the owner's [`ShouldTrace`]
//!   policy per file name; [`CodeRegistry`] memoizes per code unit.
//! - **Overhead control**: line/branch/jump events are requested from the
//!   [`Monitor`] only for code units that are traced.
//! - **Output**: [`TraceData::snapshot`] gives a sorted, serializable copy.
//!
//! # Example
//!
//! ```rust,ignore
//! use raya_coverage::{Tracer, TracerConfig, TraceData, TraceEvent, FileDisposition};
//!
//! let config = TracerConfig::arcs();
//! let data = Arc::new(TraceData::new(config.mode()));
//! let mut tracer = Tracer::new(config, vm_monitor);
//! tracer.set_should_trace(Arc::new(|file: &str, _frame: &dyn FrameContext| {
//!     Ok(FileDisposition::traced(file))
//! }));
//! tracer.set_data(data.clone());
//! tracer.start()?;
//!
//! // from the VM's event callbacks:
//! tracer.dispatch(TraceEvent::UnitStart { code: &function, offset: 0 }, &frame)?;
//! tracer.dispatch(TraceEvent::Line { code: &function, line: 12 }, &frame)?;
//!
//! tracer.stop();
//! let json = data.snapshot().to_json()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod code;
pub mod config;
pub mod context;
pub mod data;
pub mod disposition;
pub mod error;
pub mod frame_stack;
pub mod line_index;
pub mod monitor;
pub mod registry;
pub mod tracer;

pub use code::{AtLine, CodeId, CodeObject, CodeUnit, FrameContext, Instruction, LineNo, NoFrame};
pub use config::TracerConfig;
pub use context::{ContextHooks, WarnFn};
pub use data::{CollectedData, FileCoverage, FileData, LineArc, TraceData, TraceMode};
pub use disposition::{DispositionCache, FileDisposition, ShouldTrace};
pub use error::{TraceError, TraceResult};
pub use frame_stack::{FrameEntry, FrameStack};
pub use line_index::LineIndex;
pub use monitor::{EventSet, Monitor, ToolId, COVERAGE_ID};
pub use registry::{CodeRegistry, CodeUnitInfo};
pub use tracer::{TraceEvent, TraceHandle, Tracer, TracerStats};
