//! Session-level behavior: threads, faults, shutdown and context hooks.

mod common;

use common::{unit, Harness, RecordingMonitor};
use parking_lot::Mutex;
use raya_coverage::{
    AtLine, CodeObject, CodeUnit, ContextHooks, DispositionCache, EventSet, FileDisposition,
    FrameContext, NoFrame, ShouldTrace, TraceData, TraceError, TraceEvent, TraceResult, Tracer,
    TracerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, Weak};
use std::time::Duration;

fn trace_everything(file: &str, _frame: &dyn FrameContext) -> Result<FileDisposition, String> {
    Ok(FileDisposition::traced(file))
}

// ===== Threads =====

#[test]
fn test_threads_have_independent_frame_stacks() {
    let h = Harness::lines().started();
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let tracer = h.tracer.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let outer = unit(100 + t, "src/worker.raya", 1, 3);
                let inner = unit(200, "src/shared.raya", 10, 12);
                barrier.wait();
                for _ in 0..50 {
                    tracer
                        .dispatch(TraceEvent::UnitStart { code: &outer, offset: 0 }, &NoFrame)
                        .unwrap();
                    tracer
                        .dispatch(TraceEvent::Line { code: &outer, line: 1 }, &NoFrame)
                        .unwrap();
                    tracer
                        .dispatch(TraceEvent::UnitStart { code: &inner, offset: 0 }, &NoFrame)
                        .unwrap();
                    tracer
                        .dispatch(TraceEvent::Line { code: &inner, line: 11 }, &NoFrame)
                        .unwrap();
                    assert_eq!(tracer.frame_depth(), 2);
                    tracer
                        .dispatch(TraceEvent::UnitReturn { code: &inner, offset: 0 }, &NoFrame)
                        .unwrap();
                    assert_eq!(tracer.last_line(), Some(1));
                    tracer
                        .dispatch(
                            TraceEvent::Line { code: &outer, line: 2 + t as u32 % 2 },
                            &NoFrame,
                        )
                        .unwrap();
                    tracer
                        .dispatch(TraceEvent::UnitReturn { code: &outer, offset: 0 }, &NoFrame)
                        .unwrap();
                }
                tracer.frame_depth()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 0);
    }
    assert_eq!(h.tracer.thread_count(), 0);

    let snapshot = h.data.snapshot();
    let worker: Vec<u32> = snapshot
        .lines("/project/src/worker.raya")
        .unwrap()
        .iter()
        .copied()
        .collect();
    assert_eq!(worker, vec![1, 2, 3]);
    assert_eq!(snapshot.lines("/project/src/shared.raya").unwrap().len(), 1);
    assert_eq!(h.policy.calls_for("src/worker.raya"), 1);
    assert_eq!(h.policy.calls_for("src/shared.raya"), 1);
    assert_eq!(h.tracer.registry().len(), 5);
    assert!(!h.tracer.is_disabled());
}

#[test]
fn test_tracers_can_share_a_disposition_cache() {
    let monitor = Arc::new(RecordingMonitor::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(DispositionCache::new());
    let code = unit(1, "src/a.raya", 1, 2);

    for config in [TracerConfig::lines(), TracerConfig::arcs()] {
        let counter = calls.clone();
        let mut tracer = Tracer::new(config.clone(), monitor.clone());
        tracer.set_should_trace(Arc::new(
            move |file: &str, _frame: &dyn FrameContext| -> Result<FileDisposition, String> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(FileDisposition::traced(file))
            },
        ));
        tracer.set_data(Arc::new(TraceData::new(config.mode())));
        tracer.set_disposition_cache(cache.clone());

        tracer.start().unwrap();
        tracer
            .dispatch(TraceEvent::UnitStart { code: &code, offset: 0 }, &NoFrame)
            .unwrap();
        tracer
            .dispatch(TraceEvent::UnitReturn { code: &code, offset: 0 }, &NoFrame)
            .unwrap();
        tracer.stop();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ===== Faults =====

#[test]
fn test_unmatched_return_disables_tracer() {
    let h = Harness::arcs().started();
    let a = unit(1, "src/a.raya", 1, 3);

    h.call(&a);
    h.line(&a, 1);
    h.ret(&a);

    let err = h
        .tracer
        .dispatch(TraceEvent::UnitReturn { code: &a, offset: 0 }, &NoFrame)
        .unwrap_err();
    assert_eq!(err, TraceError::StackUnderflow { code: a.id() });
    assert!(err.is_fatal());
    assert!(h.tracer.is_disabled());
    assert_eq!(h.monitor.global_events(), EventSet::NONE);
    assert!(h.monitor.local_events(a.id()).is_empty());

    // Later events are ignored; earlier data is kept.
    h.tracer
        .dispatch(TraceEvent::UnitStart { code: &a, offset: 0 }, &NoFrame)
        .unwrap();
    assert_eq!(h.tracer.stats().starts, 1);
    let arcs = h.data.snapshot();
    assert!(arcs.arcs("/project/src/a.raya").unwrap().contains(&(-1, 1)));
}

#[test]
fn test_unmatched_return_tolerated_during_shutdown() {
    let h = Harness::lines().started();
    let a = unit(1, "src/a.raya", 1, 3);

    h.tracer.begin_shutdown();
    h.ret(&a);
    h.tracer
        .dispatch(TraceEvent::UnitYield { code: &a, offset: 0 }, &NoFrame)
        .unwrap();
    assert!(h.tracer.is_running());
}

#[test]
fn test_policy_failure_disables_and_is_not_cached() {
    let monitor = Arc::new(RecordingMonitor::default());
    let data = Arc::new(TraceData::new(TracerConfig::lines().mode()));
    let remaining = Arc::new(AtomicUsize::new(1));
    let mut tracer = Tracer::new(TracerConfig::lines(), monitor.clone());
    tracer.set_should_trace(Arc::new(move |file: &str, _frame: &dyn FrameContext| {
        if remaining.load(Ordering::SeqCst) > 0 {
            remaining.fetch_sub(1, Ordering::SeqCst);
            Err("bad include pattern".to_string())
        } else {
            Ok(FileDisposition::traced(file))
        }
    }));
    tracer.set_data(data.clone());
    tracer.start().unwrap();

    let code = unit(1, "src/a.raya", 1, 2);
    let err = tracer
        .dispatch(TraceEvent::UnitStart { code: &code, offset: 0 }, &NoFrame)
        .unwrap_err();
    assert!(matches!(err, TraceError::ShouldTrace { .. }));
    assert!(!err.is_fatal());
    assert!(tracer.is_disabled());
    assert!(tracer.dispositions().get("src/a.raya").is_none());
    assert!(tracer.registry().is_empty());

    // Restarting re-enables delivery; the file is decided afresh.
    tracer.start().unwrap();
    assert!(tracer.is_running());
    tracer
        .dispatch(TraceEvent::UnitStart { code: &code, offset: 0 }, &NoFrame)
        .unwrap();
    assert!(tracer.dispositions().get("src/a.raya").unwrap().trace);
    assert_eq!(tracer.frame_depth(), 1);
}

#[test]
fn test_malformed_unit_disables_tracer() {
    let h = Harness::lines().started();
    let bad = CodeObject::new(9, "bad", "src/bad.raya", 0);

    let err = h
        .tracer
        .dispatch(TraceEvent::UnitStart { code: &bad, offset: 0 }, &NoFrame)
        .unwrap_err();
    assert!(matches!(err, TraceError::MalformedCode { .. }));
    assert!(h.tracer.is_disabled());
}

#[test]
fn test_second_tracer_cannot_claim_taken_tool() {
    let h = Harness::lines().started();
    let mut other = Tracer::new(TracerConfig::lines(), h.monitor.clone());
    other.set_should_trace(h.policy.clone());
    other.set_data(h.data.clone());

    assert!(matches!(
        other.start().unwrap_err(),
        TraceError::ToolUnavailable { .. }
    ));
    assert!(!other.is_running());
}

// ===== Re-entrant policies =====

/// Policy that, while deciding `trigger`, runs `helper` on the same tracer
struct EventRaisingPolicy {
    trigger: &'static str,
    helper: CodeObject,
    tracer: Mutex<Weak<Tracer>>,
    nested: Mutex<Vec<TraceResult<()>>>,
}

impl ShouldTrace for EventRaisingPolicy {
    fn should_trace(
        &self,
        file_name: &str,
        frame: &dyn FrameContext,
    ) -> Result<FileDisposition, String> {
        if file_name == self.trigger {
            let tracer = self.tracer.lock().upgrade();
            if let Some(tracer) = tracer {
                let code = &self.helper;
                let result = tracer
                    .dispatch(TraceEvent::UnitStart { code, offset: 0 }, frame)
                    .and_then(|_| {
                        tracer.dispatch(TraceEvent::UnitReturn { code, offset: 0 }, frame)
                    });
                self.nested.lock().push(result);
            }
        }
        if file_name.starts_with("src/") {
            Ok(FileDisposition::traced(file_name))
        } else {
            Ok(FileDisposition::skipped("policy support code"))
        }
    }
}

fn event_raising_tracer(helper: CodeObject) -> (Arc<Tracer>, Arc<EventRaisingPolicy>) {
    let policy = Arc::new(EventRaisingPolicy {
        trigger: "src/a.raya",
        helper,
        tracer: Mutex::new(Weak::new()),
        nested: Mutex::new(Vec::new()),
    });
    let mut tracer = Tracer::new(TracerConfig::lines(), Arc::new(RecordingMonitor::default()));
    tracer.set_should_trace(policy.clone());
    tracer.set_data(Arc::new(TraceData::new(TracerConfig::lines().mode())));
    let tracer = Arc::new(tracer);
    *policy.tracer.lock() = Arc::downgrade(&tracer);
    tracer.start().unwrap();
    (tracer, policy)
}

/// Start `code` on a worker thread; fails the test instead of hanging.
fn start_on_worker(tracer: &Arc<Tracer>, code: CodeObject) -> (TraceResult<()>, usize) {
    let (tx, rx) = mpsc::channel();
    let tracer = tracer.clone();
    std::thread::spawn(move || {
        let result = tracer.dispatch(TraceEvent::UnitStart { code: &code, offset: 0 }, &NoFrame);
        let _ = tx.send((result, tracer.frame_depth()));
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("dispatch did not return")
}

#[test]
fn test_policy_may_raise_events_for_other_files() {
    let (tracer, policy) = event_raising_tracer(unit(2, "lib/policy.raya", 40, 41));

    let (result, depth) = start_on_worker(&tracer, unit(1, "src/a.raya", 1, 3));

    assert!(result.is_ok());
    assert_eq!(depth, 1);
    assert_eq!(*policy.nested.lock(), vec![Ok(())]);
    assert!(tracer.is_running());
    assert_eq!(tracer.registry().len(), 2);
    assert!(tracer.dispositions().get("src/a.raya").unwrap().trace);
    assert!(!tracer.dispositions().get("lib/policy.raya").unwrap().trace);
}

#[test]
fn test_policy_raising_events_for_its_own_file_fails_cleanly() {
    let (tracer, policy) = event_raising_tracer(unit(2, "src/a.raya", 40, 41));

    let (result, _) = start_on_worker(&tracer, unit(1, "src/a.raya", 1, 3));

    assert!(result.is_ok());
    assert_eq!(
        *policy.nested.lock(),
        vec![Err(TraceError::ReentrantDecision {
            file: "src/a.raya".to_string()
        })]
    );
    assert!(tracer.is_disabled());
    assert!(tracer.dispositions().get("src/a.raya").unwrap().trace);
}

// ===== Context hooks =====

#[derive(Default)]
struct TestContexts {
    switches: Mutex<Vec<Option<String>>>,
    asked: AtomicUsize,
}

impl ContextHooks for TestContexts {
    fn should_start_context(&self, frame: &dyn FrameContext) -> Option<String> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        match frame.line_number() {
            Some(line) if line >= 100 => Some(format!("test_at_{}", line)),
            _ => None,
        }
    }

    fn switch_context(&self, name: Option<&str>) {
        self.switches.lock().push(name.map(str::to_string));
    }
}

#[test]
fn test_context_started_and_ended_by_same_frame() {
    let monitor = Arc::new(RecordingMonitor::default());
    let hooks = Arc::new(TestContexts::default());
    let mut tracer = Tracer::new(TracerConfig::lines(), monitor);
    tracer.set_should_trace(Arc::new(trace_everything));
    tracer.set_data(Arc::new(TraceData::new(TracerConfig::lines().mode())));
    tracer.set_context_hooks(hooks.clone());
    tracer.start().unwrap();

    let runner = unit(1, "src/runner.raya", 1, 5);
    let test_fn = unit(2, "src/test_a.raya", 100, 102);
    let helper = unit(3, "src/helper.raya", 200, 201);

    tracer
        .dispatch(TraceEvent::UnitStart { code: &runner, offset: 0 }, &AtLine(1))
        .unwrap();
    tracer
        .dispatch(TraceEvent::UnitStart { code: &test_fn, offset: 0 }, &AtLine(100))
        .unwrap();
    // Context already active: helper is not asked.
    tracer
        .dispatch(TraceEvent::UnitStart { code: &helper, offset: 0 }, &AtLine(200))
        .unwrap();
    tracer
        .dispatch(TraceEvent::UnitReturn { code: &helper, offset: 0 }, &NoFrame)
        .unwrap();
    assert_eq!(hooks.switches.lock().len(), 1);

    tracer
        .dispatch(TraceEvent::UnitReturn { code: &test_fn, offset: 0 }, &NoFrame)
        .unwrap();
    tracer
        .dispatch(TraceEvent::UnitReturn { code: &runner, offset: 0 }, &NoFrame)
        .unwrap();

    assert_eq!(hooks.asked.load(Ordering::SeqCst), 2);
    assert_eq!(
        *hooks.switches.lock(),
        vec![Some("test_at_100".to_string()), None]
    );
}
