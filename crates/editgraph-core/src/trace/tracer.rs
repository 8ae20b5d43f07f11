//! Explicit-instrumentation execution tracer.
//!
//! Instrumented functions open a [`CallGuard`] on entry (usually through
//! [`trace_call!`](crate::trace_call)); dropping the guard is the return
//! event. Guards only record while an [`ExecutionTracer::trace_code`] region
//! is active on the same thread, so instrumentation left in place costs one
//! thread-local lookup when nothing is being traced.
//!
//! State is per thread: concurrent traces on different threads never share a
//! call stack, and at most one trace is active per thread.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TracerConfig;
use crate::errors::{EditGraphError, EditGraphResult};
use crate::trace::call_graph::{CallGraph, CallNode};

const MAX_REPR_CHARS: usize = 100;
const DEFAULT_LABEL: &str = "<string>";

// ---------------------------------------------------------------------------
// Thread-local trace state
// ---------------------------------------------------------------------------

struct ActiveTrace {
    graph: CallGraph,
    /// Call ids of the open traced calls, innermost last.
    stack: Vec<String>,
    config: TracerConfig,
    generation: u64,
}

impl ActiveTrace {
    fn should_trace(&self, module: &str) -> bool {
        if !self.config.include_only.is_empty() {
            return self
                .config
                .include_only
                .iter()
                .any(|p| module_matches(module, p));
        }
        !self
            .config
            .exclude_modules
            .iter()
            .any(|p| module_matches(module, p))
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<ActiveTrace>> = const { RefCell::new(None) };
}

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// `prefix` matches whole `::` segments: `app` covers `app` and `app::db`
/// but not `application`.
fn module_matches(module: &str, prefix: &str) -> bool {
    module == prefix
        || module
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with("::"))
}

/// Run `f` against the active trace if it is still the one `generation`
/// refers to. Never panics, including during unwinding or thread teardown.
fn with_active(generation: u64, f: impl FnOnce(&mut ActiveTrace)) {
    let _ = ACTIVE.try_with(|cell| {
        if let Ok(mut slot) = cell.try_borrow_mut() {
            if let Some(active) = slot.as_mut() {
                if active.generation == generation {
                    f(active);
                }
            }
        }
    });
}

fn is_active_on_thread() -> bool {
    ACTIVE
        .try_with(|cell| cell.try_borrow().map(|s| s.is_some()).unwrap_or(true))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Value capture
// ---------------------------------------------------------------------------

/// Structured form of `value`, or its truncated debug text when it does not
/// serialize. A panicking `Serialize`/`Debug` impl yields a placeholder.
pub fn capture_value<T: Serialize + fmt::Debug + ?Sized>(value: &T) -> serde_json::Value {
    let captured = catch_unwind(AssertUnwindSafe(|| match serde_json::to_value(value) {
        Ok(v) => v,
        Err(_) => serde_json::Value::String(truncate_repr(&format!("{value:?}"))),
    }));
    captured.unwrap_or_else(|_| serde_json::Value::String("<unrepresentable>".to_string()))
}

fn truncate_repr(repr: &str) -> String {
    if repr.chars().count() > MAX_REPR_CHARS {
        let head: String = repr.chars().take(MAX_REPR_CHARS - 3).collect();
        format!("{head}...")
    } else {
        repr.to_string()
    }
}

/// Last path segment of a type name, generics stripped.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Instrumentation points
// ---------------------------------------------------------------------------

/// Where an instrumented function lives.
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    pub function: &'a str,
    pub module: &'a str,
    pub file: &'a str,
    pub line: u32,
}

/// Open a traced call. See [`trace_call!`](crate::trace_call).
///
/// Calls in filtered modules, calls made at the depth limit and calls made
/// outside a trace get an inactive guard; children of a filtered call attach
/// to the nearest traced ancestor.
pub fn enter(frame: Frame<'_>) -> CallGuard {
    let opened = ACTIVE.try_with(|cell| {
        let mut slot = cell.try_borrow_mut().ok()?;
        let active = slot.as_mut()?;
        if !active.should_trace(frame.module) || active.stack.len() >= active.config.max_depth {
            return None;
        }

        let depth = active.stack.len();
        let call_id = format!("{depth}_{}", active.graph.total_calls());
        let mut node = CallNode::new(frame.function, frame.module, frame.file, frame.line);
        node.call_id = call_id.clone();
        node.start_time = Some(Utc::now());

        let parent = active.stack.last().cloned();
        active.graph.add_call(node, parent.as_deref());
        active.stack.push(call_id.clone());

        Some(CallGuard {
            call_id: Some(call_id),
            generation: active.generation,
            capture_args: active.config.capture_args,
            capture_return: active.config.capture_return,
            exception_recorded: false,
            _not_send: PhantomData,
        })
    });
    opened.ok().flatten().unwrap_or_else(CallGuard::inactive)
}

/// Open a traced call for the enclosing function.
///
/// ```ignore
/// fn load(path: &str) -> Result<Config, LoadError> {
///     let mut call = trace_call!("load");
///     call.arg("path", &path);
///     call.finish(parse(path))
/// }
/// ```
#[macro_export]
macro_rules! trace_call {
    ($name:expr) => {
        $crate::trace::tracer::enter($crate::trace::tracer::Frame {
            function: $name,
            module: module_path!(),
            file: file!(),
            line: line!(),
        })
    };
}

/// An open call; dropping it records the return.
///
/// Guards are bound to the thread and the trace that created them.
#[must_use = "the call ends when the guard is dropped"]
pub struct CallGuard {
    call_id: Option<String>,
    generation: u64,
    capture_args: bool,
    capture_return: bool,
    exception_recorded: bool,
    _not_send: PhantomData<*const ()>,
}

impl CallGuard {
    fn inactive() -> Self {
        Self {
            call_id: None,
            generation: 0,
            capture_args: false,
            capture_return: false,
            exception_recorded: false,
            _not_send: PhantomData,
        }
    }

    pub fn is_active(&self) -> bool {
        self.call_id.is_some()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    fn update(&self, f: impl FnOnce(&mut ActiveTrace, &str)) {
        if let Some(id) = self.call_id.as_deref() {
            with_active(self.generation, |active| f(active, id));
        }
    }

    /// Record an argument. Names starting with `_` are skipped.
    pub fn arg<T: Serialize + fmt::Debug + ?Sized>(&mut self, name: &str, value: &T) -> &mut Self {
        if !self.capture_args || name.starts_with('_') {
            return self;
        }
        if !self.is_active() {
            return self;
        }
        let captured = capture_value(value);
        self.update(|active, id| {
            if let Some(node) = active.graph.get_mut(id) {
                node.arguments
                    .get_or_insert_with(IndexMap::new)
                    .insert(name.to_string(), captured);
            }
        });
        self
    }

    pub fn returned<T: Serialize + fmt::Debug + ?Sized>(&mut self, value: &T) -> &mut Self {
        if self.capture_return && self.is_active() {
            let captured = capture_value(value);
            self.update(|active, id| {
                if let Some(node) = active.graph.get_mut(id) {
                    node.return_value = Some(captured);
                }
            });
        }
        self
    }

    /// Record an error observed in this call. The call stays open.
    pub fn raised<E: fmt::Display + ?Sized>(&mut self, error: &E) -> &mut Self {
        if self.is_active() {
            let message = error.to_string();
            self.update(|active, id| {
                active
                    .graph
                    .record_exception(id, short_type_name::<E>(), &message);
            });
            self.exception_recorded = true;
        }
        self
    }

    /// Close the call with `result`, recording the error if there is one.
    pub fn finish<T, E: fmt::Display>(mut self, result: Result<T, E>) -> Result<T, E> {
        if let Err(e) = &result {
            self.raised(e);
        }
        result
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let Some(call_id) = self.call_id.take() else {
            return;
        };
        let unwinding = std::thread::panicking() && !self.exception_recorded;
        with_active(self.generation, |active| {
            if unwinding {
                active.graph.record_exception(&call_id, "panic", "unwound by panic");
            }
            if let Some(node) = active.graph.get_mut(&call_id) {
                node.end_time = Some(Utc::now());
            }
            if let Some(pos) = active.stack.iter().rposition(|id| *id == call_id) {
                active.stack.truncate(pos);
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Traced regions
// ---------------------------------------------------------------------------

/// Captured output of a traced region.
#[derive(Debug, Default)]
pub struct TraceIo {
    stdout: String,
    stderr: String,
}

impl TraceIo {
    pub fn print(&mut self, text: &str) {
        self.stdout.push_str(text);
    }

    pub fn println(&mut self, text: &str) {
        self.stdout.push_str(text);
        self.stdout.push('\n');
    }

    pub fn eprintln(&mut self, text: &str) {
        self.stderr.push_str(text);
        self.stderr.push('\n');
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }
}

impl fmt::Write for TraceIo {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.stdout.push_str(s);
        Ok(())
    }
}

/// Everything observed while one region ran.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub trace_id: String,
    pub call_graph: CallGraph,

    pub stdout: String,
    pub stderr: String,

    pub exception_occurred: bool,
    pub exception_type: Option<String>,
    pub exception_message: Option<String>,
    pub traceback: Option<String>,

    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    pub source_code: String,
    pub file_path: Option<String>,
}

impl ExecutionTrace {
    pub fn duration_ms(&self) -> Option<f64> {
        self.end_time.map(|end| {
            let micros = (end - self.start_time).num_microseconds().unwrap_or(0);
            micros as f64 / 1000.0
        })
    }

    pub fn success(&self) -> bool {
        !self.exception_occurred
    }
}

/// Clears the thread's trace slot however the region ends.
struct ResetOnDrop;

impl Drop for ResetOnDrop {
    fn drop(&mut self) {
        let _ = ACTIVE.try_with(|cell| {
            if let Ok(mut slot) = cell.try_borrow_mut() {
                slot.take();
            }
        });
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionTracer {
    config: TracerConfig,
}

impl ExecutionTracer {
    pub fn new(config: TracerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// Run `body` with tracing active on this thread.
    ///
    /// `source` and `label` describe what is being run; `label` defaults to
    /// `<string>` and heads the traceback. An `Err` from `body` or a panic
    /// inside it is captured in the returned trace rather than propagated.
    pub fn trace_code<F, E>(
        &self,
        source: &str,
        label: Option<&str>,
        body: F,
    ) -> EditGraphResult<ExecutionTrace>
    where
        F: FnOnce(&mut TraceIo) -> Result<(), E>,
        E: fmt::Display,
    {
        if is_active_on_thread() {
            return Err(EditGraphError::Trace(
                "a trace is already active on this thread".to_string(),
            ));
        }

        let generation = GENERATION.fetch_add(1, Ordering::Relaxed);
        ACTIVE.with(|cell| {
            *cell.borrow_mut() = Some(ActiveTrace {
                graph: CallGraph::new(),
                stack: Vec::new(),
                config: self.config.clone(),
                generation,
            });
        });
        let reset = ResetOnDrop;

        let mut io = TraceIo::default();
        let start_time = Utc::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| body(&mut io)));
        let end_time = Utc::now();

        let mut graph = ACTIVE
            .with(|cell| cell.borrow_mut().take())
            .map(|active| active.graph)
            .unwrap_or_default();
        drop(reset);
        graph.end_time = Some(end_time);

        let exception = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some((short_type_name::<E>().to_string(), e.to_string())),
            Err(payload) => Some(("panic".to_string(), panic_message(payload.as_ref()))),
        };

        let label = label.unwrap_or(DEFAULT_LABEL);
        let traceback = exception
            .as_ref()
            .map(|(kind, message)| build_traceback(&graph, label, kind, message));

        let trace_id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(16).collect();
        debug!(
            "trace {trace_id}: {} calls, exception={:?}",
            graph.total_calls(),
            exception.as_ref().map(|(k, _)| k)
        );

        let (exception_type, exception_message) = match exception {
            Some((kind, message)) => (Some(kind), Some(message)),
            None => (None, None),
        };

        Ok(ExecutionTrace {
            trace_id,
            call_graph: graph,
            stdout: io.stdout,
            stderr: io.stderr,
            exception_occurred: exception_type.is_some(),
            exception_type,
            exception_message,
            traceback,
            start_time,
            end_time: Some(end_time),
            source_code: source.to_string(),
            file_path: Some(label.to_string()),
        })
    }
}

/// Python-style traceback through the deepest call that recorded an error.
fn build_traceback(graph: &CallGraph, label: &str, kind: &str, message: &str) -> String {
    let mut lines = vec![
        "Traceback (most recent call last):".to_string(),
        format!("  File \"{label}\", line 1, in <module>"),
    ];

    let deepest = graph
        .nodes()
        .iter()
        .filter(|n| n.exception.is_some())
        .max_by_key(|n| n.depth);
    if let Some(node) = deepest {
        for frame in graph.call_chain(&node.call_id) {
            lines.push(format!(
                "  File \"{}\", line {}, in {}",
                frame.file_path, frame.line_number, frame.function_name
            ));
        }
    }

    lines.push(format!("{kind}: {message}"));
    lines.join("\n")
}
