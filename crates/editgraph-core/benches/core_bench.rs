//! Criterion benchmarks for editgraph-core.
//!
//! ## Benchmark groups
//!
//! 1. **symbols**: symbol extraction and symbol diffing on Python sources.
//! 2. **store**: recording edits and the main queries on an in-memory store.
//! 3. **trace**: traced recursion, call-graph rendering, context generation.
//! 4. **snapshot**: capturing and diffing a synthetic source tree.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/editgraph-core/Cargo.toml
//! # Run only the store group:
//! cargo bench --manifest-path crates/editgraph-core/Cargo.toml -- store
//! ```

use std::fs;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use editgraph_core::config::TracerConfig;
use editgraph_core::indexer::diff::{changed_lines, find_affected_symbols, unified_diff};
use editgraph_core::indexer::filesystem::{capture_source_file_states, diff_file_states};
use editgraph_core::indexer::symbols::extract_symbols;
use editgraph_core::memory::linker::{create_edit_from_file_change, ConversationLinker, Session};
use editgraph_core::store::graph::SemanticEditGraph;
use editgraph_core::trace::context::{TraceContextGenerator, DEFAULT_PROMPT_LENGTH};
use editgraph_core::trace::tracer::ExecutionTracer;
use editgraph_core::trace_call;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A Python module with `n` functions and one class every ten functions.
fn synthetic_module(n: usize) -> String {
    let mut src = String::from("import os\nfrom typing import List\n\nLIMIT = 10\n\n");
    for i in 0..n {
        if i % 10 == 0 {
            src.push_str(&format!(
                "class Handler{i}(Base):\n    \"\"\"Handler {i}.\"\"\"\n\n    def run(self, items: List[int]) -> int:\n        return sum(items)\n\n"
            ));
        }
        src.push_str(&format!(
            "def func_{i}(a, b=1, *args, **kwargs):\n    total = a + b\n    return total * {i}\n\n"
        ));
    }
    src
}

fn populated_store(n: usize) -> SemanticEditGraph {
    let graph = SemanticEditGraph::open_in_memory().unwrap();
    let linker = ConversationLinker::new(Session::detached());
    for i in 0..n {
        let original = format!("def func_{i}(a):\n    return a\n");
        let new = format!("def func_{i}(a, b=0):\n    return a + b\n");
        let edit = create_edit_from_file_change(
            &format!("pkg/mod_{}.py", i % 20),
            &original,
            &new,
            "add an optional second argument",
            &linker,
        );
        graph.record_edit(&edit).unwrap();
    }
    graph
}

fn fib(n: u32) -> u64 {
    let _call = trace_call!("fib");
    if n < 2 {
        n as u64
    } else {
        fib(n - 1) + fib(n - 2)
    }
}

// ---------------------------------------------------------------------------
// 1. Symbols
// ---------------------------------------------------------------------------

fn bench_symbols(c: &mut Criterion) {
    let mut group = c.benchmark_group("symbols");

    for n in [10usize, 100] {
        let src = synthetic_module(n);
        group.bench_with_input(BenchmarkId::new("extract_symbols", n), &src, |b, src| {
            b.iter(|| extract_symbols(black_box(src)));
        });
    }

    let original = synthetic_module(100);
    let modified = original.replace(
        "def func_50(a, b=1, *args, **kwargs):",
        "def func_50(a, b=2, c=3, *args, **kwargs):",
    );

    group.bench_function("find_affected_symbols_100", |b| {
        b.iter(|| find_affected_symbols(black_box(&original), black_box(&modified), "bench.py"));
    });

    group.bench_function("changed_lines_100", |b| {
        b.iter(|| changed_lines(black_box(&original), black_box(&modified)));
    });

    group.bench_function("unified_diff_100", |b| {
        b.iter(|| unified_diff(black_box(&original), black_box(&modified), "bench.py"));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 2. Store
// ---------------------------------------------------------------------------

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    let linker = ConversationLinker::new(Session::detached());

    group.bench_function("record_edit", |b| {
        let graph = SemanticEditGraph::open_in_memory().unwrap();
        b.iter(|| {
            let edit = create_edit_from_file_change(
                "app.py",
                "def add(a, b):\n    return a + b\n",
                "def add(a, b, c=0):\n    return a + b + c\n",
                "add an optional third argument",
                &linker,
            );
            graph.record_edit(black_box(&edit)).unwrap()
        });
    });

    let graph = populated_store(500);

    group.bench_function("query_by_symbol", |b| {
        b.iter(|| graph.query_by_symbol(black_box("func_250"), 10).unwrap());
    });

    group.bench_function("query_by_file", |b| {
        b.iter(|| graph.query_by_file(black_box("pkg/mod_7.py"), 10).unwrap());
    });

    group.bench_function("query_by_intent", |b| {
        b.iter(|| graph.query_by_intent(black_box("optional"), 10).unwrap());
    });

    group.bench_function("institutional_knowledge", |b| {
        b.iter(|| {
            graph
                .get_institutional_knowledge(black_box("pkg/mod_3.py"), 10)
                .unwrap()
        });
    });

    group.bench_function("statistics", |b| {
        b.iter(|| graph.get_statistics().unwrap());
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 3. Trace
// ---------------------------------------------------------------------------

fn bench_trace(c: &mut Criterion) {
    let mut group = c.benchmark_group("trace");
    let tracer = ExecutionTracer::new(TracerConfig::default());

    group.bench_function("trace_fib_15", |b| {
        b.iter(|| {
            tracer
                .trace_code("fib(15)", None, |io| {
                    io.println(&fib(black_box(15)).to_string());
                    Ok::<(), std::fmt::Error>(())
                })
                .unwrap()
        });
    });

    group.bench_function("untraced_fib_15", |b| {
        b.iter(|| fib(black_box(15)));
    });

    let trace = tracer
        .trace_code("fib(12)", None, |_| {
            black_box(fib(12));
            Ok::<(), std::fmt::Error>(())
        })
        .unwrap();
    let generator = TraceContextGenerator::default();

    group.bench_function("tree_string", |b| {
        b.iter(|| trace.call_graph.to_tree_string(black_box(10)));
    });

    group.bench_function("hot_functions", |b| {
        b.iter(|| trace.call_graph.hot_functions(black_box(10)));
    });

    group.bench_function("generate_context", |b| {
        b.iter(|| {
            generator
                .generate(black_box(&trace))
                .to_prompt_string(DEFAULT_PROMPT_LENGTH)
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 4. Snapshot
// ---------------------------------------------------------------------------

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    group.sample_size(20);

    let dir = tempfile::tempdir().unwrap();
    for pkg in 0..10 {
        let pkg_dir = dir.path().join(format!("pkg{pkg}"));
        fs::create_dir_all(&pkg_dir).unwrap();
        for i in 0..20 {
            fs::write(pkg_dir.join(format!("mod_{i}.py")), synthetic_module(5)).unwrap();
        }
    }
    fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
    fs::write(dir.path().join("node_modules/dep/index.js"), "module.exports = {};").unwrap();

    group.bench_function("capture_200_files", |b| {
        b.iter(|| capture_source_file_states(black_box(dir.path()), 500));
    });

    let before = capture_source_file_states(dir.path(), 500);
    fs::write(dir.path().join("pkg3/mod_4.py"), "# rewritten\n").unwrap();
    fs::write(dir.path().join("pkg3/fresh.py"), "# new\n").unwrap();
    let after = capture_source_file_states(dir.path(), 500);

    group.bench_function("diff_200_files", |b| {
        b.iter(|| diff_file_states(black_box(&before), black_box(&after)));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Register all benchmark groups
// ---------------------------------------------------------------------------

criterion_group!(benches, bench_symbols, bench_store, bench_trace, bench_snapshot);
criterion_main!(benches);
