//! Turns an [`ExecutionTrace`] into bounded text for model context.

use crate::config::ContextConfig;
use crate::trace::call_graph::CallNode;
use crate::trace::tracer::ExecutionTrace;

pub const DEFAULT_PROMPT_LENGTH: usize = 2000;

const OUTPUT_PREVIEW_CHARS: usize = 100;
const TRACEBACK_TAIL_LINES: usize = 10;
const EXCEPTION_CHAIN_SHOWN: usize = 5;
const RANKING_SHOWN: usize = 5;
const EDIT_PATH_SHOWN: usize = 15;
const PROGRAM_OUTPUT_LIMIT: usize = 500;
const SLOW_THRESHOLD_MS: f64 = 100.0;
const HOT_THRESHOLD_CALLS: usize = 100;

/// Sections describing one traced execution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceContext {
    pub summary: String,
    pub call_flow: String,
    pub exceptions: String,
    pub performance: String,
    pub files_touched: Vec<String>,
}

impl TraceContext {
    /// Assemble the sections as markdown, capped at `max_length` characters.
    pub fn to_prompt_string(&self, max_length: usize) -> String {
        let mut parts = vec![
            "## Execution Context".to_string(),
            String::new(),
            "### Summary".to_string(),
            self.summary.clone(),
            String::new(),
        ];
        if !self.exceptions.is_empty() {
            parts.extend([
                "### Exceptions".to_string(),
                self.exceptions.clone(),
                String::new(),
            ]);
        }
        parts.extend([
            "### Call Flow".to_string(),
            self.call_flow.clone(),
            String::new(),
        ]);
        if !self.performance.is_empty() {
            parts.extend(["### Performance".to_string(), self.performance.clone()]);
        }

        let text = parts.join("\n");
        if text.chars().count() > max_length {
            let head: String = text.chars().take(max_length.saturating_sub(100)).collect();
            format!("{head}\n\n... [truncated]")
        } else {
            text
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TraceContextGenerator {
    pub max_call_depth: usize,
    pub max_calls_shown: usize,
    pub include_timing: bool,
}

impl Default for TraceContextGenerator {
    fn default() -> Self {
        Self::new(&ContextConfig::default())
    }
}

impl TraceContextGenerator {
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            max_call_depth: config.max_call_depth,
            max_calls_shown: config.max_calls_shown,
            include_timing: config.include_timing,
        }
    }

    pub fn generate(&self, trace: &ExecutionTrace) -> TraceContext {
        TraceContext {
            summary: self.generate_summary(trace),
            call_flow: self.generate_call_flow(trace),
            exceptions: self.generate_exceptions(trace),
            performance: self.generate_performance(trace),
            files_touched: trace.call_graph.files_touched.iter().cloned().collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Sections
    // -----------------------------------------------------------------------

    fn generate_summary(&self, trace: &ExecutionTrace) -> String {
        let graph = &trace.call_graph;
        let mut lines = vec![format!(
            "Execution: {}",
            if trace.success() { "SUCCESS" } else { "FAILED" }
        )];

        if let Some(ms) = trace.duration_ms().filter(|ms| *ms != 0.0) {
            lines.push(format!("Duration: {ms:.1}ms"));
        }
        lines.push(format!("Total calls: {}", graph.total_calls()));
        lines.push(format!("Unique functions: {}", graph.functions_called.len()));
        lines.push(format!("Files touched: {}", graph.files_touched.len()));

        if trace.exception_occurred {
            lines.push(format!(
                "Exception: {}: {}",
                trace.exception_type.as_deref().unwrap_or(""),
                trace.exception_message.as_deref().unwrap_or("")
            ));
        }

        if !trace.stdout.is_empty() {
            let preview: String = trace
                .stdout
                .chars()
                .take(OUTPUT_PREVIEW_CHARS)
                .collect::<String>()
                .replace('\n', " ");
            let ellipsis = if trace.stdout.chars().count() > OUTPUT_PREVIEW_CHARS {
                "..."
            } else {
                ""
            };
            lines.push(format!("Output: {preview}{ellipsis}"));
        }

        lines.join("\n")
    }

    fn generate_call_flow(&self, trace: &ExecutionTrace) -> String {
        let graph = &trace.call_graph;
        if graph.roots().next().is_none() {
            return "No calls traced".to_string();
        }

        let mut lines = Vec::new();
        let mut shown = 0;
        let total = graph.total_calls();
        for root in graph.roots() {
            self.format_call(trace, root, 0, &mut shown, &mut lines);
            if shown >= self.max_calls_shown {
                if total > shown {
                    lines.push(format!("... and {} more calls", total - shown));
                }
                break;
            }
        }
        lines.join("\n")
    }

    fn format_call(
        &self,
        trace: &ExecutionTrace,
        node: &CallNode,
        depth: usize,
        shown: &mut usize,
        lines: &mut Vec<String>,
    ) {
        if *shown >= self.max_calls_shown || depth > self.max_call_depth {
            return;
        }
        *shown += 1;

        let mut line = format!("{}{}()", "  ".repeat(depth), node.function_name);
        if node.line_number > 0 {
            line.push_str(&format!(" @ line {}", node.line_number));
        }
        if self.include_timing {
            if let Some(ms) = node.duration_ms().filter(|ms| *ms != 0.0) {
                line.push_str(&format!(" [{ms:.1}ms]"));
            }
        }
        if node.exception.is_some() {
            line.push_str(&format!(
                " RAISED {}",
                node.exception_type.as_deref().unwrap_or("Unknown")
            ));
        }
        lines.push(line);

        for child in trace.call_graph.children(node) {
            self.format_call(trace, child, depth + 1, shown, lines);
        }
    }

    fn generate_exceptions(&self, trace: &ExecutionTrace) -> String {
        if !trace.exception_occurred {
            return String::new();
        }

        let mut lines = vec![
            format!("Type: {}", trace.exception_type.as_deref().unwrap_or("")),
            format!("Message: {}", trace.exception_message.as_deref().unwrap_or("")),
        ];

        if let Some(traceback) = trace.traceback.as_deref().filter(|t| !t.is_empty()) {
            lines.push(format!("Traceback (last {TRACEBACK_TAIL_LINES} lines):"));
            let tb: Vec<&str> = traceback.trim().lines().collect();
            let start = tb.len().saturating_sub(TRACEBACK_TAIL_LINES);
            lines.extend(tb[start..].iter().map(|l| l.to_string()));
        }

        let raised = &trace.call_graph.exceptions_raised;
        if !raised.is_empty() {
            lines.push(String::new());
            lines.push("Exception call chain:".to_string());
            for exc in raised.iter().take(EXCEPTION_CHAIN_SHOWN) {
                lines.push(format!("  - {exc}"));
            }
        }

        lines.join("\n")
    }

    fn generate_performance(&self, trace: &ExecutionTrace) -> String {
        let graph = &trace.call_graph;
        if graph.is_empty() {
            return String::new();
        }

        let mut lines = vec!["Most called functions:".to_string()];
        for stat in graph.hot_functions(RANKING_SHOWN) {
            lines.push(format!(
                "  {}: {}x ({:.1}ms total)",
                stat.short_name(),
                stat.calls,
                stat.total_ms
            ));
        }

        let slow = graph.slow_functions(RANKING_SHOWN);
        if !slow.is_empty() {
            lines.push(String::new());
            lines.push("Slowest functions:".to_string());
            for stat in slow {
                lines.push(format!(
                    "  {}: {:.1}ms total ({:.1}ms avg, {}x)",
                    stat.short_name(),
                    stat.total_ms,
                    stat.avg_ms(),
                    stat.calls
                ));
            }
        }

        lines.join("\n")
    }

    // -----------------------------------------------------------------------
    // Edit-focused view
    // -----------------------------------------------------------------------

    /// Context for an edit, narrowed to calls whose file or function name
    /// contains the focus strings.
    pub fn to_edit_context(
        &self,
        trace: &ExecutionTrace,
        focus_file: Option<&str>,
        focus_function: Option<&str>,
    ) -> String {
        let mut lines = vec![
            "## Execution-Informed Edit Context".to_string(),
            String::new(),
        ];

        if trace.exception_occurred {
            lines.push("### Observed Issue".to_string());
            lines.push(format!(
                "**Exception**: {}: {}",
                trace.exception_type.as_deref().unwrap_or(""),
                trace.exception_message.as_deref().unwrap_or("")
            ));
            lines.push(String::new());
            if let Some(traceback) = trace.traceback.as_deref().filter(|t| !t.is_empty()) {
                lines.push("**Traceback**:".to_string());
                lines.push("```".to_string());
                lines.push(traceback.to_string());
                lines.push("```".to_string());
                lines.push(String::new());
            }
        }

        let mut relevant: Vec<&CallNode> = trace
            .call_graph
            .nodes()
            .iter()
            .filter(|n| focus_file.map_or(true, |f| n.file_path.contains(f)))
            .filter(|n| focus_function.map_or(true, |f| n.function_name.contains(f)))
            .collect();

        lines.push("### Execution Path".to_string());
        if relevant.is_empty() {
            lines.push("No relevant calls traced".to_string());
        } else {
            relevant.sort_by(|a, b| (a.depth, a.start_time).cmp(&(b.depth, b.start_time)));
            for node in relevant.iter().take(EDIT_PATH_SHOWN) {
                let mut line = format!(
                    "{}- `{}()` at line {}",
                    "  ".repeat(node.depth.min(4)),
                    node.function_name,
                    node.line_number
                );
                if let Some(ms) = node.duration_ms() {
                    line.push_str(&format!(" ({ms:.1}ms)"));
                }
                if node.exception.is_some() {
                    line.push_str(&format!(
                        " **RAISED {}**",
                        node.exception_type.as_deref().unwrap_or("Unknown")
                    ));
                }
                lines.push(line);
            }
            if relevant.len() > EDIT_PATH_SHOWN {
                lines.push(format!(
                    "  ... and {} more calls",
                    relevant.len() - EDIT_PATH_SHOWN
                ));
            }
        }
        lines.push(String::new());

        if !trace.stdout.is_empty() && trace.stdout.chars().count() < PROGRAM_OUTPUT_LIMIT {
            lines.push("### Program Output".to_string());
            lines.push("```".to_string());
            lines.push(trace.stdout.trim().to_string());
            lines.push("```".to_string());
            lines.push(String::new());
        }

        lines.push("### Observations".to_string());
        let observations = self.observations(trace, focus_file);
        if observations.is_empty() {
            lines.push("- Execution completed normally".to_string());
        } else {
            lines.extend(observations);
        }

        lines.join("\n")
    }

    fn observations(&self, trace: &ExecutionTrace, focus_file: Option<&str>) -> Vec<String> {
        let mut found = Vec::new();

        if trace.exception_occurred {
            found.push(format!(
                "- Exception `{}` occurred during execution",
                trace.exception_type.as_deref().unwrap_or("")
            ));
            if let (Some(traceback), Some(focus)) = (trace.traceback.as_deref(), focus_file) {
                let location = traceback
                    .lines()
                    .rev()
                    .find(|l| l.to_lowercase().contains("line") && l.contains(focus));
                if let Some(line) = location {
                    found.push(format!("- Error location: {}", line.trim()));
                }
            }
        }

        let graph = &trace.call_graph;
        for stat in graph.slow_functions(3) {
            if stat.total_ms > SLOW_THRESHOLD_MS {
                found.push(format!(
                    "- Function `{}` is slow ({:.0}ms)",
                    stat.name, stat.total_ms
                ));
            }
        }
        for stat in graph.hot_functions(3) {
            if stat.calls > HOT_THRESHOLD_CALLS {
                found.push(format!(
                    "- Function `{}` called {} times (consider optimization)",
                    stat.name, stat.calls
                ));
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::call_graph::CallGraph;
    use chrono::{Duration, Utc};

    fn node(id: &str, name: &str, line: u32, ms: Option<i64>) -> CallNode {
        let mut n = CallNode::new(name, "app", "src/app.rs", line);
        n.call_id = id.into();
        if let Some(ms) = ms {
            let start = Utc::now();
            n.start_time = Some(start);
            n.end_time = Some(start + Duration::milliseconds(ms));
        }
        n
    }

    fn trace_with(graph: CallGraph) -> ExecutionTrace {
        let start = Utc::now();
        ExecutionTrace {
            trace_id: "abcdef0123456789".into(),
            call_graph: graph,
            stdout: String::new(),
            stderr: String::new(),
            exception_occurred: false,
            exception_type: None,
            exception_message: None,
            traceback: None,
            start_time: start,
            end_time: Some(start + Duration::milliseconds(12)),
            source_code: String::new(),
            file_path: None,
        }
    }

    fn failing_trace() -> ExecutionTrace {
        let mut graph = CallGraph::new();
        graph.add_call(node("0_0", "main", 1, Some(5)), None);
        graph.add_call(node("1_1", "parse", 7, Some(2)), Some("0_0"));
        graph.record_exception("1_1", "ValueError", "bad token");
        let mut trace = trace_with(graph);
        trace.exception_occurred = true;
        trace.exception_type = Some("ValueError".into());
        trace.exception_message = Some("bad token".into());
        trace.traceback = Some(
            "Traceback (most recent call last):\n  File \"<string>\", line 1, in <module>\n  File \"src/app.rs\", line 7, in parse\nValueError: bad token"
                .into(),
        );
        trace
    }

    #[test]
    fn test_summary_and_flow_for_success() {
        let mut graph = CallGraph::new();
        graph.add_call(node("0_0", "main", 3, None), None);
        graph.add_call(node("1_1", "helper", 9, None), Some("0_0"));
        let mut trace = trace_with(graph);
        trace.stdout = "line one\nline two\n".into();

        let ctx = TraceContextGenerator::default().generate(&trace);
        assert_eq!(
            ctx.summary,
            "Execution: SUCCESS\nDuration: 12.0ms\nTotal calls: 2\nUnique functions: 2\nFiles touched: 1\nOutput: line one line two "
        );
        assert_eq!(ctx.call_flow, "main() @ line 3\n  helper() @ line 9");
        assert!(ctx.exceptions.is_empty());
        assert_eq!(ctx.files_touched, vec!["src/app.rs"]);
        assert!(ctx.performance.starts_with("Most called functions:\n  main: 1x (0.0ms total)"));
        assert!(!ctx.performance.contains("Slowest"));
    }

    #[test]
    fn test_empty_trace() {
        let ctx = TraceContextGenerator::default().generate(&trace_with(CallGraph::new()));
        assert_eq!(ctx.call_flow, "No calls traced");
        assert!(ctx.performance.is_empty());
        let prompt = ctx.to_prompt_string(DEFAULT_PROMPT_LENGTH);
        assert!(!prompt.contains("### Performance"));
        assert!(!prompt.contains("### Exceptions"));
    }

    #[test]
    fn test_call_flow_truncation() {
        let mut graph = CallGraph::new();
        graph.add_call(node("0_0", "main", 1, None), None);
        for i in 1..=30 {
            graph.add_call(node(&format!("1_{i}"), "step", 2, None), Some("0_0"));
        }
        let generator = TraceContextGenerator {
            max_calls_shown: 5,
            ..TraceContextGenerator::default()
        };
        let flow = generator.generate(&trace_with(graph)).call_flow;
        let lines: Vec<&str> = flow.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[5], "... and 26 more calls");
    }

    #[test]
    fn test_call_flow_depth_limit() {
        let mut graph = CallGraph::new();
        let mut parent: Option<String> = None;
        for depth in 0..8 {
            let id = format!("{depth}_{depth}");
            graph.add_call(node(&id, "level", 1, None), parent.as_deref());
            parent = Some(id);
        }
        let generator = TraceContextGenerator {
            max_call_depth: 2,
            ..TraceContextGenerator::default()
        };
        let flow = generator.generate(&trace_with(graph)).call_flow;
        assert_eq!(flow.lines().count(), 3);
    }

    #[test]
    fn test_exception_sections() {
        let trace = failing_trace();
        let generator = TraceContextGenerator::default();
        let ctx = generator.generate(&trace);

        assert!(ctx.summary.starts_with("Execution: FAILED"));
        assert!(ctx.summary.contains("Exception: ValueError: bad token"));
        assert!(ctx.call_flow.contains("  parse() @ line 7 [2.0ms] RAISED ValueError"));
        assert!(ctx.exceptions.starts_with("Type: ValueError\nMessage: bad token\nTraceback (last 10 lines):"));
        assert!(ctx.exceptions.ends_with("Exception call chain:\n  - ValueError: bad token"));
        assert!(ctx.performance.contains("Slowest functions:\n  main: 5.0ms total (5.0ms avg, 1x)"));

        let prompt = ctx.to_prompt_string(DEFAULT_PROMPT_LENGTH);
        let exc = prompt.find("### Exceptions").unwrap();
        let flow = prompt.find("### Call Flow").unwrap();
        assert!(prompt.starts_with("## Execution Context\n\n### Summary\n"));
        assert!(exc < flow);
    }

    #[test]
    fn test_prompt_truncation() {
        let ctx = TraceContext {
            summary: "s".repeat(500),
            call_flow: "c".repeat(500),
            ..TraceContext::default()
        };
        let prompt = ctx.to_prompt_string(300);
        assert!(prompt.ends_with("\n\n... [truncated]"));
        assert_eq!(prompt.chars().count(), 200 + "\n\n... [truncated]".len());
    }

    #[test]
    fn test_edit_context_for_failure() {
        let trace = failing_trace();
        let text = TraceContextGenerator::default().to_edit_context(&trace, Some("app.rs"), None);

        assert!(text.starts_with("## Execution-Informed Edit Context\n\n### Observed Issue\n**Exception**: ValueError: bad token\n"));
        assert!(text.contains("**Traceback**:\n```\nTraceback (most recent call last):"));
        assert!(text.contains("- `main()` at line 1 (5.0ms)\n  - `parse()` at line 7 (2.0ms) **RAISED ValueError**"));
        assert!(text.contains("- Exception `ValueError` occurred during execution"));
        assert!(text.contains("- Error location: File \"src/app.rs\", line 7, in parse"));
        assert!(!text.contains("completed normally"));
    }

    #[test]
    fn test_edit_context_filters_and_observations() {
        let mut graph = CallGraph::new();
        graph.add_call(node("0_0", "slow_loader", 1, Some(250)), None);
        for i in 1..=101 {
            graph.add_call(node(&format!("1_{i}"), "tick", 2, None), Some("0_0"));
        }
        let mut trace = trace_with(graph);
        trace.stdout = "ok\n".into();

        let generator = TraceContextGenerator::default();
        let text = generator.to_edit_context(&trace, None, Some("tick"));
        assert!(text.contains("  - `tick()` at line 2"));
        assert!(!text.contains("`slow_loader()`"));
        assert!(text.contains("  ... and 86 more calls"));
        assert!(text.contains("### Program Output\n```\nok\n```"));
        assert!(text.contains("- Function `app::slow_loader` is slow (250ms)"));
        assert!(text.contains("- Function `app::tick` called 101 times (consider optimization)"));

        let none = generator.to_edit_context(&trace, Some("missing.rs"), None);
        assert!(none.contains("### Execution Path\nNo relevant calls traced\n"));
    }

    #[test]
    fn test_edit_context_quiet_run() {
        let mut graph = CallGraph::new();
        graph.add_call(node("0_0", "main", 1, Some(1)), None);
        let text = TraceContextGenerator::default().to_edit_context(&trace_with(graph), None, None);
        assert!(text.ends_with("### Observations\n- Execution completed normally"));
    }
}
