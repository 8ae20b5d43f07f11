//! Records code executions and the file changes they cause.
//!
//! The host calls [`ExecutionRecorder::before_execution`] before running a
//! block of code and [`ExecutionRecorder::after_execution`] once it has
//! finished. Nothing here ever fails the host: storage and test errors are
//! logged and skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{EngineConfig, MemoryConfig};
use crate::indexer::filesystem::{
    capture_source_file_states, diff_file_states, relative_slash_path, ChangeKind, FileStates,
};
use crate::memory::linker::{create_edit_from_file_change, ConversationLinker};
use crate::models::{Edit, EditResult, TestResult};
use crate::store::graph::SemanticEditGraph;
use crate::validation::discovery::{TestDiscovery, TestRunResult, DEFAULT_MAX_TESTS};

/// Related test files run per changed file.
pub const AUTO_TEST_FILE_LIMIT: usize = 5;

const TRACEBACK_MARKER: &str = "Traceback (most recent call last):";

/// What one `after_execution` call stored.
#[derive(Clone, Debug, Default)]
pub struct ExecutionReport {
    pub execution_edit_id: Option<String>,
    pub file_edit_ids: Vec<String>,
    /// Changed paths relative to the project root.
    pub changed_files: Vec<String>,
    pub test_runs: Vec<(String, TestRunResult)>,
}

impl ExecutionReport {
    pub fn failed_test_runs(&self) -> impl Iterator<Item = &(String, TestRunResult)> {
        self.test_runs.iter().filter(|(_, r)| !r.passed)
    }
}

pub struct ExecutionRecorder {
    graph: Arc<SemanticEditGraph>,
    linker: ConversationLinker,
    project_root: PathBuf,
    memory: MemoryConfig,
    max_files: usize,
    discovery: TestDiscovery,
    baseline: Option<FileStates>,
}

impl ExecutionRecorder {
    pub fn new(
        graph: Arc<SemanticEditGraph>,
        linker: ConversationLinker,
        project_root: impl Into<PathBuf>,
        config: &EngineConfig,
    ) -> Self {
        let project_root = project_root.into();
        Self {
            discovery: TestDiscovery::from_config(&project_root, &config.validation),
            graph,
            linker,
            project_root,
            memory: config.memory.clone(),
            max_files: config.snapshot.max_files,
            baseline: None,
        }
    }

    pub fn graph(&self) -> &Arc<SemanticEditGraph> {
        &self.graph
    }

    pub fn linker(&self) -> &ConversationLinker {
        &self.linker
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Snapshot source files so the next `after_execution` can see changes.
    pub fn before_execution(&mut self) {
        if !self.memory.enabled {
            return;
        }
        let states = capture_source_file_states(&self.project_root, self.max_files);
        debug!(files = states.len(), "captured pre-execution snapshot");
        self.baseline = Some(states);
    }

    /// Record the executed code, then one edit per file it changed.
    ///
    /// `output` is the captured console output; a Python traceback in it
    /// marks the execution edit as failed.
    pub fn after_execution(
        &mut self,
        language: &str,
        code: &str,
        output: &str,
        trace_id: Option<&str>,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        if !self.memory.enabled {
            return report;
        }

        let user_message = self.last_user_message();

        let mut execution = Edit::new(None, "", code);
        execution.execution_trace_id = trace_id.map(str::to_string);
        execution.result = Some(execution_result(output));
        if let Some(message) = &user_message {
            let context = self
                .linker
                .create_context(message, Some(code.to_string()), None);
            execution.user_intent = context.intent_summary.clone().unwrap_or_default();
            execution.conversation_context = Some(context);
        }
        match self.graph.record_edit(&execution) {
            Ok(id) => {
                debug!(language, edit_id = %id, "recorded code execution");
                report.execution_edit_id = Some(id);
            }
            Err(e) => warn!(err = %e, "failed to record code execution"),
        }

        let Some(before) = self.baseline.take() else {
            return report;
        };
        let after = capture_source_file_states(&self.project_root, self.max_files);
        let changes = diff_file_states(&before, &after);
        if changes.is_empty() {
            return report;
        }

        let root = self
            .project_root
            .canonicalize()
            .unwrap_or_else(|_| self.project_root.clone());
        let message = user_message.unwrap_or_default();

        for (path, change) in changes {
            let file_path = relative_slash_path(&path, &root);
            let mut edit = create_edit_from_file_change(
                &file_path,
                &change.old_content,
                &change.new_content,
                &message,
                &self.linker,
            );
            edit.execution_trace_id = trace_id.map(str::to_string);

            if self.memory.auto_test && change.kind != ChangeKind::Deleted && file_path.ends_with(".py") {
                if let Some(run) = self.run_related_tests(&file_path) {
                    edit.result = Some(test_outcome(&run));
                    report.test_runs.push((file_path.clone(), run));
                }
            }

            match self.graph.record_edit(&edit) {
                Ok(id) => report.file_edit_ids.push(id),
                Err(e) => warn!(file_path = %file_path, err = %e, "failed to record file edit"),
            }
            report.changed_files.push(file_path);
        }

        info!(
            changed = report.changed_files.len(),
            tested = report.test_runs.len(),
            "recorded execution side effects"
        );
        report
    }

    fn last_user_message(&self) -> Option<String> {
        self.linker
            .session()
            .history
            .as_ref()
            .and_then(|h| h.messages().into_iter().rev().find(|m| m.is_user()))
            .map(|m| m.content)
    }

    fn run_related_tests(&self, file_path: &str) -> Option<TestRunResult> {
        let mut related = self.discovery.find_related_tests(file_path, DEFAULT_MAX_TESTS);
        if related.is_empty() {
            return None;
        }
        related.truncate(AUTO_TEST_FILE_LIMIT);
        let timeout = Duration::from_secs(self.memory.auto_test_timeout_secs);
        let run = self.discovery.run_tests(&related, timeout);
        if !run.passed {
            warn!(file_path, failed = ?run.failed_test_names, "auto tests failed");
        }
        Some(run)
    }
}

fn execution_result(output: &str) -> EditResult {
    if !output.contains(TRACEBACK_MARKER) {
        return EditResult::success();
    }
    let last_line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(TRACEBACK_MARKER);
    EditResult::failure(vec![last_line.to_string()])
}

fn test_outcome(run: &TestRunResult) -> EditResult {
    let mut result = if run.passed {
        EditResult::success()
    } else {
        EditResult::failure(vec![format!("Tests failed: {} failures", run.failed_tests)])
    };
    result.tests_passed = Some(run.passed);
    result.test_results = run
        .failed_test_names
        .iter()
        .map(|name| TestResult::new(name.clone(), false))
        .collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::linker::{Message, Session};
    use crate::models::EditType;
    use parking_lot::RwLock;
    use std::fs;

    fn recorder(root: &Path, config: &EngineConfig) -> ExecutionRecorder {
        let history = Arc::new(RwLock::new(vec![
            Message::user("fix the divide by zero bug in calc"),
            Message::assistant("Patching calc.py"),
        ]));
        let linker = ConversationLinker::new(Session::new(history));
        let graph = Arc::new(SemanticEditGraph::open_in_memory().unwrap());
        ExecutionRecorder::new(graph, linker, root, config)
    }

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("calc.py"),
            "def div(a, b):\n    return a / b\n",
        )
        .unwrap();
        fs::write(dir.path().join("old.py"), "x = 1\n").unwrap();
        dir
    }

    #[test]
    fn test_records_execution_and_file_changes() {
        let dir = project();
        let mut rec = recorder(dir.path(), &EngineConfig::default());

        rec.before_execution();
        fs::write(
            dir.path().join("calc.py"),
            "def div(a, b):\n    if b == 0:\n        return 0\n    return a / b\n",
        )
        .unwrap();
        fs::write(dir.path().join("new.py"), "# new").unwrap();
        fs::remove_file(dir.path().join("old.py")).unwrap();
        let report = rec.after_execution("python", "patch()", "done\n", Some("trace123"));

        assert!(report.execution_edit_id.is_some());
        assert_eq!(report.changed_files, vec!["calc.py", "new.py", "old.py"]);
        assert_eq!(report.file_edit_ids.len(), 3);
        assert!(report.test_runs.is_empty());
        assert_eq!(rec.graph().edit_count().unwrap(), 4);

        let edits = rec.graph().query_by_file("calc.py", 10).unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].edit_type, EditType::BugFix);
        assert_eq!(edits[0].primary_symbol.as_ref().unwrap().name, "div");
        assert_eq!(edits[0].execution_trace_id.as_deref(), Some("trace123"));

        let created = &rec.graph().query_by_file("new.py", 10).unwrap()[0];
        assert_eq!(created.original_content, "");
        assert_eq!(created.new_content, "# new");

        let execution = rec
            .graph()
            .get_edit(report.execution_edit_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert!(execution.file_path.is_none());
        assert_eq!(execution.new_content, "patch()");
        let ctx = execution.conversation_context.unwrap();
        assert_eq!(ctx.user_message, "fix the divide by zero bug in calc");
        assert_eq!(ctx.assistant_response.as_deref(), Some("patch()"));
        assert!(execution.result.unwrap().success);
    }

    #[test]
    fn test_traceback_marks_execution_failed() {
        let dir = project();
        let mut rec = recorder(dir.path(), &EngineConfig::default());
        let output = "Traceback (most recent call last):\n  File \"<stdin>\", line 1\nZeroDivisionError: division by zero\n";
        let report = rec.after_execution("python", "1/0", output, None);
        assert!(report.changed_files.is_empty());

        let edit = rec
            .graph()
            .get_edit(report.execution_edit_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        let result = edit.result.unwrap();
        assert!(!result.success);
        assert_eq!(result.errors, vec!["ZeroDivisionError: division by zero"]);
    }

    #[test]
    fn test_auto_test_folds_outcome_into_edit() {
        let dir = project();
        fs::write(
            dir.path().join("test_calc.py"),
            "from calc import div\n\ndef test_div():\n    assert div(4, 2) == 2\n",
        )
        .unwrap();
        let mut config = EngineConfig::default();
        config.memory.auto_test = true;
        config.validation.test_command = vec![
            "sh".into(),
            "-c".into(),
            "echo \"FAILED $1::test_div\"; echo '1 failed in 0.02s'; exit 1".into(),
            "runner".into(),
        ];
        let mut rec = recorder(dir.path(), &config);

        rec.before_execution();
        fs::write(dir.path().join("calc.py"), "def div(a, b):\n    return a // b\n").unwrap();
        let report = rec.after_execution("python", "patch()", "", None);

        assert_eq!(report.test_runs.len(), 1);
        assert_eq!(report.failed_test_runs().count(), 1);
        let edit = &rec.graph().query_by_file("calc.py", 10).unwrap()[0];
        let result = edit.result.as_ref().unwrap();
        assert!(!result.success);
        assert_eq!(result.tests_passed, Some(false));
        assert_eq!(result.test_results[0].test_name, "test_calc.py::test_div");
    }

    #[test]
    fn test_disabled_memory_records_nothing() {
        let dir = project();
        let mut config = EngineConfig::default();
        config.memory.enabled = false;
        let mut rec = recorder(dir.path(), &config);

        rec.before_execution();
        fs::write(dir.path().join("calc.py"), "changed = True\n").unwrap();
        let report = rec.after_execution("python", "x", "", None);
        assert!(report.execution_edit_id.is_none());
        assert!(report.changed_files.is_empty());
        assert_eq!(rec.graph().edit_count().unwrap(), 0);
    }
}
