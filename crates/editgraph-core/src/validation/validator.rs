//! Edit validation pipeline: syntax, then type check, then related tests.
//!
//! A syntax failure stops the pipeline. Type-check failures are warnings.
//! The test stage writes the proposed content in place for the duration of
//! the run and always restores the original afterwards.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ValidationConfig;
use crate::errors::EditGraphResult;
use crate::indexer::diff::changed_lines;
use crate::indexer::filesystem::{detect_language, matches_any};
use crate::models::{EditResult, TestResult};
use crate::validation::discovery::{TestDiscovery, TestRunResult, DEFAULT_MAX_TESTS};
use crate::validation::process::{run_command_with_timeout, DEFAULT_OUTPUT_LIMIT};
use crate::validation::rollback::{EditRollback, EditTransaction};
use crate::validation::syntax::{SyntaxCheckResult, SyntaxChecker};

/// Entries never copied into a sandbox.
pub const SANDBOX_EXCLUDES: &[&str] = &[
    "__pycache__",
    "*.pyc",
    ".git",
    "node_modules",
    ".venv",
    "venv",
    "*.egg-info",
    "dist",
    "build",
];

const CONTEXT_LIST_LIMIT: usize = 5;
const TYPE_WARNINGS_SHOWN: usize = 3;

// ---------------------------------------------------------------------------
// Stage results
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeCheckOutcome {
    Passed,
    Failed { errors: Vec<String> },
    Skipped { reason: String },
    TimedOut,
}

impl TypeCheckOutcome {
    /// Only an explicit failure counts against the edit.
    pub fn passed(&self) -> bool {
        !matches!(self, TypeCheckOutcome::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    pub syntax_result: Option<SyntaxCheckResult>,
    pub type_check: Option<TypeCheckOutcome>,
    pub test_result: Option<TestRunResult>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn pending() -> Self {
        Self {
            valid: true,
            syntax_result: None,
            type_check: None,
            test_result: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Plain-text report naming the failing stage and why.
    pub fn to_context_string(&self) -> String {
        let mut parts = vec![format!(
            "## Validation Result: {}",
            if self.valid { "PASSED" } else { "FAILED" }
        )];

        if let Some(syntax) = &self.syntax_result {
            parts.push(format!(
                "\n### Syntax: {}",
                if syntax.valid { "OK" } else { "FAILED" }
            ));
            if !syntax.valid {
                parts.extend(syntax.errors.iter().map(|e| format!("- {e}")));
            }
        }

        if let Some(outcome) = &self.type_check {
            match outcome {
                TypeCheckOutcome::Passed => parts.push("\n### Type Check: OK".to_string()),
                TypeCheckOutcome::Failed { errors } => {
                    parts.push("\n### Type Check: FAILED".to_string());
                    parts.extend(
                        errors
                            .iter()
                            .take(CONTEXT_LIST_LIMIT)
                            .map(|e| format!("- {e}")),
                    );
                }
                TypeCheckOutcome::Skipped { reason } => {
                    parts.push(format!("\n### Type Check: SKIPPED ({reason})"))
                }
                TypeCheckOutcome::TimedOut => {
                    parts.push("\n### Type Check: TIMED OUT".to_string())
                }
            }
        }

        if let Some(tests) = &self.test_result {
            parts.push(format!(
                "\n### Tests: {}",
                if tests.passed { "PASSED" } else { "FAILED" }
            ));
            parts.push(format!("- {}/{} passed", tests.passed_tests, tests.total_tests));
            if !tests.failed_test_names.is_empty() {
                parts.push("- Failed tests:".to_string());
                parts.extend(
                    tests
                        .failed_test_names
                        .iter()
                        .take(CONTEXT_LIST_LIMIT)
                        .map(|n| format!("  - {n}")),
                );
            }
        }

        if !self.errors.is_empty() {
            parts.push("\n### Errors".to_string());
            parts.extend(self.errors.iter().map(|e| format!("- {e}")));
        }

        parts.join("\n")
    }
}

impl EditResult {
    /// Fold a pipeline result into the outcome stored on an edit.
    pub fn from_validation(result: &ValidationResult) -> Self {
        let type_check_passed = match &result.type_check {
            Some(TypeCheckOutcome::Passed) => Some(true),
            Some(TypeCheckOutcome::Failed { .. }) => Some(false),
            _ => None,
        };
        let test_results = result
            .test_result
            .as_ref()
            .map(|t| {
                t.failed_test_names
                    .iter()
                    .map(|name| TestResult::new(name.clone(), false))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            success: result.valid,
            syntax_valid: result.syntax_result.as_ref().map_or(true, |s| s.valid),
            type_check_passed,
            tests_passed: result.test_result.as_ref().map(|t| t.passed),
            test_results,
            errors: result.errors.clone(),
            warnings: result.warnings.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// EditValidator
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct EditValidator {
    project_root: PathBuf,
    config: ValidationConfig,
    syntax: SyntaxChecker,
    discovery: TestDiscovery,
    type_checker: Option<PathBuf>,
}

impl EditValidator {
    pub fn new(project_root: impl Into<PathBuf>, config: ValidationConfig) -> Self {
        let project_root = project_root.into();
        Self {
            syntax: SyntaxChecker::new(Duration::from_secs(config.syntax_timeout_secs)),
            discovery: TestDiscovery::from_config(&project_root, &config),
            type_checker: which::which("mypy").ok(),
            project_root,
            config,
        }
    }

    /// Override the type checker binary; `None` disables the stage.
    pub fn with_type_checker(mut self, program: Option<PathBuf>) -> Self {
        self.type_checker = program;
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate replacing `original_content` with `new_content` at
    /// `file_path` (relative to the project root).
    pub fn validate_edit(
        &self,
        file_path: &str,
        original_content: &str,
        new_content: &str,
    ) -> ValidationResult {
        debug!(
            file_path,
            changed = changed_lines(original_content, new_content).len(),
            "validating edit"
        );
        let mut result = ValidationResult::pending();

        let syntax = self.syntax.check(new_content, file_path);
        if !syntax.valid {
            result.valid = false;
            result.errors.extend(syntax.errors.iter().map(|e| e.to_string()));
            result.syntax_result = Some(syntax);
            info!(file_path, "edit rejected: syntax");
            return result;
        }
        result.warnings.extend(syntax.warnings.iter().cloned());
        result.syntax_result = Some(syntax);

        if self.config.run_type_check {
            if let Some(program) = &self.type_checker {
                let outcome = self.run_type_check(program, file_path, new_content);
                match &outcome {
                    TypeCheckOutcome::Failed { errors } => {
                        result.warnings.push("Type check failed (non-blocking)".to_string());
                        result
                            .warnings
                            .extend(errors.iter().take(TYPE_WARNINGS_SHOWN).cloned());
                    }
                    TypeCheckOutcome::TimedOut => {
                        result.warnings.push("Type check timed out".to_string())
                    }
                    _ => {}
                }
                result.type_check = Some(outcome);
            }
        }

        if self.config.run_tests {
            let tests = self.validate_with_tests(file_path, new_content);
            if !tests.passed {
                result.valid = false;
                result
                    .errors
                    .push(format!("Tests failed: {} failures", tests.failed_tests));
            }
            result.test_result = Some(tests);
        }

        info!(file_path, valid = result.valid, "edit validated");
        result
    }

    pub fn validate_syntax_only(&self, file_path: &str, content: &str) -> SyntaxCheckResult {
        self.syntax.check(content, file_path)
    }

    /// Validator that works on a throwaway copy of the project.
    pub fn sandbox(&self) -> EditGraphResult<SandboxValidator> {
        SandboxValidator::new(self.clone())
    }

    fn run_type_check(&self, program: &Path, file_path: &str, content: &str) -> TypeCheckOutcome {
        if detect_language(Path::new(file_path)) != Some("python") {
            return TypeCheckOutcome::Skipped {
                reason: "not a Python file".to_string(),
            };
        }

        let mut file = match tempfile::Builder::new()
            .prefix("edit_check_")
            .suffix(".py")
            .tempfile()
        {
            Ok(f) => f,
            Err(e) => return TypeCheckOutcome::Skipped { reason: e.to_string() },
        };
        if let Err(e) = file.write_all(content.as_bytes()).and_then(|_| file.flush()) {
            return TypeCheckOutcome::Skipped { reason: e.to_string() };
        }
        let temp_path = file.path().to_string_lossy().into_owned();

        let mut cmd = Command::new(program);
        cmd.args(["--no-error-summary", "--no-color-output", &temp_path]);
        let timeout = Duration::from_secs(self.config.type_check_timeout_secs);

        match run_command_with_timeout(cmd, None, timeout, DEFAULT_OUTPUT_LIMIT) {
            Ok(out) if out.timed_out => TypeCheckOutcome::TimedOut,
            Ok(out) if out.success() => TypeCheckOutcome::Passed,
            Ok(out) => TypeCheckOutcome::Failed {
                errors: out
                    .stdout_text()
                    .lines()
                    .filter(|l| l.contains("error:"))
                    .map(|l| l.replace(&temp_path, file_path))
                    .collect(),
            },
            Err(e) => {
                warn!(err = %e, "type checker failed to run");
                TypeCheckOutcome::Skipped { reason: e.to_string() }
            }
        }
    }

    fn validate_with_tests(&self, file_path: &str, new_content: &str) -> TestRunResult {
        let mut tx = EditTransaction::new(EditRollback::in_memory(&self.project_root));
        if let Err(e) = tx.apply(file_path, new_content) {
            return TestRunResult::errored(format!("Failed to apply edit: {e}"));
        }

        let mut related = self.discovery.find_related_tests(file_path, DEFAULT_MAX_TESTS);
        if related.is_empty() {
            related = self.discovery.find_same_directory_tests(file_path);
        }

        let result = if related.is_empty() {
            TestRunResult::empty("No related tests found")
        } else {
            self.discovery
                .run_tests(&related, Duration::from_secs(self.config.test_timeout_secs))
        };

        let restored = tx.rollback();
        if !restored.success {
            warn!(errors = ?restored.errors, "failed to restore file after tests");
        }
        result
    }
}

// ---------------------------------------------------------------------------
// SandboxValidator
// ---------------------------------------------------------------------------

/// Validates edits against a temporary copy of the project. The copy is
/// removed on drop.
pub struct SandboxValidator {
    parent: EditValidator,
    sandbox: TempDir,
    inner: EditValidator,
}

impl SandboxValidator {
    fn new(parent: EditValidator) -> EditGraphResult<Self> {
        let sandbox = tempfile::Builder::new().prefix("edit_sandbox_").tempdir()?;
        let copied = copy_project(&parent.project_root, sandbox.path())?;
        debug!(copied, sandbox = %sandbox.path().display(), "created sandbox");

        let inner = EditValidator {
            project_root: sandbox.path().to_path_buf(),
            discovery: TestDiscovery::from_config(sandbox.path(), &parent.config),
            ..parent.clone()
        };
        Ok(Self {
            parent,
            sandbox,
            inner,
        })
    }

    pub fn sandbox_root(&self) -> &Path {
        self.sandbox.path()
    }

    /// Write `new_content` into the sandbox and validate it there.
    pub fn validate_edit(&self, file_path: &str, new_content: &str) -> ValidationResult {
        let original =
            std::fs::read_to_string(self.parent.project_root.join(file_path)).unwrap_or_default();

        let target = self.sandbox.path().join(file_path);
        let written = target
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| std::fs::write(&target, new_content));
        if let Err(e) = written {
            let mut result = ValidationResult::pending();
            result.valid = false;
            result.errors.push(format!("Failed to write sandbox file: {e}"));
            return result;
        }

        self.inner.validate_edit(file_path, &original, new_content)
    }
}

fn copy_project(from: &Path, to: &Path) -> EditGraphResult<usize> {
    let mut copied = 0;
    let walker = WalkDir::new(from).into_iter().filter_entry(|e| {
        e.depth() == 0 || !matches_any(&e.file_name().to_string_lossy(), SANDBOX_EXCLUDES)
    });
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(err = %e, "skipping unreadable entry");
                continue;
            }
        };
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const ORIGINAL: &str = "def add(a, b):\n    return a + b\n";
    const NEW: &str = "def add(a, b, c=0):\n    return a + b + c\n";

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("tests")).unwrap();
        fs::write(dir.path().join("calc.py"), ORIGINAL).unwrap();
        fs::write(
            dir.path().join("tests/test_calc.py"),
            "from calc import add\n\ndef test_add():\n    assert add(1, 2) == 3\n",
        )
        .unwrap();
        dir
    }

    /// Stand-in runner: passes only while the proposed content is on disk.
    fn validator(root: &Path, run_tests: bool) -> EditValidator {
        let config = ValidationConfig {
            run_tests,
            run_type_check: false,
            test_command: vec![
                "sh".into(),
                "-c".into(),
                "if grep -q 'c=0' calc.py; then echo '1 passed in 0.01s'; \
                 else echo \"FAILED $1::test_add\"; echo '1 failed in 0.01s'; exit 1; fi"
                    .into(),
                "runner".into(),
            ],
            use_vcs: false,
            ..ValidationConfig::default()
        };
        EditValidator::new(root, config).with_type_checker(None)
    }

    #[test]
    fn test_syntax_failure_stops_pipeline() {
        let dir = project();
        let result = validator(dir.path(), true).validate_edit("calc.py", ORIGINAL, "def add(a, b:\n");
        assert!(!result.valid);
        assert!(!result.syntax_result.as_ref().unwrap().errors.is_empty());
        assert!(result.test_result.is_none());
        assert!(result.type_check.is_none());
        assert!(result.to_context_string().contains("### Syntax: FAILED"));
        assert_eq!(fs::read_to_string(dir.path().join("calc.py")).unwrap(), ORIGINAL);
    }

    #[test]
    fn test_passing_edit_runs_tests_against_new_content() {
        let dir = project();
        let result = validator(dir.path(), true).validate_edit("calc.py", ORIGINAL, NEW);
        assert!(result.valid, "{}", result.to_context_string());
        let tests = result.test_result.as_ref().unwrap();
        assert!(tests.passed);
        assert_eq!(tests.passed_tests, 1);
        assert_eq!(fs::read_to_string(dir.path().join("calc.py")).unwrap(), ORIGINAL);

        let report = result.to_context_string();
        assert!(report.starts_with("## Validation Result: PASSED"));
        assert!(report.contains("### Tests: PASSED\n- 1/1 passed"));
    }

    #[test]
    fn test_failing_tests_invalidate_and_restore() {
        let dir = project();
        let broken = "def add(a, b):\n    return a - b\n";
        let result = validator(dir.path(), true).validate_edit("calc.py", ORIGINAL, broken);
        assert!(!result.valid);
        assert_eq!(result.errors, vec!["Tests failed: 1 failures"]);
        let tests = result.test_result.as_ref().unwrap();
        assert_eq!(tests.failed_test_names, vec!["tests/test_calc.py::test_add"]);
        assert_eq!(fs::read_to_string(dir.path().join("calc.py")).unwrap(), ORIGINAL);

        let report = result.to_context_string();
        assert!(report.contains("- Failed tests:\n  - tests/test_calc.py::test_add"));
        assert!(report.contains("### Errors\n- Tests failed: 1 failures"));

        let folded = EditResult::from_validation(&result);
        assert!(!folded.success);
        assert!(folded.syntax_valid);
        assert_eq!(folded.tests_passed, Some(false));
        assert_eq!(folded.test_results.len(), 1);
        assert!(!folded.test_results[0].passed);
    }

    #[test]
    fn test_no_related_tests_passes() {
        let dir = project();
        fs::write(dir.path().join("other.py"), "x = 1\n").unwrap();
        let result = validator(dir.path(), true).validate_edit("other.py", "x = 1\n", "x = 2\n");
        assert!(result.valid);
        assert_eq!(result.test_result.unwrap().output, "No related tests found");
    }

    #[test]
    fn test_new_file_is_removed_after_tests() {
        let dir = project();
        let result = validator(dir.path(), true).validate_edit("fresh.py", "", "y = 1\n");
        assert!(result.valid);
        assert!(!dir.path().join("fresh.py").exists());
    }

    #[test]
    fn test_syntax_only_and_tests_disabled() {
        let dir = project();
        let v = validator(dir.path(), false);
        assert!(v.validate_syntax_only("calc.py", NEW).valid);
        let result = v.validate_edit("calc.py", ORIGINAL, NEW);
        assert!(result.valid);
        assert!(result.test_result.is_none());
    }

    #[test]
    fn test_type_check_outcomes() {
        assert!(TypeCheckOutcome::Passed.passed());
        assert!(TypeCheckOutcome::TimedOut.passed());
        assert!(TypeCheckOutcome::Skipped { reason: "x".into() }.passed());
        assert!(!TypeCheckOutcome::Failed { errors: vec![] }.passed());

        let mut result = ValidationResult::pending();
        result.type_check = Some(TypeCheckOutcome::Failed {
            errors: vec!["calc.py:1: error: bad".into()],
        });
        let report = result.to_context_string();
        assert!(report.contains("### Type Check: FAILED\n- calc.py:1: error: bad"));
        assert_eq!(EditResult::from_validation(&result).type_check_passed, Some(false));
    }

    #[test]
    fn test_stand_in_type_checker_failure_is_a_warning() {
        let dir = project();
        let script = dir.path().join("fake_mypy.sh");
        fs::write(&script, "#!/bin/sh\nfor last; do :; done\necho \"$last:2: error: Incompatible return\"\nexit 1\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        }
        let config = ValidationConfig {
            run_tests: false,
            use_vcs: false,
            ..ValidationConfig::default()
        };
        let v = EditValidator::new(dir.path(), config).with_type_checker(Some(script));
        let result = v.validate_edit("calc.py", ORIGINAL, NEW);
        assert!(result.valid);
        assert_eq!(result.warnings[0], "Type check failed (non-blocking)");
        assert_eq!(result.warnings[1], "calc.py:2: error: Incompatible return");

        let skipped = v.validate_edit("data.json", "{}", "{\"a\": 1}");
        assert!(matches!(skipped.type_check, Some(TypeCheckOutcome::Skipped { .. })));
    }

    #[test]
    fn test_sandbox_leaves_project_untouched() {
        let dir = project();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("__pycache__/calc.pyc"), "").unwrap();

        let sandbox = validator(dir.path(), true).sandbox().unwrap();
        let root = sandbox.sandbox_root().to_path_buf();
        assert!(root.join("tests/test_calc.py").exists());
        assert!(!root.join(".git").exists());
        assert!(!root.join("__pycache__").exists());

        let result = sandbox.validate_edit("calc.py", NEW);
        assert!(result.valid, "{}", result.to_context_string());
        assert_eq!(fs::read_to_string(root.join("calc.py")).unwrap(), NEW);
        assert_eq!(fs::read_to_string(dir.path().join("calc.py")).unwrap(), ORIGINAL);

        drop(sandbox);
        assert!(!root.exists());
    }
}
