//! Finds and runs the tests most likely to be affected by a change.
//!
//! Relatedness is textual: a test file is related when it imports the
//! changed module (one of four `import`/`from` shapes) or when its name
//! contains the changed file's stem. Re-exports and aliased imports are not
//! resolved.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::ValidationConfig;
use crate::errors::EditGraphError;
use crate::indexer::filesystem::{matches_any, relative_slash_path};
use crate::validation::process::{run_command_with_timeout, DEFAULT_OUTPUT_LIMIT};

pub const DEFAULT_MAX_TESTS: usize = 20;
pub const DEFAULT_TEST_PATTERNS: &[&str] = &["test_*.py", "*_test.py", "tests.py"];

const DISCOVERY_SKIP_DIRS: &[&str] = &["__pycache__", ".git", "node_modules", ".venv", "venv"];
const COLLECT_TIMEOUT: Duration = Duration::from_secs(30);

static TEST_DEF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(async\s+)?def\s+test_").unwrap());
static PASSED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+passed").unwrap());
static FAILED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+failed").unwrap());
static SKIPPED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+skipped").unwrap());
static DURATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bin\s+([\d.]+)s\b").unwrap());
static FAILED_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"FAILED\s+(\S+)").unwrap());

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestFile {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub test_count: usize,
    pub imports_target: bool,
    pub name_matches: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TestRunResult {
    pub passed: bool,
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub skipped_tests: usize,
    pub duration_seconds: f64,
    pub output: String,
    pub failed_test_names: Vec<String>,
    pub timed_out: bool,
}

impl TestRunResult {
    /// A passing run that executed nothing.
    pub fn empty(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            skipped_tests: 0,
            duration_seconds: 0.0,
            output: output.into(),
            failed_test_names: Vec::new(),
            timed_out: false,
        }
    }

    /// A failed run that produced no parsable results.
    pub fn errored(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            failed_tests: 1,
            ..Self::empty(output)
        }
    }
}

/// Counts pulled from a pytest run's output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PytestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_seconds: f64,
    pub failed_names: Vec<String>,
}

pub fn parse_pytest_output(output: &str) -> PytestSummary {
    let count = |re: &Regex| {
        re.captures(output)
            .and_then(|c| c[1].parse::<usize>().ok())
            .unwrap_or(0)
    };
    let passed = count(&PASSED);
    let failed = count(&FAILED);
    let skipped = count(&SKIPPED);
    let duration_seconds = DURATION
        .captures(output)
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(0.0);
    let failed_names = FAILED_NAME
        .captures_iter(output)
        .map(|c| c[1].to_string())
        .collect();

    PytestSummary {
        total: passed + failed + skipped,
        passed,
        failed,
        skipped,
        duration_seconds,
        failed_names,
    }
}

// ---------------------------------------------------------------------------
// TestDiscovery
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct TestDiscovery {
    project_root: PathBuf,
    test_patterns: Vec<String>,
    /// Program and leading arguments; test paths are appended.
    test_command: Vec<String>,
}

impl TestDiscovery {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            test_patterns: DEFAULT_TEST_PATTERNS.iter().map(|p| p.to_string()).collect(),
            test_command: ValidationConfig::default().test_command,
        }
    }

    pub fn from_config(project_root: impl Into<PathBuf>, config: &ValidationConfig) -> Self {
        Self::new(project_root).with_test_command(config.test_command.clone())
    }

    pub fn with_test_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.test_command = command;
        }
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Related test files for `file_path` (relative to the project root),
    /// importers first, then name matches, each by descending test count.
    pub fn find_related_tests(&self, file_path: &str, max_tests: usize) -> Vec<TestFile> {
        let module = module_name(file_path);
        let stem = file_stem(file_path);
        let import_patterns = import_patterns(&module, &stem);

        let mut related: Vec<TestFile> = self
            .find_all_test_files()
            .into_iter()
            .filter_map(|path| {
                let content = self.read_test_file(&path);
                let imports_target = import_patterns.iter().any(|re| re.is_match(&content));
                let name_matches = file_stem(&path).contains(&stem);
                (imports_target || name_matches).then(|| TestFile {
                    test_count: TEST_DEF.find_iter(&content).count(),
                    path,
                    imports_target,
                    name_matches,
                })
            })
            .collect();

        related.sort_by_key(|t| (!t.imports_target, !t.name_matches, std::cmp::Reverse(t.test_count)));
        related.truncate(max_tests);
        debug!(file_path, found = related.len(), "related tests");
        related
    }

    /// Test files sitting next to `file_path`.
    pub fn find_same_directory_tests(&self, file_path: &str) -> Vec<TestFile> {
        let dir = Path::new(file_path).parent().unwrap_or(Path::new(""));
        let full_dir = self.project_root.join(dir);
        let Ok(entries) = std::fs::read_dir(&full_dir) else {
            return Vec::new();
        };

        let patterns = self.pattern_refs();
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| matches_any(name, &patterns))
            .collect();
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let path = relative_slash_path(&full_dir.join(&name), &self.project_root);
                TestFile {
                    test_count: TEST_DEF.find_iter(&self.read_test_file(&path)).count(),
                    path,
                    ..TestFile::default()
                }
            })
            .collect()
    }

    /// Run `test_files` with the configured test command from the project root.
    pub fn run_tests(&self, test_files: &[TestFile], timeout: Duration) -> TestRunResult {
        if test_files.is_empty() {
            return TestRunResult::empty("No tests to run");
        }
        let Some((program, args)) = self.test_command.split_first() else {
            return TestRunResult::empty("No test command configured");
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .args(test_files.iter().map(|t| t.path.as_str()))
            .current_dir(&self.project_root);

        match run_command_with_timeout(cmd, None, timeout, DEFAULT_OUTPUT_LIMIT) {
            Ok(out) if out.timed_out => TestRunResult {
                duration_seconds: timeout.as_secs_f64(),
                timed_out: true,
                ..TestRunResult::errored(format!(
                    "Test run timed out after {}s",
                    timeout.as_secs()
                ))
            },
            Ok(out) => {
                let output = out.combined_text();
                let summary = parse_pytest_output(&output);
                TestRunResult {
                    passed: out.success(),
                    total_tests: summary.total,
                    passed_tests: summary.passed,
                    failed_tests: summary.failed,
                    skipped_tests: summary.skipped,
                    duration_seconds: summary.duration_seconds,
                    output,
                    failed_test_names: summary.failed_names,
                    timed_out: false,
                }
            }
            Err(EditGraphError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(program, "test runner not found");
                TestRunResult::empty(format!("{program} not available"))
            }
            Err(e) => TestRunResult::errored(format!("Error running tests: {e}")),
        }
    }

    /// Test ids in `test_file` as reported by `--collect-only -q`.
    pub fn collect_tests(&self, test_file: &str) -> Vec<String> {
        let Some((program, args)) = self.test_command.split_first() else {
            return Vec::new();
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .args(["--collect-only", "-q", test_file])
            .current_dir(&self.project_root);

        match run_command_with_timeout(cmd, None, COLLECT_TIMEOUT, DEFAULT_OUTPUT_LIMIT) {
            Ok(out) if out.success() => out
                .stdout_text()
                .lines()
                .map(str::trim)
                .filter(|l| l.contains("::") && !l.starts_with('='))
                .map(str::to_string)
                .collect(),
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!(err = %e, "test collection failed");
                Vec::new()
            }
        }
    }

    fn pattern_refs(&self) -> Vec<&str> {
        self.test_patterns.iter().map(String::as_str).collect()
    }

    fn find_all_test_files(&self) -> Vec<String> {
        let patterns = self.pattern_refs();
        WalkDir::new(&self.project_root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0
                    || !(e.file_type().is_dir() && DISCOVERY_SKIP_DIRS.iter().any(|d| *d == name))
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| matches_any(&e.file_name().to_string_lossy(), &patterns))
            .map(|e| relative_slash_path(e.path(), &self.project_root))
            .collect()
    }

    fn read_test_file(&self, relative: &str) -> String {
        std::fs::read(self.project_root.join(relative))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }
}

/// `src/pkg/mod.py` -> `src.pkg.mod`.
fn module_name(file_path: &str) -> String {
    let path = Path::new(file_path).with_extension("");
    path.to_string_lossy().replace(['/', '\\'], ".")
}

fn file_stem(file_path: &str) -> String {
    Path::new(file_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn import_patterns(module: &str, stem: &str) -> Vec<Regex> {
    let module = regex::escape(module);
    let stem = regex::escape(stem);
    [
        format!(r"\bimport\s+{module}\b"),
        format!(r"\bfrom\s+{module}\s+import\b"),
        format!(r"\bfrom\s+\S*\.{stem}\s+import\b"),
        format!(r"\bimport\s+\S*\.{stem}\b"),
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
}
