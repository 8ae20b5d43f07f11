//! Per-language syntax checks run before an edit is applied.
//!
//! Languages with an in-process grammar are parsed with tree-sitter; the
//! rest shell out to their toolchain's check-only mode with a timeout.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::indexer::filesystem::detect_language;
use crate::indexer::parser::{first_syntax_issue, parse_source};
use crate::validation::process::{run_command_with_timeout, DEFAULT_OUTPUT_LIMIT};

const TSC_MESSAGE_CHARS: usize = 500;

static NODE_LINE_COL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":(\d+):(\d+)").unwrap());
static NODE_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":(\d+)").unwrap());

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntaxErrorInfo {
    pub line: usize,
    pub column: usize,
    pub message: String,
    pub file_path: String,
}

impl SyntaxErrorInfo {
    fn new(line: usize, column: usize, message: impl Into<String>, file_path: &str) -> Self {
        Self {
            line,
            column,
            message: message.into(),
            file_path: file_path.to_string(),
        }
    }
}

impl fmt::Display for SyntaxErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.file_path.is_empty() {
            write!(f, "{}:", self.file_path)?;
        }
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntaxCheckResult {
    pub valid: bool,
    pub errors: Vec<SyntaxErrorInfo>,
    pub warnings: Vec<String>,
    pub language: String,
}

impl SyntaxCheckResult {
    fn ok(language: &str) -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            language: language.to_string(),
        }
    }

    fn ok_with_warning(language: &str, warning: impl Into<String>) -> Self {
        Self {
            warnings: vec![warning.into()],
            ..Self::ok(language)
        }
    }

    fn invalid(language: &str, error: SyntaxErrorInfo) -> Self {
        Self {
            valid: false,
            errors: vec![error],
            ..Self::ok(language)
        }
    }
}

impl fmt::Display for SyntaxCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            return write!(f, "Syntax OK ({})", self.language);
        }
        write!(f, "Syntax errors:")?;
        for error in &self.errors {
            write!(f, "\n{error}")?;
        }
        Ok(())
    }
}

/// Multi-language syntax checker. External tools are located once, at
/// construction.
#[derive(Clone, Debug)]
pub struct SyntaxChecker {
    timeout: Duration,
    node: Option<PathBuf>,
    tsc: Option<PathBuf>,
    bash: Option<PathBuf>,
}

impl SyntaxChecker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            node: which::which("node").ok(),
            tsc: which::which("tsc").ok(),
            bash: which::which("bash").ok(),
        }
    }

    /// Check `code` as the language implied by `file_path`'s extension.
    pub fn check(&self, code: &str, file_path: &str) -> SyntaxCheckResult {
        let language = detect_language(Path::new(file_path)).unwrap_or("unknown");
        self.check_language(code, file_path, language)
    }

    pub fn check_language(&self, code: &str, file_path: &str, language: &str) -> SyntaxCheckResult {
        debug!(file_path, language, "checking syntax");
        match language {
            "python" | "java" | "go" => self.check_with_grammar(code, file_path, language, language),
            "javascript" => self.check_javascript(code, file_path),
            "typescript" => self.check_typescript(code, file_path),
            "json" => check_json(code, file_path),
            "shell" => self.check_shell(code, file_path),
            other => SyntaxCheckResult::ok_with_warning(
                other,
                format!("No syntax checker available for {other}"),
            ),
        }
    }

    fn check_with_grammar(
        &self,
        code: &str,
        file_path: &str,
        language: &str,
        grammar: &str,
    ) -> SyntaxCheckResult {
        match parse_source(code, grammar) {
            Ok(tree) => match first_syntax_issue(&tree) {
                None => SyntaxCheckResult::ok(language),
                Some(issue) => SyntaxCheckResult::invalid(
                    language,
                    SyntaxErrorInfo::new(issue.line, issue.column, issue.message, file_path),
                ),
            },
            Err(e) => {
                SyntaxCheckResult::invalid(language, SyntaxErrorInfo::new(0, 0, e.to_string(), file_path))
            }
        }
    }

    fn check_javascript(&self, code: &str, file_path: &str) -> SyntaxCheckResult {
        let grammar = if file_path.ends_with(".jsx") { "jsx" } else { "javascript" };
        let Some(node) = &self.node else {
            let mut result = self.check_with_grammar(code, file_path, "javascript", grammar);
            result
                .warnings
                .push("Node.js not available; checked with the built-in parser".to_string());
            return result;
        };

        match self.run_tool(node, &["--check"], code, ".js", self.timeout) {
            ToolRun::Passed => SyntaxCheckResult::ok("javascript"),
            ToolRun::Failed(message) => {
                let (line, column) = parse_node_location(&message);
                SyntaxCheckResult::invalid(
                    "javascript",
                    SyntaxErrorInfo::new(line, column, message, file_path),
                )
            }
            ToolRun::TimedOut => timed_out("javascript", file_path),
            ToolRun::Unavailable(e) => {
                SyntaxCheckResult::ok_with_warning("javascript", format!("Error running node: {e}"))
            }
        }
    }

    fn check_typescript(&self, code: &str, file_path: &str) -> SyntaxCheckResult {
        let Some(tsc) = &self.tsc else {
            let grammar = if file_path.ends_with(".tsx") { "tsx" } else { "typescript" };
            return self.check_with_grammar(code, file_path, "typescript", grammar);
        };

        let suffix = if file_path.ends_with(".tsx") { ".tsx" } else { ".ts" };
        match self.run_tool(tsc, &["--noEmit", "--skipLibCheck"], code, suffix, self.timeout * 3) {
            ToolRun::Passed => SyntaxCheckResult::ok("typescript"),
            ToolRun::Failed(message) => {
                let message: String = message.chars().take(TSC_MESSAGE_CHARS).collect();
                SyntaxCheckResult::invalid("typescript", SyntaxErrorInfo::new(0, 0, message, file_path))
            }
            ToolRun::TimedOut => timed_out("typescript", file_path),
            ToolRun::Unavailable(e) => {
                SyntaxCheckResult::ok_with_warning("typescript", format!("Error running tsc: {e}"))
            }
        }
    }

    fn check_shell(&self, code: &str, file_path: &str) -> SyntaxCheckResult {
        let Some(bash) = &self.bash else {
            return SyntaxCheckResult::ok_with_warning(
                "shell",
                "bash not available for shell syntax checking",
            );
        };

        match self.run_tool(bash, &["-n"], code, ".sh", self.timeout) {
            ToolRun::Passed => SyntaxCheckResult::ok("shell"),
            ToolRun::Failed(message) => {
                SyntaxCheckResult::invalid("shell", SyntaxErrorInfo::new(0, 0, message, file_path))
            }
            ToolRun::TimedOut => timed_out("shell", file_path),
            ToolRun::Unavailable(e) => {
                SyntaxCheckResult::ok_with_warning("shell", format!("Error running bash: {e}"))
            }
        }
    }

    /// Write `code` to a temp file with `suffix` and run `program args <file>`.
    fn run_tool(
        &self,
        program: &Path,
        args: &[&str],
        code: &str,
        suffix: &str,
        timeout: Duration,
    ) -> ToolRun {
        let mut temp = match tempfile::Builder::new().suffix(suffix).tempfile() {
            Ok(f) => f,
            Err(e) => return ToolRun::Unavailable(e.to_string()),
        };
        if let Err(e) = temp.write_all(code.as_bytes()).and_then(|_| temp.flush()) {
            return ToolRun::Unavailable(e.to_string());
        }

        let mut cmd = Command::new(program);
        cmd.args(args).arg(temp.path());
        match run_command_with_timeout(cmd, None, timeout, DEFAULT_OUTPUT_LIMIT) {
            Ok(out) if out.timed_out => ToolRun::TimedOut,
            Ok(out) if out.success() => ToolRun::Passed,
            Ok(out) => {
                let stderr = out.stderr_text();
                let text = if stderr.trim().is_empty() {
                    out.stdout_text()
                } else {
                    stderr
                };
                ToolRun::Failed(text.trim().to_string())
            }
            Err(e) => {
                warn!(err = %e, "syntax tool failed to run");
                ToolRun::Unavailable(e.to_string())
            }
        }
    }
}

impl Default for SyntaxChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

enum ToolRun {
    Passed,
    Failed(String),
    TimedOut,
    Unavailable(String),
}

fn timed_out(language: &str, file_path: &str) -> SyntaxCheckResult {
    SyntaxCheckResult::invalid(
        language,
        SyntaxErrorInfo::new(0, 0, "Syntax check timed out", file_path),
    )
}

fn check_json(code: &str, file_path: &str) -> SyntaxCheckResult {
    match serde_json::from_str::<serde_json::Value>(code) {
        Ok(_) => SyntaxCheckResult::ok("json"),
        Err(e) => SyntaxCheckResult::invalid(
            "json",
            SyntaxErrorInfo::new(e.line(), e.column(), e.to_string(), file_path),
        ),
    }
}

/// `(line, column)` from a Node.js error message, zeros when absent.
fn parse_node_location(message: &str) -> (usize, usize) {
    if let Some(caps) = NODE_LINE_COL.captures(message) {
        let line = caps[1].parse().unwrap_or(0);
        let column = caps[2].parse().unwrap_or(0);
        return (line, column);
    }
    if let Some(caps) = NODE_LINE.captures(message) {
        return (caps[1].parse().unwrap_or(0), 0);
    }
    (0, 0)
}
