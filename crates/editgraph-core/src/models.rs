//! Shared typed models for recorded edits, symbols, and conversation context.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EditGraphError, EditGraphResult};

/// Number of affected symbols listed by [`Edit::to_context_string`].
const CONTEXT_AFFECTED_LIMIT: usize = 5;

/// Number of result errors listed by [`Edit::to_context_string`].
const CONTEXT_ERROR_LIMIT: usize = 2;

// ---------------------------------------------------------------------------
// 1. EditType
// ---------------------------------------------------------------------------

/// Category of a recorded change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditType {
    BugFix,
    Feature,
    Refactor,
    Optimization,
    Documentation,
    Test,
    Dependency,
    Configuration,
    #[default]
    Unknown,
}

impl EditType {
    pub const ALL: [EditType; 9] = [
        EditType::BugFix,
        EditType::Feature,
        EditType::Refactor,
        EditType::Optimization,
        EditType::Documentation,
        EditType::Test,
        EditType::Dependency,
        EditType::Configuration,
        EditType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EditType::BugFix => "bug_fix",
            EditType::Feature => "feature",
            EditType::Refactor => "refactor",
            EditType::Optimization => "optimization",
            EditType::Documentation => "documentation",
            EditType::Test => "test",
            EditType::Dependency => "dependency",
            EditType::Configuration => "configuration",
            EditType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EditType {
    type Err = EditGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EditType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EditGraphError::Parse(format!("unknown edit type: {s}")))
    }
}

// ---------------------------------------------------------------------------
// 2. SymbolKind / SymbolReference
// ---------------------------------------------------------------------------

/// Kind of a named code construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Function,
    AsyncFunction,
    Method,
    Variable,
    Import,
    #[serde(other)]
    Other,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Class => "class",
            SymbolKind::Function => "function",
            SymbolKind::AsyncFunction => "async_function",
            SymbolKind::Method => "method",
            SymbolKind::Variable => "variable",
            SymbolKind::Import => "import",
            SymbolKind::Other => "other",
        }
    }

    /// Sort key used when choosing the primary symbol of an edit (lower wins).
    pub fn priority(&self) -> u8 {
        match self {
            SymbolKind::Class => 0,
            SymbolKind::Function => 1,
            SymbolKind::AsyncFunction => 2,
            SymbolKind::Method => 3,
            SymbolKind::Variable => 4,
            SymbolKind::Import => 5,
            SymbolKind::Other => u8::MAX,
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, line-ranged code construct (1-based inclusive lines).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolReference {
    pub name: String,
    pub kind: SymbolKind,
    pub file_path: String,
    pub line_start: usize,
    pub line_end: usize,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub docstring: Option<String>,
}

impl SymbolReference {
    pub fn new(name: impl Into<String>, kind: SymbolKind, line_start: usize, line_end: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            file_path: String::new(),
            line_start,
            line_end,
            signature: None,
            docstring: None,
        }
    }

    /// Number of lines spanned by the symbol.
    pub fn line_count(&self) -> usize {
        self.line_end.saturating_sub(self.line_start) + 1
    }

    pub fn to_display(&self) -> String {
        format!("{} ({})", self.name, self.kind)
    }
}

// ---------------------------------------------------------------------------
// 3. TestResult / EditResult
// ---------------------------------------------------------------------------

/// Outcome of a single test case.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub passed: bool,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TestResult {
    pub fn new(test_name: impl Into<String>, passed: bool) -> Self {
        Self {
            test_name: test_name.into(),
            passed,
            duration_ms: 0.0,
            error_message: None,
            stack_trace: None,
            timestamp: Utc::now(),
        }
    }
}

/// Validation outcome attached to an edit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditResult {
    pub success: bool,
    #[serde(default = "default_true")]
    pub syntax_valid: bool,
    #[serde(default)]
    pub type_check_passed: Option<bool>,
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl EditResult {
    pub fn success() -> Self {
        Self {
            success: true,
            syntax_valid: true,
            type_check_passed: None,
            tests_passed: None,
            test_results: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
            ..Self::success()
        }
    }
}

// ---------------------------------------------------------------------------
// 4. ConversationContext
// ---------------------------------------------------------------------------

/// Conversational state that led to an edit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub turn_index: usize,
    pub user_message: String,
    #[serde(default)]
    pub assistant_response: Option<String>,
    #[serde(default)]
    pub intent_summary: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 5. Edit
// ---------------------------------------------------------------------------

/// One recorded unit of code change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub id: String,
    /// `None` for code executions that are not tied to a file.
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub original_content: String,
    #[serde(default)]
    pub new_content: String,
    #[serde(default)]
    pub diff: String,

    #[serde(default)]
    pub edit_type: EditType,
    #[serde(default)]
    pub primary_symbol: Option<SymbolReference>,
    #[serde(default)]
    pub affected_symbols: Vec<SymbolReference>,
    #[serde(default)]
    pub related_symbols: Vec<SymbolReference>,

    #[serde(default)]
    pub conversation_context: Option<ConversationContext>,
    #[serde(default)]
    pub user_intent: String,

    #[serde(default)]
    pub result: Option<EditResult>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,

    #[serde(default)]
    pub execution_trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub git_commit_hash: Option<String>,
    #[serde(default)]
    pub parent_edit_id: Option<String>,
}

fn default_confidence() -> f64 {
    1.0
}

impl Edit {
    /// Create an edit with a fresh id and the current timestamp.
    pub fn new(
        file_path: Option<String>,
        original_content: impl Into<String>,
        new_content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_path,
            original_content: original_content.into(),
            new_content: new_content.into(),
            diff: String::new(),
            edit_type: EditType::Unknown,
            primary_symbol: None,
            affected_symbols: Vec::new(),
            related_symbols: Vec::new(),
            conversation_context: None,
            user_intent: String::new(),
            result: None,
            confidence: default_confidence(),
            execution_trace_id: None,
            timestamp: Utc::now(),
            git_commit_hash: None,
            parent_edit_id: None,
        }
    }

    /// Set the confidence score, clamped to `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    pub fn with_parent(mut self, parent_edit_id: impl Into<String>) -> Self {
        self.parent_edit_id = Some(parent_edit_id.into());
        self
    }

    /// Primary symbol name followed by every affected symbol name.
    pub fn affected_symbol_names(&self) -> Vec<String> {
        self.primary_symbol
            .iter()
            .chain(self.affected_symbols.iter())
            .map(|s| s.name.clone())
            .collect()
    }

    /// Short id prefix used in human-readable output.
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }

    /// Compact multi-line description for LLM context.
    pub fn to_context_string(&self) -> String {
        let mut lines = vec![
            format!(
                "Edit [{}] on {}",
                self.short_id(),
                self.file_path.as_deref().unwrap_or("<execution>")
            ),
            format!("  Type: {}", self.edit_type),
        ];

        if !self.user_intent.is_empty() {
            lines.push(format!("  Intent: {}", self.user_intent));
        }

        if let Some(primary) = &self.primary_symbol {
            lines.push(format!("  Primary symbol: {}", primary.to_display()));
        }

        if !self.affected_symbols.is_empty() {
            let names: Vec<&str> = self
                .affected_symbols
                .iter()
                .take(CONTEXT_AFFECTED_LIMIT)
                .map(|s| s.name.as_str())
                .collect();
            let mut line = format!("  Affected: {}", names.join(", "));
            if self.affected_symbols.len() > CONTEXT_AFFECTED_LIMIT {
                line.push_str(&format!(
                    " (+{} more)",
                    self.affected_symbols.len() - CONTEXT_AFFECTED_LIMIT
                ));
            }
            lines.push(line);
        }

        if let Some(result) = &self.result {
            let status = if result.success { "SUCCESS" } else { "FAILED" };
            lines.push(format!("  Result: {status}"));
            if !result.errors.is_empty() {
                let errors: Vec<&str> = result
                    .errors
                    .iter()
                    .take(CONTEXT_ERROR_LIMIT)
                    .map(String::as_str)
                    .collect();
                lines.push(format!("  Errors: {}", errors.join("; ")));
            }
        }

        if let Some(summary) = self
            .conversation_context
            .as_ref()
            .and_then(|c| c.intent_summary.as_ref())
        {
            lines.push(format!("  Context: {summary}"));
        }

        lines.join("\n")
    }

    /// Encode into a nested JSON value.
    pub fn to_value(&self) -> EditGraphResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode from a nested JSON value produced by [`Edit::to_value`].
    pub fn from_value(value: serde_json::Value) -> EditGraphResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Render a timestamp in the fixed-width form stored in indexed columns.
///
/// Fixed width keeps lexical order equal to chronological order.
pub fn timestamp_column(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
