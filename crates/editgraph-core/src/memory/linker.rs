//! Links edits to the conversation that produced them.
//!
//! A [`Session`] carries the session start time and an optional handle to the
//! live message history. The conversation id is derived from the session
//! once and then pinned for the lifetime of the linker.

use std::sync::{Arc, LazyLock, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::indexer::diff::{extract_affected_symbols, unified_diff};
use crate::models::{ConversationContext, Edit, EditType};

const INTENT_SENTENCE_LIMIT: usize = 80;
const CONVERSATION_SEED_CHARS: usize = 100;

// ---------------------------------------------------------------------------
// Message history
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == "user"
    }
}

/// Ordered chat history owned by the host application.
pub trait MessageHistory: Send + Sync {
    fn messages(&self) -> Vec<Message>;
}

impl MessageHistory for Vec<Message> {
    fn messages(&self) -> Vec<Message> {
        self.clone()
    }
}

impl MessageHistory for RwLock<Vec<Message>> {
    fn messages(&self) -> Vec<Message> {
        self.read().clone()
    }
}

#[derive(Clone)]
pub struct Session {
    pub started_at: DateTime<Utc>,
    pub history: Option<Arc<dyn MessageHistory>>,
}

impl Session {
    pub fn new(history: Arc<dyn MessageHistory>) -> Self {
        Self {
            started_at: Utc::now(),
            history: Some(history),
        }
    }

    /// A session with no message history attached.
    pub fn detached() -> Self {
        Self {
            started_at: Utc::now(),
            history: None,
        }
    }

    fn messages(&self) -> Vec<Message> {
        self.history
            .as_ref()
            .map(|h| h.messages())
            .unwrap_or_default()
    }
}

/// `sha256(started_at + first_message[..100])`, first 16 hex chars.
pub fn compute_conversation_id(started_at: &DateTime<Utc>, first_message: Option<&str>) -> String {
    let mut seed = started_at.to_rfc3339();
    if let Some(message) = first_message {
        seed.extend(message.chars().take(CONVERSATION_SEED_CHARS));
    }
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

// ---------------------------------------------------------------------------
// Intent heuristics
// ---------------------------------------------------------------------------

static INTENT_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"^(fix|debug|solve|repair)\b", "Bug fix"),
        (r"^(add|implement|create|build|make)\b", "New feature"),
        (r"^(refactor|clean|reorganize|restructure)\b", "Refactoring"),
        (r"^(optimize|improve|speed up|make faster)\b", "Optimization"),
        (r"^(update|change|modify|edit)\b", "Modification"),
        (r"^(remove|delete|drop)\b", "Removal"),
        (r"^(test|write tests)\b", "Testing"),
        (r"^(document|add docs|comment)\b", "Documentation"),
        (r"\?$", "Question/Exploration"),
    ]
    .into_iter()
    .map(|(p, label)| (Regex::new(p).unwrap(), label))
    .collect()
});

static EDIT_TYPE_PATTERNS: LazyLock<Vec<(Regex, EditType)>> = LazyLock::new(|| {
    [
        (r"\b(fix|bug|error|issue|problem|crash|broken)\b", EditType::BugFix),
        (r"\b(add|implement|create|build|new|feature)\b", EditType::Feature),
        (r"\b(refactor|clean|reorganize|restructure|simplify)\b", EditType::Refactor),
        (r"\b(optimize|performance|speed|faster|efficient)\b", EditType::Optimization),
        (r"\b(test|tests|testing|spec|unittest)\b", EditType::Test),
        (r"\b(doc|document|comment|readme|docstring)\b", EditType::Documentation),
        (r"\b(depend|package|install|import|require)\b", EditType::Dependency),
        (r"\b(config|setting|environment|env)\b", EditType::Configuration),
    ]
    .into_iter()
    .map(|(p, kind)| (Regex::new(p).unwrap(), kind))
    .collect()
});

static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?\n]").unwrap());

fn first_sentence(message: &str) -> String {
    let sentence = SENTENCE_END
        .split(message)
        .next()
        .unwrap_or_default()
        .trim();
    if sentence.chars().count() > INTENT_SENTENCE_LIMIT {
        let head: String = sentence.chars().take(INTENT_SENTENCE_LIMIT - 3).collect();
        format!("{head}...")
    } else {
        sentence.to_string()
    }
}

/// Label the message by its leading verb and append its first sentence.
pub fn extract_intent(user_message: &str) -> String {
    if user_message.is_empty() {
        return "Unknown intent".to_string();
    }
    let normalized = user_message.trim().to_lowercase();
    let sentence = first_sentence(user_message);
    match INTENT_PATTERNS.iter().find(|(re, _)| re.is_match(&normalized)) {
        Some((_, label)) => format!("{label}: {sentence}"),
        None => sentence,
    }
}

/// First keyword family found in the message decides the type.
pub fn infer_edit_type(user_message: &str) -> EditType {
    let normalized = user_message.trim().to_lowercase();
    if normalized.is_empty() {
        return EditType::Unknown;
    }
    EDIT_TYPE_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(&normalized))
        .map(|(_, kind)| *kind)
        .unwrap_or(EditType::Unknown)
}

// ---------------------------------------------------------------------------
// ConversationLinker
// ---------------------------------------------------------------------------

pub struct ConversationLinker {
    session: Session,
    conversation_id: OnceLock<String>,
}

impl ConversationLinker {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            conversation_id: OnceLock::new(),
        }
    }

    /// Pin the conversation id instead of deriving it from the session.
    pub fn with_conversation_id(self, conversation_id: impl Into<String>) -> Self {
        let pinned = OnceLock::new();
        let _ = pinned.set(conversation_id.into());
        Self {
            session: self.session,
            conversation_id: pinned,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn conversation_id(&self) -> &str {
        self.conversation_id.get_or_init(|| {
            let messages = self.session.messages();
            compute_conversation_id(
                &self.session.started_at,
                messages.first().map(|m| m.content.as_str()),
            )
        })
    }

    /// Number of user messages in the session history.
    pub fn current_turn_index(&self) -> usize {
        self.session.messages().iter().filter(|m| m.is_user()).count()
    }

    pub fn create_context(
        &self,
        user_message: &str,
        assistant_response: Option<String>,
        intent_summary: Option<String>,
    ) -> ConversationContext {
        ConversationContext {
            conversation_id: self.conversation_id().to_string(),
            turn_index: self.current_turn_index(),
            user_message: user_message.to_string(),
            assistant_response,
            intent_summary: Some(intent_summary.unwrap_or_else(|| extract_intent(user_message))),
            timestamp: Utc::now(),
        }
    }

    fn context_for_turn(&self, messages: &[Message], position: usize, turn: usize) -> ConversationContext {
        let content = messages[position].content.clone();
        let assistant_response = messages[position + 1..]
            .iter()
            .find(|m| m.role == "assistant")
            .map(|m| m.content.clone());
        ConversationContext {
            conversation_id: self.conversation_id().to_string(),
            turn_index: turn,
            intent_summary: Some(extract_intent(&content)),
            user_message: content,
            assistant_response,
            timestamp: Utc::now(),
        }
    }

    /// Context for the last user message and the assistant reply after it.
    pub fn create_context_from_messages(&self, messages: &[Message]) -> ConversationContext {
        let user_positions: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_user())
            .map(|(i, _)| i)
            .collect();

        match user_positions.last() {
            Some(&position) => self.context_for_turn(messages, position, user_positions.len()),
            None => ConversationContext {
                conversation_id: self.conversation_id().to_string(),
                turn_index: 0,
                user_message: String::new(),
                assistant_response: None,
                intent_summary: None,
                timestamp: Utc::now(),
            },
        }
    }

    /// Contexts for the last `n_turns` user messages, oldest first.
    pub fn recent_contexts(&self, n_turns: usize) -> Vec<ConversationContext> {
        let messages = self.session.messages();
        let user_positions: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_user())
            .map(|(i, _)| i)
            .collect();
        let skip = user_positions.len().saturating_sub(n_turns);
        user_positions
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(turn, &position)| self.context_for_turn(&messages, position, turn + 1))
            .collect()
    }

    /// Attach context from `messages` (or the session history) to `edit`.
    ///
    /// An existing context is never replaced, and the edit type is only
    /// filled in while it is still unknown.
    pub fn link_edit_to_conversation(&self, edit: &mut Edit, messages: Option<&[Message]>) {
        if edit.conversation_context.is_none() {
            let owned;
            let messages = match messages {
                Some(m) => m,
                None => {
                    owned = self.session.messages();
                    owned.as_slice()
                }
            };
            if !messages.is_empty() {
                edit.conversation_context = Some(self.create_context_from_messages(messages));
            }
        }

        if edit.edit_type == EditType::Unknown {
            if let Some(ctx) = &edit.conversation_context {
                edit.edit_type = infer_edit_type(&ctx.user_message);
            }
        }
    }
}

/// Build a fully described edit for an explicit file change.
pub fn create_edit_from_file_change(
    file_path: &str,
    original_content: &str,
    new_content: &str,
    user_message: &str,
    linker: &ConversationLinker,
) -> Edit {
    let (primary, affected) = extract_affected_symbols(original_content, new_content, file_path);
    let context = linker.create_context(user_message, None, None);

    let mut edit = Edit::new(Some(file_path.to_string()), original_content, new_content);
    edit.diff = unified_diff(original_content, new_content, file_path);
    edit.edit_type = infer_edit_type(user_message);
    edit.primary_symbol = primary;
    edit.affected_symbols = affected;
    edit.user_intent = context.intent_summary.clone().unwrap_or_default();
    edit.conversation_context = Some(context);
    edit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::graph::SemanticEditGraph;

    fn history(messages: Vec<Message>) -> Arc<RwLock<Vec<Message>>> {
        Arc::new(RwLock::new(messages))
    }

    #[test]
    fn test_extract_intent_labels() {
        assert_eq!(extract_intent(""), "Unknown intent");
        assert_eq!(
            extract_intent("Fix the crash in parser. It fails on empty input"),
            "Bug fix: Fix the crash in parser"
        );
        assert_eq!(
            extract_intent("Why does this loop?"),
            "Question/Exploration: Why does this loop"
        );
        assert_eq!(extract_intent("the login page"), "the login page");
    }

    #[test]
    fn test_extract_intent_truncates_sentence() {
        let long = format!("refactor {}", "x".repeat(100));
        let intent = extract_intent(&long);
        assert!(intent.starts_with("Refactoring: refactor "));
        assert!(intent.ends_with("..."));
        assert_eq!(intent.chars().count(), "Refactoring: ".len() + 80);
    }

    #[test]
    fn test_infer_edit_type_order() {
        assert_eq!(infer_edit_type("add an optional third argument"), EditType::Feature);
        assert_eq!(infer_edit_type("add a fix for the bug"), EditType::BugFix);
        assert_eq!(infer_edit_type("Speed this up, performance matters"), EditType::Optimization);
        assert_eq!(infer_edit_type("install the package"), EditType::Dependency);
        assert_eq!(infer_edit_type("hello there"), EditType::Unknown);
        assert_eq!(infer_edit_type(""), EditType::Unknown);
    }

    #[test]
    fn test_conversation_id_stable_and_pinnable() {
        let linker = ConversationLinker::new(Session::new(history(vec![Message::user("hi")])));
        let first = linker.conversation_id().to_string();
        assert_eq!(first.len(), 16);
        assert_eq!(linker.conversation_id(), first);

        let pinned = ConversationLinker::new(Session::detached()).with_conversation_id("conv-1");
        assert_eq!(pinned.conversation_id(), "conv-1");
    }

    #[test]
    fn test_conversation_id_is_pure_function_of_session() {
        let started = Utc::now();
        assert_eq!(
            compute_conversation_id(&started, Some("hello")),
            compute_conversation_id(&started, Some("hello"))
        );
        assert_ne!(
            compute_conversation_id(&started, Some("hello")),
            compute_conversation_id(&started, None)
        );
    }

    #[test]
    fn test_create_context_counts_user_turns() {
        let shared = history(vec![
            Message::user("first"),
            Message::assistant("ok"),
            Message::user("second"),
        ]);
        let linker = ConversationLinker::new(Session::new(shared.clone()));
        let ctx = linker.create_context("fix the bug", None, None);
        assert_eq!(ctx.turn_index, 2);
        assert_eq!(ctx.intent_summary.as_deref(), Some("Bug fix: fix the bug"));

        shared.write().push(Message::user("third"));
        assert_eq!(linker.current_turn_index(), 3);
    }

    #[test]
    fn test_context_from_messages_finds_reply() {
        let linker = ConversationLinker::new(Session::detached());
        let messages = vec![
            Message::user("first"),
            Message::assistant("reply one"),
            Message::user("refactor the parser"),
            Message::assistant("done"),
        ];
        let ctx = linker.create_context_from_messages(&messages);
        assert_eq!(ctx.user_message, "refactor the parser");
        assert_eq!(ctx.assistant_response.as_deref(), Some("done"));
        assert_eq!(ctx.turn_index, 2);

        let empty = linker.create_context_from_messages(&[]);
        assert_eq!(empty.user_message, "");
        assert_eq!(empty.turn_index, 0);
    }

    #[test]
    fn test_recent_contexts() {
        let shared = history(vec![
            Message::user("one"),
            Message::assistant("a"),
            Message::user("two"),
            Message::user("three"),
            Message::assistant("b"),
        ]);
        let linker = ConversationLinker::new(Session::new(shared));
        let recent = linker.recent_contexts(2);
        let messages: Vec<&str> = recent.iter().map(|c| c.user_message.as_str()).collect();
        assert_eq!(messages, vec!["two", "three"]);
        assert_eq!(recent[0].assistant_response.as_deref(), Some("b"));
        assert_eq!(recent[1].turn_index, 3);
        assert!(ConversationLinker::new(Session::detached()).recent_contexts(3).is_empty());
    }

    #[test]
    fn test_link_is_idempotent_for_edit_type() {
        let linker = ConversationLinker::new(Session::detached());
        let mut edit = Edit::new(Some("a.py".into()), "", "");
        linker.link_edit_to_conversation(&mut edit, Some(&[Message::user("fix the crash")]));
        assert_eq!(edit.edit_type, EditType::BugFix);
        let first_context = edit.conversation_context.clone();

        linker.link_edit_to_conversation(&mut edit, Some(&[Message::user("add docs")]));
        assert_eq!(edit.edit_type, EditType::BugFix);
        assert_eq!(edit.conversation_context, first_context);
    }

    #[test]
    fn test_link_uses_session_history() {
        let shared = history(vec![Message::user("optimize the loop")]);
        let linker = ConversationLinker::new(Session::new(shared));
        let mut edit = Edit::new(Some("a.py".into()), "", "");
        linker.link_edit_to_conversation(&mut edit, None);
        assert_eq!(edit.edit_type, EditType::Optimization);

        let mut untouched = Edit::new(Some("a.py".into()), "", "");
        ConversationLinker::new(Session::detached()).link_edit_to_conversation(&mut untouched, None);
        assert!(untouched.conversation_context.is_none());
        assert_eq!(untouched.edit_type, EditType::Unknown);
    }

    #[test]
    fn test_end_to_end_edit_memory() {
        let graph = SemanticEditGraph::open_in_memory().unwrap();
        let linker = ConversationLinker::new(Session::detached());

        let mut edit = Edit::new(
            Some("app.py".into()),
            "def add(a,b): return a+b",
            "def add(a,b,c=0): return a+b+c",
        );
        let (primary, affected) =
            extract_affected_symbols(&edit.original_content, &edit.new_content, "app.py");
        edit.primary_symbol = primary;
        edit.affected_symbols = affected;
        linker.link_edit_to_conversation(
            &mut edit,
            Some(&[Message::user("add an optional third argument")]),
        );
        graph.record_edit(&edit).unwrap();

        let found = graph.query_by_symbol("add", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].primary_symbol.as_ref().unwrap().name, "add");
        assert_eq!(found[0].edit_type, EditType::Feature);
    }

    #[test]
    fn test_create_edit_from_file_change() {
        let linker = ConversationLinker::new(Session::detached()).with_conversation_id("c");
        let edit = create_edit_from_file_change(
            "m.py",
            "def f(x):\n    return x\n",
            "def f(x, y):\n    return x + y\n",
            "Change f to take y",
            &linker,
        );
        assert_eq!(edit.primary_symbol.as_ref().unwrap().name, "f");
        assert_eq!(edit.user_intent, "Modification: Change f to take y");
        assert!(edit.diff.contains("+++ b/m.py"));
        assert_eq!(edit.conversation_context.unwrap().conversation_id, "c");
        assert_eq!(edit.edit_type, EditType::Unknown);
    }
}
