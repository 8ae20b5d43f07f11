//! Symbol-level diffing between two versions of a source file.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use similar::{ChangeTag, TextDiff};

use crate::indexer::symbols::extract_symbols_for_file;
use crate::models::SymbolReference;

/// Symbols added, removed and modified between two versions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolDiff {
    pub added: Vec<SymbolReference>,
    pub removed: Vec<SymbolReference>,
    /// Entries carry the new version of the symbol.
    pub modified: Vec<SymbolReference>,
}

impl SymbolDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

fn index_by_name(symbols: Vec<SymbolReference>) -> IndexMap<String, SymbolReference> {
    let mut map = IndexMap::new();
    for symbol in symbols {
        map.insert(symbol.name.clone(), symbol);
    }
    map
}

/// Classify symbols by name.
///
/// A symbol present in both versions is modified when its signature text,
/// start line or line count differs. A pure shift caused by lines inserted
/// above it therefore counts as a modification.
pub fn find_affected_symbols(original: &str, new: &str, file_path: &str) -> SymbolDiff {
    let before = index_by_name(extract_symbols_for_file(original, file_path));
    let after = index_by_name(extract_symbols_for_file(new, file_path));

    let mut diff = SymbolDiff::default();
    for (name, symbol) in &after {
        match before.get(name) {
            None => diff.added.push(symbol.clone()),
            Some(old) => {
                if old.signature != symbol.signature
                    || old.line_start != symbol.line_start
                    || old.line_count() != symbol.line_count()
                {
                    diff.modified.push(symbol.clone());
                }
            }
        }
    }
    for (name, symbol) in &before {
        if !after.contains_key(name) {
            diff.removed.push(symbol.clone());
        }
    }
    diff
}

/// 1-based line numbers of the new text touched by the change.
///
/// Inserted lines are reported directly; a deletion marks the new-side line
/// right above the removed block.
pub fn changed_lines(original: &str, new: &str) -> BTreeSet<usize> {
    let diff = TextDiff::from_lines(original, new);
    let mut changed = BTreeSet::new();
    let mut new_line = 0usize;
    // A deletion followed by insertions is a replacement and is covered by
    // the inserted lines.
    let mut pending_delete = false;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Equal => {
                if pending_delete {
                    changed.insert(new_line.max(1));
                    pending_delete = false;
                }
                new_line += 1;
            }
            ChangeTag::Insert => {
                pending_delete = false;
                new_line += 1;
                changed.insert(new_line);
            }
            ChangeTag::Delete => pending_delete = true,
        }
    }
    if pending_delete {
        changed.insert(new_line.max(1));
    }
    changed
}

/// Symbols of `source` whose line range intersects `lines`.
pub fn symbols_in_lines(
    source: &str,
    lines: &BTreeSet<usize>,
    file_path: &str,
) -> Vec<SymbolReference> {
    if lines.is_empty() {
        return Vec::new();
    }
    extract_symbols_for_file(source, file_path)
        .into_iter()
        .filter(|s| lines.range(s.line_start..=s.line_end).next().is_some())
        .collect()
}

/// Pick the primary symbol of a change and return the rest as affected.
///
/// Falls back to the symbols overlapping the textual diff when no symbol
/// changed at the declaration level.
pub fn extract_affected_symbols(
    original: &str,
    new: &str,
    file_path: &str,
) -> (Option<SymbolReference>, Vec<SymbolReference>) {
    let diff = find_affected_symbols(original, new, file_path);
    let mut all: Vec<SymbolReference> = diff
        .added
        .into_iter()
        .chain(diff.modified)
        .chain(diff.removed)
        .collect();

    if all.is_empty() {
        let lines = changed_lines(original, new);
        all = symbols_in_lines(new, &lines, file_path);
    }
    if all.is_empty() {
        return (None, Vec::new());
    }

    all.sort_by_key(|s| s.kind.priority());
    let primary = all.remove(0);
    (Some(primary), all)
}

/// Unified diff text with `a/` and `b/` headers.
pub fn unified_diff(original: &str, new: &str, file_path: &str) -> String {
    TextDiff::from_lines(original, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{file_path}"), &format!("b/{file_path}"))
        .to_string()
}
