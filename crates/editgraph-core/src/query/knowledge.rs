//! Derived views over the edit graph: file history digests, related edits
//! and parent chains.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::errors::EditGraphResult;
use crate::models::Edit;
use crate::query::guards::{clamp_limit, MAX_KNOWLEDGE_EDITS, MAX_QUERY_LIMIT};
use crate::store::graph::SemanticEditGraph;

/// Human-readable history of the most recent edits to `file_path`.
pub fn institutional_knowledge(
    graph: &SemanticEditGraph,
    file_path: &str,
    max_edits: usize,
) -> EditGraphResult<String> {
    let edits = graph.query_by_file(file_path, clamp_limit(max_edits, MAX_KNOWLEDGE_EDITS))?;
    if edits.is_empty() {
        return Ok(format!("No edit history found for {file_path}"));
    }

    let mut parts = vec![format!("## Edit History for {file_path}"), String::new()];
    for edit in &edits {
        parts.push(edit.to_context_string());
        parts.push(String::new());
    }

    let mut histogram: IndexMap<&str, usize> = IndexMap::new();
    for edit in &edits {
        *histogram.entry(edit.edit_type.as_str()).or_insert(0) += 1;
    }
    let mut counts: Vec<(&str, usize)> = histogram.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1));

    parts.push("### Summary".to_string());
    parts.push(format!("Total edits: {}", edits.len()));
    for (edit_type, count) in counts {
        parts.push(format!("  {edit_type}: {count}"));
    }
    Ok(parts.join("\n"))
}

/// Edits sharing any symbol name with `edit`, excluding `edit` itself.
pub fn related_edits(
    graph: &SemanticEditGraph,
    edit: &Edit,
    limit: usize,
) -> EditGraphResult<Vec<Edit>> {
    let limit = clamp_limit(limit, MAX_QUERY_LIMIT);
    let names = edit.affected_symbol_names();
    let mut related = Vec::new();
    let mut seen: HashSet<String> = HashSet::from([edit.id.clone()]);

    'names: for name in names {
        for candidate in graph.query_by_symbol(&name, limit)? {
            if seen.insert(candidate.id.clone()) {
                related.push(candidate);
                if related.len() >= limit {
                    break 'names;
                }
            }
        }
    }
    Ok(related)
}

/// Walk parent links from `edit_id` and return the chain oldest first.
///
/// A missing edit ends the walk; an id seen twice ends it as well.
pub fn edit_chain(graph: &SemanticEditGraph, edit_id: &str) -> EditGraphResult<Vec<Edit>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(edit_id.to_string());

    while let Some(id) = current.take() {
        if !seen.insert(id.clone()) {
            break;
        }
        match graph.get_edit(&id)? {
            Some(edit) => {
                current = edit.parent_edit_id.clone();
                chain.push(edit);
            }
            None => break,
        }
    }

    chain.reverse();
    Ok(chain)
}
