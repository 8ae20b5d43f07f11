//! Shared guardrails for query limits and search strings.

pub const MAX_QUERY_LENGTH: usize = 512;
pub const MAX_QUERY_LIMIT: usize = 1000;
pub const MAX_KNOWLEDGE_EDITS: usize = 50;

pub fn clamp_int(value: usize, minimum: usize, maximum: usize) -> usize {
    value.max(minimum).min(maximum)
}

pub fn clamp_limit(value: usize, maximum: usize) -> usize {
    clamp_int(value, 1, maximum)
}

/// Trim and cap a search string at [`MAX_QUERY_LENGTH`] characters.
pub fn truncate_query(query: &str) -> String {
    let stripped = query.trim();
    match stripped.char_indices().nth(MAX_QUERY_LENGTH) {
        Some((idx, _)) => stripped[..idx].to_string(),
        None => stripped.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(0, MAX_QUERY_LIMIT), 1);
        assert_eq!(clamp_limit(50, MAX_QUERY_LIMIT), 50);
        assert_eq!(clamp_limit(5000, MAX_QUERY_LIMIT), MAX_QUERY_LIMIT);
    }

    #[test]
    fn test_truncate_query() {
        assert_eq!(truncate_query("  add  "), "add");
        let long = "é".repeat(MAX_QUERY_LENGTH + 10);
        assert_eq!(truncate_query(&long).chars().count(), MAX_QUERY_LENGTH);
    }
}
