//! Tree-sitter parsing wrapper shared by symbol extraction and syntax checks.

use tree_sitter::{Language, Node, Parser, Tree};

use crate::errors::{EditGraphError, EditGraphResult};

/// Location of the first syntax problem in a parse tree (1-based).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

pub fn grammar_for(language: &str) -> Option<Language> {
    let lang = match language {
        "python" => tree_sitter_python::LANGUAGE,
        "java" => tree_sitter_java::LANGUAGE,
        "typescript" | "javascript" => tree_sitter_typescript::LANGUAGE_TYPESCRIPT,
        "tsx" | "jsx" => tree_sitter_typescript::LANGUAGE_TSX,
        "go" => tree_sitter_go::LANGUAGE,
        _ => return None,
    };
    Some(lang.into())
}

/// Parse `source` with the grammar registered for `language`.
pub fn parse_source(source: &str, language: &str) -> EditGraphResult<Tree> {
    let grammar = grammar_for(language)
        .ok_or_else(|| EditGraphError::Parse(format!("No tree-sitter grammar for: {language}")))?;

    let mut parser = Parser::new();
    parser
        .set_language(&grammar)
        .map_err(|e| EditGraphError::Parse(format!("Failed to set language: {e}")))?;

    parser
        .parse(source.as_bytes(), None)
        .ok_or_else(|| EditGraphError::Parse(format!("Failed to parse {language} source")))
}

/// First ERROR or MISSING node in document order, if any.
pub fn first_syntax_issue(tree: &Tree) -> Option<SyntaxIssue> {
    let root = tree.root_node();
    if !root.has_error() {
        return None;
    }
    find_issue(root).or(Some(SyntaxIssue {
        line: root.start_position().row + 1,
        column: root.start_position().column + 1,
        message: "invalid syntax".to_string(),
    }))
}

fn find_issue(node: Node<'_>) -> Option<SyntaxIssue> {
    if node.is_missing() {
        let pos = node.start_position();
        return Some(SyntaxIssue {
            line: pos.row + 1,
            column: pos.column + 1,
            message: format!("missing '{}'", node.kind()),
        });
    }
    if node.is_error() {
        let pos = node.start_position();
        return Some(SyntaxIssue {
            line: pos.row + 1,
            column: pos.column + 1,
            message: "invalid syntax".to_string(),
        });
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error() {
            if let Some(issue) = find_issue(child) {
                return Some(issue);
            }
        }
    }
    None
}

/// Text covered by `node`.
pub fn node_text<'a>(node: Node<'_>, source: &'a [u8]) -> &'a str {
    std::str::from_utf8(&source[node.start_byte()..node.end_byte()]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_python() {
        let tree = parse_source("def f(x):\n    return x\n", "python").unwrap();
        assert!(first_syntax_issue(&tree).is_none());
    }

    #[test]
    fn test_parse_invalid_python_reports_line() {
        let tree = parse_source("x = 1\ndef f(:\n    pass\n", "python").unwrap();
        let issue = first_syntax_issue(&tree).unwrap();
        assert_eq!(issue.line, 2);
    }

    #[test]
    fn test_unknown_language() {
        assert!(matches!(
            parse_source("", "cobol"),
            Err(EditGraphError::Parse(_))
        ));
    }

    #[test]
    fn test_go_and_java_grammars_load() {
        for (lang, src) in [
            ("go", "package main\nfunc main() {}\n"),
            ("java", "class A { void f() {} }\n"),
            ("typescript", "const x: number = 1;\n"),
        ] {
            let tree = parse_source(src, lang).unwrap();
            assert!(first_syntax_issue(&tree).is_none(), "{lang}");
        }
    }
}
