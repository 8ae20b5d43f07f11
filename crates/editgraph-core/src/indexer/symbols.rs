//! Symbol extraction from Python source.
//!
//! Walks a tree-sitter parse tree and emits one [`SymbolReference`] per
//! function, async function, class, module-level variable and imported name.
//! Source that does not parse cleanly yields no symbols.

use tree_sitter::Node;

use crate::indexer::parser::{node_text, parse_source};
use crate::models::{SymbolKind, SymbolReference};

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Extract every symbol in `source`; parse failures return an empty list.
pub fn extract_symbols(source: &str) -> Vec<SymbolReference> {
    extract_symbols_for_file(source, "")
}

/// Like [`extract_symbols`], stamping `file_path` onto each symbol.
pub fn extract_symbols_for_file(source: &str, file_path: &str) -> Vec<SymbolReference> {
    let tree = match parse_source(source, "python") {
        Ok(tree) => tree,
        Err(_) => return Vec::new(),
    };
    let root = tree.root_node();
    if root.has_error() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let bytes = source.as_bytes();
    collect(root, bytes, true, &mut out);
    for symbol in &mut out {
        symbol.file_path = file_path.to_string();
    }
    out
}

// ---------------------------------------------------------------------------
// Tree walk
// ---------------------------------------------------------------------------

fn collect(node: Node<'_>, src: &[u8], module_level: bool, out: &mut Vec<SymbolReference>) {
    match node.kind() {
        "function_definition" => {
            if let Some(sym) = function_symbol(node, src) {
                out.push(sym);
            }
        }
        "class_definition" => {
            if let Some(sym) = class_symbol(node, src) {
                out.push(sym);
            }
        }
        "expression_statement" if module_level => {
            variable_symbols(node, src, out);
        }
        "import_statement" => import_symbols(node, src, out),
        "import_from_statement" => import_from_symbols(node, src, out),
        _ => {}
    }

    // Only direct statements of the module (including those wrapped in
    // decorators) count as module level.
    let child_module_level = matches!(node.kind(), "module" | "decorated_definition") && module_level;
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect(child, src, child_module_level, out);
    }
}

fn span(node: Node<'_>) -> (usize, usize) {
    let start = node.start_position().row + 1;
    let end = node.end_position().row + 1;
    (start, end.max(start))
}

fn function_symbol(node: Node<'_>, src: &[u8]) -> Option<SymbolReference> {
    let name = node_text(node.child_by_field_name("name")?, src).to_string();
    let is_async = node
        .child(0)
        .map(|first| first.kind() == "async")
        .unwrap_or(false);
    let kind = if is_async {
        SymbolKind::AsyncFunction
    } else {
        SymbolKind::Function
    };

    let params = node
        .child_by_field_name("parameters")
        .map(|p| parameter_list(p, src))
        .unwrap_or_default();
    let mut signature = format!(
        "{}def {}({})",
        if is_async { "async " } else { "" },
        name,
        params.join(", ")
    );
    if let Some(ret) = node.child_by_field_name("return_type") {
        signature.push_str(" -> ");
        signature.push_str(node_text(ret, src));
    }

    let (line_start, line_end) = span(node);
    let mut symbol = SymbolReference::new(name, kind, line_start, line_end);
    symbol.signature = Some(signature);
    symbol.docstring = node
        .child_by_field_name("body")
        .and_then(|body| docstring(body, src));
    Some(symbol)
}

fn parameter_list(params: Node<'_>, src: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = params.walk();
    for param in params.named_children(&mut cursor) {
        match param.kind() {
            "identifier" | "list_splat_pattern" | "dictionary_splat_pattern" => {
                out.push(node_text(param, src).to_string());
            }
            "typed_parameter" => {
                // The name is the first named child (identifier or a splat pattern).
                let name = param
                    .named_child(0)
                    .map(|n| node_text(n, src).to_string())
                    .unwrap_or_default();
                match param.child_by_field_name("type") {
                    Some(ty) => out.push(format!("{name}: {}", node_text(ty, src))),
                    None => out.push(name),
                }
            }
            "default_parameter" => {
                if let Some(name) = param.child_by_field_name("name") {
                    out.push(node_text(name, src).to_string());
                }
            }
            "typed_default_parameter" => {
                let name = param
                    .child_by_field_name("name")
                    .map(|n| node_text(n, src).to_string())
                    .unwrap_or_default();
                match param.child_by_field_name("type") {
                    Some(ty) => out.push(format!("{name}: {}", node_text(ty, src))),
                    None => out.push(name),
                }
            }
            // Bare `*` / `/` separators carry no name.
            _ => {}
        }
    }
    out
}

fn class_symbol(node: Node<'_>, src: &[u8]) -> Option<SymbolReference> {
    let name = node_text(node.child_by_field_name("name")?, src).to_string();
    let mut bases = Vec::new();
    if let Some(args) = node.child_by_field_name("superclasses") {
        let mut cursor = args.walk();
        for base in args.named_children(&mut cursor) {
            if base.kind() == "comment" {
                continue;
            }
            bases.push(node_text(base, src).to_string());
        }
    }
    let signature = if bases.is_empty() {
        format!("class {name}")
    } else {
        format!("class {name}({})", bases.join(", "))
    };

    let (line_start, line_end) = span(node);
    let mut symbol = SymbolReference::new(name, SymbolKind::Class, line_start, line_end);
    symbol.signature = Some(signature);
    symbol.docstring = node
        .child_by_field_name("body")
        .and_then(|body| docstring(body, src));
    Some(symbol)
}

fn variable_symbols(stmt: Node<'_>, src: &[u8], out: &mut Vec<SymbolReference>) {
    let Some(first) = stmt.named_child(0) else {
        return;
    };
    if first.kind() != "assignment" {
        return;
    }
    let (line_start, line_end) = span(stmt);

    // `a = b = 1` nests assignments through the right-hand side.
    let mut current = Some(first);
    while let Some(assign) = current {
        if assign.kind() != "assignment" || assign.child_by_field_name("type").is_some() {
            break;
        }
        if let Some(left) = assign.child_by_field_name("left") {
            if left.kind() == "identifier" {
                out.push(SymbolReference::new(
                    node_text(left, src),
                    SymbolKind::Variable,
                    line_start,
                    line_end,
                ));
            }
        }
        current = assign.child_by_field_name("right");
    }
}

fn import_symbols(node: Node<'_>, src: &[u8], out: &mut Vec<SymbolReference>) {
    let (line_start, line_end) = span(node);
    let mut cursor = node.walk();
    for name in node.children_by_field_name("name", &mut cursor) {
        if let Some(imported) = imported_name(name, src) {
            out.push(SymbolReference::new(
                imported,
                SymbolKind::Import,
                line_start,
                line_end,
            ));
        }
    }
}

fn import_from_symbols(node: Node<'_>, src: &[u8], out: &mut Vec<SymbolReference>) {
    let (line_start, line_end) = span(node);
    let module = node
        .child_by_field_name("module_name")
        .map(|m| node_text(m, src).trim_start_matches('.').to_string())
        .unwrap_or_default();

    let mut names = Vec::new();
    let mut cursor = node.walk();
    for name in node.children_by_field_name("name", &mut cursor) {
        if let Some(imported) = imported_name(name, src) {
            names.push(imported);
        }
    }
    // `from x import *`
    if names.is_empty() {
        let mut cursor = node.walk();
        if node
            .named_children(&mut cursor)
            .any(|c| c.kind() == "wildcard_import")
        {
            names.push("*".to_string());
        }
    }

    for name in names {
        let full = if module.is_empty() {
            name
        } else {
            format!("{module}.{name}")
        };
        out.push(SymbolReference::new(
            full,
            SymbolKind::Import,
            line_start,
            line_end,
        ));
    }
}

/// Alias if present, otherwise the dotted name itself.
fn imported_name(node: Node<'_>, src: &[u8]) -> Option<String> {
    match node.kind() {
        "aliased_import" => node
            .child_by_field_name("alias")
            .or_else(|| node.child_by_field_name("name"))
            .map(|n| node_text(n, src).to_string()),
        "dotted_name" | "identifier" => Some(node_text(node, src).to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Docstrings
// ---------------------------------------------------------------------------

fn docstring(body: Node<'_>, src: &[u8]) -> Option<String> {
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let literal = first.named_child(0)?;
    if literal.kind() != "string" {
        return None;
    }
    Some(clean_docstring(strip_string_quotes(node_text(literal, src))))
}

fn strip_string_quotes(raw: &str) -> &str {
    let body = raw.trim_start_matches(|c: char| "rRuUbBfF".contains(c));
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if body.len() >= 2 * quote.len() && body.starts_with(quote) && body.ends_with(quote) {
            return &body[quote.len()..body.len() - quote.len()];
        }
    }
    body
}

/// Remove the common leading indentation of every line after the first.
fn clean_docstring(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let indent = lines
        .iter()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut cleaned: Vec<String> = Vec::with_capacity(lines.len());
    cleaned.push(lines[0].trim().to_string());
    for line in &lines[1..] {
        if line.len() >= indent {
            cleaned.push(line[indent..].trim_end().to_string());
        } else {
            cleaned.push(line.trim().to_string());
        }
    }
    while cleaned.last().map(|l| l.is_empty()).unwrap_or(false) {
        cleaned.pop();
    }
    while cleaned.first().map(|l| l.is_empty()).unwrap_or(false) {
        cleaned.remove(0);
    }
    cleaned.join("\n")
}
