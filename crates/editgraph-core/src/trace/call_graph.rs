//! Call tree observed during one traced region.
//!
//! Nodes live in an arena owned by [`CallGraph`]; each node keeps the arena
//! indices of its children in call order. A flat `call_id -> index` map gives
//! constant-time lookup at any depth.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One function invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallNode {
    pub function_name: String,
    pub module: String,
    pub file_path: String,
    pub line_number: u32,

    pub call_id: String,
    #[serde(default)]
    pub parent_call_id: Option<String>,
    pub depth: usize,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub arguments: Option<IndexMap<String, serde_json::Value>>,
    #[serde(default)]
    pub return_value: Option<serde_json::Value>,

    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub exception_type: Option<String>,

    /// Arena indices of child calls, in call order.
    #[serde(default)]
    pub children: Vec<usize>,
}

impl CallNode {
    pub fn new(
        function_name: impl Into<String>,
        module: impl Into<String>,
        file_path: impl Into<String>,
        line_number: u32,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            module: module.into(),
            file_path: file_path.into(),
            line_number,
            call_id: String::new(),
            parent_call_id: None,
            depth: 0,
            start_time: None,
            end_time: None,
            arguments: None,
            return_value: None,
            exception: None,
            exception_type: None,
            children: Vec::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                let micros = (end - start).num_microseconds().unwrap_or(0);
                Some(micros as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// `module::function`, or the bare function name without a module.
    pub fn qualified_name(&self) -> String {
        if self.module.is_empty() {
            self.function_name.clone()
        } else {
            format!("{}::{}", self.module, self.function_name)
        }
    }

    pub fn to_summary(&self) -> String {
        let mut parts = vec![format!("{}()", self.qualified_name())];
        if self.line_number > 0 {
            parts.push(format!("at line {}", self.line_number));
        }
        if let Some(ms) = self.duration_ms() {
            parts.push(format!("({ms:.1}ms)"));
        }
        if self.exception.is_some() {
            parts.push(format!(
                "RAISED {}",
                self.exception_type.as_deref().unwrap_or("Unknown")
            ));
        }
        parts.join(" ")
    }
}

/// Aggregated timing for one qualified function name.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionStat {
    pub name: String,
    pub calls: usize,
    pub total_ms: f64,
}

impl FunctionStat {
    pub fn short_name(&self) -> &str {
        self.name.rsplit("::").next().unwrap_or(&self.name)
    }

    pub fn avg_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_ms / self.calls as f64
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct CallGraphData {
    nodes: Vec<CallNode>,
    roots: Vec<usize>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    functions_called: BTreeSet<String>,
    files_touched: BTreeSet<String>,
    exceptions_raised: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CallGraphData", into = "CallGraphData")]
pub struct CallGraph {
    nodes: Vec<CallNode>,
    roots: Vec<usize>,
    index: HashMap<String, usize>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub functions_called: BTreeSet<String>,
    pub files_touched: BTreeSet<String>,
    pub exceptions_raised: Vec<String>,
}

impl TryFrom<CallGraphData> for CallGraph {
    type Error = String;

    /// Rejects link indices past the node list and duplicate call ids.
    fn try_from(data: CallGraphData) -> Result<Self, Self::Error> {
        let len = data.nodes.len();
        if let Some(bad) = data.roots.iter().find(|&&i| i >= len) {
            return Err(format!("root index {bad} out of bounds for {len} nodes"));
        }

        let mut index = HashMap::with_capacity(len);
        for (i, node) in data.nodes.iter().enumerate() {
            if let Some(bad) = node.children.iter().find(|&&c| c >= len) {
                return Err(format!(
                    "child index {bad} of call {} out of bounds for {len} nodes",
                    node.call_id
                ));
            }
            if index.insert(node.call_id.clone(), i).is_some() {
                return Err(format!("duplicate call id {}", node.call_id));
            }
        }

        Ok(Self {
            nodes: data.nodes,
            roots: data.roots,
            index,
            start_time: data.start_time,
            end_time: data.end_time,
            functions_called: data.functions_called,
            files_touched: data.files_touched,
            exceptions_raised: data.exceptions_raised,
        })
    }
}

impl From<CallGraph> for CallGraphData {
    fn from(graph: CallGraph) -> Self {
        Self {
            nodes: graph.nodes,
            roots: graph.roots,
            start_time: graph.start_time,
            end_time: graph.end_time,
            functions_called: graph.functions_called,
            files_touched: graph.files_touched,
            exceptions_raised: graph.exceptions_raised,
        }
    }
}

impl CallGraph {
    pub fn new() -> Self {
        Self {
            start_time: Some(Utc::now()),
            ..Self::default()
        }
    }

    // -----------------------------------------------------------------------
    // Building
    // -----------------------------------------------------------------------

    /// Insert `node` under `parent_id`, or as a root when the parent is
    /// absent. Depth and parent id are derived from the parent.
    pub fn add_call(&mut self, mut node: CallNode, parent_id: Option<&str>) -> usize {
        let idx = self.nodes.len();
        self.functions_called.insert(node.qualified_name());
        if !node.file_path.is_empty() {
            self.files_touched.insert(node.file_path.clone());
        }

        match parent_id.and_then(|p| self.index.get(p).copied()) {
            Some(parent_idx) => {
                let parent = &mut self.nodes[parent_idx];
                parent.children.push(idx);
                node.parent_call_id = Some(parent.call_id.clone());
                node.depth = parent.depth + 1;
            }
            None => {
                node.parent_call_id = None;
                node.depth = 0;
                self.roots.push(idx);
            }
        }

        self.index.insert(node.call_id.clone(), idx);
        self.nodes.push(node);
        idx
    }

    pub fn record_exception(&mut self, call_id: &str, exception_type: &str, message: &str) {
        if let Some(node) = self.get_mut(call_id) {
            node.exception_type = Some(exception_type.to_string());
            node.exception = Some(message.to_string());
            self.exceptions_raised
                .push(format!("{exception_type}: {message}"));
        }
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    pub fn total_calls(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, call_id: &str) -> Option<&CallNode> {
        self.index.get(call_id).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, call_id: &str) -> Option<&mut CallNode> {
        match self.index.get(call_id) {
            Some(&i) => self.nodes.get_mut(i),
            None => None,
        }
    }

    /// Every node in call order.
    pub fn nodes(&self) -> &[CallNode] {
        &self.nodes
    }

    pub fn roots(&self) -> impl Iterator<Item = &CallNode> {
        self.roots.iter().map(|&i| &self.nodes[i])
    }

    pub fn children<'a>(&'a self, node: &'a CallNode) -> impl Iterator<Item = &'a CallNode> {
        node.children.iter().map(|&i| &self.nodes[i])
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.nodes.iter().map(|n| n.depth).max()
    }

    /// Nodes from the root down to `call_id`.
    pub fn call_chain(&self, call_id: &str) -> Vec<&CallNode> {
        let mut chain = Vec::new();
        let mut current = self.get(call_id);
        while let Some(node) = current {
            chain.push(node);
            current = node.parent_call_id.as_deref().and_then(|p| self.get(p));
        }
        chain.reverse();
        chain
    }

    // -----------------------------------------------------------------------
    // Rankings
    // -----------------------------------------------------------------------

    fn function_stats(&self) -> IndexMap<String, FunctionStat> {
        let mut stats: IndexMap<String, FunctionStat> = IndexMap::new();
        for node in &self.nodes {
            let name = node.qualified_name();
            let entry = stats.entry(name.clone()).or_insert(FunctionStat {
                name,
                calls: 0,
                total_ms: 0.0,
            });
            entry.calls += 1;
            entry.total_ms += node.duration_ms().unwrap_or(0.0);
        }
        stats
    }

    /// Most frequently called functions.
    pub fn hot_functions(&self, top_n: usize) -> Vec<FunctionStat> {
        let mut stats: Vec<FunctionStat> = self.function_stats().into_values().collect();
        stats.sort_by(|a, b| b.calls.cmp(&a.calls));
        stats.truncate(top_n);
        stats
    }

    /// Functions with the highest cumulative duration; untimed ones are left out.
    pub fn slow_functions(&self, top_n: usize) -> Vec<FunctionStat> {
        let mut stats: Vec<FunctionStat> = self
            .function_stats()
            .into_values()
            .filter(|s| s.total_ms > 0.0)
            .collect();
        stats.sort_by(|a, b| b.total_ms.total_cmp(&a.total_ms));
        stats.truncate(top_n);
        stats
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    pub fn to_tree_string(&self, max_depth: usize) -> String {
        let mut lines = Vec::new();
        let count = self.roots.len();
        for (i, root) in self.roots().enumerate() {
            self.format_tree_node(root, "", i + 1 == count, max_depth, &mut lines);
        }
        lines.join("\n")
    }

    fn format_tree_node(
        &self,
        node: &CallNode,
        prefix: &str,
        is_last: bool,
        max_depth: usize,
        lines: &mut Vec<String>,
    ) {
        let connector = if is_last { "└── " } else { "├── " };
        lines.push(format!("{prefix}{connector}{}", node.to_summary()));

        if node.depth >= max_depth {
            if !node.children.is_empty() {
                lines.push(format!("{prefix}    └── ... ({} more)", node.children.len()));
            }
            return;
        }

        let child_prefix = format!("{prefix}{}", if is_last { "    " } else { "│   " });
        let count = node.children.len();
        for (i, child) in self.children(node).enumerate() {
            self.format_tree_node(child, &child_prefix, i + 1 == count, max_depth, lines);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn node(id: &str, name: &str) -> CallNode {
        let mut n = CallNode::new(name, "app", "app.rs", 10);
        n.call_id = id.into();
        n
    }

    fn timed(id: &str, name: &str, ms: i64) -> CallNode {
        let mut n = node(id, name);
        let start = Utc::now();
        n.start_time = Some(start);
        n.end_time = Some(start + Duration::milliseconds(ms));
        n
    }

    fn sample() -> CallGraph {
        let mut g = CallGraph::new();
        g.add_call(node("0_0", "main"), None);
        g.add_call(node("1_1", "load"), Some("0_0"));
        g.add_call(node("2_2", "parse"), Some("1_1"));
        g.add_call(node("1_3", "save"), Some("0_0"));
        g
    }

    #[test]
    fn test_parent_links_and_depth() {
        let g = sample();
        assert_eq!(g.total_calls(), 4);
        for n in g.nodes() {
            match &n.parent_call_id {
                Some(p) => assert_eq!(n.depth, g.get(p).unwrap().depth + 1),
                None => assert_eq!(n.depth, 0),
            }
        }
        let roots: Vec<&str> = g.roots().map(|n| n.call_id.as_str()).collect();
        assert_eq!(roots, vec!["0_0"]);
        assert_eq!(g.max_depth(), Some(2));
    }

    #[test]
    fn test_unknown_parent_becomes_root() {
        let mut g = CallGraph::new();
        g.add_call(node("1_0", "orphan"), Some("missing"));
        assert_eq!(g.get("1_0").unwrap().depth, 0);
        assert_eq!(g.roots().count(), 1);
    }

    #[test]
    fn test_call_chain() {
        let g = sample();
        let chain: Vec<&str> = g
            .call_chain("2_2")
            .iter()
            .map(|n| n.function_name.as_str())
            .collect();
        assert_eq!(chain, vec!["main", "load", "parse"]);
        assert!(g.call_chain("nope").is_empty());
    }

    #[test]
    fn test_record_exception() {
        let mut g = sample();
        g.record_exception("2_2", "ValueError", "bad input");
        let n = g.get("2_2").unwrap();
        assert_eq!(n.exception_type.as_deref(), Some("ValueError"));
        assert_eq!(g.exceptions_raised, vec!["ValueError: bad input"]);
        assert!(n.to_summary().ends_with("RAISED ValueError"));
    }

    #[test]
    fn test_hot_and_slow() {
        let mut g = CallGraph::new();
        g.add_call(timed("0_0", "main", 50), None);
        for i in 1..=3 {
            g.add_call(timed(&format!("1_{i}"), "step", 5), Some("0_0"));
        }
        let hot = g.hot_functions(1);
        assert_eq!(hot[0].name, "app::step");
        assert_eq!(hot[0].calls, 3);
        assert_eq!(hot[0].short_name(), "step");

        let slow = g.slow_functions(5);
        assert_eq!(slow[0].name, "app::main");
        assert!((slow[1].total_ms - 15.0).abs() < 1e-6);
        assert!((slow[1].avg_ms() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_tree_string() {
        let g = sample();
        let tree = g.to_tree_string(10);
        let lines: Vec<&str> = tree.lines().collect();
        assert_eq!(lines[0], "└── app::main() at line 10");
        assert_eq!(lines[1], "    ├── app::load() at line 10");
        assert_eq!(lines[2], "    │   └── app::parse() at line 10");
        assert_eq!(lines[3], "    └── app::save() at line 10");

        let shallow = g.to_tree_string(0);
        assert_eq!(shallow, "└── app::main() at line 10\n    └── ... (2 more)");
    }

    #[test]
    fn test_serde_rebuilds_index() {
        let g = sample();
        let json = serde_json::to_string(&g).unwrap();
        let back: CallGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
        assert_eq!(back.get("2_2").unwrap().function_name, "parse");
    }

    #[test]
    fn test_deserialize_rejects_dangling_root() {
        let err = serde_json::from_str::<CallGraph>(r#"{"nodes":[],"roots":[3]}"#).unwrap_err();
        assert!(err.to_string().contains("root index 3"));
        let empty: CallGraph = serde_json::from_str(r#"{"nodes":[],"roots":[]}"#).unwrap();
        assert_eq!(empty.roots().count(), 0);
    }

    #[test]
    fn test_deserialize_rejects_dangling_child_and_duplicate_id() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["nodes"][0]["children"] = serde_json::json!([1, 99]);
        let err = serde_json::from_value::<CallGraph>(value).unwrap_err();
        assert!(err.to_string().contains("child index 99"));

        let mut value = serde_json::to_value(sample()).unwrap();
        value["nodes"][3]["call_id"] = serde_json::json!("0_0");
        let err = serde_json::from_value::<CallGraph>(value).unwrap_err();
        assert!(err.to_string().contains("duplicate call id 0_0"));
    }
}
