pub mod call_graph;
pub mod context;
pub mod tracer;
