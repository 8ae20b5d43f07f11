pub mod backend;
pub mod graph;
pub mod schema;
