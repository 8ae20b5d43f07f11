//! editgraph core library: execution-informed memory of code edits.
//!
//! Edits are recorded with the symbols they touched and the conversation
//! that asked for them, executions are traced into call graphs that can be
//! rendered as prompt context, and proposed edits are validated (syntax,
//! type check, related tests) with guaranteed rollback of the working tree.

pub mod config;
pub mod errors;
pub mod indexer;
pub mod memory;
pub mod models;
pub mod query;
pub mod store;
pub mod trace;
pub mod validation;

