pub mod diff;
pub mod filesystem;
pub mod parser;
pub mod symbols;
