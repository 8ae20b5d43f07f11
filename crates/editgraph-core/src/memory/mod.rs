pub mod linker;
pub mod recorder;
