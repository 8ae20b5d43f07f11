pub mod guards;
pub mod knowledge;
