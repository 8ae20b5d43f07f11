pub mod discovery;
pub mod process;
pub mod rollback;
pub mod syntax;
pub mod validator;
pub mod vcs;
