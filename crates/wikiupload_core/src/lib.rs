pub mod config;
pub mod error;
pub mod execute;
pub mod plan;
pub mod resolve;
pub mod rewrite;
pub mod session;
