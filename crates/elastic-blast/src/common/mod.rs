pub mod cli;
pub mod env;
pub mod error;
pub mod memory;
pub mod parser;
pub mod placeholders;
pub mod retry;
pub mod setup;
