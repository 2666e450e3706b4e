pub mod config;
pub mod demo;
pub mod error;
pub mod infra;
pub mod queue;
