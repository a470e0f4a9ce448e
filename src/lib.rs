// ABOUTME: Library crate for devloop exposing the session runtime for the CLI and tests

pub mod config;
pub mod logs;
pub mod models;
pub mod platform;
pub mod router;
pub mod runtime;
pub mod session;
