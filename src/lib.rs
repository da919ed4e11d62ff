pub mod cli;
pub mod commands;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod identity;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod ui;
