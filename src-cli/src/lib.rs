//! Command-line harness for Aerial QA
//!
//! Walks image files, runs them through the batch scheduler and writes JSON snapshots.

pub mod analyze;
pub mod cli;
pub mod config;
pub mod summary;

pub use analyze::{collect_images, run_analyze, BatchReport};
pub use cli::{AnalyzeArgs, Cli, Commands};
pub use config::AppConfig;
