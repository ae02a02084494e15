//! The `babbla` command line: configuration layering, logging setup and the
//! speak, dry-run, voice listing and harness flows on top of `tts_core`.

pub mod app;
pub mod args;
pub mod config;
pub mod error;
pub mod harness;
pub mod logging;
pub mod metrics;
pub mod validation;

pub use app::{execute, Stdin};
pub use args::Cli;
pub use config::AppConfig;
pub use error::CliError;
