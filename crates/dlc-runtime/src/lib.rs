//! dlc-runtime: Command execution layer
//!
//! This crate runs the external tools the harness is built on:
//! - A `CommandRunner` trait with local and dry-run implementations
//! - Retry helpers for flaky operations
//! - The Docker image builder

pub mod docker;
pub mod dry_run;
pub mod process;
pub mod retry;
pub mod traits;

pub use docker::{BuildRecord, ImageBuilder, ImageBuilderConfig};
pub use dry_run::DryRunRunner;
pub use process::LocalRunner;
pub use retry::{retry, retry_until, RetryConfig};
pub use traits::{BackgroundProcess, CommandOutput, CommandRunner, CommandSpec};
