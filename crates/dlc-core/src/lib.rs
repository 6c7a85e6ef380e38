//! dlc-core: Core types for the DLC build and test harness
//!
//! This crate provides the types shared by the build and test tooling:
//! - Configuration and environment gates
//! - Buildspec model and build matrix selection
//! - Image URI parsing and framework versions
//! - The test-type images report
//! - Error handling

pub mod buildspec;
pub mod config;
pub mod environment;
pub mod error;
pub mod image;
pub mod report;
pub mod selection;
pub mod version;

pub use buildspec::*;
pub use config::*;
pub use environment::*;
pub use error::*;
pub use image::*;
pub use report::*;
pub use selection::*;
pub use version::*;
