//! `cadence-core`: configuration and error types shared by the scheduler
//! crate and the daemon binary.

pub mod config;
pub mod error;

pub use config::{CadenceConfig, DatabaseConfig, SchedulerConfig};
pub use error::{CoreError, Result};
