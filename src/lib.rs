//! fleetrun - configuration-driven SSH deployment and multi-host task
//! runner
//!
//! Given a declarative description of servers and ordered task scripts,
//! fleetrun executes shell steps locally, executes shell steps on one or
//! more remote hosts over SSH, and transfers files using one of three
//! upload strategies (direct, checksum-differential, atomic archive).

pub mod cli;
pub mod config;
pub mod error;
pub mod runner;
pub mod ssh;

// Re-exports
pub use config::{Config, LogConfig, Script, Server, Task};
pub use error::{Error, Result};
pub use runner::Runner;
pub use ssh::{SshClient, SyncOutcome, SyncStats};
