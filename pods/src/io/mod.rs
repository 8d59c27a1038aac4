//! Side-effecting helpers: the file channel, layout, config and processes.

pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod layout;
pub mod process;
pub mod prompt;
pub mod workflow_file;
