// ABOUTME: Library side of the beacon binary.
// ABOUTME: Config loading, logging setup and the collector/agent commands.

pub mod agent;
pub mod collector;
pub mod config;
pub mod logging;
pub mod signal;

pub use config::Config;
