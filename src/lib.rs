pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod firewall;
pub mod portmap;
pub mod shell;

// Re-export core types for convenience
pub use config::Config;
pub use error::{Error, Result, Status};
