//! SAJ Tool Framework
//!
//! Common plumbing for command-line tools that talk to a SAJ inverter.
//!
//! # Overview
//!
//! This framework provides:
//! - [`ToolArgs`] for the shared `--config`, `--broker`, `--serial` and
//!   `--log-level` flags
//! - [`ToolConfig`] trait for configuration loading, overrides and validation
//! - [`ToolRunner`] for managing tool lifecycle (logging, connection,
//!   Ctrl+C, shutdown)
//! - [`RegisterIo`] as the register access seam for control loops
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use saj_common::BaseConfig;
//! use saj_tool_framework::{ToolArgs, run_tool};
//!
//! #[derive(Parser)]
//! struct Cli {
//!     #[command(flatten)]
//!     tool: ToolArgs,
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cli = Cli::parse();
//!
//!     run_tool::<BaseConfig, _, _>("meter", &cli.tool, |client, _config| async move {
//!         let data = client.query(0x40a1, 1).await?;
//!         println!("{:?}", data);
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

mod args;
mod config;
mod error;
mod registers;
mod runner;

pub use args::{ToolArgs, parse_u16};
pub use config::ToolConfig;
pub use error::{Result, ToolError};
pub use registers::RegisterIo;
pub use runner::{ToolRunner, run_tool};

// Re-export commonly used types
pub use saj_common::{BaseConfig, LoggingConfig};
pub use saj_mqtt::{SajClient, SajError};
