//! `saj`: read or write inverter registers from the command line.
//!
//! ```text
//! saj -b 192.168.1.30 -s H1S267K2429B029410 read 0x3200 0x80 > data.bin
//! saj -b 192.168.1.30 -s H1S267K2429B029410 write 0x3635 0x1
//! ```

use std::io::Write;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use saj_common::BaseConfig;
use saj_tool_framework::{SajClient, ToolArgs, parse_u16, run_tool};

/// Read and write SAJ inverter registers over MQTT.
#[derive(Parser, Debug)]
#[command(name = "saj", version, about)]
struct Cli {
    #[command(flatten)]
    tool: ToolArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Dump registers as raw big-endian bytes on stdout.
    Read {
        /// First register (decimal or 0x hex).
        #[arg(value_parser = parse_u16)]
        start: u16,

        /// Number of registers (decimal or 0x hex).
        #[arg(value_parser = parse_u16)]
        count: u16,
    },

    /// Write a single holding register.
    Write {
        /// Register address (decimal or 0x hex).
        #[arg(value_parser = parse_u16)]
        register: u16,

        /// New value (decimal or 0x hex).
        #[arg(value_parser = parse_u16)]
        value: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone();

    run_tool::<BaseConfig, _, _>("saj", &cli.tool, |client, _config| async move {
        execute(&client, command).await
    })
    .await
}

async fn execute(client: &SajClient, command: Command) -> Result<()> {
    match command {
        Command::Read { start, count } => {
            let data = client
                .query(start, count)
                .await
                .with_context(|| format!("Failed to read {} registers at {:#06x}", count, start))?;

            eprintln!("registers size: {}", data.len());

            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&data)
                .and_then(|_| stdout.flush())
                .context("Failed to write register data")?;
        }
        Command::Write { register, value } => {
            let echoed = client
                .write(register, value)
                .await
                .with_context(|| format!("Failed to write register {:#06x}", register))?;

            tracing::debug!(
                register = format_args!("{:#06x}", register),
                echoed,
                "Write acknowledged"
            );
            println!("wrote {:4x}", echoed);
        }
    }

    Ok(())
}
