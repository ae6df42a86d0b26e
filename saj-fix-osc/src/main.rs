//! Oscillation fix for SAJ hybrid inverters.

use anyhow::Result;
use clap::Parser;

use saj_fix_osc::config::FixOscConfig;
use saj_fix_osc::controller::FixOsc;
use saj_tool_framework::{ToolArgs, run_tool};

/// Limits inverter output while battery and grid oscillate.
#[derive(Parser, Debug)]
#[command(name = "saj-fix-osc")]
#[command(about = "Limits inverter output while battery and grid oscillate")]
#[command(version)]
struct Args {
    #[command(flatten)]
    tool: ToolArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    run_tool::<FixOscConfig, _, _>("saj-fix-osc", &args.tool, |client, config| async move {
        FixOsc::new(config.fix_osc).run(client.as_ref()).await
    })
    .await
}
