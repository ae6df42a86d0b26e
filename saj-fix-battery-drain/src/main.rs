//! Battery-drain fix for SAJ hybrid inverters.

use anyhow::{Context, Result};
use clap::Parser;

use saj_fix_battery_drain::config::FixBatteryDrainConfig;
use saj_fix_battery_drain::controller::BatteryDrainFix;
use saj_tool_framework::{ToolArgs, run_tool};

/// Keeps the battery from draining into the grid.
#[derive(Parser, Debug)]
#[command(name = "saj-fix-battery-drain")]
#[command(about = "Keeps the battery from draining into the grid")]
#[command(version)]
struct Args {
    #[command(flatten)]
    tool: ToolArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    run_tool::<FixBatteryDrainConfig, _, _>(
        "saj-fix-battery-drain",
        &args.tool,
        |client, config| async move {
            let mut fix = BatteryDrainFix::initialize(client.as_ref(), config.battery_drain)
                .await
                .context("Failed to read the initial inverter state")?;
            fix.run(client.as_ref()).await
        },
    )
    .await
}
