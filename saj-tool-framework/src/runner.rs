//! Tool runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;

use tokio::signal;

use saj_common::init_tracing;
use saj_mqtt::SajClient;

use crate::ToolArgs;
use crate::config::ToolConfig;
use crate::error::{ToolError, Result};

/// Tool runner that manages the lifecycle of an inverter tool.
///
/// Handles:
/// - Logging initialization
/// - Broker connection
/// - Running the tool's worker until it finishes or Ctrl+C
/// - Session shutdown
///
/// # Example
///
/// ```ignore
/// use saj_tool_framework::{ToolConfig, ToolRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let cli = Cli::parse();
///     let config = MyToolConfig::from_args(&cli.tool)?;
///
///     let runner = ToolRunner::new("mytool", config).await?;
///     let client = runner.client();
///
///     runner.run(async move { my_loop(client).await }).await
/// }
/// ```
pub struct ToolRunner<C: ToolConfig> {
    /// Tool name for logging.
    name: String,
    /// Tool version.
    version: String,
    /// The effective configuration.
    config: C,
    /// Connected inverter client.
    client: Arc<SajClient>,
}

impl<C: ToolConfig> ToolRunner<C> {
    /// Initialize logging and connect to the inverter's broker.
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        init_tracing(&config.base().logging).map_err(|e| ToolError::config(e.to_string()))?;

        tracing::info!(tool = %name, version = %version, "Starting tool");

        let client = SajClient::connect(config.base()).await?;

        tracing::info!(
            serial = %config.base().device.serial,
            broker = %config.base().mqtt.host,
            "Connected to inverter"
        );

        Ok(Self {
            name,
            version,
            config,
            client: Arc::new(client),
        })
    }

    /// Get the tool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the tool version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a handle to the inverter client.
    pub fn client(&self) -> Arc<SajClient> {
        self.client.clone()
    }

    /// Drive `worker` until it completes or Ctrl+C is received, then shut
    /// the session down.
    pub async fn run<F>(self, worker: F) -> Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        tracing::debug!(tool = %self.name, "Tool running. Press Ctrl+C to stop.");

        let outcome = tokio::select! {
            result = worker => result.map_err(|e| ToolError::worker(format!("{:#}", e))),
            received = signal::ctrl_c() => {
                if let Err(e) = received {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                tracing::info!(tool = %self.name, "Received shutdown signal");
                Ok(())
            }
        };

        self.client.shutdown().await;

        match outcome {
            Ok(()) => tracing::info!(tool = %self.name, "Goodbye!"),
            Err(ref e) => tracing::error!(tool = %self.name, error = %e, "Tool failed"),
        }

        outcome
    }
}

/// Convenience function to run a tool with minimal boilerplate.
///
/// Builds the configuration from `args`, connects, and hands the client and
/// configuration to `worker`.
///
/// # Example
///
/// ```ignore
/// use saj_tool_framework::run_tool;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let cli = Cli::parse();
///     run_tool::<MyToolConfig, _, _>("mytool", &cli.tool, |client, config| async move {
///         my_loop(client, config).await
///     })
///     .await
/// }
/// ```
pub async fn run_tool<C, F, Fut>(name: &str, args: &ToolArgs, worker: F) -> anyhow::Result<()>
where
    C: ToolConfig + Clone,
    F: FnOnce(Arc<SajClient>, C) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let config = C::from_args(args).map_err(|e| anyhow::anyhow!("{}", e))?;

    let runner = ToolRunner::new(name, config)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let task = worker(runner.client(), runner.config().clone());

    runner.run(task).await.map_err(|e| anyhow::anyhow!("{}", e))
}
