//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use saj_common::BaseConfig;

use crate::ToolArgs;
use crate::error::{ToolError, Result};

/// Trait for tool configuration types.
///
/// A tool configuration embeds the shared [`BaseConfig`] sections next to
/// its own settings.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use saj_common::BaseConfig;
/// use saj_tool_framework::ToolConfig;
///
/// #[derive(Debug, Clone, Default, Deserialize)]
/// pub struct MyToolConfig {
///     #[serde(flatten)]
///     pub base: BaseConfig,
///     #[serde(default)]
///     pub my_tool: MyToolSettings,
/// }
///
/// impl ToolConfig for MyToolConfig {
///     fn base(&self) -> &BaseConfig {
///         &self.base
///     }
///
///     fn base_mut(&mut self) -> &mut BaseConfig {
///         &mut self.base
///     }
/// }
/// ```
pub trait ToolConfig: Sized + Default + DeserializeOwned {
    /// Shared broker, device, request and logging settings.
    fn base(&self) -> &BaseConfig;

    /// Mutable access for command-line overrides.
    fn base_mut(&mut self) -> &mut BaseConfig;

    /// Validate tool-specific settings.
    ///
    /// The base sections are validated separately. Override to add custom
    /// validation.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Load configuration from a JSON5 file, without validating it.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ToolError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;

        Ok(config)
    }

    /// Build the effective configuration for a run.
    ///
    /// Loads `--config` when given (defaults otherwise), applies the
    /// remaining command-line overrides, then validates everything.
    fn from_args(args: &ToolArgs) -> Result<Self> {
        let mut config = match args.config {
            Some(ref path) => Self::load(path)?,
            None => Self::default(),
        };

        args.apply(config.base_mut())?;

        config.base().validate()?;
        config.validate()?;

        Ok(config)
    }
}

impl ToolConfig for BaseConfig {
    fn base(&self) -> &BaseConfig {
        self
    }

    fn base_mut(&mut self) -> &mut BaseConfig {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize)]
    struct TestConfig {
        #[serde(flatten)]
        base: BaseConfig,
        #[serde(default)]
        poll_secs: u64,
    }

    impl ToolConfig for TestConfig {
        fn base(&self) -> &BaseConfig {
            &self.base
        }

        fn base_mut(&mut self) -> &mut BaseConfig {
            &mut self.base
        }

        fn validate(&self) -> Result<()> {
            if self.poll_secs == 0 {
                return Err(ToolError::validation("poll_secs must be greater than zero"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(ToolError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_from_args_without_file() {
        let args = ToolArgs {
            serial: Some("SERIAL".to_string()),
            ..Default::default()
        };

        let config = BaseConfig::from_args(&args).unwrap();
        assert_eq!(config.device.serial, "SERIAL");
    }

    #[test]
    fn test_from_args_requires_serial() {
        let result = BaseConfig::from_args(&ToolArgs::default());
        assert!(matches!(result, Err(ToolError::ConfigValidation(_))));
    }

    #[test]
    fn test_from_args_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                mqtt: {{ host: "10.0.0.1" }},
                device: {{ serial: "FROM_FILE" }},
                poll_secs: 30,
            }}"#
        )
        .unwrap();

        let args = ToolArgs {
            config: Some(file.path().to_path_buf()),
            broker: Some("10.0.0.2:1999".to_string()),
            ..Default::default()
        };

        let config = TestConfig::from_args(&args).unwrap();
        assert_eq!(config.base.mqtt.host, "10.0.0.2");
        assert_eq!(config.base.mqtt.port, 1999);
        assert_eq!(config.base.device.serial, "FROM_FILE");
        assert_eq!(config.poll_secs, 30);
    }

    #[test]
    fn test_from_args_runs_tool_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ device: {{ serial: "S" }} }}"#).unwrap();

        let args = ToolArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let result = TestConfig::from_args(&args);
        assert!(matches!(result, Err(ToolError::ConfigValidation(_))));
    }

    #[test]
    fn test_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ mqtt: ").unwrap();

        let result = BaseConfig::load(file.path());
        assert!(matches!(result, Err(ToolError::ConfigParse(_))));
    }
}
