//! Command line flags shared by every tally binary.

use crate::config::TallyConfig;
use anyhow::{Context, Result};
use clap::Args;
use tally_common::WireFormat;

/// Configuration file tried when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "config/default";

#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Configuration file (TOML); TALLY_<SECTION>__<KEY> environment variables are layered on top
    #[arg(short, long)]
    pub config: Option<String>,

    /// Total number of participants (N)
    #[arg(short = 'n', long)]
    pub participants: Option<u32>,

    /// Wire format: line or legacy
    #[arg(long)]
    pub format: Option<WireFormat>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log output format: text or json
    #[arg(long)]
    pub log_format: Option<String>,

    /// Disable the progress display on stdout
    #[arg(long)]
    pub quiet: bool,
}

/// Configuration plus a note to log once logging is up
pub struct Loaded {
    pub config: TallyConfig,
    pub fallback_reason: Option<String>,
}

impl CommonArgs {
    /// Load the configuration and apply the shared overrides.
    ///
    /// An explicit `--config` must load. Without one the default file is
    /// tried and defaults plus environment are used if it is missing.
    pub fn load(&self) -> Result<Loaded> {
        let (mut config, fallback_reason) = match &self.config {
            Some(path) => (
                TallyConfig::from_file(path)
                    .with_context(|| format!("Failed to load configuration from {}", path))?,
                None,
            ),
            None => match TallyConfig::from_file(DEFAULT_CONFIG_PATH) {
                Ok(config) => (config, None),
                Err(e) => (
                    TallyConfig::from_env().context("Failed to read TALLY_* environment")?,
                    Some(format!("Failed to load config file: {}, using defaults", e)),
                ),
            },
        };

        if let Some(participants) = self.participants {
            config.protocol.participants = participants;
        }
        if let Some(format) = self.format {
            config.protocol.format = format;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = Some(format.clone());
        }
        if self.quiet {
            config.display.console = false;
        }

        Ok(Loaded {
            config,
            fallback_reason,
        })
    }
}

/// Validate after binary-specific overrides were applied
pub fn validated(config: TallyConfig) -> Result<TallyConfig> {
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn test_overrides_apply_on_top_of_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tally.toml");
        std::fs::write(&path, "[protocol]\nparticipants = 7\n").expect("write");
        let path = path.to_str().expect("utf-8 path");

        let cli = TestCli::parse_from(["test", "--config", path, "--format", "legacy", "--quiet"]);
        let loaded = cli.common.load().expect("load");

        assert_eq!(loaded.config.protocol.participants, 7);
        assert_eq!(loaded.config.protocol.format, WireFormat::Legacy);
        assert!(!loaded.config.display.console);
        assert!(loaded.fallback_reason.is_none());
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let cli = TestCli::parse_from(["test", "--config", "/nonexistent/tally"]);
        assert!(cli.common.load().is_err());
    }

    #[test]
    fn test_participants_override_is_validated() {
        let cli = TestCli::parse_from(["test", "-n", "0"]);
        let loaded = cli.common.load().expect("defaults load");
        assert_eq!(loaded.config.protocol.participants, 0);
        assert!(validated(loaded.config).is_err());
    }
}
