use crate::error::{Result, TallyError};
use serde::{Deserialize, Serialize};
use std::net::{AddrParseError, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tally_common::{WireFormat, DEFAULT_GROUP_ADDR, DEFAULT_GROUP_PORT, DEFAULT_TCP_PORT};

/// Main configuration shared by every tally binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// Network configuration
    pub network: NetworkConfig,
    /// Counting protocol settings
    pub protocol: ProtocolConfig,
    /// Stall detection and synthetic contributions
    pub stall: StallConfig,
    /// Console display and throughput tracking
    pub display: DisplayConfig,
    /// Participant-side behaviour
    pub participant: ParticipantConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics and monitoring
    pub metrics: MetricsConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface the coordinator listens on (0.0.0.0 for all interfaces)
    pub listen_interface: String,
    /// Coordinator TCP port
    pub listen_port: u16,
    /// Host participants connect to
    pub coordinator_host: String,
    /// Port participants connect to
    pub coordinator_port: u16,
    /// Multicast group used by datagram peers
    pub group_addr: String,
    /// Multicast port used by datagram peers
    pub group_port: u16,
    /// Maximum concurrently connected participants
    pub max_participants: u32,
    /// Requested socket send buffer for datagram peers
    pub send_buffer_bytes: usize,
}

/// Whether contributions are checked before they mutate the count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Any parsable integer is accepted
    #[default]
    Permissive,
    /// Only the expected value from the participant whose turn it is
    Strict,
}

/// Counting protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Number of participants taking turns (N)
    pub participants: u32,
    /// Wire framing
    pub format: WireFormat,
    /// Validation applied by the coordinator
    pub validation: ValidationMode,
}

/// Stall detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StallConfig {
    /// Enable synthetic contributions
    pub enabled: bool,
    /// Detector tick in milliseconds
    pub tick_ms: u64,
    /// Silence after which a contribution is synthesized
    pub threshold_ms: u64,
    /// How long to wait for a first participant before simulating alone
    pub bootstrap_grace_seconds: u64,
}

/// Rule deciding when throughput is high enough for the condensed display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeRule {
    /// Fast when the gap since the previous acceptance is below the threshold
    #[default]
    InterArrival,
    /// Fast when the windowed rate exceeds the per-millisecond threshold
    Throughput,
}

/// When the throughput window starts over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// At a full round (value mod N == 0) once the window is old enough
    #[default]
    RoundBoundary,
    /// On a fixed cadence
    Fixed,
}

/// Console display and throughput tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Render progress on stdout
    pub console: bool,
    /// Mode switching rule
    pub rule: ModeRule,
    /// Inter-arrival gap below which the display goes fast
    pub inter_arrival_threshold_ms: u64,
    /// Accepted counts per millisecond above which the display goes fast
    pub throughput_threshold_per_ms: f64,
    /// Status line refresh period in fast mode
    pub fast_refresh_ms: u64,
    /// Window reset policy
    pub window_policy: WindowPolicy,
    /// Minimum window age before a round boundary resets it
    pub min_window_ms: u64,
    /// Window length for the fixed policy
    pub window_ms: u64,
    /// Periodic statistics summary (disabled when absent)
    pub stats_interval_seconds: Option<u64>,
    /// Periodic gap analysis on the monitor (disabled when absent)
    pub gap_report_seconds: Option<u64>,
}

/// Participant-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// This participant's id in [0, N)
    pub id: u32,
    /// Idle time between turn checks
    pub turn_delay_ms: u64,
    /// Resend an unanswered contribution after this long
    pub resend_interval_ms: u64,
    /// Run the id 0 watchdog (peer topology enables it when unset)
    pub watchdog_enabled: Option<bool>,
    /// Silence after which participant 0 restarts the count
    pub watchdog_timeout_ms: u64,
    /// Send `JOIN:<id>` right after connecting
    pub announce: bool,
    /// Delay before the first turn check
    pub startup_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Output format: text or json
    pub format: Option<String>,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    /// Exporter listen address
    pub listen_addr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_interface: "0.0.0.0".to_string(),
            listen_port: DEFAULT_TCP_PORT,
            coordinator_host: "127.0.0.1".to_string(),
            coordinator_port: DEFAULT_TCP_PORT,
            group_addr: DEFAULT_GROUP_ADDR.to_string(),
            group_port: DEFAULT_GROUP_PORT,
            max_participants: 13,
            send_buffer_bytes: 1024 * 1024,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            participants: 13,
            format: WireFormat::Line,
            validation: ValidationMode::Permissive,
        }
    }
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: 500,
            threshold_ms: 5000,
            bootstrap_grace_seconds: 30,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            console: true,
            rule: ModeRule::InterArrival,
            inter_arrival_threshold_ms: 100,
            throughput_threshold_per_ms: 5.0,
            fast_refresh_ms: 500,
            window_policy: WindowPolicy::RoundBoundary,
            min_window_ms: 2000,
            window_ms: 1000,
            stats_interval_seconds: Some(10),
            gap_report_seconds: Some(5),
        }
    }
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            id: 0,
            turn_delay_ms: 100,
            resend_interval_ms: 1000,
            watchdog_enabled: None,
            watchdog_timeout_ms: 8000,
            announce: true,
            startup_delay_ms: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("text".to_string()),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

impl TallyConfig {
    /// Coordinator listen address
    pub fn listen_addr(&self) -> std::result::Result<SocketAddr, AddrParseError> {
        format!(
            "{}:{}",
            self.network.listen_interface, self.network.listen_port
        )
        .parse()
    }

    /// Coordinator address as `host:port`, resolved by the caller
    pub fn coordinator_target(&self) -> String {
        format!(
            "{}:{}",
            self.network.coordinator_host, self.network.coordinator_port
        )
    }

    /// Multicast group and port
    pub fn group_addr(&self) -> std::result::Result<SocketAddrV4, AddrParseError> {
        let ip: Ipv4Addr = self.network.group_addr.parse()?;
        Ok(SocketAddrV4::new(ip, self.network.group_port))
    }

    /// Metrics exporter address
    pub fn metrics_addr(&self) -> std::result::Result<SocketAddr, AddrParseError> {
        self.metrics.listen_addr.parse()
    }

    /// Get the stall detector tick as Duration
    pub fn stall_tick(&self) -> Duration {
        Duration::from_millis(self.stall.tick_ms)
    }

    /// Get the stall threshold as Duration
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall.threshold_ms)
    }

    /// Get the bootstrap grace period as Duration
    pub fn bootstrap_grace(&self) -> Duration {
        Duration::from_secs(self.stall.bootstrap_grace_seconds)
    }

    /// Get the idle delay between turn checks as Duration
    pub fn turn_delay(&self) -> Duration {
        Duration::from_millis(self.participant.turn_delay_ms)
    }

    /// Get the resend interval as Duration
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.participant.resend_interval_ms)
    }

    /// Get the watchdog timeout as Duration
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.participant.watchdog_timeout_ms)
    }

    /// Whether the watchdog runs, falling back to the topology default
    pub fn watchdog_active(&self, topology_default: bool) -> bool {
        self.participant.id == 0
            && self
                .participant
                .watchdog_enabled
                .unwrap_or(topology_default)
    }

    /// Get the statistics interval as Duration, if enabled
    pub fn stats_interval(&self) -> Option<Duration> {
        self.display
            .stats_interval_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Get the monitor's gap analysis interval as Duration, if enabled
    pub fn gap_report_interval(&self) -> Option<Duration> {
        self.display
            .gap_report_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl TallyConfig {
    /// Load configuration from file, layered with `TALLY_<SECTION>__<KEY>`
    /// environment variables
    pub fn from_file(path: &str) -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("TALLY")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Defaults layered with environment variables only
    pub fn from_env() -> std::result::Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("TALLY")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.protocol.participants == 0 {
            return Err(TallyError::Config(
                "Number of participants must be positive".to_string(),
            ));
        }

        if self.participant.id >= self.protocol.participants {
            return Err(TallyError::Config(format!(
                "Participant id must be between 0 and {}",
                self.protocol.participants - 1
            )));
        }

        if self.network.max_participants == 0 {
            return Err(TallyError::Config(
                "Maximum participants cannot be 0".to_string(),
            ));
        }

        if self.stall.tick_ms == 0 || self.stall.threshold_ms == 0 {
            return Err(TallyError::Config(
                "Stall tick and threshold must be positive".to_string(),
            ));
        }

        if self.display.fast_refresh_ms == 0 {
            return Err(TallyError::Config(
                "Fast mode refresh period must be positive".to_string(),
            ));
        }

        if self.display.rule == ModeRule::Throughput
            && self.display.throughput_threshold_per_ms <= 0.0
        {
            return Err(TallyError::Config(
                "Throughput threshold must be positive".to_string(),
            ));
        }

        if self.display.window_policy == WindowPolicy::Fixed && self.display.window_ms == 0 {
            return Err(TallyError::Config(
                "Fixed rate window cannot be 0".to_string(),
            ));
        }

        if self.participant.turn_delay_ms == 0 {
            return Err(TallyError::Config(
                "Turn delay must be positive".to_string(),
            ));
        }

        if self.listen_addr().is_err() {
            return Err(TallyError::Config(format!(
                "Invalid listen interface: {}",
                self.network.listen_interface
            )));
        }

        match self.group_addr() {
            Ok(group) if group.ip().is_multicast() => {}
            Ok(group) => {
                return Err(TallyError::Config(format!(
                    "{} is not a multicast address",
                    group.ip()
                )))
            }
            Err(e) => {
                return Err(TallyError::Config(format!(
                    "Invalid group address {}: {}",
                    self.network.group_addr, e
                )))
            }
        }

        if self.metrics.enabled && self.metrics_addr().is_err() {
            return Err(TallyError::Config(format!(
                "Invalid metrics address: {}",
                self.metrics.listen_addr
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = TallyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stall_threshold(), Duration::from_millis(5000));
        assert_eq!(config.stall_tick(), Duration::from_millis(500));
        assert_eq!(config.bootstrap_grace(), Duration::from_secs(30));
        assert_eq!(config.watchdog_timeout(), Duration::from_secs(8));
        assert_eq!(config.gap_report_interval(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_zero_interval_disables_periodic_reports() {
        let mut config = TallyConfig::default();
        config.display.stats_interval_seconds = Some(0);
        config.display.gap_report_seconds = None;
        assert!(config.stats_interval().is_none());
        assert!(config.gap_report_interval().is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TallyConfig::default();

        config.protocol.participants = 0;
        assert!(config.validate().is_err());

        config.protocol.participants = 3;
        config.participant.id = 3;
        assert!(config.validate().is_err());

        config.participant.id = 2;
        assert!(config.validate().is_ok());

        config.network.group_addr = "10.0.0.1".to_string();
        assert!(config.validate().is_err());

        config.network.group_addr = "239.255.1.1".to_string();
        config.stall.tick_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_watchdog_only_for_participant_zero() {
        let mut config = TallyConfig::default();
        assert!(config.watchdog_active(true));
        assert!(!config.watchdog_active(false));

        config.participant.watchdog_enabled = Some(true);
        config.participant.id = 1;
        assert!(!config.watchdog_active(true));
    }

    #[test]
    fn test_config_loading_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            "[protocol]\nparticipants = 3\nvalidation = \"strict\"\n\n[stall]\nthreshold_ms = 250\n"
        )
        .expect("write config");

        let path = file.path().to_str().expect("utf-8 path");
        let config = TallyConfig::from_file(path).expect("config should load");

        assert_eq!(config.protocol.participants, 3);
        assert_eq!(config.protocol.validation, ValidationMode::Strict);
        assert_eq!(config.stall.threshold_ms, 250);
        // Untouched sections keep their defaults
        assert_eq!(config.stall.tick_ms, 500);
        assert_eq!(config.network.listen_port, DEFAULT_TCP_PORT);
    }

    #[test]
    fn test_from_env_without_variables_gives_defaults() {
        let config = TallyConfig::from_env().expect("defaults");
        assert_eq!(config.protocol.participants, 13);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_and_reload() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tally.toml");
        let path = path.to_str().expect("utf-8 path");

        let mut config = TallyConfig::default();
        config.protocol.participants = 5;
        config.display.rule = ModeRule::Throughput;
        config.save_to_file(path).expect("save");

        let reloaded = TallyConfig::from_file(path).expect("reload");
        assert_eq!(reloaded.protocol.participants, 5);
        assert_eq!(reloaded.display.rule, ModeRule::Throughput);
    }
}
