//! Simulation configuration
//!
//! The configuration is a YAML document. Only the fields the engine consumes
//! are modelled here; the raw text is kept alongside so it can be handed
//! verbatim to worker containers and external drivers.
//!
//! ```yaml
//! logLevel: info
//! timeout: 30m
//! output:
//!   path: ./results
//! server:
//!   dockerCompose: ./platform/docker-compose.yml
//!   endpoint: localhost:8080/health
//! client:
//!   numberOfDevices: 1000
//!   numberOfContainers: 4
//!   template: ./templates/poller
//!   containerStartMode: sequential
//! network:
//!   rate: 8mbps
//!   delay: 100ms
//! simulation:
//!   task: update
//!   crash:
//!     percent: 20%
//! ```

use crate::error::{Result, SimulationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default first worker control port
pub const DEFAULT_BASE_PORT: u16 = 8086;

/// Default device simulator image
pub const DEFAULT_WORKER_IMAGE: &str = "device-simulator";

/// Default period of the container stats snapshot
pub const DEFAULT_STATS_PERIOD: &str = "10s";

/// Top-level simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    /// Log level directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Overall timeout, `<number><s|m|h|d|w>`
    #[serde(default)]
    pub timeout: Option<String>,

    /// Output location
    pub output: OutputConfig,

    /// Platform under test
    #[serde(default)]
    pub server: ServerConfig,

    /// Simulated device population
    pub client: ClientConfig,

    /// Network shaping rule applied to the device containers
    #[serde(default)]
    pub network: Option<NetworkRule>,

    /// Scenario section
    #[serde(default)]
    pub simulation: Option<ScenarioConfig>,

    /// Container stats snapshotting
    #[serde(default)]
    pub stats: StatsConfig,

    /// Raw YAML this configuration was parsed from
    #[serde(skip)]
    pub raw: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Output directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving logs, stats and results of the run
    pub path: PathBuf,
}

/// Server adapter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Driver reference (`builtin:<name>` or path to an executable driver)
    #[serde(default)]
    pub driver: Option<String>,

    /// Health endpoint polled after the platform starts (`host:port/path`)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Compose file used by the built-in compose adapter
    #[serde(default)]
    pub docker_compose: Option<PathBuf>,
}

/// Worker start ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    /// Start every worker, then wait for all of them to connect
    #[default]
    Parallel,
    /// Start and wait for each worker before moving to the next
    Sequential,
}

/// Device population configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Driver reference (`builtin:<name>` or path to an executable driver)
    #[serde(default)]
    pub driver: Option<String>,

    /// Total simulated devices
    pub number_of_devices: u64,

    /// Worker containers sharing the population
    #[serde(default = "default_number_of_containers")]
    pub number_of_containers: u32,

    /// Container network the workers join
    #[serde(default = "default_network")]
    pub network: String,

    /// Device template directory, bind-mounted read-only into every worker
    #[serde(default)]
    pub template: Option<PathBuf>,

    /// Worker image
    #[serde(default = "default_image")]
    pub image: String,

    /// Worker start ordering
    #[serde(default)]
    pub container_start_mode: StartMode,

    /// Control port of worker 0; worker i listens on base + i
    #[serde(default = "default_base_port")]
    pub http_server_base_port: u16,
}

fn default_number_of_containers() -> u32 {
    1
}

fn default_network() -> String {
    "host".to_string()
}

fn default_image() -> String {
    DEFAULT_WORKER_IMAGE.to_string()
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

/// Named shaping configuration forwarded to the sidecar
///
/// Keys and values are sent as-is; `rate` additionally drives the
/// token-bucket burst computed by the network controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, serde_yaml::Value>",
    into = "BTreeMap<String, String>"
)]
pub struct NetworkRule {
    params: BTreeMap<String, String>,
}

impl NetworkRule {
    /// Build a rule from key/value pairs
    pub fn new<K, V>(params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            params: params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Configured rate string, if any
    pub fn rate(&self) -> Option<&str> {
        self.params.get("rate").map(String::as_str)
    }

    /// All shaping parameters
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// `k1=v1&k2=v2` form encoding of the parameters
    pub fn form_body(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl From<NetworkRule> for BTreeMap<String, String> {
    fn from(rule: NetworkRule) -> Self {
        rule.params
    }
}

/// YAML scalars (numbers, booleans) are accepted and kept as their string form.
impl TryFrom<BTreeMap<String, serde_yaml::Value>> for NetworkRule {
    type Error = String;

    fn try_from(raw: BTreeMap<String, serde_yaml::Value>) -> std::result::Result<Self, String> {
        let params = raw
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(format!(
                            "network parameter '{}' must be a scalar, got {:?}",
                            k, other
                        ));
                    }
                };
                Ok((k, value))
            })
            .collect::<std::result::Result<_, _>>()?;
        Ok(Self { params })
    }
}

/// Scenario section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioConfig {
    /// Triggerable task marker; when absent the run ends after device startup
    #[serde(default)]
    pub task: Option<String>,

    /// Devices performing extra dummy work
    #[serde(default)]
    pub dummy_work: Option<InfluenceSpec>,

    /// Devices simulating a crash
    #[serde(default)]
    pub crash: Option<InfluenceSpec>,
}

/// How many devices an influence affects
///
/// `number` wins over `percent` when both are given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfluenceSpec {
    /// Absolute device count
    #[serde(default)]
    pub number: Option<u64>,

    /// Share of the population, e.g. `"20%"`
    #[serde(default)]
    pub percent: Option<String>,
}

impl InfluenceSpec {
    /// Influence on an absolute number of devices
    pub fn number(n: u64) -> Self {
        Self {
            number: Some(n),
            percent: None,
        }
    }

    /// Influence on a share of the population
    pub fn percent(p: impl Into<String>) -> Self {
        Self {
            number: None,
            percent: Some(p.into()),
        }
    }

    /// Resolve to a device count for a population.
    ///
    /// Percentages are truncated toward zero.
    pub fn affected(&self, population: u64) -> Result<u64> {
        if let Some(n) = self.number {
            return Ok(n);
        }
        match &self.percent {
            Some(p) => {
                let digits = p.trim().trim_end_matches('%').trim();
                let percent: u64 = digits
                    .parse()
                    .map_err(|_| SimulationError::value(format!("invalid percentage '{}'", p)))?;
                Ok(percent * population / 100)
            }
            None => Ok(0),
        }
    }
}

/// Container stats snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Snapshot period, `<number><s|m|h|d|w>`
    #[serde(default = "default_stats_period")]
    pub period: String,
}

fn default_stats_period() -> String {
    DEFAULT_STATS_PERIOD.to_string()
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            period: default_stats_period(),
        }
    }
}

impl SimulationConfig {
    /// Parse and validate a YAML configuration
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: SimulationConfig = serde_yaml::from_str(raw)?;
        config.raw = raw.to_string();
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML configuration file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    fn validate(&self) -> Result<()> {
        if self.client.number_of_devices == 0 {
            return Err(SimulationError::config(
                "client.numberOfDevices must be greater than zero",
            ));
        }
        if self.client.number_of_containers == 0 {
            return Err(SimulationError::config(
                "client.numberOfContainers must be greater than zero",
            ));
        }
        let last_port = u64::from(self.client.http_server_base_port)
            + u64::from(self.client.number_of_containers - 1);
        if last_port > u64::from(u16::MAX) {
            return Err(SimulationError::config(format!(
                "client.httpServerBasePort {} leaves no room for {} container(s)",
                self.client.http_server_base_port, self.client.number_of_containers
            )));
        }
        if let Some(timeout) = &self.timeout {
            parse_duration(timeout)?;
        }
        parse_duration(&self.stats.period)?;
        Ok(())
    }

    /// Overall run timeout, if configured
    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.timeout.as_deref().map(parse_duration).transpose()
    }

    /// Stats snapshot period
    pub fn stats_period(&self) -> Result<Duration> {
        parse_duration(&self.stats.period)
    }

    /// True when a triggerable task is configured
    pub fn has_task(&self) -> bool {
        self.simulation
            .as_ref()
            .is_some_and(|s| s.task.is_some())
    }
}

/// Parse `<number><s|m|h|d|w>` into a duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let unit = s
        .chars()
        .last()
        .ok_or_else(|| SimulationError::value("empty duration string"))?;
    let value: u64 = s[..s.len() - unit.len_utf8()]
        .trim()
        .parse()
        .map_err(|_| SimulationError::value(format!("invalid duration '{}'", s)))?;

    let seconds = match unit.to_ascii_lowercase() {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        'w' => 7 * 24 * 60 * 60,
        other => {
            return Err(SimulationError::value(format!(
                "invalid time unit '{}' in '{}'",
                other, s
            )));
        }
    };

    value
        .checked_mul(seconds)
        .map(Duration::from_secs)
        .ok_or_else(|| SimulationError::value(format!("duration '{}' is out of range", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
output:
  path: /tmp/out
client:
  numberOfDevices: 10
"#;

    #[test]
    fn test_defaults_applied() {
        let config = SimulationConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.client.number_of_containers, 1);
        assert_eq!(config.client.network, "host");
        assert_eq!(config.client.image, "device-simulator");
        assert_eq!(config.client.http_server_base_port, 8086);
        assert_eq!(config.client.container_start_mode, StartMode::Parallel);
        assert!(config.network.is_none());
        assert!(!config.has_task());
        assert_eq!(config.raw, MINIMAL);
    }

    #[test]
    fn test_full_config() {
        let raw = r#"
logLevel: debug
timeout: 2h
output:
  path: ./out
server:
  driver: /opt/drivers/platform
client:
  numberOfDevices: 50
  numberOfContainers: 3
  containerStartMode: sequential
  httpServerBasePort: 9000
network:
  rate: 8mbps
  delay: 100ms
  loss: 2
simulation:
  task: update
  dummyWork:
    number: 7
  crash:
    percent: 20%
"#;
        let config = SimulationConfig::from_yaml(raw).unwrap();
        assert_eq!(config.timeout().unwrap(), Some(Duration::from_secs(7200)));
        assert_eq!(config.client.container_start_mode, StartMode::Sequential);
        assert_eq!(config.server.driver.as_deref(), Some("/opt/drivers/platform"));

        let rule = config.network.as_ref().unwrap();
        assert_eq!(rule.rate(), Some("8mbps"));
        assert_eq!(rule.params().get("loss").map(String::as_str), Some("2"));
        assert_eq!(rule.form_body(), "delay=100ms&loss=2&rate=8mbps");

        let scenario = config.simulation.as_ref().unwrap();
        assert!(config.has_task());
        assert_eq!(scenario.dummy_work, Some(InfluenceSpec::number(7)));
        assert_eq!(
            scenario.crash.as_ref().unwrap().affected(50).unwrap(),
            10
        );
    }

    #[test]
    fn test_zero_devices_rejected() {
        let raw = MINIMAL.replace("numberOfDevices: 10", "numberOfDevices: 0");
        assert!(matches!(
            SimulationConfig::from_yaml(&raw),
            Err(SimulationError::Config(_))
        ));
    }

    #[test]
    fn test_zero_containers_rejected() {
        let raw = format!("{}  numberOfContainers: 0\n", MINIMAL);
        assert!(SimulationConfig::from_yaml(&raw).is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("10M").unwrap(), Duration::from_secs(600));
    }

    #[test]
    fn test_parse_duration_rejects_bad_input() {
        assert!(matches!(parse_duration("10x"), Err(SimulationError::Value(_))));
        assert!(matches!(parse_duration("abcs"), Err(SimulationError::Value(_))));
        assert!(matches!(parse_duration(""), Err(SimulationError::Value(_))));
    }

    #[test]
    fn test_bad_timeout_rejected_at_load() {
        let raw = format!("timeout: 10y\n{}", MINIMAL);
        assert!(SimulationConfig::from_yaml(&raw).is_err());
    }

    #[test]
    fn test_huge_durations_rejected() {
        assert!(matches!(
            parse_duration("18446744073709551615w"),
            Err(SimulationError::Value(_))
        ));
        assert!(matches!(
            parse_duration("30500568904944w"),
            Err(SimulationError::Value(_))
        ));
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );

        let raw = format!("timeout: 99999999999999999d
{}", MINIMAL);
        assert!(matches!(
            SimulationConfig::from_yaml(&raw),
            Err(SimulationError::Value(_))
        ));
    }

    #[test]
    fn test_port_range_must_fit_every_container() {
        let fits = format!("{}  numberOfContainers: 10
  httpServerBasePort: 65526
", MINIMAL);
        assert!(SimulationConfig::from_yaml(&fits).is_ok());

        let overflows = format!("{}  numberOfContainers: 11
  httpServerBasePort: 65526
", MINIMAL);
        assert!(matches!(
            SimulationConfig::from_yaml(&overflows),
            Err(SimulationError::Config(_))
        ));

        let many = format!("{}  numberOfContainers: 4294967295
", MINIMAL);
        assert!(matches!(
            SimulationConfig::from_yaml(&many),
            Err(SimulationError::Config(_))
        ));
    }

    #[test]
    fn test_influence_percent_floors() {
        let spec = InfluenceSpec::percent("20%");
        assert_eq!(spec.affected(50).unwrap(), 10);
        assert_eq!(spec.affected(9).unwrap(), 1);
        assert_eq!(spec.affected(4).unwrap(), 0);
        assert!(InfluenceSpec::percent("lots").affected(10).is_err());
        assert_eq!(InfluenceSpec::default().affected(10).unwrap(), 0);
    }
}
