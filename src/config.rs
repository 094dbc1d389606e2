//! Fixture configuration: TOML file, then environment overrides.

use std::{
    env::VarError,
    path::{Path, PathBuf},
    time::Duration,
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    evaluator::{TelemetryEvaluator, DEFAULT_MIN_SAMPLES, DEFAULT_TOLERANCE},
    logging::category,
    retry::RetryPolicy,
    telemetry::{SessionTimeouts, DEFAULT_READ_BUFFER},
    wifi::NM_CONNECTIONS_DIR,
};

pub const DEFAULT_BAUD: u32 = 115_200;
/// Number of telemetry polls per run; a calibration value.
pub const DEFAULT_POLL_COUNT: u32 = 30;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    pub port: String,
    pub baud: u32,
    pub start_command: String,
    pub stop_command: String,
    pub settle_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: DEFAULT_BAUD,
            start_command: "fan pwm 50".to_string(),
            stop_command: "fan pwm 0".to_string(),
            settle_ms: 2_000,
            stop_grace_ms: 500,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub port: String,
    pub baud: u32,
    pub device_info_timeout_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: DEFAULT_BAUD,
            device_info_timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    pub poll_count: u32,
    pub poll_interval_ms: u64,
    pub read_buffer: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1".to_string(),
            port: 12_024,
            poll_count: DEFAULT_POLL_COUNT,
            poll_interval_ms: 100,
            read_buffer: DEFAULT_READ_BUFFER,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 3_000,
        }
    }
}

impl TcpConfig {
    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            read: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    pub password: Option<String>,
    pub profile_dir: PathBuf,
    pub settle_ms: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            password: None,
            profile_dir: PathBuf::from(NM_CONNECTIONS_DIR),
            settle_ms: 3_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRetry {
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

impl StepRetry {
    pub const fn new(max_attempts: u32, timeout_secs: u64) -> Self {
        Self {
            max_attempts,
            timeout_secs,
        }
    }

    pub fn policy(self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub motor: StepRetry,
    pub sensor: StepRetry,
    pub wifi: StepRetry,
    pub tcp: StepRetry,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            motor: StepRetry::new(3, 10),
            sensor: StepRetry::new(3, 15),
            wifi: StepRetry::new(3, 15),
            tcp: StepRetry::new(3, 10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub tolerance: f64,
    pub min_samples: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_path: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub auto_save: bool,
    pub data_dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            auto_save: true,
            data_dir: PathBuf::from("Data"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    /// Probe serial ports when a port name is left empty.
    pub auto_detect_ports: bool,
    pub motor: MotorConfig,
    pub sensor: SensorConfig,
    pub tcp: TcpConfig,
    pub wifi: WifiConfig,
    pub retry: RetryConfig,
    pub evaluation: EvaluationConfig,
    pub logging: LoggingConfig,
    pub report: ReportConfig,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            auto_detect_ports: true,
            motor: MotorConfig::default(),
            sensor: SensorConfig::default(),
            tcp: TcpConfig::default(),
            wifi: WifiConfig::default(),
            retry: RetryConfig::default(),
            evaluation: EvaluationConfig::default(),
            logging: LoggingConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

fn env_string<L>(lookup: &L, name: &str) -> Result<Option<String>, ConfigError>
where
    L: Fn(&str) -> Result<String, VarError>,
{
    match lookup(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => Ok(Some(raw.trim().to_string())),
        Err(VarError::NotPresent) => Ok(None),
        Err(err) => Err(ConfigError::Env {
            name: name.to_string(),
            reason: err.to_string(),
        }),
    }
}

fn env_parsed<L, T>(lookup: &L, name: &str) -> Result<Option<T>, ConfigError>
where
    L: Fn(&str) -> Result<String, VarError>,
    T: std::str::FromStr,
{
    let Some(raw) = env_string(lookup, name)? else {
        return Ok(None);
    };
    raw.parse::<T>().map(Some).map_err(|_| ConfigError::Env {
        name: name.to_string(),
        reason: format!("{raw:?} is not a valid {}", std::any::type_name::<T>()),
    })
}

impl FixtureConfig {
    /// Reads `path` if given and present, then applies process environment
    /// overrides. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                info!(target: category::SYSTEM, "loaded config {}", path.display());
                toml::from_str::<FixtureConfig>(&raw)?
            }
            Some(path) => {
                info!(
                    target: category::SYSTEM,
                    "config {} not found, using defaults", path.display()
                );
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name))?;
        Ok(config)
    }

    pub fn apply_env<L>(&mut self, lookup: L) -> Result<(), ConfigError>
    where
        L: Fn(&str) -> Result<String, VarError>,
    {
        if let Some(port) = env_string(&lookup, "FIXTURE_MOTOR_PORT")? {
            self.motor.port = port;
        }
        if let Some(baud) = env_parsed(&lookup, "FIXTURE_MOTOR_BAUD")? {
            self.motor.baud = baud;
        }
        if let Some(port) = env_string(&lookup, "FIXTURE_SENSOR_PORT")? {
            self.sensor.port = port;
        }
        if let Some(baud) = env_parsed(&lookup, "FIXTURE_SENSOR_BAUD")? {
            self.sensor.baud = baud;
        }
        if let Some(host) = env_string(&lookup, "FIXTURE_TCP_HOST")? {
            self.tcp.host = host;
        }
        if let Some(port) = env_parsed(&lookup, "FIXTURE_TCP_PORT")? {
            self.tcp.port = port;
        }
        if let Some(password) = env_string(&lookup, "FIXTURE_WIFI_PASSWORD")? {
            self.wifi.password = Some(password);
        }
        if let Some(count) = env_parsed(&lookup, "FIXTURE_POLL_COUNT")? {
            self.tcp.poll_count = count;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.motor.port.trim().is_empty() {
            return invalid("motor.port is empty");
        }
        if self.sensor.port.trim().is_empty() {
            return invalid("sensor.port is empty");
        }
        if self.motor.port == self.sensor.port {
            return invalid("motor.port and sensor.port must differ");
        }
        if self.motor.baud == 0 || self.sensor.baud == 0 {
            return invalid("baud rate must be positive");
        }
        if self.motor.start_command.trim().is_empty() || self.motor.stop_command.trim().is_empty() {
            return invalid("motor commands must not be empty");
        }
        if self.tcp.host.trim().is_empty() || self.tcp.port == 0 {
            return invalid("tcp host/port not set");
        }
        if self.tcp.poll_count == 0 {
            return invalid("tcp.poll_count must be positive");
        }
        let retries = [
            self.retry.motor,
            self.retry.sensor,
            self.retry.wifi,
            self.retry.tcp,
        ];
        if retries.iter().any(|r| r.max_attempts == 0 || r.timeout_secs == 0) {
            return invalid("retry max_attempts and timeout_secs must be positive");
        }
        if !(self.evaluation.tolerance > 0.0) {
            return invalid("evaluation.tolerance must be positive");
        }
        Ok(())
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            motor_port: self.motor.port.clone(),
            motor_baud: self.motor.baud,
            start_command: self.motor.start_command.clone(),
            stop_command: self.motor.stop_command.clone(),
            motor_settle: Duration::from_millis(self.motor.settle_ms),
            stop_grace: Duration::from_millis(self.motor.stop_grace_ms),
            sensor_port: self.sensor.port.clone(),
            sensor_baud: self.sensor.baud,
            device_info_timeout: Duration::from_millis(self.sensor.device_info_timeout_ms),
            tcp_host: self.tcp.host.clone(),
            tcp_port: self.tcp.port,
            poll_count: self.tcp.poll_count,
            poll_interval: Duration::from_millis(self.tcp.poll_interval_ms),
            wifi_password: self.wifi.password.clone(),
            motor_retry: self.retry.motor.policy(),
            sensor_retry: self.retry.sensor.policy(),
            wifi_retry: self.retry.wifi.policy(),
            tcp_retry: self.retry.tcp.policy(),
            evaluator: TelemetryEvaluator::new(
                self.evaluation.tolerance,
                self.evaluation.min_samples,
            ),
        }
    }
}

/// Read-only snapshot handed to one run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub motor_port: String,
    pub motor_baud: u32,
    pub start_command: String,
    pub stop_command: String,
    pub motor_settle: Duration,
    pub stop_grace: Duration,
    pub sensor_port: String,
    pub sensor_baud: u32,
    pub device_info_timeout: Duration,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub poll_count: u32,
    pub poll_interval: Duration,
    pub wifi_password: Option<String>,
    pub motor_retry: RetryPolicy,
    pub sensor_retry: RetryPolicy,
    pub wifi_retry: RetryPolicy,
    pub tcp_retry: RetryPolicy,
    pub evaluator: TelemetryEvaluator,
}

impl Default for RunConfig {
    fn default() -> Self {
        let mut config = FixtureConfig::default();
        config.motor.port = "motor".to_string();
        config.sensor.port = "sensor".to_string();
        config.run_config()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, VarError> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| vars.get(name).cloned().ok_or(VarError::NotPresent)
    }

    #[test]
    fn defaults_follow_fixture_values() {
        let config = FixtureConfig::default();
        assert_eq!(config.tcp.host, "192.168.4.1");
        assert_eq!(config.tcp.port, 12_024);
        assert_eq!(config.tcp.poll_count, 30);
        assert_eq!(config.motor.start_command, "fan pwm 50");
        assert_eq!(config.retry.sensor.timeout_secs, 15);
        assert_eq!(config.evaluation.tolerance, 500.0);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_the_rest() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("fixture.toml");
        std::fs::write(
            &path,
            "[motor]\nport = \"/dev/ttyUSB0\"\n\n[sensor]\nport = \"/dev/ttyUSB1\"\nbaud = 921600\n\n[retry.tcp]\nmax_attempts = 5\ntimeout_secs = 20\n",
        )?;
        let raw = std::fs::read_to_string(&path)?;
        let config = toml::from_str::<FixtureConfig>(&raw)?;
        assert_eq!(config.motor.port, "/dev/ttyUSB0");
        assert_eq!(config.motor.baud, DEFAULT_BAUD);
        assert_eq!(config.sensor.baud, 921_600);
        assert_eq!(config.retry.tcp.max_attempts, 5);
        assert_eq!(config.retry.motor.max_attempts, 3);
        config.validate()?;
        Ok(())
    }

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = tempdir()?;
        let loaded = FixtureConfig::load(Some(&dir.path().join("absent.toml")))?;
        assert_eq!(loaded.tcp.read_buffer, DEFAULT_READ_BUFFER);
        assert_eq!(loaded.retry, RetryConfig::default());
        Ok(())
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() -> Result<()> {
        let mut config = FixtureConfig::default();
        config.apply_env(lookup(&[
            ("FIXTURE_MOTOR_PORT", "/dev/ttyACM0"),
            ("FIXTURE_TCP_PORT", "9000"),
            ("FIXTURE_POLL_COUNT", "5"),
            ("FIXTURE_WIFI_PASSWORD", " "),
        ]))?;
        assert_eq!(config.motor.port, "/dev/ttyACM0");
        assert_eq!(config.tcp.port, 9000);
        assert_eq!(config.tcp.poll_count, 5);
        assert_eq!(config.wifi.password, None);

        let err = config
            .apply_env(lookup(&[("FIXTURE_SENSOR_BAUD", "fast")]))
            .expect_err("non-numeric baud");
        assert!(err.to_string().contains("FIXTURE_SENSOR_BAUD"));
        Ok(())
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let mut config = FixtureConfig::default();
        assert!(config.validate().is_err());
        config.motor.port = "/dev/ttyUSB0".to_string();
        config.sensor.port = "/dev/ttyUSB0".to_string();
        assert!(config.validate().is_err());
        config.sensor.port = "/dev/ttyUSB1".to_string();
        assert!(config.validate().is_ok());
        config.tcp.poll_count = 0;
        assert!(config.validate().is_err());
        config.tcp.poll_count = 30;
        config.evaluation.tolerance = 0.0;
        assert!(config.validate().is_err());
    }
}
