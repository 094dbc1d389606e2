use std::{io, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to open serial port {port} @ {baud}: {source}")]
    Open {
        port: String,
        baud: u32,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("serial link is not open")]
    NotOpen,
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CorrelateError {
    #[error("no matching response within {0:?}")]
    Timeout(Duration),
    #[error("inbound notification stream closed")]
    Closed,
    #[error("failed to send request: {0}")]
    Send(#[from] LinkError),
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("device info response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("device reported result code {0}")]
    ResultCode(i64),
    #[error("device info field `{0}` is empty")]
    EmptyField(&'static str),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("response has no \"IMU\" section")]
    MissingSection,
    #[error("required field `{0}` missing")]
    MissingField(&'static str),
    #[error("field `{field}` is not a number: {raw}")]
    BadNumber { field: &'static str, raw: String },
    #[error("response exceeds {0}-byte read buffer")]
    Oversize(usize),
    #[error("empty response")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("telemetry session is not connected")]
    NotConnected,
    #[error("telemetry I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer closed the telemetry connection")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TelemetryError),
    #[error("unusable sample: {0}")]
    Parse(#[from] ParseError),
}

impl PollError {
    /// Transport faults end the collection phase; parse faults only drop one sample.
    pub fn is_transport(&self) -> bool {
        !matches!(self, PollError::Parse(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WifiError {
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` failed: {output}")]
    Command { command: String, output: String },
    #[error("association parameters rejected by backend: {0}")]
    Incompatible(String),
    #[error("insufficient privileges for WiFi management: {0}")]
    Permission(String),
    #[error("profile file error: {0}")]
    Profile(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("environment variable {name} invalid: {reason}")]
    Env { name: String, reason: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}
