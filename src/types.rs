use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

/// Identity block returned by the sensor in reply to `{"DevInfo":{}}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    #[serde(rename = "product", default)]
    pub product: String,
    #[serde(rename = "fw_ver", default)]
    pub firmware_version: String,
    #[serde(rename = "bt_name", default)]
    pub device_name: String,
    #[serde(rename = "cpu_id", default)]
    pub hardware_id: String,
    #[serde(rename = "ap_name", default)]
    pub ap_name: String,
    #[serde(rename = "ap_addr", default)]
    pub ap_addr: String,
}

#[derive(Debug, Deserialize)]
struct DeviceInfoResponse {
    #[serde(rename = "DevInfo", default)]
    dev_info: DeviceDescriptor,
    #[serde(rename = "res")]
    result: i64,
}

impl DeviceDescriptor {
    /// Parses a device-info reply. A nonzero result code or an empty
    /// access point name is rejected so the caller can re-run the handshake.
    pub fn from_response(raw: &str) -> Result<Self, DescriptorError> {
        let response = serde_json::from_str::<DeviceInfoResponse>(raw.trim())?;
        if response.result != 0 {
            return Err(DescriptorError::ResultCode(response.result));
        }
        if response.dev_info.ap_name.trim().is_empty() {
            return Err(DescriptorError::EmptyField("ap_name"));
        }
        Ok(response.dev_info)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Axis3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Local>,
    pub accel: Axis3,
    pub gyro: Axis3,
    pub mag: Axis3,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl TelemetrySample {
    pub fn orientation(timestamp: DateTime<Local>, roll: f64, pitch: f64, yaw: f64) -> Self {
        Self {
            timestamp,
            accel: Axis3::default(),
            gyro: Axis3::default(),
            mag: Axis3::default(),
            roll,
            pitch,
            yaw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Ng,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Ng => "NG",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelRange {
    pub channel: String,
    pub min: f64,
    pub max: f64,
    pub range: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestVerdict {
    pub verdict: Verdict,
    pub reason: String,
    pub failing_channels: Vec<String>,
    pub channels: Vec<ChannelRange>,
    pub sample_count: usize,
}

impl TestVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self.verdict, Verdict::Pass)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Connecting,
    AwaitingDeviceInfo,
    Associating,
    Polling,
    Evaluating,
    CleaningUp,
    Passed,
    Failed,
}

impl RunState {
    pub fn is_active(self) -> bool {
        !matches!(self, RunState::Idle | RunState::Passed | RunState::Failed)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle | Passed | Failed, Connecting) => true,
            (Connecting, AwaitingDeviceInfo)
            | (AwaitingDeviceInfo, Associating)
            | (Associating, Polling)
            | (Polling, Evaluating) => true,
            (CleaningUp, Idle | Passed | Failed) => true,
            (current, CleaningUp) => current.is_active(),
            _ => false,
        }
    }
}

/// Pipeline step a failure is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    MotorControl,
    DeviceInfo,
    WifiAssociation,
    TelemetryConnect,
    Evaluation,
}

impl Step {
    pub fn describe(self) -> &'static str {
        match self {
            Step::MotorControl => "motor control failed",
            Step::DeviceInfo => "device info request failed",
            Step::WifiAssociation => "WiFi association failed",
            Step::TelemetryConnect => "TCP telemetry connection failed",
            Step::Evaluation => "telemetry out of tolerance",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    Passed(TestVerdict),
    Failed {
        step: Step,
        reason: String,
        verdict: Option<TestVerdict>,
    },
    Stopped,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Passed(_) => "PASS",
            RunOutcome::Failed { .. } => "NG",
            RunOutcome::Stopped => "STOPPED",
        }
    }

    pub fn reason(&self) -> String {
        match self {
            RunOutcome::Passed(verdict) => verdict.reason.clone(),
            RunOutcome::Failed { reason, .. } => reason.clone(),
            RunOutcome::Stopped => "stopped by operator".to_string(),
        }
    }

    pub fn verdict(&self) -> Option<&TestVerdict> {
        match self {
            RunOutcome::Passed(verdict) => Some(verdict),
            RunOutcome::Failed { verdict, .. } => verdict.as_ref(),
            RunOutcome::Stopped => None,
        }
    }
}

/// What a finished run hands back. The descriptor read during the run leaves
/// the orchestrator with it.
#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    pub outcome: RunOutcome,
    pub descriptor: Option<DeviceDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_parses_success_response() {
        let raw = r#"{"DevInfo":{"product":"W1","fw_ver":"1.2.0","bt_name":"W1-BT","cpu_id":"abc123","ap_name":"W1_AP_01","ap_addr":"192.168.4.1"},"res":0}"#;
        let descriptor = DeviceDescriptor::from_response(raw).expect("valid descriptor");
        assert_eq!(descriptor.product, "W1");
        assert_eq!(descriptor.firmware_version, "1.2.0");
        assert_eq!(descriptor.ap_name, "W1_AP_01");
        assert_eq!(descriptor.ap_addr, "192.168.4.1");
    }

    #[test]
    fn descriptor_rejects_error_code_and_empty_ap() {
        assert!(matches!(
            DeviceDescriptor::from_response(r#"{"DevInfo":{"ap_name":"x"},"res":3}"#),
            Err(DescriptorError::ResultCode(3))
        ));
        assert!(matches!(
            DeviceDescriptor::from_response(r#"{"DevInfo":{"product":"W1","ap_name":""},"res":0}"#),
            Err(DescriptorError::EmptyField("ap_name"))
        ));
        assert!(matches!(
            DeviceDescriptor::from_response("{\"DevInfo\":"),
            Err(DescriptorError::Json(_))
        ));
    }

    #[test]
    fn cleanup_reachable_only_from_active_states() {
        assert!(RunState::Polling.can_transition_to(RunState::CleaningUp));
        assert!(RunState::Connecting.can_transition_to(RunState::CleaningUp));
        assert!(!RunState::Idle.can_transition_to(RunState::CleaningUp));
        assert!(!RunState::Connecting.can_transition_to(RunState::Polling));
        assert!(RunState::Failed.can_transition_to(RunState::Connecting));
    }
}
