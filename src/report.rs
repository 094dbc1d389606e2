use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use log::info;
use serde::Serialize;

use crate::{
    logging::category,
    types::{DeviceDescriptor, RunOutcome, TelemetrySample, TestVerdict},
};

pub const MIN_PRODUCT_CODE_LEN: usize = 10;

/// Scanned or typed identifier of the unit under test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ProductCode(String);

impl ProductCode {
    pub fn parse(raw: &str) -> Result<Self> {
        let code = raw.trim();
        let len = code.chars().filter(|c| !c.is_whitespace()).count();
        if len < MIN_PRODUCT_CODE_LEN {
            bail!("product code must have at least {MIN_PRODUCT_CODE_LEN} characters, got {len}");
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub product_code: &'a ProductCode,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub result: &'static str,
    pub reason: String,
    pub device: Option<&'a DeviceDescriptor>,
    pub verdict: Option<&'a TestVerdict>,
    pub samples: &'a [TelemetrySample],
}

impl<'a> RunReport<'a> {
    pub fn new(
        product_code: &'a ProductCode,
        started_at: DateTime<Local>,
        outcome: &'a RunOutcome,
        device: Option<&'a DeviceDescriptor>,
        samples: &'a [TelemetrySample],
    ) -> Self {
        Self {
            product_code,
            started_at,
            finished_at: Local::now(),
            result: outcome.label(),
            reason: outcome.reason(),
            device,
            verdict: outcome.verdict(),
            samples,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "IMU_Test_{}_{}.json",
            self.product_code.file_stem(),
            self.started_at.format("%Y%m%d_%H%M%S")
        )
    }

    /// Writes the report into `dir`, creating it if needed. The file appears
    /// complete or not at all.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create report dir {}", dir.display()))?;
        let body = serde_json::to_string_pretty(self).context("failed to encode run report")?;

        let mut file = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to stage report in {}", dir.display()))?;
        file.write_all(body.as_bytes())?;
        file.write_all(b"\n")?;

        let path = dir.join(self.file_name());
        file.persist(&path)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        info!(target: category::FILE_IO, "saved run report {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;
    use crate::types::Step;

    #[test]
    fn product_code_requires_ten_characters() {
        assert!(ProductCode::parse("  W1-12345 ").is_err());
        assert!(ProductCode::parse("").is_err());
        let code = ProductCode::parse(" W1-2026-0001 ").expect("valid code");
        assert_eq!(code.as_str(), "W1-2026-0001");
    }

    #[test]
    fn saves_named_json_report() -> Result<()> {
        let dir = tempdir()?;
        let code = ProductCode::parse("W1/2026 0001")?;
        let started = Local
            .with_ymd_and_hms(2026, 3, 14, 9, 26, 53)
            .single()
            .expect("unambiguous local time");
        let outcome = RunOutcome::Failed {
            step: Step::WifiAssociation,
            reason: "WiFi association failed: could not join W1_AP".to_string(),
            verdict: None,
        };
        let samples = vec![TelemetrySample::orientation(started, 1.0, 2.0, 3.0)];

        let report = RunReport::new(&code, started, &outcome, None, &samples);
        assert_eq!(report.file_name(), "IMU_Test_W1_2026_0001_20260314_092653.json");

        let path = report.save(&dir.path().join("Data"))?;
        let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(saved["product_code"], "W1/2026 0001");
        assert_eq!(saved["result"], "NG");
        assert_eq!(saved["samples"].as_array().map(Vec::len), Some(1));
        assert!(saved["verdict"].is_null());
        Ok(())
    }
}
