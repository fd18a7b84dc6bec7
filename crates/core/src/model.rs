use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub name: String,
    #[serde(rename = "device")]
    pub address: String,
    pub connected: bool,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u32", into = "u32")]
pub struct Resolution(u32);

impl Resolution {
    pub const SUPPORTED_DPI: [u32; 7] = [75, 100, 150, 200, 300, 600, 1200];

    pub fn new(dpi: u32) -> Result<Self, String> {
        if Self::SUPPORTED_DPI.contains(&dpi) {
            Ok(Self(dpi))
        } else {
            Err(format!(
                "unsupported resolution {dpi} dpi (expected one of {:?})",
                Self::SUPPORTED_DPI
            ))
        }
    }

    pub fn dpi(self) -> u32 {
        self.0
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self(300)
    }
}

impl TryFrom<u32> for Resolution {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Resolution> for u32 {
    fn from(value: Resolution) -> Self {
        value.0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanOptions {
    #[serde(default = "default_true")]
    pub multi_page: bool,
    #[serde(default)]
    pub duplex: bool,
    #[serde(default = "default_true")]
    pub color: bool,
    #[serde(default)]
    pub resolution: Resolution,
}

fn default_true() -> bool {
    true
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            multi_page: true,
            duplex: false,
            color: true,
            resolution: Resolution::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedPage {
    pub filename: String,
    pub page_number: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScannerCapabilities {
    pub multi_page: bool,
    pub color: bool,
    pub resolution: bool,
    pub source: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatientRecord {
    #[serde(default)]
    pub patient_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub birth_date: String,
    #[serde(default, alias = "gender")]
    pub sex: String,
    #[serde(default)]
    pub study_date: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    #[default]
    Name,
    Birthdate,
}

impl FromStr for SearchKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "name" => Ok(Self::Name),
            "birthdate" => Ok(Self::Birthdate),
            other => Err(format!("unknown search type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExportStage {
    Converting,
    Updating,
    Sending,
    Cleaning,
    Completed,
    Failed,
}

impl ExportStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportJob {
    pub filename: String,
    #[serde(rename = "status")]
    pub stage: ExportStage,
    pub message: String,
    pub progress: u8,
}

impl ExportJob {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            stage: ExportStage::Converting,
            message: "Converting image to DICOM format...".to_string(),
            progress: 0,
        }
    }

    pub fn advance(&mut self, stage: ExportStage, progress: u8, message: impl Into<String>) {
        self.stage = stage;
        self.progress = progress;
        self.message = message.into();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.advance(ExportStage::Failed, 0, message);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    pub modified_time: String,
    pub extension: String,
}
