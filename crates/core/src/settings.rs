use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

const MAX_AE_TITLE_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_enumeration_timeout_ms")]
    pub enumeration_timeout_ms: u64,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_max_batch_pages")]
    pub max_batch_pages: u32,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default = "default_capture_tool")]
    pub capture_tool: PathBuf,
    #[serde(default = "default_dcmtk_dir")]
    pub dcmtk_dir: PathBuf,
    #[serde(default = "default_ae_title")]
    pub local_ae_title: String,
    #[serde(default = "default_remote_ae_title")]
    pub query_ae_title: String,
    #[serde(default = "default_remote_ae_title")]
    pub store_ae_title: String,
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    #[serde(default = "default_query_port")]
    pub query_port: u16,
    #[serde(default = "default_store_port")]
    pub store_port: u16,
    #[serde(default = "default_ae_title")]
    pub station_name: String,
    #[serde(default = "default_uid_root")]
    pub uid_root: String,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/tmp/DICOMScanStation/tempfiles")
}

fn default_allowed_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "tiff", "tif"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_enumeration_timeout_ms() -> u64 {
    15_000
}

fn default_scan_timeout_ms() -> u64 {
    30_000
}

fn default_settle_delay_ms() -> u64 {
    2_000
}

fn default_max_batch_pages() -> u32 {
    50
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_tool_timeout_ms() -> u64 {
    60_000
}

fn default_capture_tool() -> PathBuf {
    PathBuf::from("scanimage")
}

fn default_dcmtk_dir() -> PathBuf {
    PathBuf::from("/usr/bin")
}

fn default_ae_title() -> String {
    "DICOMScanStation".to_string()
}

fn default_remote_ae_title() -> String {
    "ANY-SCP".to_string()
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

fn default_query_port() -> u16 {
    11112
}

fn default_store_port() -> u16 {
    11113
}

fn default_uid_root() -> String {
    "1.2.840.10008.1.2.3".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            allowed_extensions: default_allowed_extensions(),
            poll_interval_ms: default_poll_interval_ms(),
            enumeration_timeout_ms: default_enumeration_timeout_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            max_batch_pages: default_max_batch_pages(),
            query_timeout_ms: default_query_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            tool_timeout_ms: default_tool_timeout_ms(),
            capture_tool: default_capture_tool(),
            dcmtk_dir: default_dcmtk_dir(),
            local_ae_title: default_ae_title(),
            query_ae_title: default_remote_ae_title(),
            store_ae_title: default_remote_ae_title(),
            remote_host: default_remote_host(),
            query_port: default_query_port(),
            store_port: default_store_port(),
            station_name: default_ae_title(),
            uid_root: default_uid_root(),
        }
    }
}

impl Settings {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        settings
            .validate()
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("enumeration_timeout_ms", self.enumeration_timeout_ms),
            ("scan_timeout_ms", self.scan_timeout_ms),
            ("query_timeout_ms", self.query_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("tool_timeout_ms", self.tool_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(anyhow!("{name} must be greater than zero"));
            }
        }
        if self.max_batch_pages == 0 {
            return Err(anyhow!("max_batch_pages must be greater than zero"));
        }
        for (name, title) in [
            ("local_ae_title", &self.local_ae_title),
            ("query_ae_title", &self.query_ae_title),
            ("store_ae_title", &self.store_ae_title),
        ] {
            if title.trim().is_empty() || title.len() > MAX_AE_TITLE_LEN {
                return Err(anyhow!(
                    "{name} must be 1-{MAX_AE_TITLE_LEN} characters, got {title:?}"
                ));
            }
        }
        if self.remote_host.trim().is_empty() {
            return Err(anyhow!("remote_host must not be empty"));
        }
        if self.uid_root.is_empty() || !self.uid_root.chars().all(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(anyhow!("uid_root must be a dotted numeric UID prefix"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_millis(self.enumeration_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn dcmtk_tool(&self, name: &str) -> PathBuf {
        self.dcmtk_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::Settings;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"remote_host": "pacs.local", "store_port": 4242}"#)
                .expect("settings parse");
        assert_eq!(settings.remote_host, "pacs.local");
        assert_eq!(settings.store_port, 4242);
        assert_eq!(settings.query_port, 11112);
        assert_eq!(settings.poll_interval_ms, 5_000);
        assert_eq!(settings.max_batch_pages, 50);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_zero_timeouts_and_long_ae_titles() {
        let zero = Settings {
            scan_timeout_ms: 0,
            ..Settings::default()
        };
        assert!(zero.validate().is_err());

        let long_title = Settings {
            local_ae_title: "A_VERY_LONG_AE_TITLE".to_string(),
            ..Settings::default()
        };
        assert!(long_title.validate().is_err());
    }

    #[test]
    fn loads_from_file_and_resolves_tools() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("station.json");
        fs::write(&path, r#"{"dcmtk_dir": "/opt/dcmtk/bin"}"#).expect("write settings");

        let settings = Settings::from_json_file(&path).expect("settings load");
        assert_eq!(
            settings.dcmtk_tool("findscu"),
            std::path::PathBuf::from("/opt/dcmtk/bin/findscu")
        );
    }
}
