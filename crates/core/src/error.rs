use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StationError {
    #[error("scanner device '{device}' not found")]
    DeviceNotFound { device: String },

    #[error("scanner '{name}' is not connected")]
    DeviceDisconnected { device: String, name: String },

    #[error("scan failed: {message}\n{command}")]
    ScanFailed { message: String, command: String },

    #[error("scan completed but no files were created: {detail}")]
    NoOutputProduced { detail: String },

    #[error("unable to connect to DICOM server at {host}:{port}")]
    DirectoryUnreachable { host: String, port: u16 },

    #[error("DICOM error: {message}")]
    DirectoryError { message: String },

    #[error("conversion failed: {message}")]
    ConversionFailed { message: String },

    #[error("update failed: {message}")]
    TagUpdateFailed { message: String },

    #[error("upload failed: {message}")]
    TransmissionFailed { message: String },

    #[error("a {operation} is already in progress")]
    JobInProgress { operation: &'static str },

    #[error("file not found: {name}")]
    FileNotFound { name: String },

    #[error("invalid file name: {name}")]
    InvalidFileName { name: String },

    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StationError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceNotFound { .. } => "device_not_found",
            Self::DeviceDisconnected { .. } => "device_disconnected",
            Self::ScanFailed { .. } => "scan_failed",
            Self::NoOutputProduced { .. } => "no_output_produced",
            Self::DirectoryUnreachable { .. } => "directory_unreachable",
            Self::DirectoryError { .. } => "directory_error",
            Self::ConversionFailed { .. } => "conversion_failed",
            Self::TagUpdateFailed { .. } => "tag_update_failed",
            Self::TransmissionFailed { .. } => "transmission_failed",
            Self::JobInProgress { .. } => "job_in_progress",
            Self::FileNotFound { .. } => "file_not_found",
            Self::InvalidFileName { .. } => "invalid_file_name",
            Self::Storage { .. } => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("failed while waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

pub type StationResult<T> = Result<T, StationError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{StationError, ToolError};

    #[test]
    fn scan_failure_display_carries_tool_text_and_command() {
        let err = StationError::ScanFailed {
            message: "scanimage: sane_start: Document feeder out of documents".to_string(),
            command: "scanimage -d fujitsu:fi-7030:1".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("Document feeder out of documents"));
        assert!(text.contains("scanimage -d fujitsu:fi-7030:1"));
        assert_eq!(err.kind(), "scan_failed");
    }

    #[test]
    fn tool_timeout_display_names_program() {
        let err = ToolError::TimedOut {
            program: "findscu".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert!(err.to_string().starts_with("findscu timed out"));
    }
}
