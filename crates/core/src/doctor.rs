use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::settings::Settings;
use crate::storage::Storage;

const DCMTK_TOOLS: [&str; 4] = ["findscu", "img2dcm", "dcmodify", "dcmsend"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCheck {
    pub name: String,
    pub path: String,
    pub found: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInfo {
    pub os: String,
    pub arch: String,
    pub current_dir: Option<String>,
    pub storage_dir: String,
    pub storage_exists: bool,
    pub storage_writable: bool,
    pub stored_files: usize,
    pub archive: String,
    pub tools: Vec<ToolCheck>,
    pub notes: Vec<String>,
}

impl DoctorInfo {
    pub fn healthy(&self) -> bool {
        self.storage_writable && self.tools.iter().all(|tool| tool.found)
    }
}

pub fn collect_doctor_info(settings: &Settings) -> DoctorInfo {
    let current_dir = env::current_dir()
        .ok()
        .map(|path| path.to_string_lossy().to_string());

    let mut tools = vec![check_tool("scanimage", &settings.capture_tool)];
    tools.extend(
        DCMTK_TOOLS
            .iter()
            .map(|name| check_tool(name, &settings.dcmtk_tool(name))),
    );

    let storage = Storage::from_settings(settings);
    let storage_exists = storage.root().is_dir();
    let storage_writable = storage_exists && probe_writable(storage.root());
    let stored_files = storage.list_files().map(|files| files.len()).unwrap_or(0);

    let mut notes = vec![
        "Device and export state is kept in memory only.".to_string(),
        "Scan and export requests are processed one at a time.".to_string(),
    ];
    for tool in tools.iter().filter(|tool| !tool.found) {
        notes.push(format!("{} not found at {}", tool.name, tool.path));
    }
    if !storage_exists {
        notes.push("Storage directory does not exist yet; it is created on first scan.".to_string());
    } else if !storage_writable {
        notes.push("Storage directory is not writable.".to_string());
    }
    if stored_files > 0 {
        notes.push(format!(
            "{stored_files} captured file(s) are waiting; new scans are refused until they are sent or deleted."
        ));
    }

    DoctorInfo {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        current_dir,
        storage_dir: storage.root().to_string_lossy().to_string(),
        storage_exists,
        storage_writable,
        stored_files,
        archive: format!(
            "{} (query {}, store {})",
            settings.remote_host, settings.query_port, settings.store_port
        ),
        tools,
        notes,
    }
}

fn check_tool(name: &str, configured: &Path) -> ToolCheck {
    let resolved = resolve_program(configured);
    ToolCheck {
        name: name.to_string(),
        path: resolved
            .as_deref()
            .unwrap_or(configured)
            .to_string_lossy()
            .to_string(),
        found: resolved.is_some(),
    }
}

// Bare names are looked up on `PATH`; anything with a directory component is taken as is.
fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn probe_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".doctor-{}", uuid::Uuid::new_v4().simple()));
    let writable = fs::write(&probe, b"").is_ok();
    let _ = fs::remove_file(&probe);
    writable
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::collect_doctor_info;
    use crate::settings::Settings;

    #[test]
    fn reports_missing_tools_and_waiting_files() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join("scan_1_1.jpg"), b"jpeg").expect("write");
        let settings = Settings {
            storage_dir: temp.path().to_path_buf(),
            dcmtk_dir: temp.path().join("no-dcmtk"),
            capture_tool: temp.path().join("no-scanimage"),
            ..Settings::default()
        };

        let info = collect_doctor_info(&settings);
        assert!(info.storage_exists);
        assert!(info.storage_writable);
        assert_eq!(info.stored_files, 1);
        assert_eq!(info.tools.len(), 5);
        assert!(info.tools.iter().all(|tool| !tool.found));
        assert!(!info.healthy());
        assert!(info.notes.iter().any(|note| note.starts_with("findscu not found")));
        assert!(info.notes.iter().any(|note| note.contains("captured file(s) are waiting")));
    }

    #[test]
    fn absent_storage_is_noted() {
        let temp = TempDir::new().expect("tempdir");
        let settings = Settings {
            storage_dir: temp.path().join("later"),
            ..Settings::default()
        };
        let info = collect_doctor_info(&settings);
        assert!(!info.storage_exists);
        assert!(!info.storage_writable);
        assert_eq!(info.stored_files, 0);
        assert!(info.notes.iter().any(|note| note.contains("does not exist yet")));
    }

    #[cfg(unix)]
    #[test]
    fn finds_tools_by_absolute_path() {
        let temp = TempDir::new().expect("tempdir");
        let tool = temp.path().join("scanimage");
        fs::write(&tool, b"#!/bin/sh\n").expect("write tool");
        let settings = Settings {
            storage_dir: temp.path().to_path_buf(),
            capture_tool: tool.clone(),
            ..Settings::default()
        };
        let info = collect_doctor_info(&settings);
        assert!(info.tools[0].found);
        assert_eq!(info.tools[0].path, tool.to_string_lossy());
    }
}
