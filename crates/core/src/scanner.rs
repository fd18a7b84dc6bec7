use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::device::DeviceRegistry;
use crate::error::{StationError, StationResult};
use crate::listing::parse_capabilities;
use crate::model::{CapturedPage, Device, ScanOptions, ScannerCapabilities};
use crate::settings::Settings;
use crate::tool::{ToolInvocation, ToolRunner};

pub struct ScanOrchestrator {
    registry: Arc<DeviceRegistry>,
    runner: Arc<dyn ToolRunner>,
    capture_tool: PathBuf,
    storage_dir: PathBuf,
    scan_timeout: Duration,
    help_timeout: Duration,
    settle_delay: Duration,
    max_batch_pages: u32,
    in_flight: Mutex<()>,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("capture_tool", &self.capture_tool)
            .field("storage_dir", &self.storage_dir)
            .field("scan_timeout", &self.scan_timeout)
            .finish()
    }
}

impl ScanOrchestrator {
    pub fn new(
        settings: &Settings,
        registry: Arc<DeviceRegistry>,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        Self {
            registry,
            runner,
            capture_tool: settings.capture_tool.clone(),
            storage_dir: settings.storage_dir.clone(),
            scan_timeout: settings.scan_timeout(),
            help_timeout: settings.enumeration_timeout(),
            settle_delay: settings.settle_delay(),
            max_batch_pages: settings.max_batch_pages,
            in_flight: Mutex::new(()),
        }
    }

    pub fn scan(&self, device: &str, options: &ScanOptions) -> StationResult<Vec<CapturedPage>> {
        let _guard = self.begin()?;
        let scanner = self.connected_device(device)?;

        let base = format!("scan_{}", Utc::now().timestamp());
        let invocation =
            build_scan_invocation(&self.capture_tool, device, options, &self.storage_dir, &base);
        let command = invocation.to_string();

        info!(
            device = %device,
            multi_page = options.multi_page,
            duplex = options.duplex,
            color = options.color,
            resolution = options.resolution.dpi(),
            "starting scan"
        );
        debug!(command = %command, "scan command");

        match self.runner.run(&invocation, self.scan_timeout) {
            Ok(output) if output.success => {}
            Ok(output) => {
                let message = output.diagnostic();
                error!(device = %device, error = %message, command = %command, "scan failed");
                return Err(StationError::ScanFailed { message, command });
            }
            Err(err) => {
                error!(device = %device, error = %err, command = %command, "scan failed");
                return Err(StationError::ScanFailed {
                    message: err.to_string(),
                    command,
                });
            }
        }

        if !self.settle_delay.is_zero() {
            thread::sleep(self.settle_delay);
        }

        let pages = discover_pages(&self.storage_dir, &base, options, self.max_batch_pages);
        if pages.is_empty() {
            log_storage_contents(&self.storage_dir);
            let detail = if options.multi_page {
                format!("no batch files matching {base}_N.jpg")
            } else {
                format!("{base}.jpg was not created")
            };
            return Err(StationError::NoOutputProduced { detail });
        }

        info!(device = %device, scanner = %scanner.name, pages = pages.len(), "document scanned");
        Ok(pages)
    }

    pub fn capabilities(&self, device: &str) -> StationResult<ScannerCapabilities> {
        self.connected_device(device)?;

        let invocation = ToolInvocation::new(&self.capture_tool).args(["-d", device, "-h"]);
        match self.runner.run(&invocation, self.help_timeout) {
            Ok(output) if output.success => Ok(parse_capabilities(&output.stdout)),
            Ok(output) => {
                warn!(device = %device, error = %output.diagnostic(), "failed to get scanner capabilities");
                Ok(ScannerCapabilities::default())
            }
            Err(err) => {
                warn!(device = %device, error = %err, "failed to get scanner capabilities");
                Ok(ScannerCapabilities::default())
            }
        }
    }

    fn begin(&self) -> StationResult<MutexGuard<'_, ()>> {
        match self.in_flight.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(StationError::JobInProgress { operation: "scan" }),
        }
    }

    fn connected_device(&self, device: &str) -> StationResult<Device> {
        let scanner = self
            .registry
            .get(device)
            .ok_or_else(|| StationError::DeviceNotFound {
                device: device.to_string(),
            })?;
        if !scanner.connected {
            return Err(StationError::DeviceDisconnected {
                device: device.to_string(),
                name: scanner.name,
            });
        }
        Ok(scanner)
    }
}

pub fn build_scan_invocation(
    capture_tool: &Path,
    device: &str,
    options: &ScanOptions,
    storage_dir: &Path,
    base: &str,
) -> ToolInvocation {
    let mode = if options.color { "Color" } else { "Gray" };
    let mut invocation = ToolInvocation::new(capture_tool)
        .args(["-d", device])
        .arg("--format=jpeg")
        .args(["--resolution".to_string(), options.resolution.dpi().to_string()])
        .args(["--mode", mode]);

    if options.multi_page {
        let pattern = storage_dir.join(format!("{base}_%d.jpg"));
        invocation = invocation
            .args(["--batch-start=1", "--batch-increment=1"])
            .arg(format!("--batch={}", pattern.display()));
    } else {
        let output = storage_dir.join(format!("{base}.jpg"));
        invocation = invocation.arg("-o").arg(output.display().to_string());
    }

    let source = if options.duplex { "ADF Duplex" } else { "ADF Front" };
    invocation.args(["--source", source])
}

pub fn discover_pages(
    storage_dir: &Path,
    base: &str,
    options: &ScanOptions,
    max_pages: u32,
) -> Vec<CapturedPage> {
    if !options.multi_page {
        let filename = format!("{base}.jpg");
        let path = storage_dir.join(&filename);
        if path.is_file() {
            return vec![CapturedPage {
                filename,
                page_number: 1,
                path,
            }];
        }
        return Vec::new();
    }

    let mut pages = Vec::new();
    for page in 1..=max_pages {
        let filename = format!("{base}_{page}.jpg");
        let path = storage_dir.join(&filename);
        if !path.is_file() {
            debug!(path = %path.display(), "batch file not found");
            break;
        }
        debug!(page, file = %filename, "found batch page");
        pages.push(CapturedPage {
            filename,
            page_number: page,
            path,
        });
    }

    if options.duplex && pages.is_empty() {
        pages = discover_duplex_pages(storage_dir, base, max_pages);
    }
    pages
}

fn discover_duplex_pages(storage_dir: &Path, base: &str, max_pages: u32) -> Vec<CapturedPage> {
    let mut pages = Vec::new();
    for page in 1..=max_pages {
        let candidates = [
            format!("{base}_{page}.jpg"),
            format!("{base}_front_{page}.jpg"),
            format!("{base}_back_{page}.jpg"),
            format!("{base}_{page}_front.jpg"),
            format!("{base}_{page}_back.jpg"),
        ];

        let mut found = false;
        for filename in candidates {
            let path = storage_dir.join(&filename);
            if path.is_file() {
                debug!(page, file = %filename, "found duplex page");
                let page_number = pages.len() as u32 + 1;
                pages.push(CapturedPage {
                    filename,
                    page_number,
                    path,
                });
                found = true;
            }
        }
        if !found {
            break;
        }
    }
    pages
}

fn log_storage_contents(storage_dir: &Path) {
    let Ok(entries) = fs::read_dir(storage_dir) else {
        return;
    };
    debug!(dir = %storage_dir.display(), "no scan files found; current images:");
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".jpg") {
            debug!("  - {name}");
        }
    }
}
