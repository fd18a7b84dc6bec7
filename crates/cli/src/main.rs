use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use scan_station_core::{
    ExportRequest, ExportStage, PatientRecord, Resolution, ScanOptions, Settings,
    SystemToolRunner,
};
use scan_station_service::{ScanRequest, SearchRequest, StationService};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "scan-station",
    version,
    about = "Capture pages from USB document scanners and send them to a PACS as DICOM."
)]
struct Cli {
    /// JSON settings file. Missing fields fall back to built-in defaults.
    #[arg(long, global = true, value_name = "FILE", env = "SCAN_STATION_CONFIG")]
    config: Option<PathBuf>,

    /// Override the working directory for captured pages.
    #[arg(long, global = true, value_name = "DIR", env = "SCAN_STATION_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Override the PACS host used for queries and stores.
    #[arg(long, global = true, value_name = "HOST", env = "SCAN_STATION_REMOTE_HOST")]
    remote_host: Option<String>,

    /// Log output format.
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect attached scanners and print their status.
    Devices(DevicesArgs),
    /// Poll for scanners and report connects and disconnects.
    Monitor(MonitorArgs),
    /// Show what a connected scanner supports.
    Capabilities(CapabilitiesArgs),
    /// Scan a document into the storage directory.
    Scan(ScanArgs),
    /// Search the PACS patient directory.
    Search(SearchArgs),
    /// Convert, tag and send every captured page to the PACS.
    Export(ExportArgs),
    /// List captured files waiting in storage.
    Files(OutputArgs),
    /// Delete one captured file.
    Delete(DeleteArgs),
    /// Check tool availability and storage health.
    Doctor(DoctorArgs),
}

#[derive(Debug, Args)]
struct OutputArgs {
    /// Optional JSON output file.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DevicesArgs {
    /// Only list connected scanners.
    #[arg(long)]
    connected: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Args)]
struct MonitorArgs {
    /// Stop after this many seconds. Runs until interrupted when omitted.
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,
}

#[derive(Debug, Args)]
struct CapabilitiesArgs {
    /// Device address as printed by `devices`, e.g. `fujitsu:fi-7030:211822`.
    device: String,
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Device address as printed by `devices`.
    device: String,

    /// Capture one page to a fixed file instead of a batch.
    #[arg(long)]
    single_page: bool,

    /// Scan both sides of each sheet.
    #[arg(long)]
    duplex: bool,

    /// Scan in grayscale.
    #[arg(long)]
    gray: bool,

    /// Resolution in DPI (75, 100, 150, 200, 300, 600 or 1200).
    #[arg(long, default_value_t = 300, value_parser = parse_resolution)]
    resolution: u32,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum SearchType {
    Name,
    Birthdate,
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Name fragment, or a YYYYMMDD date with `--type birthdate`.
    term: String,

    #[arg(long = "type", default_value = "name")]
    search_type: SearchType,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Patient ID of the selected patient.
    #[arg(long)]
    patient_id: String,

    /// Patient name, either `Last First Middle` or already in `Last^First` form.
    #[arg(long)]
    name: String,

    /// Birth date as YYYYMMDD.
    #[arg(long, default_value = "")]
    birth_date: String,

    /// Patient sex (M, F or O).
    #[arg(long, default_value = "")]
    sex: String,

    /// Institution or person that produced the documents.
    #[arg(long)]
    creator: String,

    /// Study description written to every page.
    #[arg(long, default_value = "")]
    description: String,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    /// File name as printed by `files`.
    name: String,
}

#[derive(Debug, Args)]
struct DoctorArgs {
    /// Also run a connectivity probe against the PACS query port.
    #[arg(long)]
    probe: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let settings = load_settings(&cli)?;
    tracing::debug!(?settings, "settings loaded");
    let service = StationService::new(settings, Arc::new(SystemToolRunner::default()));

    match cli.command {
        Commands::Devices(args) => run_devices_command(&service, args),
        Commands::Monitor(args) => run_monitor_command(&service, args),
        Commands::Capabilities(args) => run_capabilities_command(&service, args),
        Commands::Scan(args) => run_scan_command(&service, args),
        Commands::Search(args) => run_search_command(&service, args),
        Commands::Export(args) => run_export_command(&service, args),
        Commands::Files(args) => run_files_command(&service, args),
        Commands::Delete(args) => run_delete_command(&service, args),
        Commands::Doctor(args) => run_doctor_command(&service, args),
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::from_json_file(path)?,
        None => Settings::default(),
    };
    if let Some(storage_dir) = &cli.storage_dir {
        settings.storage_dir = storage_dir.clone();
    }
    if let Some(remote_host) = &cli.remote_host {
        settings.remote_host = remote_host.clone();
    }
    settings
        .validate()
        .context("invalid settings after applying command-line overrides")?;
    Ok(settings)
}

fn run_devices_command(service: &StationService, args: DevicesArgs) -> Result<()> {
    service.registry().refresh();
    let devices = if args.connected {
        service.connected_devices()
    } else {
        service.list_devices()
    };

    if devices.is_empty() {
        println!("No scanners detected.");
    }
    for device in &devices {
        println!(
            "- {} [{}] {:?} last seen {}",
            device.name,
            device.address,
            device.status,
            device.last_seen.to_rfc3339()
        );
    }
    write_json(&args.output.output, &devices, "device list")
}

fn run_monitor_command(service: &StationService, args: MonitorArgs) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        info!("received interrupt, stopping scanner monitor");
        let _ = shutdown_tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    monitor_until(service, args.duration.map(Duration::from_secs), &shutdown_rx);
    Ok(())
}

fn monitor_until(service: &StationService, duration: Option<Duration>, shutdown: &Receiver<()>) {
    let interval = service.settings().poll_interval();
    let deadline = duration.map(|duration| Instant::now() + duration);

    service.start();
    println!(
        "Monitoring scanners every {} ms{}",
        interval.as_millis(),
        if deadline.is_some() { "" } else { "; press Ctrl-C to stop." }
    );

    let mut last = Vec::new();
    loop {
        let devices = service.list_devices();
        let current = devices
            .iter()
            .map(|device| (device.address.clone(), device.connected))
            .collect::<Vec<_>>();
        if current != last {
            println!("Scanners ({} connected):", service.connected_devices().len());
            for device in &devices {
                println!("- {} [{}] {:?}", device.name, device.address, device.status);
            }
            last = current;
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        match shutdown.recv_timeout(interval.min(Duration::from_secs(1))) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    service.stop();
}

fn run_capabilities_command(service: &StationService, args: CapabilitiesArgs) -> Result<()> {
    service.registry().refresh();
    let capabilities = service.capabilities(&args.device)?;
    println!("Capabilities for {}:", args.device);
    println!("  multi-page: {}", capabilities.multi_page);
    println!("  color:      {}", capabilities.color);
    println!("  resolution: {}", capabilities.resolution);
    println!("  source:     {}", capabilities.source);
    Ok(())
}

fn run_scan_command(service: &StationService, args: ScanArgs) -> Result<()> {
    service.registry().refresh();
    let resolution = Resolution::new(args.resolution).map_err(anyhow::Error::msg)?;
    let request = ScanRequest {
        device: args.device,
        options: Some(ScanOptions {
            multi_page: !args.single_page,
            duplex: args.duplex,
            color: !args.gray,
            resolution,
        }),
    };

    let response = service.start_scan(&request)?;
    println!("{} ({} page(s)):", response.message, response.pages);
    for filename in &response.filenames {
        println!("- {filename}");
    }
    write_json(&args.output.output, &response, "scan result")
}

fn run_search_command(service: &StationService, args: SearchArgs) -> Result<()> {
    let kind = match args.search_type {
        SearchType::Name => "name",
        SearchType::Birthdate => "birthdate",
    };
    let response = service.search_patients(&SearchRequest {
        term: args.term,
        kind: kind.to_string(),
    })?;

    if response.patients.is_empty() {
        println!("No patients found.");
    } else {
        println!("Found {} patient(s):", response.total);
        for patient in &response.patients {
            println!(
                "- {} | {} | born {} | sex {} | last study {}",
                patient.patient_id,
                patient.name,
                empty_as_dash(&patient.birth_date),
                empty_as_dash(&patient.sex),
                empty_as_dash(&patient.study_date)
            );
        }
    }
    write_json(&args.output.output, &response, "search result")
}

fn run_export_command(service: &StationService, args: ExportArgs) -> Result<()> {
    let request = ExportRequest {
        patient_ids: vec![args.patient_id.clone()],
        document_creator: args.creator,
        description: args.description,
        patient: PatientRecord {
            patient_id: args.patient_id,
            name: args.name,
            birth_date: args.birth_date,
            sex: args.sex,
            study_date: String::new(),
        },
    };

    let response = service.send_to_pacs(&request)?;
    println!("{} (patient {}):", response.message, response.patient);
    for job in &response.jobs {
        let marker = if job.stage == ExportStage::Completed {
            "OK"
        } else {
            "FAIL"
        };
        println!("- [{marker}] {} ({}%): {}", job.filename, job.progress, job.message);
    }
    write_json(&args.output.output, &response, "export result")?;

    if response.failed > 0 {
        anyhow::bail!(
            "{} of {} file(s) failed to export",
            response.failed,
            response.files
        );
    }
    Ok(())
}

fn run_files_command(service: &StationService, args: OutputArgs) -> Result<()> {
    let response = service.list_files()?;
    println!(
        "{} file(s) in {}:",
        response.total,
        service.settings().storage_dir.display()
    );
    for file in &response.files {
        println!(
            "- {} {} modified {}",
            file.name,
            human_bytes(file.size),
            file.modified_time
        );
    }
    write_json(&args.output, &response, "file list")
}

fn run_delete_command(service: &StationService, args: DeleteArgs) -> Result<()> {
    service.delete_file(&args.name)?;
    println!("Deleted {}", args.name);
    Ok(())
}

fn run_doctor_command(service: &StationService, args: DoctorArgs) -> Result<()> {
    let info = service.doctor();
    println!("OS: {} ({})", info.os, info.arch);
    if let Some(current_dir) = &info.current_dir {
        println!("Current directory: {}", current_dir);
    }
    println!(
        "Storage: {} (exists={} writable={} files={})",
        info.storage_dir, info.storage_exists, info.storage_writable, info.stored_files
    );
    println!("PACS: {}", info.archive);
    for tool in &info.tools {
        println!(
            "- {} [{}] {}",
            tool.name,
            tool.path,
            if tool.found { "found" } else { "missing" }
        );
    }
    for note in &info.notes {
        println!("Note: {}", note);
    }

    if args.probe {
        match service.check_directory() {
            Ok(()) => println!("PACS query port reachable."),
            Err(err) => println!("PACS probe failed: {err}"),
        }
    }
    Ok(())
}

fn write_json<T: Serialize>(output: &Option<PathBuf>, value: &T, what: &str) -> Result<()> {
    let Some(path) = output else {
        return Ok(());
    };
    let payload =
        serde_json::to_string_pretty(value).with_context(|| format!("failed to serialize {what}"))?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write {what} to {}", path.display()))?;
    println!("JSON written to {}", path.display());
    Ok(())
}

fn parse_resolution(value: &str) -> Result<u32, String> {
    let dpi = value
        .parse::<u32>()
        .map_err(|err| format!("invalid resolution '{value}': {err}"))?;
    Resolution::new(dpi).map(Resolution::dpi)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
    };
}

fn empty_as_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

fn human_bytes(value: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if value == 0 {
        return "0 B".to_string();
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}
