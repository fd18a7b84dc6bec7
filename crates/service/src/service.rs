use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use scan_station_core::{
    collect_doctor_info, CapturedPage, Device, DeviceRegistry, DoctorInfo, ExportJob,
    ExportPipeline, ExportRequest, ExportStage, PatientDirectory, PatientRecord, ScanOptions,
    ScanOrchestrator, ScannerCapabilities, SearchKind, Settings, StationError, Storage,
    StoredFile, ToolRunner,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_FINISHED_SESSIONS: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    Internal,
}

/// Request-level failure: a status class plus the message shown to the caller.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ServiceError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::BadRequest,
            code: "bad_request".to_string(),
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code: "conflict".to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found".to_string(),
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            code: "internal".to_string(),
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.kind {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }
}

impl From<StationError> for ServiceError {
    fn from(err: StationError) -> Self {
        let kind = match &err {
            StationError::DeviceNotFound { .. } | StationError::FileNotFound { .. } => {
                ErrorKind::NotFound
            }
            StationError::DeviceDisconnected { .. } | StationError::JobInProgress { .. } => {
                ErrorKind::Conflict
            }
            StationError::InvalidFileName { .. } => ErrorKind::BadRequest,
            _ => ErrorKind::Internal,
        };
        Self {
            kind,
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub options: Option<ScanOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub message: String,
    pub filenames: Vec<String>,
    pub pages: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default, rename = "q")]
    pub term: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientSearchResponse {
    pub patients: Vec<PatientRecord>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListResponse {
    pub files: Vec<StoredFile>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub message: String,
    pub files: usize,
    pub patient: String,
    pub completed: usize,
    pub failed: usize,
    pub jobs: Vec<ExportJob>,
}

impl SendResponse {
    fn from_jobs(jobs: Vec<ExportJob>, patient: &str) -> Self {
        let completed = jobs
            .iter()
            .filter(|job| job.stage == ExportStage::Completed)
            .count();
        let failed = jobs.len() - completed;
        let message = if failed == 0 {
            "Files sent to PACS successfully".to_string()
        } else {
            format!("{completed} of {} files sent to PACS", jobs.len())
        };
        Self {
            message,
            files: jobs.len(),
            patient: patient.to_string(),
            completed,
            failed,
            jobs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportSessionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSessionSnapshot {
    pub export_id: String,
    pub status: ExportSessionStatus,
    pub jobs: Vec<ExportJob>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct ExportSession {
    started: Instant,
    status: ExportSessionStatus,
    jobs: Vec<ExportJob>,
    error: Option<String>,
}

type Sessions = Arc<Mutex<HashMap<String, ExportSession>>>;

/// Everything the request layer needs, wired from one `Settings` value.
pub struct StationService {
    settings: Settings,
    storage: Storage,
    registry: Arc<DeviceRegistry>,
    scanner: ScanOrchestrator,
    directory: PatientDirectory,
    pipeline: Arc<ExportPipeline>,
    sessions: Sessions,
}

impl StationService {
    pub fn new(settings: Settings, runner: Arc<dyn ToolRunner>) -> Self {
        let registry = Arc::new(DeviceRegistry::new(&settings, Arc::clone(&runner)));
        let scanner = ScanOrchestrator::new(&settings, Arc::clone(&registry), Arc::clone(&runner));
        let directory = PatientDirectory::new(&settings, Arc::clone(&runner));
        let pipeline = Arc::new(ExportPipeline::new(&settings, runner));
        Self {
            storage: Storage::from_settings(&settings),
            settings,
            registry,
            scanner,
            directory,
            pipeline,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Prepares storage, runs one enumeration so the first listing is populated, then starts
    /// the background poll loop.
    pub fn start(&self) {
        if let Err(err) = self.storage.ensure_root() {
            warn!(error = %err, "failed to create storage directory");
        }
        let summary = self.registry.refresh();
        info!(devices = summary.added.len(), "initial scanner detection finished");
        self.registry.start_monitoring();
    }

    pub fn stop(&self) {
        self.registry.stop();
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.registry.list()
    }

    pub fn connected_devices(&self) -> Vec<Device> {
        self.registry.list_connected()
    }

    pub fn capabilities(&self, device: &str) -> ServiceResult<ScannerCapabilities> {
        Ok(self.scanner.capabilities(device)?)
    }

    pub fn start_scan(&self, request: &ScanRequest) -> ServiceResult<ScanResponse> {
        if request.device.trim().is_empty() {
            return Err(ServiceError::bad_request("Device is required"));
        }
        self.storage.ensure_root()?;
        if self.storage.has_files()? {
            return Err(ServiceError::conflict(
                "Files already exist. Please delete existing files before scanning.",
            ));
        }

        let options = request.options.unwrap_or_default();
        let pages = self.scanner.scan(&request.device, &options)?;
        let filenames = pages
            .into_iter()
            .map(|page: CapturedPage| page.filename)
            .collect::<Vec<_>>();
        Ok(ScanResponse {
            message: "Scan completed successfully".to_string(),
            pages: filenames.len(),
            filenames,
        })
    }

    pub fn search_patients(&self, request: &SearchRequest) -> ServiceResult<PatientSearchResponse> {
        let term = request.term.trim();
        if term.is_empty() {
            return Err(ServiceError::bad_request("Search term is required"));
        }
        let kind = request
            .kind
            .parse::<SearchKind>()
            .map_err(ServiceError::bad_request)?;

        let patients = self.directory.search(term, kind).inspect_err(|err| {
            error!(error = %err, "patient search failed");
        })?;
        Ok(PatientSearchResponse {
            total: patients.len(),
            patients,
        })
    }

    pub fn send_to_pacs(&self, request: &ExportRequest) -> ServiceResult<SendResponse> {
        self.check_export_request(request)?;
        info!(patient = %request.patient.name, "sending captured files to PACS");
        let jobs = self.pipeline.export(request)?;
        Ok(SendResponse::from_jobs(jobs, &request.patient.name))
    }

    /// Starts an export on a background thread and returns its session id. Job snapshots are
    /// available through [`StationService::export_session`] while it runs.
    pub fn start_export(&self, request: ExportRequest) -> ServiceResult<String> {
        self.check_export_request(&request)?;

        let export_id = Uuid::new_v4().to_string();
        {
            let mut sessions = lock_sessions(&self.sessions)?;
            prune_finished_sessions(&mut sessions, MAX_FINISHED_SESSIONS);
            sessions.insert(
                export_id.clone(),
                ExportSession {
                    started: Instant::now(),
                    status: ExportSessionStatus::Running,
                    jobs: Vec::new(),
                    error: None,
                },
            );
        }

        let sessions = Arc::clone(&self.sessions);
        let pipeline = Arc::clone(&self.pipeline);
        let thread_export_id = export_id.clone();
        thread::spawn(move || {
            let run_result = pipeline.export_with_progress(&request, |job| {
                if let Ok(mut sessions) = lock_sessions(&sessions) {
                    if let Some(session) = sessions.get_mut(&thread_export_id) {
                        record_job(&mut session.jobs, job);
                    }
                }
            });

            if let Ok(mut sessions) = lock_sessions(&sessions) {
                if let Some(session) = sessions.get_mut(&thread_export_id) {
                    match run_result {
                        Ok(jobs) => {
                            session.jobs = jobs;
                            session.status = ExportSessionStatus::Completed;
                        }
                        Err(err) => {
                            error!(export_id = %thread_export_id, error = %err, "export failed");
                            session.status = ExportSessionStatus::Failed;
                            session.error = Some(err.to_string());
                        }
                    }
                }
            }
        });

        Ok(export_id)
    }

    pub fn export_session(&self, export_id: &str) -> ServiceResult<ExportSessionSnapshot> {
        let sessions = lock_sessions(&self.sessions)?;
        let session = sessions
            .get(export_id)
            .ok_or_else(|| ServiceError::not_found(format!("export session not found: {export_id}")))?;
        Ok(ExportSessionSnapshot {
            export_id: export_id.to_string(),
            status: session.status.clone(),
            jobs: session.jobs.clone(),
            error: session.error.clone(),
        })
    }

    /// Connectivity check against the directory's query port.
    pub fn check_directory(&self) -> ServiceResult<()> {
        Ok(self.directory.probe()?)
    }

    pub fn list_files(&self) -> ServiceResult<FileListResponse> {
        self.storage.ensure_root()?;
        let files = self.storage.list_files()?;
        Ok(FileListResponse {
            total: files.len(),
            files,
        })
    }

    pub fn file_path(&self, name: &str) -> ServiceResult<PathBuf> {
        if name.trim().is_empty() {
            return Err(ServiceError::bad_request("Filename is required"));
        }
        self.storage.resolve(name).map_err(file_error)
    }

    pub fn delete_file(&self, name: &str) -> ServiceResult<()> {
        if name.trim().is_empty() {
            return Err(ServiceError::bad_request("Filename is required"));
        }
        self.storage.delete(name).map_err(file_error)?;
        info!(file = %name, "file deleted");
        Ok(())
    }

    pub fn doctor(&self) -> DoctorInfo {
        collect_doctor_info(&self.settings)
    }

    fn check_export_request(&self, request: &ExportRequest) -> ServiceResult<()> {
        if request.patient_ids.is_empty()
            || request.document_creator.trim().is_empty()
            || request.patient.patient_id.trim().is_empty()
        {
            return Err(ServiceError::bad_request(
                "Patient IDs, document creator, and selected patient are required",
            ));
        }
        self.storage.ensure_root()?;
        if self.storage.captured_images()?.is_empty() {
            return Err(ServiceError::bad_request("No scanned files to send"));
        }
        Ok(())
    }
}

impl Drop for StationService {
    fn drop(&mut self) {
        self.registry.stop();
    }
}

fn file_error(err: StationError) -> ServiceError {
    match err {
        StationError::FileNotFound { .. } => ServiceError {
            kind: ErrorKind::NotFound,
            code: err.kind().to_string(),
            message: "File not found".to_string(),
        },
        other => other.into(),
    }
}

fn record_job(jobs: &mut Vec<ExportJob>, job: &ExportJob) {
    match jobs.last_mut() {
        Some(last) if last.filename == job.filename && !last.stage.is_terminal() => {
            *last = job.clone();
        }
        _ => jobs.push(job.clone()),
    }
}

// Running sessions are never evicted; finished ones beyond `keep` go oldest first.
fn prune_finished_sessions(sessions: &mut HashMap<String, ExportSession>, keep: usize) {
    let mut finished = sessions
        .iter()
        .filter(|(_, session)| session.status != ExportSessionStatus::Running)
        .map(|(id, session)| (session.started, id.clone()))
        .collect::<Vec<_>>();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        sessions.remove(&id);
    }
}

fn lock_sessions(sessions: &Sessions) -> ServiceResult<MutexGuard<'_, HashMap<String, ExportSession>>> {
    sessions
        .lock()
        .map_err(|_| ServiceError::internal("export session registry lock poisoned"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use scan_station_core::{
        ExportRequest, ExportStage, PatientRecord, ScriptedRunner, Settings, ToolInvocation,
        ToolOutput,
    };
    use tempfile::TempDir;

    use super::{
        prune_finished_sessions, ErrorKind, ExportSession, ExportSessionStatus, ScanRequest,
        SearchRequest, ServiceError, StationService,
    };

    const LISTING: &str = "device `fujitsu:fi-7030:211822' is a FUJITSU fi-7030 scanner\n";
    const DEVICE: &str = "fujitsu:fi-7030:211822";

    fn fake_tools(call: &ToolInvocation) -> Result<ToolOutput, scan_station_core::ToolError> {
        match call.program_name().as_str() {
            "scanimage" if call.args.first().map(String::as_str) == Some("-L") => {
                Ok(ToolOutput::succeeded(LISTING))
            }
            "scanimage" => {
                if let Some(pattern) = call.arg_value("--batch=") {
                    fs::write(pattern.replace("%d", "1"), b"jpeg").expect("write page");
                }
                Ok(ToolOutput::succeeded(""))
            }
            "img2dcm" => {
                fs::write(&call.args[1], b"DICM").expect("write dicom");
                Ok(ToolOutput::succeeded(""))
            }
            _ => Ok(ToolOutput::succeeded("")),
        }
    }

    fn service(temp: &TempDir) -> (StationService, Arc<ScriptedRunner>) {
        let settings = Settings {
            storage_dir: temp.path().join("tempfiles"),
            settle_delay_ms: 0,
            ..Settings::default()
        };
        let runner = Arc::new(ScriptedRunner::new(fake_tools));
        let service = StationService::new(settings, runner.clone());
        service.registry().refresh();
        (service, runner)
    }

    fn export_request() -> ExportRequest {
        ExportRequest {
            patient_ids: vec!["P1".to_string()],
            document_creator: "Front Desk".to_string(),
            description: "Consent form".to_string(),
            patient: PatientRecord {
                patient_id: "P1".to_string(),
                name: "SMITH^JOHN".to_string(),
                ..PatientRecord::default()
            },
        }
    }

    #[test]
    fn scan_is_refused_while_files_exist() {
        let temp = TempDir::new().expect("tempdir");
        let (service, runner) = service(&temp);
        let request = ScanRequest {
            device: DEVICE.to_string(),
            options: None,
        };

        let response = service.start_scan(&request).expect("first scan");
        assert_eq!(response.pages, 1);

        let err = service.start_scan(&request).expect_err("files exist");
        assert_eq!(err.status_code(), 409);
        assert_eq!(
            err.message,
            "Files already exist. Please delete existing files before scanning."
        );
        assert_eq!(runner.calls().iter().filter(|c| c.arg_value("--batch=").is_some()).count(), 1);
    }

    #[test]
    fn unknown_device_and_missing_device_map_to_client_errors() {
        let temp = TempDir::new().expect("tempdir");
        let (service, _) = service(&temp);

        let missing = service
            .start_scan(&ScanRequest::default())
            .expect_err("device required");
        assert_eq!(missing.status_code(), 400);

        let unknown = service
            .start_scan(&ScanRequest {
                device: "epson2:libusb:002:003".to_string(),
                options: None,
            })
            .expect_err("unknown device");
        assert_eq!(unknown.status_code(), 404);
        assert_eq!(unknown.code, "device_not_found");
    }

    #[test]
    fn search_requires_a_term_and_known_type() {
        let temp = TempDir::new().expect("tempdir");
        let (service, _) = service(&temp);

        let err = service
            .search_patients(&SearchRequest::default())
            .expect_err("term required");
        assert_eq!(err, ServiceError::bad_request("Search term is required"));

        let err = service
            .search_patients(&SearchRequest {
                term: "Smith".to_string(),
                kind: "ssn".to_string(),
            })
            .expect_err("bad type");
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn send_needs_captured_files() {
        let temp = TempDir::new().expect("tempdir");
        let (service, _) = service(&temp);

        let err = service.send_to_pacs(&export_request()).expect_err("no files");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.message, "No scanned files to send");

        let mut incomplete = export_request();
        incomplete.document_creator.clear();
        let err = service.send_to_pacs(&incomplete).expect_err("missing creator");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn scan_then_send_empties_storage() {
        let temp = TempDir::new().expect("tempdir");
        let (service, _) = service(&temp);
        service
            .start_scan(&ScanRequest {
                device: DEVICE.to_string(),
                options: None,
            })
            .expect("scan");

        let response = service.send_to_pacs(&export_request()).expect("send");
        assert_eq!(response.files, 1);
        assert_eq!(response.completed, 1);
        assert_eq!(response.failed, 0);
        assert_eq!(response.patient, "SMITH^JOHN");
        assert_eq!(service.list_files().expect("list").total, 0);
    }

    #[test]
    fn background_export_session_reports_jobs() {
        let temp = TempDir::new().expect("tempdir");
        let (service, _) = service(&temp);
        service
            .start_scan(&ScanRequest {
                device: DEVICE.to_string(),
                options: None,
            })
            .expect("scan");

        let export_id = service.start_export(export_request()).expect("export starts");
        let started = Instant::now();
        let snapshot = loop {
            let snapshot = service.export_session(&export_id).expect("session exists");
            if snapshot.status != ExportSessionStatus::Running {
                break snapshot;
            }
            assert!(started.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(snapshot.status, ExportSessionStatus::Completed);
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].stage, ExportStage::Completed);

        assert_eq!(
            service.export_session("missing").expect_err("unknown").status_code(),
            404
        );
    }

    #[test]
    fn finished_sessions_are_capped_oldest_first() {
        let base = Instant::now();
        let session = |offset_ms: u64, status: ExportSessionStatus| ExportSession {
            started: base + Duration::from_millis(offset_ms),
            status,
            jobs: Vec::new(),
            error: None,
        };
        let mut sessions = HashMap::new();
        sessions.insert("running".to_string(), session(0, ExportSessionStatus::Running));
        sessions.insert("old".to_string(), session(1, ExportSessionStatus::Completed));
        sessions.insert("failed".to_string(), session(2, ExportSessionStatus::Failed));
        sessions.insert("recent".to_string(), session(3, ExportSessionStatus::Completed));

        prune_finished_sessions(&mut sessions, 2);
        let mut left = sessions.keys().cloned().collect::<Vec<_>>();
        left.sort();
        assert_eq!(left, ["failed", "recent", "running"]);

        prune_finished_sessions(&mut sessions, 2);
        assert_eq!(sessions.len(), 3);
    }

    #[test]
    fn file_download_and_delete_guard_names() {
        let temp = TempDir::new().expect("tempdir");
        let (service, _) = service(&temp);
        let storage_dir = temp.path().join("tempfiles");
        fs::create_dir_all(&storage_dir).expect("mkdir");
        fs::write(storage_dir.join("scan_1_1.jpg"), b"jpeg").expect("write");

        let path = service.file_path("scan_1_1.jpg").expect("resolve");
        assert_eq!(path, storage_dir.join("scan_1_1.jpg"));

        let missing = service.delete_file("scan_9_9.jpg").expect_err("missing");
        assert_eq!(missing.status_code(), 404);
        assert_eq!(missing.message, "File not found");

        let traversal = service.file_path("../secret.jpg").expect_err("traversal");
        assert_eq!(traversal.status_code(), 400);

        service.delete_file("scan_1_1.jpg").expect("delete");
        assert_eq!(service.list_files().expect("list").total, 0);
    }

    #[test]
    fn request_bodies_use_wire_field_names() {
        let scan: ScanRequest = serde_json::from_str(
            r#"{"device": "fujitsu:fi-7030:211822", "options": {"duplex": true, "resolution": 600}}"#,
        )
        .expect("scan body");
        let options = scan.options.expect("options");
        assert!(options.duplex && options.multi_page);
        assert_eq!(options.resolution.dpi(), 600);

        let export: ExportRequest = serde_json::from_str(
            r#"{"patientIds": ["P1"], "documentCreator": "Front Desk",
                "selectedPatient": {"patientId": "P1", "name": "DOE^JANE", "gender": "F"}}"#,
        )
        .expect("export body");
        assert_eq!(export.patient.sex, "F");
        assert_eq!(export.description, "");

        let body = serde_json::to_value(ServiceError::conflict("busy")).expect("error body");
        assert_eq!(body["kind"], "conflict");
        assert_eq!(body["message"], "busy");
    }

    #[test]
    fn station_errors_map_to_status_codes() {
        use scan_station_core::StationError;

        let cases = [
            (StationError::DeviceNotFound { device: "x".into() }, 404),
            (
                StationError::DeviceDisconnected {
                    device: "x".into(),
                    name: "X".into(),
                },
                409,
            ),
            (StationError::JobInProgress { operation: "scan" }, 409),
            (
                StationError::DirectoryUnreachable {
                    host: "pacs".into(),
                    port: 104,
                },
                500,
            ),
            (StationError::InvalidFileName { name: "..".into() }, 400),
        ];
        for (err, status) in cases {
            assert_eq!(ServiceError::from(err).status_code(), status);
        }
    }
}
