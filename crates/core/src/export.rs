use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{StationError, StationResult};
use crate::model::{ExportJob, ExportStage, PatientRecord};
use crate::settings::Settings;
use crate::storage::Storage;
use crate::tool::{ToolInvocation, ToolRunner};

const SERIES_DESCRIPTION: &str = "Scanner imported document";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudyContext {
    pub study_id: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
}

impl StudyContext {
    pub fn generate(now: DateTime<Utc>, uid_root: &str) -> Self {
        let timestamp = now.format("%Y%m%d%H%M%S").to_string();
        let suffix = Uuid::new_v4().simple().to_string();
        let study_instance_uid = format!("{uid_root}.{timestamp}");
        Self {
            study_id: format!("STUDY_{timestamp}_{}", &suffix[..8]),
            series_instance_uid: format!("{study_instance_uid}.1"),
            study_instance_uid,
        }
    }

    pub fn sop_instance_uid(&self, instance_number: u32) -> String {
        format!("{}.{instance_number}", self.series_instance_uid)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    #[serde(default)]
    pub patient_ids: Vec<String>,
    #[serde(default)]
    pub document_creator: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "selectedPatient", alias = "patient")]
    pub patient: PatientRecord,
}

// Converts free-text names to the DICOM person-name form: `Smith John Q` becomes
// `Smith^John^Q`. Tokens past the third are dropped.
pub fn format_patient_name(name: &str) -> String {
    let parts = name.split_whitespace().collect::<Vec<_>>();
    match parts.as_slice() {
        [] => String::new(),
        [single] => single.to_string(),
        [last, first] => format!("{last}^{first}"),
        [last, first, middle, ..] => format!("{last}^{first}^{middle}"),
    }
}

pub fn tag_assignments(
    request: &ExportRequest,
    station_name: &str,
    study: &StudyContext,
    instance_number: u32,
) -> Vec<(&'static str, String)> {
    let patient = &request.patient;
    vec![
        ("0010,0010", format_patient_name(&patient.name)),
        ("0010,0020", patient.patient_id.clone()),
        ("0010,0030", patient.birth_date.clone()),
        ("0010,0040", patient.sex.clone()),
        ("0008,0080", request.document_creator.clone()),
        ("0008,1010", station_name.to_string()),
        ("0020,0010", study.study_id.clone()),
        ("0020,000D", study.study_instance_uid.clone()),
        ("0020,000E", study.series_instance_uid.clone()),
        ("0008,0018", study.sop_instance_uid(instance_number)),
        ("0020,0013", instance_number.to_string()),
        ("0008,1030", request.description.clone()),
        ("0008,103E", SERIES_DESCRIPTION.to_string()),
    ]
}

pub struct ExportPipeline {
    runner: Arc<dyn ToolRunner>,
    storage: Storage,
    img2dcm: PathBuf,
    dcmodify: PathBuf,
    dcmsend: PathBuf,
    local_ae_title: String,
    store_ae_title: String,
    host: String,
    store_port: u16,
    station_name: String,
    uid_root: String,
    tool_timeout: Duration,
    in_flight: Mutex<()>,
}

impl std::fmt::Debug for ExportPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportPipeline")
            .field("storage", &self.storage.root())
            .field("host", &self.host)
            .field("store_port", &self.store_port)
            .finish()
    }
}

impl ExportPipeline {
    pub fn new(settings: &Settings, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            storage: Storage::from_settings(settings),
            img2dcm: settings.dcmtk_tool("img2dcm"),
            dcmodify: settings.dcmtk_tool("dcmodify"),
            dcmsend: settings.dcmtk_tool("dcmsend"),
            local_ae_title: settings.local_ae_title.clone(),
            store_ae_title: settings.store_ae_title.clone(),
            host: settings.remote_host.clone(),
            store_port: settings.store_port,
            station_name: settings.station_name.clone(),
            uid_root: settings.uid_root.clone(),
            tool_timeout: settings.tool_timeout(),
            in_flight: Mutex::new(()),
        }
    }

    pub fn export(&self, request: &ExportRequest) -> StationResult<Vec<ExportJob>> {
        self.export_with_progress(request, |_| {})
    }

    pub fn export_with_progress<F>(
        &self,
        request: &ExportRequest,
        mut on_progress: F,
    ) -> StationResult<Vec<ExportJob>>
    where
        F: FnMut(&ExportJob),
    {
        let _guard = self.begin()?;

        let study = StudyContext::generate(Utc::now(), &self.uid_root);
        info!(
            patient_id = %request.patient.patient_id,
            patient_ids = ?request.patient_ids,
            creator = %request.document_creator,
            "starting PACS upload"
        );
        info!(
            study_id = %study.study_id,
            study_uid = %study.study_instance_uid,
            series_uid = %study.series_instance_uid,
            "generated study identifiers"
        );

        let images = self.storage.captured_images()?;
        info!(count = images.len(), "found images to convert");

        let mut jobs = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let instance_number = index as u32 + 1;
            let job = self.export_page(request, &study, image, instance_number, &mut on_progress);
            jobs.push(job);
        }

        let completed = jobs
            .iter()
            .filter(|job| job.stage == ExportStage::Completed)
            .count();
        info!(completed, failed = jobs.len() - completed, "PACS upload finished");
        Ok(jobs)
    }

    fn export_page<F>(
        &self,
        request: &ExportRequest,
        study: &StudyContext,
        image: &Path,
        instance_number: u32,
        on_progress: &mut F,
    ) -> ExportJob
    where
        F: FnMut(&ExportJob),
    {
        let filename = image
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut job = ExportJob::new(filename);
        on_progress(&job);
        info!(file = %image.display(), instance_number, "processing page");

        let dicom = image.with_extension("dcm");
        if let Err(err) = self.convert(image, &dicom) {
            return self.fail(job, err, on_progress);
        }

        job.advance(
            ExportStage::Updating,
            20,
            "Updating DICOM with patient data...",
        );
        on_progress(&job);
        let tags = tag_assignments(request, &self.station_name, study, instance_number);
        if let Err(err) = self.apply_tags(&dicom, &tags) {
            return self.fail(job, err, on_progress);
        }

        job.advance(ExportStage::Sending, 50, "Sending to PACS server...");
        on_progress(&job);
        if let Err(err) = self.send(&dicom) {
            return self.fail(job, err, on_progress);
        }

        job.advance(ExportStage::Cleaning, 80, "Cleaning up temporary files...");
        on_progress(&job);
        cleanup(image, &dicom);
        job.advance(ExportStage::Cleaning, 90, "Temporary files removed");
        on_progress(&job);

        job.advance(
            ExportStage::Completed,
            100,
            "Successfully uploaded to PACS and cleaned up",
        );
        on_progress(&job);
        info!(file = %image.display(), "page sent and cleaned up");
        job
    }

    fn fail<F>(&self, mut job: ExportJob, err: StationError, on_progress: &mut F) -> ExportJob
    where
        F: FnMut(&ExportJob),
    {
        error!(file = %job.filename, stage = ?job.stage, error = %err, "page export failed");
        job.fail(err.to_string());
        on_progress(&job);
        job
    }

    fn convert(&self, image: &Path, dicom: &Path) -> StationResult<()> {
        let invocation = ToolInvocation::new(&self.img2dcm)
            .arg(image.display().to_string())
            .arg(dicom.display().to_string());
        self.run_stage(&invocation)
            .map_err(|message| StationError::ConversionFailed { message })
    }

    fn apply_tags(&self, dicom: &Path, tags: &[(&'static str, String)]) -> StationResult<()> {
        let mut invocation = ToolInvocation::new(&self.dcmodify).args(["-nb", "-gin"]);
        for (tag, value) in tags {
            invocation = invocation.arg("-i").arg(format!("({tag})={value}"));
        }
        let invocation = invocation.arg(dicom.display().to_string());
        self.run_stage(&invocation)
            .map_err(|message| StationError::TagUpdateFailed { message })
    }

    fn send(&self, dicom: &Path) -> StationResult<()> {
        let invocation = ToolInvocation::new(&self.dcmsend)
            .args(["-aet", self.local_ae_title.as_str()])
            .args(["-aec", self.store_ae_title.as_str()])
            .args([self.host.clone(), self.store_port.to_string()])
            .arg(dicom.display().to_string());
        self.run_stage(&invocation)
            .map_err(|message| StationError::TransmissionFailed { message })
    }

    fn run_stage(&self, invocation: &ToolInvocation) -> Result<(), String> {
        debug!(command = %invocation, "running export stage");
        match self.runner.run(invocation, self.tool_timeout) {
            Ok(output) if output.success => {
                debug!(program = %invocation.program_name(), output = %output.combined().trim(), "stage output");
                Ok(())
            }
            Ok(output) => Err(format!(
                "{} failed: {}",
                invocation.program_name(),
                output.diagnostic()
            )),
            Err(err) => Err(err.to_string()),
        }
    }

    fn begin(&self) -> StationResult<MutexGuard<'_, ()>> {
        match self.in_flight.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                Err(StationError::JobInProgress { operation: "export" })
            }
        }
    }
}

fn cleanup(image: &Path, dicom: &Path) {
    for path in [image, dicom] {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove file"),
        }
    }
}
