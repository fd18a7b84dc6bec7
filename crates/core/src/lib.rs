pub mod device;
pub mod directory;
pub mod doctor;
pub mod error;
pub mod export;
pub mod find_response;
pub mod listing;
pub mod model;
pub mod scanner;
pub mod settings;
pub mod storage;
pub mod tool;

pub use device::{DeviceRegistry, ReconcileSummary};
pub use directory::PatientDirectory;
pub use doctor::{collect_doctor_info, DoctorInfo, ToolCheck};
pub use error::{StationError, StationResult, ToolError};
pub use export::{format_patient_name, ExportPipeline, ExportRequest, StudyContext};
pub use model::{
    CapturedPage, Device, DeviceStatus, ExportJob, ExportStage, PatientRecord, Resolution,
    ScanOptions, ScannerCapabilities, SearchKind, StoredFile,
};
pub use scanner::ScanOrchestrator;
pub use settings::Settings;
pub use storage::Storage;
pub use tool::{ScriptedRunner, SystemToolRunner, ToolInvocation, ToolOutput, ToolRunner};
