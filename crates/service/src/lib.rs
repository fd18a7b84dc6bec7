pub mod service;

pub use service::{
    ErrorKind, ExportSessionSnapshot, ExportSessionStatus, FileListResponse,
    PatientSearchResponse, ScanRequest, ScanResponse, SearchRequest, SendResponse, ServiceError,
    ServiceResult, StationService,
};
