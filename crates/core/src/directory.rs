use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{StationError, StationResult};
use crate::find_response::{is_association_failure, parse_find_output};
use crate::model::{PatientRecord, SearchKind};
use crate::settings::Settings;
use crate::tool::{ToolInvocation, ToolRunner};

pub struct PatientDirectory {
    runner: Arc<dyn ToolRunner>,
    findscu: PathBuf,
    local_ae_title: String,
    query_ae_title: String,
    host: String,
    port: u16,
    query_timeout: Duration,
    probe_timeout: Duration,
}

impl std::fmt::Debug for PatientDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatientDirectory")
            .field("findscu", &self.findscu)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl PatientDirectory {
    pub fn new(settings: &Settings, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            findscu: settings.dcmtk_tool("findscu"),
            local_ae_title: settings.local_ae_title.clone(),
            query_ae_title: settings.query_ae_title.clone(),
            host: settings.remote_host.clone(),
            port: settings.query_port,
            query_timeout: settings.query_timeout(),
            probe_timeout: settings.probe_timeout(),
        }
    }

    pub fn search(&self, term: &str, kind: SearchKind) -> StationResult<Vec<PatientRecord>> {
        let patterns = search_patterns(term, kind);
        info!(term = %term, ?kind, "searching patients");
        debug!(?patterns, "search patterns");

        let mut seen = HashSet::new();
        let mut patients = Vec::new();

        for pattern in &patterns {
            let invocation = self.query_invocation(pattern, kind);
            debug!(command = %invocation, "patient query");

            let output = match self.runner.run(&invocation, self.query_timeout) {
                Ok(output) => output,
                Err(err) => {
                    debug!(pattern = %pattern, error = %err, "pattern failed");
                    continue;
                }
            };

            let text = output.combined();
            if is_association_failure(&text) {
                error!(output = %text.trim(), "directory association failed");
                return Err(StationError::DirectoryError {
                    message: text.trim().to_string(),
                });
            }
            if !output.success {
                debug!(pattern = %pattern, error = %output.diagnostic(), "pattern failed");
                continue;
            }

            for patient in parse_find_output(&text) {
                if patient.patient_id.is_empty() {
                    continue;
                }
                if seen.insert(patient.patient_id.clone()) {
                    patients.push(patient);
                }
            }
        }

        if patients.is_empty() {
            warn!(term = %term, "no patients found after trying all patterns");
            self.probe()?;
        }

        info!(count = patients.len(), "found unique patients");
        Ok(patients)
    }

    pub fn probe(&self) -> StationResult<()> {
        let invocation = self
            .base_invocation()
            .args(["-k", "PatientName=*"])
            .args([self.host.clone(), self.port.to_string()]);

        let reachable = match self.runner.run(&invocation, self.probe_timeout) {
            Ok(output) if output.success => true,
            Ok(output) => {
                error!(error = %output.diagnostic(), "directory connection test failed");
                false
            }
            Err(err) => {
                error!(error = %err, "directory connection test failed");
                false
            }
        };

        if reachable {
            Ok(())
        } else {
            Err(StationError::DirectoryUnreachable {
                host: self.host.clone(),
                port: self.port,
            })
        }
    }

    fn base_invocation(&self) -> ToolInvocation {
        ToolInvocation::new(&self.findscu)
            .args(["-v", "-S"])
            .args(["-aet", self.local_ae_title.as_str()])
            .args(["-aec", self.query_ae_title.as_str()])
            .args(["-k", "QueryRetrieveLevel=PATIENT"])
    }

    fn query_invocation(&self, pattern: &str, kind: SearchKind) -> ToolInvocation {
        let (name_key, birth_key) = match kind {
            SearchKind::Name => (format!("PatientName={pattern}"), "PatientBirthDate".to_string()),
            SearchKind::Birthdate => {
                ("PatientName".to_string(), format!("PatientBirthDate={pattern}"))
            }
        };
        self.base_invocation()
            .args(["-k".to_string(), name_key])
            .args(["-k", "PatientID"])
            .args(["-k".to_string(), birth_key])
            .args(["-k", "PatientSex"])
            .args([self.host.clone(), self.port.to_string()])
    }
}

fn search_patterns(term: &str, kind: SearchKind) -> Vec<String> {
    match kind {
        SearchKind::Birthdate => vec![term.to_string()],
        SearchKind::Name => vec![format!("{term}*"), format!("*{term}*"), format!("*{term}")],
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::PatientDirectory;
    use crate::error::{StationError, ToolError};
    use crate::model::SearchKind;
    use crate::settings::Settings;
    use crate::tool::{ScriptedRunner, ToolInvocation, ToolOutput};

    const RESPONSE: &str = include_str!("../../../fixtures/findscu-response.txt");

    fn directory(runner: Arc<ScriptedRunner>) -> PatientDirectory {
        let settings = Settings {
            remote_host: "pacs.example".to_string(),
            query_port: 4242,
            ..Settings::default()
        };
        PatientDirectory::new(&settings, runner)
    }

    fn name_key(call: &ToolInvocation) -> Option<&str> {
        call.arg_value("PatientName=")
    }

    fn response(id: &str, name: &str) -> String {
        format!(
            "I: Find Response: 1 (Pending)\n\
             I: (0010,0010) PN [{name}]  # PatientName\n\
             I: (0010,0020) LO [{id}]    # PatientID\n\n"
        )
    }

    #[test]
    fn name_search_merges_patterns_and_dedupes_by_id() {
        let runner = Arc::new(ScriptedRunner::new(|call| match name_key(call) {
            Some("Smith*") => Ok(ToolOutput::succeeded(response("P1", "SMITH^JOHN"))),
            Some("*Smith*") => Ok(ToolOutput::succeeded(format!(
                "{}{}",
                response("P1", "SMITH^JOHN"),
                response("P2", "GOLDSMITH^ANN")
            ))),
            Some("*Smith") => Ok(ToolOutput::succeeded(response("P2", "GOLDSMITH^ANN"))),
            _ => Ok(ToolOutput::succeeded("")),
        }));
        let patients = directory(runner.clone())
            .search("Smith", SearchKind::Name)
            .expect("search");

        let ids = patients.iter().map(|p| p.patient_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["P1", "P2"]);

        let calls = runner.calls_to("findscu");
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls.iter().map(|c| name_key(c).unwrap_or("")).collect::<Vec<_>>(),
            vec!["Smith*", "*Smith*", "*Smith"]
        );
        assert_eq!(
            calls[0].args[..8],
            ["-v", "-S", "-aet", "DICOMScanStation", "-aec", "ANY-SCP", "-k", "QueryRetrieveLevel=PATIENT"]
        );
        assert_eq!(calls[0].args[calls[0].args.len() - 2..], ["pacs.example", "4242"]);
    }

    #[test]
    fn birthdate_search_runs_a_single_query() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(ToolOutput::succeeded(RESPONSE))));
        let patients = directory(runner.clone())
            .search("19700101", SearchKind::Birthdate)
            .expect("search");
        assert_eq!(patients.len(), 2);

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arg_value("PatientBirthDate="), Some("19700101"));
        assert!(calls[0].args.iter().any(|arg| arg == "PatientName"));
    }

    #[test]
    fn association_failure_stops_the_search() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(ToolOutput::failed(
                1,
                "F: Association Request Failed: 0006:0317 Peer aborted Association\n",
            ))
        }));
        let err = directory(runner.clone())
            .search("Smith", SearchKind::Name)
            .expect_err("association failure");
        match err {
            StationError::DirectoryError { message } => {
                assert!(message.starts_with("F: Association Request Failed"));
                assert!(!message.ends_with('\n'));
            }
            other => panic!("expected DirectoryError, got {other:?}"),
        }
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn empty_results_are_ok_when_the_probe_succeeds() {
        let runner = Arc::new(ScriptedRunner::new(|_| Ok(ToolOutput::succeeded(""))));
        let patients = directory(runner.clone())
            .search("Nobody", SearchKind::Name)
            .expect("empty search");
        assert!(patients.is_empty());

        let calls = runner.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(name_key(&calls[3]), Some("*"));
    }

    #[test]
    fn failing_probe_reports_unreachable_directory() {
        let runner = Arc::new(ScriptedRunner::new(|call| {
            if name_key(call) == Some("*") {
                Err(ToolError::TimedOut {
                    program: "findscu".to_string(),
                    timeout: std::time::Duration::from_secs(10),
                })
            } else {
                Ok(ToolOutput::failed(1, "E: connection refused"))
            }
        }));
        let err = directory(runner)
            .search("Smith", SearchKind::Name)
            .expect_err("unreachable");
        assert!(matches!(
            &err,
            StationError::DirectoryUnreachable { host, port: 4242 } if host == "pacs.example"
        ));
        assert_eq!(
            err.to_string(),
            "unable to connect to DICOM server at pacs.example:4242"
        );
    }

    #[test]
    fn records_without_an_id_are_dropped() {
        let runner = Arc::new(ScriptedRunner::new(|call| {
            if name_key(call) == Some("Doe*") {
                Ok(ToolOutput::succeeded(response("", "DOE^JANE")))
            } else {
                Ok(ToolOutput::succeeded(response("P3", "DOE^JOHN")))
            }
        }));
        let patients = directory(runner)
            .search("Doe", SearchKind::Name)
            .expect("search");
        assert_eq!(patients.len(), 1);
        assert_eq!(patients[0].name, "DOE^JOHN");
    }
}
