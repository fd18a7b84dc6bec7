// `findscu -v` prints each match as a `Find Response:` line followed by one attribute per line:
//
//   I: Find Response: 1 (Pending)
//   I: (0010,0010) PN [SMITH^JOHN ]        #  10, 1 PatientName
//   I: (0010,0020) LO [P1]                 #   2, 1 PatientID

use crate::model::PatientRecord;

const RESPONSE_MARKER: &str = "Find Response:";
pub const ASSOCIATION_FAILURE_MARKER: &str = "Association Request Failed";

pub fn parse_find_output(output: &str) -> Vec<PatientRecord> {
    let mut patients = Vec::new();
    let mut current: Option<PatientRecord> = None;
    let mut in_response = false;

    for line in output.lines() {
        let line = line.trim();

        if line.contains(RESPONSE_MARKER) {
            if let Some(patient) = current.take().filter(|patient| !patient.name.is_empty()) {
                patients.push(patient);
            }
            current = Some(PatientRecord::default());
            in_response = true;
            continue;
        }

        if !in_response {
            continue;
        }
        if line.is_empty() {
            in_response = false;
            continue;
        }

        let Some(patient) = current.as_mut() else {
            continue;
        };
        if line.contains("PatientName") {
            if let Some(name) = bracketed_value(line) {
                if name != "*" && !name.is_empty() {
                    patient.name = name.to_string();
                }
            }
        } else if line.contains("PatientID") {
            if let Some(id) = bracketed_value(line) {
                patient.patient_id = id.to_string();
            }
        } else if line.contains("PatientBirthDate") {
            if let Some(birth_date) = bracketed_value(line) {
                patient.birth_date = birth_date.to_string();
            }
        } else if line.contains("PatientSex") {
            if let Some(sex) = bracketed_value(line) {
                patient.sex = sex.to_string();
            }
        } else if line.contains("StudyDate") {
            if let Some(study_date) = bracketed_value(line) {
                patient.study_date = study_date.to_string();
            }
        }
    }

    if let Some(patient) = current.filter(|patient| !patient.name.is_empty()) {
        patients.push(patient);
    }
    patients
}

pub fn is_association_failure(output: &str) -> bool {
    output.contains(ASSOCIATION_FAILURE_MARKER)
}

fn bracketed_value(line: &str) -> Option<&str> {
    let start = line.find('[')?;
    let len = line[start + 1..].find(']')?;
    Some(line[start + 1..start + 1 + len].trim())
}
