//! Segment-based HL7 v2.3 field path plugin.
//!
//! Locators take the form `SEG.field` or `SEG.field.component`, 1-based,
//! matching the notation clinicians and interface analysts already use
//! (`PID.3`, `PID.5.1`). Field access splits on the standard v2 separators
//! (`|` fields, `^` components) against the first matching segment; it does
//! not expand escape sequences or repetitions, which belong to the full
//! message model outside this seam.
//!
//! The `MSH` segment is special: its first field *is* the field separator,
//! so `MSH.2` lives at split index 1. No dictionary entry below maps into
//! `MSH`, but message-type detection reads `MSH.9`.

use crate::{check_value, DateShape, FieldLocation, FieldPathPlugin, FieldSpec, ValueOutcome};
use crate::ApplyError;
use plover_types::SemanticPath;
use std::collections::BTreeMap;

const STANDARD: &str = "hl7v23";

const ADT: &[&str] = &["ADT_ADMIT", "ADT_DISCHARGE"];
const ALL: &[&str] = &["ADT_ADMIT", "ADT_DISCHARGE", "ORU_RESULT", "RDE_ORDER"];
const ORU: &[&str] = &["ORU_RESULT"];
const RDE: &[&str] = &["RDE_ORDER"];

const DICTIONARY: &[FieldSpec] = &[
    FieldSpec {
        path: "patient.mrn",
        message_types: ALL,
        locator: "PID.3",
        data_type: "CX",
        description: "Patient identifier list (medical record number)",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.family_name",
        message_types: ALL,
        locator: "PID.5.1",
        data_type: "XPN",
        description: "Patient family name",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.given_name",
        message_types: ALL,
        locator: "PID.5.2",
        data_type: "XPN",
        description: "Patient given name",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.dob",
        message_types: ALL,
        locator: "PID.7",
        data_type: "TS",
        description: "Patient date/time of birth",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.sex",
        message_types: ALL,
        locator: "PID.8",
        data_type: "IS",
        description: "Administrative sex",
        coding_table: Some("HL7 table 0001"),
        allowed: &["F", "M", "O", "U"],
    },
    FieldSpec {
        path: "patient.address.city",
        message_types: ALL,
        locator: "PID.11.3",
        data_type: "XAD",
        description: "Patient address: city",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.phone",
        message_types: ALL,
        locator: "PID.13",
        data_type: "XTN",
        description: "Patient home phone number",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "encounter.class",
        message_types: ADT,
        locator: "PV1.2",
        data_type: "IS",
        description: "Patient class",
        coding_table: Some("HL7 table 0004"),
        allowed: &["E", "I", "O", "P"],
    },
    FieldSpec {
        path: "encounter.location",
        message_types: ADT,
        locator: "PV1.3",
        data_type: "PL",
        description: "Assigned patient location",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "encounter.admit_time",
        message_types: ADT,
        locator: "PV1.44",
        data_type: "TS",
        description: "Admit date/time",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "observation.code",
        message_types: ORU,
        locator: "OBX.3.1",
        data_type: "CE",
        description: "Observation identifier code",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "observation.value",
        message_types: ORU,
        locator: "OBX.5",
        data_type: "ST",
        description: "Observation value",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "observation.units",
        message_types: ORU,
        locator: "OBX.6.1",
        data_type: "CE",
        description: "Observation units",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "observation.time",
        message_types: ORU,
        locator: "OBX.14",
        data_type: "TS",
        description: "Date/time of the observation",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.code",
        message_types: RDE,
        locator: "RXE.2.1",
        data_type: "CE",
        description: "Give code (medication identifier)",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.name",
        message_types: RDE,
        locator: "RXE.2.2",
        data_type: "CE",
        description: "Give code text (medication name)",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.dose",
        message_types: RDE,
        locator: "RXE.3",
        data_type: "NM",
        description: "Give amount, minimum",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.quantity",
        message_types: RDE,
        locator: "RXE.10",
        data_type: "NM",
        description: "Dispense amount",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "prescriber.id",
        message_types: RDE,
        locator: "ORC.12.1",
        data_type: "XCN",
        description: "Ordering provider identifier",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "prescriber.family_name",
        message_types: RDE,
        locator: "ORC.12.2",
        data_type: "XCN",
        description: "Ordering provider family name",
        coding_table: None,
        allowed: &[],
    },
];

/// Field path plugin for segment-based HL7 v2.3 messages.
pub struct Hl7v2Plugin;

impl Hl7v2Plugin {
    pub fn new() -> Self {
        Self
    }

    fn spec(&self, path: &SemanticPath, message_type: &str) -> Option<&'static FieldSpec> {
        DICTIONARY
            .iter()
            .find(|s| s.path == path.as_str() && s.applies_to(message_type))
    }
}

impl Default for Hl7v2Plugin {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldPathPlugin for Hl7v2Plugin {
    fn standard(&self) -> &str {
        STANDARD
    }

    fn display_name(&self) -> &str {
        "HL7 v2.3"
    }

    fn resolve(&self, path: &SemanticPath, message_type: &str) -> Option<FieldLocation> {
        self.spec(path, message_type).map(|s| s.location(STANDARD))
    }

    fn list_paths(&self, message_type: &str) -> BTreeMap<SemanticPath, String> {
        DICTIONARY
            .iter()
            .filter(|s| s.applies_to(message_type))
            .map(|s| {
                let path = SemanticPath::parse(s.path).expect("dictionary paths are canonical");
                (path, format!("{} ({})", s.description, s.locator))
            })
            .collect()
    }

    fn validate_value(&self, path: &SemanticPath, value: &str, message_type: &str) -> ValueOutcome {
        match self.spec(path, message_type) {
            Some(spec) => check_value(spec, value, DateShape::Compact),
            None => ValueOutcome::invalid(format!(
                "no {STANDARD} mapping for '{path}' in message type '{message_type}'"
            )),
        }
    }

    fn detect(&self, message: &str) -> bool {
        message.trim_start().starts_with("MSH|")
    }

    fn detect_message_type(&self, message: &str) -> Option<String> {
        let trigger = read_field(message, "MSH", 9, None)?;
        let mt = match trigger.as_str() {
            "ADT^A01" | "ADT^A04" => "ADT_ADMIT",
            "ADT^A03" => "ADT_DISCHARGE",
            "ORU^R01" => "ORU_RESULT",
            "RDE^O01" | "RDE^O11" => "RDE_ORDER",
            _ => return None,
        };
        Some(mt.to_owned())
    }

    fn extract(&self, message: &str, location: &FieldLocation) -> Option<String> {
        let (segment, field, component) = parse_locator(&location.locator)?;
        read_field(message, segment, field, component).filter(|v| !v.is_empty())
    }

    fn apply(
        &self,
        message: &str,
        location: &FieldLocation,
        value: &str,
    ) -> Result<String, ApplyError> {
        let (segment, field, component) = parse_locator(&location.locator)
            .ok_or_else(|| ApplyError::UnsupportedLocator(location.locator.clone()))?;
        write_field(message, segment, field, component, value)
    }
}

/// Parses `SEG.field[.component]` into its parts. Field and component are
/// 1-based as written in the standard.
fn parse_locator(locator: &str) -> Option<(&str, usize, Option<usize>)> {
    let mut parts = locator.split('.');
    let segment = parts.next().filter(|s| !s.is_empty())?;
    let field = parts.next()?.parse::<usize>().ok().filter(|f| *f > 0)?;
    let component = match parts.next() {
        Some(c) => Some(c.parse::<usize>().ok().filter(|c| *c > 0)?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((segment, field, component))
}

fn segment_lines(message: &str) -> impl Iterator<Item = &str> {
    message
        .split(['\r', '\n'])
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
}

/// Split index of `field` within a raw segment line. `MSH.1` is the field
/// separator itself, shifting every MSH index down by one.
fn field_index(segment: &str, field: usize) -> usize {
    if segment == "MSH" {
        field - 1
    } else {
        field
    }
}

fn read_field(message: &str, segment: &str, field: usize, component: Option<usize>) -> Option<String> {
    let line = segment_lines(message).find(|l| {
        l.split('|').next().is_some_and(|id| id == segment)
    })?;
    let idx = field_index(segment, field);
    let raw = line.split('|').nth(idx)?;
    match component {
        None => Some(raw.to_owned()),
        Some(c) => raw.split('^').nth(c - 1).map(str::to_owned),
    }
}

fn write_field(
    message: &str,
    segment: &str,
    field: usize,
    component: Option<usize>,
    value: &str,
) -> Result<String, ApplyError> {
    let mut found = false;
    let lines: Vec<String> = segment_lines(message)
        .map(|line| {
            let id = line.split('|').next().unwrap_or("");
            if id != segment || found {
                return line.to_owned();
            }
            found = true;

            let mut fields: Vec<String> = line.split('|').map(str::to_owned).collect();
            let idx = field_index(segment, field);
            while fields.len() <= idx {
                fields.push(String::new());
            }

            match component {
                None => fields[idx] = value.to_owned(),
                Some(c) => {
                    let mut comps: Vec<String> =
                        fields[idx].split('^').map(str::to_owned).collect();
                    while comps.len() < c {
                        comps.push(String::new());
                    }
                    comps[c - 1] = value.to_owned();
                    fields[idx] = comps.join("^");
                }
            }

            fields.join("|")
        })
        .collect();

    if !found {
        return Err(ApplyError::MalformedMessage {
            standard: STANDARD.to_owned(),
            detail: format!("message has no {segment} segment"),
        });
    }

    Ok(lines.join("\r"))
}
