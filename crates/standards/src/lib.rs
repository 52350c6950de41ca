//! Per-standard field path plugins.
//!
//! A semantic path such as `patient.mrn` means nothing on its own; each wire
//! standard stores the concept somewhere different (`PID.3` in a v2 segment
//! message, `Patient.identifier[0].value` in a FHIR resource, `PTT.5` in a
//! pharmacy script). This crate defines the capability interface the
//! resolver dispatches through — [`FieldPathPlugin`] — and ships one
//! reference plugin per supported standard:
//!
//! - [`hl7v2::Hl7v2Plugin`] — segment-based HL7 v2.3 (`hl7v23`)
//! - [`fhir::FhirPlugin`] — resource-based FHIR R4 (`fhir-r4`)
//! - [`script::ScriptPlugin`] — EDIFACT-style pharmacy script (`script10`)
//!
//! Plugins own *all* standard-specific knowledge: the path dictionary per
//! message type, field data types and coding tables, and the minimal
//! field-access seam (`extract`/`apply`) the de-identification and
//! generation flows write through. Full wire-format parsing and
//! serialization stay out of scope; the seam touches only the fields it is
//! pointed at and leaves the rest of the message byte-for-byte alone.

pub mod fhir;
pub mod hl7v2;
pub mod script;

use plover_types::SemanticPath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Errors surfaced when a plugin cannot write through a field location.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The carrier message does not parse far enough to locate the field
    #[error("malformed {standard} message: {detail}")]
    MalformedMessage { standard: String, detail: String },

    /// The locator does not address a field this plugin can reach
    #[error("unsupported field locator '{0}'")]
    UnsupportedLocator(String),
}

/// The concrete, standard-specific place a semantic path resolves to.
///
/// Produced fresh on every resolution call; locations are never cached
/// across plugin versions because the same semantic path may resolve
/// differently per standard version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLocation {
    /// Registry name of the standard that produced this location
    pub standard: String,
    /// Standard-specific locator, e.g. `PID.3.1` or `Patient.birthDate`
    pub locator: String,
    /// Field data type in the standard's own vocabulary
    pub data_type: String,
    /// Human description of the field
    pub description: String,
    /// Coding-table reference, if the field is coded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coding_table: Option<String>,
    /// Allowed values for coded fields; empty when the field is free-form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
}

/// Outcome of validating a candidate value against a field's constraints.
///
/// This is data, not an error: an invalid value is an expected result the
/// caller renders to the user, together with the allowed-value set and any
/// suggested corrections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
}

impl ValueOutcome {
    /// A passing outcome.
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: None,
            suggestions: Vec::new(),
            allowed_values: Vec::new(),
        }
    }

    /// A failing outcome with a reason.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
            suggestions: Vec::new(),
            allowed_values: Vec::new(),
        }
    }

    fn with_allowed(mut self, allowed: &[&str]) -> Self {
        self.allowed_values = allowed.iter().map(|s| s.to_string()).collect();
        self.suggestions = self.allowed_values.clone();
        self
    }
}

/// Capability interface implemented once per supported standard.
///
/// The resolver depends only on this trait and dispatches through a lookup
/// table keyed by [`standard`](FieldPathPlugin::standard); adding a new
/// standard never touches the resolver.
pub trait FieldPathPlugin {
    /// Registry name, e.g. `hl7v23`. Lowercase, stable.
    fn standard(&self) -> &str;

    /// Human-readable standard name for help output.
    fn display_name(&self) -> &str;

    /// Resolves a semantic path for one message type, if this plugin maps it.
    fn resolve(&self, path: &SemanticPath, message_type: &str) -> Option<FieldLocation>;

    /// Everything this plugin knows for a message type: path → description.
    fn list_paths(&self, message_type: &str) -> BTreeMap<SemanticPath, String>;

    /// Validates a candidate value against the field's type and coding table.
    ///
    /// An unknown path yields an invalid outcome rather than an error; the
    /// resolver layers its own `UnresolvablePath` reporting on top.
    fn validate_value(&self, path: &SemanticPath, value: &str, message_type: &str) -> ValueOutcome;

    /// Returns true if `message` looks like this plugin's wire format.
    fn detect(&self, message: &str) -> bool;

    /// Best-effort message-type detection for a raw message.
    fn detect_message_type(&self, message: &str) -> Option<String>;

    /// Reads the value at `location` from a raw message, if present.
    fn extract(&self, message: &str, location: &FieldLocation) -> Option<String>;

    /// Writes `value` through `location`, returning the re-serialized message.
    fn apply(&self, message: &str, location: &FieldLocation, value: &str)
        -> Result<String, ApplyError>;
}

/// All reference plugins, boxed for registry construction.
pub fn default_plugins() -> Vec<Box<dyn FieldPathPlugin>> {
    vec![
        Box::new(hl7v2::Hl7v2Plugin::new()),
        Box::new(fhir::FhirPlugin::new()),
        Box::new(script::ScriptPlugin::new()),
    ]
}

/// Static dictionary row describing one semantic path within one standard.
///
/// Plugins keep their whole mapping as a table of these; resolution is a
/// linear scan, which is fine at dictionary sizes (tens of entries).
pub(crate) struct FieldSpec {
    pub path: &'static str,
    pub message_types: &'static [&'static str],
    pub locator: &'static str,
    pub data_type: &'static str,
    pub description: &'static str,
    pub coding_table: Option<&'static str>,
    pub allowed: &'static [&'static str],
}

impl FieldSpec {
    pub(crate) fn location(&self, standard: &str) -> FieldLocation {
        FieldLocation {
            standard: standard.to_owned(),
            locator: self.locator.to_owned(),
            data_type: self.data_type.to_owned(),
            description: self.description.to_owned(),
            coding_table: self.coding_table.map(str::to_owned),
            allowed_values: self.allowed.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub(crate) fn applies_to(&self, message_type: &str) -> bool {
        self.message_types.iter().any(|mt| *mt == message_type)
    }
}

/// Shared value validation against a spec row's data type and coding table.
///
/// Data type vocabulary is per standard, but the checks overlap enough to
/// centralise: `date` expects the standard's date shape, `number` must parse
/// as a decimal, coded fields must be members of the allowed set.
pub(crate) fn check_value(spec: &FieldSpec, value: &str, date_shape: DateShape) -> ValueOutcome {
    if value.trim().is_empty() {
        return ValueOutcome::invalid("value cannot be empty");
    }

    if !spec.allowed.is_empty() {
        if spec.allowed.iter().any(|a| *a == value) {
            return ValueOutcome::ok();
        }
        let table = spec.coding_table.unwrap_or("coded field");
        return ValueOutcome::invalid(format!(
            "'{value}' is not a member of {table}"
        ))
        .with_allowed(spec.allowed);
    }

    match spec.data_type {
        "DT" | "date" => check_date(value, date_shape),
        "TS" | "dateTime" => check_timestamp(value, date_shape),
        "NM" | "decimal" => {
            if value.parse::<f64>().is_ok() {
                ValueOutcome::ok()
            } else {
                ValueOutcome::invalid(format!("'{value}' is not a number"))
            }
        }
        _ => ValueOutcome::ok(),
    }
}

/// Which textual date shape a standard carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DateShape {
    /// `YYYYMMDD`, optionally extended with `HHMMSS` for timestamps
    Compact,
    /// ISO 8601 `YYYY-MM-DD` / RFC 3339 date-times
    Iso,
}

fn check_date(value: &str, shape: DateShape) -> ValueOutcome {
    let ok = match shape {
        DateShape::Compact => value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()),
        DateShape::Iso => {
            let b = value.as_bytes();
            value.len() == 10
                && b[4] == b'-'
                && b[7] == b'-'
                && value
                    .bytes()
                    .enumerate()
                    .all(|(i, c)| matches!(i, 4 | 7) || c.is_ascii_digit())
        }
    };
    if ok {
        ValueOutcome::ok()
    } else {
        let sample = match shape {
            DateShape::Compact => "19700101",
            DateShape::Iso => "1970-01-01",
        };
        ValueOutcome::invalid(format!("'{value}' is not a date (expected e.g. {sample})"))
    }
}

fn check_timestamp(value: &str, shape: DateShape) -> ValueOutcome {
    let ok = match shape {
        DateShape::Compact => {
            value.len() >= 8
                && value.len() <= 14
                && value.len() % 2 == 0
                && value.bytes().all(|b| b.is_ascii_digit())
        }
        // Accept a date with an optional time suffix; full RFC 3339
        // validation belongs to the message model, not this seam.
        DateShape::Iso => {
            value.len() >= 10
                && value.is_char_boundary(10)
                && check_date(&value[..10], DateShape::Iso).valid
        }
    };
    if ok {
        ValueOutcome::ok()
    } else {
        let sample = match shape {
            DateShape::Compact => "19700101123000",
            DateShape::Iso => "1970-01-01T12:30:00Z",
        };
        ValueOutcome::invalid(format!(
            "'{value}' is not a timestamp (expected e.g. {sample})"
        ))
    }
}
