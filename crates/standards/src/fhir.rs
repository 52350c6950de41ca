//! Resource-based FHIR R4 field path plugin.
//!
//! Locators are resource-relative element paths, e.g.
//! `Patient.identifier[0].value` or `Encounter.period.start`. The first
//! segment names the resource type; field access accepts either a bare
//! resource of that type or a `Bundle` containing one (the first matching
//! entry wins). Traversal is plain JSON navigation via `serde_json`; schema
//! validation of whole resources belongs to the message model outside this
//! seam.

use crate::{check_value, DateShape, FieldLocation, FieldPathPlugin, FieldSpec, ValueOutcome};
use crate::ApplyError;
use plover_types::SemanticPath;
use serde_json::Value;
use std::collections::BTreeMap;

const STANDARD: &str = "fhir-r4";

const ADT: &[&str] = &["ADT_ADMIT", "ADT_DISCHARGE"];
const ALL: &[&str] = &["ADT_ADMIT", "ADT_DISCHARGE", "ORU_RESULT", "RDE_ORDER"];
const ORU: &[&str] = &["ORU_RESULT"];
const RDE: &[&str] = &["RDE_ORDER"];

const DICTIONARY: &[FieldSpec] = &[
    FieldSpec {
        path: "patient.mrn",
        message_types: ALL,
        locator: "Patient.identifier[0].value",
        data_type: "string",
        description: "Patient identifier value (medical record number)",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.family_name",
        message_types: ALL,
        locator: "Patient.name[0].family",
        data_type: "string",
        description: "Patient family name",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.given_name",
        message_types: ALL,
        locator: "Patient.name[0].given[0]",
        data_type: "string",
        description: "Patient given name",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.dob",
        message_types: ALL,
        locator: "Patient.birthDate",
        data_type: "date",
        description: "Patient date of birth",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.sex",
        message_types: ALL,
        locator: "Patient.gender",
        data_type: "code",
        description: "Administrative gender",
        coding_table: Some("administrative-gender"),
        allowed: &["female", "male", "other", "unknown"],
    },
    FieldSpec {
        path: "patient.address.city",
        message_types: ALL,
        locator: "Patient.address[0].city",
        data_type: "string",
        description: "Patient address: city",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.phone",
        message_types: ALL,
        locator: "Patient.telecom[0].value",
        data_type: "string",
        description: "Patient contact value (phone)",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "encounter.class",
        message_types: ADT,
        locator: "Encounter.class.code",
        data_type: "code",
        description: "Encounter class",
        coding_table: Some("v3-ActEncounterCode"),
        allowed: &["AMB", "EMER", "IMP", "PRENC"],
    },
    FieldSpec {
        path: "encounter.location",
        message_types: ADT,
        locator: "Encounter.location[0].location.display",
        data_type: "string",
        description: "Encounter location display name",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "encounter.admit_time",
        message_types: ADT,
        locator: "Encounter.period.start",
        data_type: "dateTime",
        description: "Encounter period start",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "observation.code",
        message_types: ORU,
        locator: "Observation.code.coding[0].code",
        data_type: "code",
        description: "Observation code",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "observation.value",
        message_types: ORU,
        locator: "Observation.valueQuantity.value",
        data_type: "decimal",
        description: "Observation value",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "observation.units",
        message_types: ORU,
        locator: "Observation.valueQuantity.unit",
        data_type: "string",
        description: "Observation units",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "observation.time",
        message_types: ORU,
        locator: "Observation.effectiveDateTime",
        data_type: "dateTime",
        description: "Clinically relevant time of the observation",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.code",
        message_types: RDE,
        locator: "MedicationRequest.medicationCodeableConcept.coding[0].code",
        data_type: "code",
        description: "Medication code",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.name",
        message_types: RDE,
        locator: "MedicationRequest.medicationCodeableConcept.text",
        data_type: "string",
        description: "Medication display text",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.dose",
        message_types: RDE,
        locator: "MedicationRequest.dosageInstruction[0].text",
        data_type: "string",
        description: "Dosage instruction text",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.quantity",
        message_types: RDE,
        locator: "MedicationRequest.dispenseRequest.quantity.value",
        data_type: "decimal",
        description: "Dispense quantity",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "prescriber.id",
        message_types: RDE,
        locator: "MedicationRequest.requester.identifier.value",
        data_type: "string",
        description: "Requesting provider identifier",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "prescriber.family_name",
        message_types: RDE,
        locator: "MedicationRequest.requester.display",
        data_type: "string",
        description: "Requesting provider display name",
        coding_table: None,
        allowed: &[],
    },
];

/// Field path plugin for resource-based FHIR R4 messages.
pub struct FhirPlugin;

impl FhirPlugin {
    pub fn new() -> Self {
        Self
    }

    fn spec(&self, path: &SemanticPath, message_type: &str) -> Option<&'static FieldSpec> {
        DICTIONARY
            .iter()
            .find(|s| s.path == path.as_str() && s.applies_to(message_type))
    }
}

impl Default for FhirPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldPathPlugin for FhirPlugin {
    fn standard(&self) -> &str {
        STANDARD
    }

    fn display_name(&self) -> &str {
        "FHIR R4"
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
            Some(spec) => check_value(spec, value, DateShape::Iso),
            None => ValueOutcome::invalid(format!(
                "no {STANDARD} mapping for '{path}' in message type '{message_type}'"
            )),
        }
    }

    fn detect(&self, message: &str) -> bool {
        let trimmed = message.trim_start();
        trimmed.starts_with('{')
            && serde_json::from_str::<Value>(trimmed)
                .map(|v| v.get("resourceType").is_some())
                .unwrap_or(false)
    }

    fn detect_message_type(&self, message: &str) -> Option<String> {
        let root: Value = serde_json::from_str(message).ok()?;
        let resource_type = primary_resource_type(&root)?;
        let mt = match resource_type.as_str() {
            "Encounter" | "Patient" => "ADT_ADMIT",
            "Observation" | "DiagnosticReport" => "ORU_RESULT",
            "MedicationRequest" => "RDE_ORDER",
            _ => return None,
        };
        Some(mt.to_owned())
    }

    fn extract(&self, message: &str, location: &FieldLocation) -> Option<String> {
        let root: Value = serde_json::from_str(message).ok()?;
        let (resource_type, steps) = parse_locator(&location.locator)?;
        let resource = find_resource(&root, &resource_type)?;
        let value = steps
            .iter()
            .try_fold(resource, |node, step| step.get(node))?;
        scalar_to_string(value)
    }

    fn apply(
        &self,
        message: &str,
        location: &FieldLocation,
        value: &str,
    ) -> Result<String, ApplyError> {
        let mut root: Value = serde_json::from_str(message).map_err(|e| {
            ApplyError::MalformedMessage {
                standard: STANDARD.to_owned(),
                detail: e.to_string(),
            }
        })?;

        let (resource_type, steps) = parse_locator(&location.locator)
            .ok_or_else(|| ApplyError::UnsupportedLocator(location.locator.clone()))?;

        {
            let resource =
                find_resource_mut(&mut root, &resource_type).ok_or_else(|| {
                    ApplyError::MalformedMessage {
                        standard: STANDARD.to_owned(),
                        detail: format!("message contains no {resource_type} resource"),
                    }
                })?;

            let mut slot = resource;
            for step in &steps {
                slot = step.get_or_insert(slot);
            }
            let replacement = value_for_slot(slot, value);
            *slot = replacement;
        }

        serde_json::to_string_pretty(&root).map_err(|e| ApplyError::MalformedMessage {
            standard: STANDARD.to_owned(),
            detail: e.to_string(),
        })
    }
}

/// One traversal step: an object key with an optional array index.
struct Step {
    key: String,
    index: Option<usize>,
}

impl Step {
    fn get<'a>(&self, node: &'a Value) -> Option<&'a Value> {
        let child = node.get(&self.key)?;
        match self.index {
            None => Some(child),
            Some(i) => child.get(i),
        }
    }

    /// Navigates to this step's slot, materialising missing objects and
    /// padding missing array elements with `null` so generation can write
    /// into skeleton messages.
    fn get_or_insert<'a>(&self, node: &'a mut Value) -> &'a mut Value {
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        let map = node.as_object_mut().expect("node coerced to object");
        let child = map
            .entry(self.key.clone())
            .or_insert(Value::Null);

        match self.index {
            None => child,
            Some(i) => {
                if !child.is_array() {
                    *child = Value::Array(Vec::new());
                }
                let arr = child.as_array_mut().expect("child coerced to array");
                while arr.len() <= i {
                    arr.push(Value::Null);
                }
                &mut arr[i]
            }
        }
    }
}

/// Parses `ResourceType.a[0].b.c[1]` into the type and traversal steps.
fn parse_locator(locator: &str) -> Option<(String, Vec<Step>)> {
    let mut parts = locator.split('.');
    let resource_type = parts.next().filter(|s| !s.is_empty())?.to_owned();

    let mut steps = Vec::new();
    for part in parts {
        let (key, index) = match part.split_once('[') {
            None => (part, None),
            Some((key, rest)) => {
                let idx = rest.strip_suffix(']')?.parse::<usize>().ok()?;
                (key, Some(idx))
            }
        };
        if key.is_empty() {
            return None;
        }
        steps.push(Step {
            key: key.to_owned(),
            index,
        });
    }

    if steps.is_empty() {
        return None;
    }
    Some((resource_type, steps))
}

fn resource_type_of(node: &Value) -> Option<&str> {
    node.get("resourceType").and_then(Value::as_str)
}

/// Resource type that best characterises the message: the root resource, or
/// the first non-Patient entry of a Bundle (a Bundle of Patient + Encounter
/// is an encounter message, not a patient message).
fn primary_resource_type(root: &Value) -> Option<String> {
    let root_type = resource_type_of(root)?;
    if root_type != "Bundle" {
        return Some(root_type.to_owned());
    }
    let entries = root.get("entry")?.as_array()?;
    let mut first = None;
    for entry in entries {
        if let Some(rt) = entry.get("resource").and_then(resource_type_of) {
            if first.is_none() {
                first = Some(rt.to_owned());
            }
            if rt != "Patient" {
                return Some(rt.to_owned());
            }
        }
    }
    first
}

fn find_resource<'a>(root: &'a Value, resource_type: &str) -> Option<&'a Value> {
    if resource_type_of(root) == Some(resource_type) {
        return Some(root);
    }
    if resource_type_of(root) == Some("Bundle") {
        return root.get("entry")?.as_array()?.iter().find_map(|entry| {
            let resource = entry.get("resource")?;
            (resource_type_of(resource) == Some(resource_type)).then_some(resource)
        });
    }
    None
}

fn find_resource_mut<'a>(root: &'a mut Value, resource_type: &str) -> Option<&'a mut Value> {
    if resource_type_of(root) == Some(resource_type) {
        return Some(root);
    }
    if resource_type_of(root) == Some("Bundle") {
        return root
            .get_mut("entry")?
            .as_array_mut()?
            .iter_mut()
            .find_map(|entry| {
                let resource = entry.get_mut("resource")?;
                (resource_type_of(resource) == Some(resource_type)).then_some(resource)
            });
    }
    None
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Preserves the JSON type of the slot being overwritten: numeric slots stay
/// numeric when the new value parses as a number.
fn value_for_slot(slot: &Value, value: &str) -> Value {
    if slot.is_number() {
        if let Ok(n) = value.parse::<f64>() {
            if let Some(num) = serde_json::Number::from_f64(n) {
                return Value::Number(num);
            }
        }
    }
    Value::String(value.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATIENT: &str = r#"{
        "resourceType": "Patient",
        "identifier": [{"system": "urn:mrn", "value": "REG123456"}],
        "name": [{"family": "Smith", "given": ["John", "Quincy"]}],
        "birthDate": "1957-08-07",
        "gender": "male"
    }"#;

    const BUNDLE: &str = r#"{
        "resourceType": "Bundle",
        "type": "message",
        "entry": [
            {"resource": {"resourceType": "Patient",
                          "identifier": [{"value": "REG123456"}]}},
            {"resource": {"resourceType": "Observation",
                          "code": {"coding": [{"code": "2345-7"}]},
                          "valueQuantity": {"value": 98, "unit": "mg/dL"}}}
        ]
    }"#;

    fn plugin() -> FhirPlugin {
        FhirPlugin::new()
    }

    fn path(p: &str) -> SemanticPath {
        SemanticPath::parse(p).unwrap()
    }

    #[test]
    fn resolves_mrn_to_identifier_value() {
        let loc = plugin().resolve(&path("patient.mrn"), "ADT_ADMIT").unwrap();
        assert_eq!(loc.locator, "Patient.identifier[0].value");
    }

    #[test]
    fn detects_fhir_and_message_types() {
        let p = plugin();
        assert!(p.detect(PATIENT));
        assert!(!p.detect("MSH|^~\\&|..."));
        assert_eq!(p.detect_message_type(PATIENT).as_deref(), Some("ADT_ADMIT"));
        assert_eq!(p.detect_message_type(BUNDLE).as_deref(), Some("ORU_RESULT"));
    }

    #[test]
    fn extracts_from_bare_resource() {
        let p = plugin();
        let mrn = p.resolve(&path("patient.mrn"), "ADT_ADMIT").unwrap();
        assert_eq!(p.extract(PATIENT, &mrn).as_deref(), Some("REG123456"));

        let given = p.resolve(&path("patient.given_name"), "ADT_ADMIT").unwrap();
        assert_eq!(p.extract(PATIENT, &given).as_deref(), Some("John"));
    }

    #[test]
    fn extracts_from_bundle_entries() {
        let p = plugin();
        let mrn = p.resolve(&path("patient.mrn"), "ORU_RESULT").unwrap();
        assert_eq!(p.extract(BUNDLE, &mrn).as_deref(), Some("REG123456"));

        let value = p.resolve(&path("observation.value"), "ORU_RESULT").unwrap();
        assert_eq!(p.extract(BUNDLE, &value).as_deref(), Some("98"));
    }

    #[test]
    fn apply_replaces_value_preserving_number_type() {
        let p = plugin();
        let value = p.resolve(&path("observation.value"), "ORU_RESULT").unwrap();
        let rewritten = p.apply(BUNDLE, &value, "101.5").unwrap();

        let root: Value = serde_json::from_str(&rewritten).unwrap();
        let obs = find_resource(&root, "Observation").unwrap();
        assert!(obs["valueQuantity"]["value"].is_number());
        assert_eq!(p.extract(&rewritten, &value).as_deref(), Some("101.5"));
    }

    #[test]
    fn apply_materialises_missing_elements() {
        let p = plugin();
        let city = p.resolve(&path("patient.address.city"), "ADT_ADMIT").unwrap();
        let rewritten = p.apply(PATIENT, &city, "Springfield").unwrap();
        assert_eq!(p.extract(&rewritten, &city).as_deref(), Some("Springfield"));
    }

    #[test]
    fn apply_to_wrong_resource_is_malformed() {
        let p = plugin();
        let admit = p.resolve(&path("encounter.admit_time"), "ADT_ADMIT").unwrap();
        let err = p.apply(PATIENT, &admit, "2024-01-02T03:00:00Z").unwrap_err();
        assert!(matches!(err, ApplyError::MalformedMessage { .. }));
    }

    #[test]
    fn validates_gender_codes() {
        let p = plugin();
        assert!(p.validate_value(&path("patient.sex"), "female", "ADT_ADMIT").valid);
        let outcome = p.validate_value(&path("patient.sex"), "F", "ADT_ADMIT");
        assert!(!outcome.valid);
        assert!(outcome.allowed_values.contains(&"female".to_string()));
    }

    #[test]
    fn validates_iso_dates() {
        let p = plugin();
        assert!(p.validate_value(&path("patient.dob"), "1957-08-07", "ADT_ADMIT").valid);
        assert!(!p.validate_value(&path("patient.dob"), "19570807", "ADT_ADMIT").valid);
    }
}
