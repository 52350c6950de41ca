//! EDIFACT-style pharmacy script field path plugin.
//!
//! Pre-XML SCRIPT messages are EDIFACT-derived: segments terminated by `'`,
//! elements separated by `+`, components by `:`. Locators take the form
//! `SEG.element[.component]`, 1-based over the data elements (the segment
//! tag is element 0 of the split), e.g. `PTT.5` for the patient reference
//! number or `PTT.3.1` for the patient family name.
//!
//! As with the other plugins, escape handling and full envelope validation
//! belong to the message model; this seam only reads and rewrites the
//! fields it is pointed at.

use crate::{check_value, DateShape, FieldLocation, FieldPathPlugin, FieldSpec, ValueOutcome};
use crate::ApplyError;
use plover_types::SemanticPath;
use std::collections::BTreeMap;

const STANDARD: &str = "script10";

const ALL: &[&str] = &["SCRIPT_NEWRX", "SCRIPT_REFILL"];
const NEWRX: &[&str] = &["SCRIPT_NEWRX"];

const DICTIONARY: &[FieldSpec] = &[
    FieldSpec {
        path: "patient.mrn",
        message_types: ALL,
        locator: "PTT.5",
        data_type: "AN",
        description: "Patient reference number",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.dob",
        message_types: ALL,
        locator: "PTT.2",
        data_type: "DT",
        description: "Patient date of birth",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.family_name",
        message_types: ALL,
        locator: "PTT.3.1",
        data_type: "AN",
        description: "Patient family name",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.given_name",
        message_types: ALL,
        locator: "PTT.3.2",
        data_type: "AN",
        description: "Patient given name",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "patient.sex",
        message_types: ALL,
        locator: "PTT.4",
        data_type: "ID",
        description: "Patient gender code",
        coding_table: Some("SCRIPT gender"),
        allowed: &["F", "M", "U"],
    },
    FieldSpec {
        path: "prescriber.id",
        message_types: ALL,
        locator: "PVD.2",
        data_type: "AN",
        description: "Prescriber reference number",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "prescriber.family_name",
        message_types: ALL,
        locator: "PVD.3.1",
        data_type: "AN",
        description: "Prescriber family name",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "pharmacy.id",
        message_types: ALL,
        locator: "PVD.8",
        data_type: "AN",
        description: "Pharmacy reference number",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.name",
        message_types: NEWRX,
        locator: "DRU.2.1",
        data_type: "AN",
        description: "Drug description",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.code",
        message_types: NEWRX,
        locator: "DRU.2.3",
        data_type: "AN",
        description: "Drug product code",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.quantity",
        message_types: NEWRX,
        locator: "DRU.4",
        data_type: "NM",
        description: "Quantity dispensed",
        coding_table: None,
        allowed: &[],
    },
    FieldSpec {
        path: "medication.dose",
        message_types: NEWRX,
        locator: "DRU.5",
        data_type: "AN",
        description: "Directions (sig)",
        coding_table: None,
        allowed: &[],
    },
];

/// Field path plugin for EDIFACT-style pharmacy script messages.
pub struct ScriptPlugin;

impl ScriptPlugin {
    pub fn new() -> Self {
        Self
    }

    fn spec(&self, path: &SemanticPath, message_type: &str) -> Option<&'static FieldSpec> {
        DICTIONARY
            .iter()
            .find(|s| s.path == path.as_str() && s.applies_to(message_type))
    }
}

impl Default for ScriptPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldPathPlugin for ScriptPlugin {
    fn standard(&self) -> &str {
        STANDARD
    }

    fn display_name(&self) -> &str {
        "Pharmacy script 10.x"
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
        let trimmed = message.trim_start();
        trimmed.starts_with("UNA") || trimmed.starts_with("UIB+")
    }

    fn detect_message_type(&self, message: &str) -> Option<String> {
        // UIH carries the message function in its third data element,
        // e.g. UIH+SCRIPT+010+NEWRX+...
        let function = segments(message)
            .find(|s| s.starts_with("UIH"))
            .and_then(|uih| uih.split('+').nth(3).map(str::to_owned))?;
        let mt = match function.as_str() {
            "NEWRX" => "SCRIPT_NEWRX",
            "REFREQ" | "REFRES" => "SCRIPT_REFILL",
            _ => return None,
        };
        Some(mt.to_owned())
    }

    fn extract(&self, message: &str, location: &FieldLocation) -> Option<String> {
        let (tag, element, component) = parse_locator(&location.locator)?;
        let segment = segments(message).find(|s| tag_of(s) == tag)?;
        let raw = segment.split('+').nth(element)?;
        let value = match component {
            None => raw.to_owned(),
            Some(c) => raw.split(':').nth(c - 1)?.to_owned(),
        };
        (!value.is_empty()).then_some(value)
    }

    fn apply(
        &self,
        message: &str,
        location: &FieldLocation,
        value: &str,
    ) -> Result<String, ApplyError> {
        let (tag, element, component) = parse_locator(&location.locator)
            .ok_or_else(|| ApplyError::UnsupportedLocator(location.locator.clone()))?;

        let mut found = false;
        let rewritten: Vec<String> = segments(message)
            .map(|segment| {
                if tag_of(segment) != tag || found {
                    return segment.to_owned();
                }
                found = true;

                let mut elements: Vec<String> =
                    segment.split('+').map(str::to_owned).collect();
                while elements.len() <= element {
                    elements.push(String::new());
                }

                match component {
                    None => elements[element] = value.to_owned(),
                    Some(c) => {
                        let mut comps: Vec<String> =
                            elements[element].split(':').map(str::to_owned).collect();
                        while comps.len() < c {
                            comps.push(String::new());
                        }
                        comps[c - 1] = value.to_owned();
                        elements[element] = comps.join(":");
                    }
                }

                elements.join("+")
            })
            .collect();

        if !found {
            return Err(ApplyError::MalformedMessage {
                standard: STANDARD.to_owned(),
                detail: format!("message has no {tag} segment"),
            });
        }

        Ok(format!("{}'", rewritten.join("'")))
    }
}

fn segments(message: &str) -> impl Iterator<Item = &str> {
    message
        .split('\'')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn tag_of(segment: &str) -> &str {
    segment.split('+').next().unwrap_or("")
}

/// Parses `SEG.element[.component]`, element 1-based over data elements.
fn parse_locator(locator: &str) -> Option<(&str, usize, Option<usize>)> {
    let mut parts = locator.split('.');
    let tag = parts.next().filter(|s| !s.is_empty())?;
    let element = parts.next()?.parse::<usize>().ok().filter(|e| *e > 0)?;
    let component = match parts.next() {
        Some(c) => Some(c.parse::<usize>().ok().filter(|c| *c > 0)?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((tag, element, component))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEWRX_MSG: &str = "UNA:+./*'\
        UIB+UNOA:0++PLV1234'\
        UIH+SCRIPT+010+NEWRX+PLV1234'\
        PTT+1+19570807+SMITH:JOHN+M+REG123456'\
        PVD+P1+1992818+JONES:ALICE+++++PHARM42'\
        DRU+P+LIPITOR 10MG TAB::00071015523+ +30+TAKE 1 TABLET DAILY'\
        UIT+PLV1234+5'";

    fn plugin() -> ScriptPlugin {
        ScriptPlugin::new()
    }

    fn path(p: &str) -> SemanticPath {
        SemanticPath::parse(p).unwrap()
    }

    #[test]
    fn resolves_mrn_to_ptt_5() {
        let loc = plugin().resolve(&path("patient.mrn"), "SCRIPT_NEWRX").unwrap();
        assert_eq!(loc.locator, "PTT.5");
    }

    #[test]
    fn detects_script_and_message_type() {
        let p = plugin();
        assert!(p.detect(NEWRX_MSG));
        assert!(!p.detect("MSH|^~\\&|"));
        assert_eq!(
            p.detect_message_type(NEWRX_MSG).as_deref(),
            Some("SCRIPT_NEWRX")
        );
    }

    #[test]
    fn extracts_elements_and_components() {
        let p = plugin();
        let mrn = p.resolve(&path("patient.mrn"), "SCRIPT_NEWRX").unwrap();
        assert_eq!(p.extract(NEWRX_MSG, &mrn).as_deref(), Some("REG123456"));

        let family = p.resolve(&path("patient.family_name"), "SCRIPT_NEWRX").unwrap();
        assert_eq!(p.extract(NEWRX_MSG, &family).as_deref(), Some("SMITH"));

        let drug = p.resolve(&path("medication.name"), "SCRIPT_NEWRX").unwrap();
        assert_eq!(
            p.extract(NEWRX_MSG, &drug).as_deref(),
            Some("LIPITOR 10MG TAB")
        );
    }

    #[test]
    fn apply_rewrites_only_addressed_element() {
        let p = plugin();
        let mrn = p.resolve(&path("patient.mrn"), "SCRIPT_NEWRX").unwrap();
        let rewritten = p.apply(NEWRX_MSG, &mrn, "SYN000001").unwrap();

        assert_eq!(p.extract(&rewritten, &mrn).as_deref(), Some("SYN000001"));
        let family = p.resolve(&path("patient.family_name"), "SCRIPT_NEWRX").unwrap();
        assert_eq!(p.extract(&rewritten, &family).as_deref(), Some("SMITH"));
        assert!(rewritten.contains("UIH+SCRIPT+010+NEWRX"));
    }

    #[test]
    fn apply_into_component_preserves_siblings() {
        let p = plugin();
        let given = p.resolve(&path("patient.given_name"), "SCRIPT_NEWRX").unwrap();
        let rewritten = p.apply(NEWRX_MSG, &given, "JANE").unwrap();
        assert_eq!(p.extract(&rewritten, &given).as_deref(), Some("JANE"));

        let family = p.resolve(&path("patient.family_name"), "SCRIPT_NEWRX").unwrap();
        assert_eq!(p.extract(&rewritten, &family).as_deref(), Some("SMITH"));
    }

    #[test]
    fn apply_to_missing_segment_is_malformed() {
        let p = plugin();
        let drug = p.resolve(&path("medication.name"), "SCRIPT_NEWRX").unwrap();
        let err = p.apply("UNA:+./*'UIT+X+1'", &drug, "NEW").unwrap_err();
        assert!(matches!(err, ApplyError::MalformedMessage { .. }));
    }

    #[test]
    fn refill_paths_exclude_drug_segment() {
        let listed = plugin().list_paths("SCRIPT_REFILL");
        assert!(listed.contains_key(&path("patient.mrn")));
        assert!(!listed.contains_key(&path("medication.name")));
    }
}
