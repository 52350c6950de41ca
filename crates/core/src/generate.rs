//! Applying a lock session to a carrier message.
//!
//! This is the generation half of the data flow: each locked
//! (semantic path → value) pair is resolved to a concrete field location
//! for the target standard, validated against the field's constraints, and
//! written through the plugin's field-access seam. Building the carrier
//! message itself belongs to the per-standard collaborator; this module
//! only guarantees that whatever messages are generated from the same
//! session agree on every locked value.

use crate::error::{CoreError, CoreResult};
use crate::resolver::PathResolver;
use crate::session::LockSession;
use plover_standards::FieldPathPlugin;

/// Writes every applicable locked value of `session` into `message`.
///
/// Paths that do not resolve for this message type are skipped — one
/// session spans multiple message types, and a locked `observation.value`
/// has no business inside an admission message. Paths outside the session's
/// scope (standard or path prefix) are skipped likewise.
///
/// # Errors
///
/// `UnknownStandard` for an unregistered standard, `InvalidValue` when a
/// locked value fails the field's type or coding-table check, and an apply
/// error when the carrier message cannot hold the field.
pub fn apply_session(
    resolver: &PathResolver,
    session: &LockSession,
    message: &str,
    message_type: &str,
    standard: Option<&str>,
) -> CoreResult<String> {
    let plugin = match standard {
        Some(s) => resolver.plugin(s)?,
        None => resolver.plugin(resolver.default_standard())?,
    };
    let standard_name = plugin.standard().to_owned();

    if !session.scope.admits_standard(&standard_name) {
        tracing::debug!(
            session = %session.name,
            standard = standard_name,
            "session scope excludes this standard; message left unchanged"
        );
        return Ok(message.to_owned());
    }

    let mut current = message.to_owned();
    for (path, locked) in &session.values {
        if !session.scope.admits_path(path) {
            continue;
        }
        let Some(location) = plugin.resolve(path, message_type) else {
            continue;
        };

        let outcome = plugin.validate_value(path, &locked.value, message_type);
        if !outcome.valid {
            return Err(CoreError::InvalidValue {
                path: path.clone(),
                standard: standard_name,
                reason: outcome
                    .message
                    .unwrap_or_else(|| "value rejected by field constraints".into()),
                allowed: outcome.allowed_values,
            });
        }

        current = plugin.apply(&current, &location, &locked.value)?;
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::session::{SessionScope, SessionStore};
    use plover_standards::default_plugins;
    use plover_store::MemoryStore;
    use plover_types::{SemanticPath, SessionName};

    const ADMIT_SKELETON: &str = "MSH|^~\\&|REG|FAC|LAB|FAC|20240102030405||ADT^A01|MSG0001|P|2.3\r\
        PID|1\r\
        PV1|1|I";

    const RESULT_SKELETON: &str = "MSH|^~\\&|LAB|FAC|EHR|FAC|20240102040000||ORU^R01|MSG0002|P|2.3\r\
        PID|1\r\
        OBX|1|NM|2345-7^GLUCOSE^LN";

    fn resolver() -> PathResolver {
        PathResolver::with_plugins("hl7v23", default_plugins())
    }

    fn path(p: &str) -> SemanticPath {
        SemanticPath::parse(p).unwrap()
    }

    fn demo_session(values: &[(&str, &str)]) -> LockSession {
        let store = SessionStore::new(Box::new(MemoryStore::new()), None);
        let cancel = CancelToken::new();
        let name = SessionName::parse("demo").unwrap();
        store
            .create(&name, SessionScope::unrestricted(), None, false, &cancel)
            .unwrap();
        for (p, v) in values {
            store.set_value(&name, &path(p), *v, None, &cancel).unwrap();
        }
        store.get(&name).unwrap()
    }

    #[test]
    fn locked_value_lands_at_resolved_location() {
        let resolver = resolver();
        let session = demo_session(&[("patient.mrn", "TEST123")]);

        let generated =
            apply_session(&resolver, &session, ADMIT_SKELETON, "ADT_ADMIT", None).unwrap();
        let plugin = resolver.plugin("hl7v23").unwrap();
        let loc = plugin.resolve(&path("patient.mrn"), "ADT_ADMIT").unwrap();
        assert_eq!(loc.locator, "PID.3");
        assert_eq!(plugin.extract(&generated, &loc).as_deref(), Some("TEST123"));
    }

    #[test]
    fn two_message_types_from_one_session_share_values() {
        let resolver = resolver();
        let session = demo_session(&[
            ("patient.mrn", "TEST123"),
            ("patient.family_name", "DOE"),
            ("observation.value", "120"),
        ]);

        let admission =
            apply_session(&resolver, &session, ADMIT_SKELETON, "ADT_ADMIT", None).unwrap();
        let lab =
            apply_session(&resolver, &session, RESULT_SKELETON, "ORU_RESULT", None).unwrap();

        assert!(admission.contains("TEST123"));
        assert!(lab.contains("TEST123"));
        assert!(admission.contains("DOE"));
        assert!(lab.contains("DOE"));
        // observation.value only resolves for the result message.
        assert!(!admission.contains("|120"));
        assert!(lab.contains("|120"));
    }

    #[test]
    fn same_session_agrees_across_standards() {
        let resolver = resolver();
        let session = demo_session(&[("patient.mrn", "TEST123")]);

        let v2 = apply_session(&resolver, &session, ADMIT_SKELETON, "ADT_ADMIT", None).unwrap();
        let fhir = apply_session(
            &resolver,
            &session,
            r#"{"resourceType": "Patient"}"#,
            "ADT_ADMIT",
            Some("fhir-r4"),
        )
        .unwrap();

        assert!(v2.contains("TEST123"));
        assert!(fhir.contains("TEST123"));
    }

    #[test]
    fn invalid_locked_value_is_rejected_at_application() {
        let resolver = resolver();
        let session = demo_session(&[("patient.sex", "banana")]);

        let err = apply_session(&resolver, &session, ADMIT_SKELETON, "ADT_ADMIT", None)
            .unwrap_err();
        match err {
            CoreError::InvalidValue { allowed, .. } => {
                assert_eq!(allowed, vec!["F", "M", "O", "U"]);
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn out_of_scope_standard_leaves_message_unchanged() {
        let resolver = resolver();
        let mut session = demo_session(&[("patient.mrn", "TEST123")]);
        session.scope = SessionScope {
            standards: vec!["fhir-r4".into()],
            path_prefixes: vec![],
        };

        let unchanged =
            apply_session(&resolver, &session, ADMIT_SKELETON, "ADT_ADMIT", None).unwrap();
        assert_eq!(unchanged, ADMIT_SKELETON);
    }

    #[test]
    fn out_of_scope_paths_are_skipped() {
        let resolver = resolver();
        let mut session = demo_session(&[
            ("patient.mrn", "TEST123"),
            ("encounter.location", "WARD9"),
        ]);
        session.scope = SessionScope {
            standards: vec![],
            path_prefixes: vec!["patient".into()],
        };

        let generated =
            apply_session(&resolver, &session, ADMIT_SKELETON, "ADT_ADMIT", None).unwrap();
        assert!(generated.contains("TEST123"));
        assert!(!generated.contains("WARD9"));
    }
}
