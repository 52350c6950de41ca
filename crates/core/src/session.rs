//! Lock sessions: named, persisted sets of semantic-path → value bindings.
//!
//! A lock session is what makes independently-invoked generation commands
//! agree: once `patient.mrn` is locked to `REG123456` in session `demo`,
//! every message generated against `demo` carries that MRN regardless of
//! message type or standard. Sessions are stored one document per session,
//! named after the session, in YAML.
//!
//! ## Lifecycle
//!
//! `Absent → Created → Active (mutated by set/remove value) →
//! Expired | Removed (terminal)`. There is no transition from a terminal
//! state back to active; callers re-create explicitly. TTL expiry is a
//! garbage-collection concern only: cleanup removes whole sessions and
//! never mutates a value.
//!
//! ## Concurrency
//!
//! Two processes may race on the same session file. Every mutation here is
//! an atomic read-modify-write: read current state, compute the new
//! document, hand it to the storage provider whose save is an atomic
//! replace. Readers never see a torn document; they see the state from just
//! before or just after a concurrent write.

use crate::cancel::CancelToken;
use crate::config::CoreConfig;
use crate::constants::DOCUMENT_EXT;
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use plover_store::{StorageProvider, StoreError};
use plover_types::{NonEmptyText, SemanticPath, SessionName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One locked value: what was chosen, why, and when it last changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NonEmptyText>,
    pub updated_at: DateTime<Utc>,
}

/// Which subset of standards and paths a session governs.
///
/// Empty lists mean unrestricted. Scope is enforced where values are
/// *applied* to messages; locking an out-of-scope value is allowed (the
/// session may be broadened later, and one session can span message types).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionScope {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub standards: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_prefixes: Vec<String>,
}

impl SessionScope {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn admits_standard(&self, standard: &str) -> bool {
        self.standards.is_empty()
            || self
                .standards
                .iter()
                .any(|s| s.eq_ignore_ascii_case(standard))
    }

    pub fn admits_path(&self, path: &SemanticPath) -> bool {
        self.path_prefixes.is_empty()
            || self.path_prefixes.iter().any(|prefix| {
                path.as_str() == prefix
                    || path
                        .as_str()
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('.'))
            })
    }
}

/// A named, persisted set of semantic-path → value bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSession {
    pub name: SessionName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<NonEmptyText>,
    #[serde(default)]
    pub scope: SessionScope,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub values: BTreeMap<SemanticPath, LockedValue>,
}

impl LockSession {
    /// True once `created_at + ttl` is in the past.
    pub fn is_expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.created_at + ttl <= now
    }
}

/// One row of `list`: enough to render a table without loading every value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub name: SessionName,
    pub description: Option<NonEmptyText>,
    pub created_at: DateTime<Utc>,
    pub value_count: usize,
}

/// Outcome of a cleanup pass: how many sessions were purged and which
/// entries could not be examined (and why).
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: usize,
    pub skipped: Vec<(String, String)>,
}

/// Session lifecycle and value locking over a [`StorageProvider`].
pub struct SessionStore {
    store: Box<dyn StorageProvider>,
    ttl: Option<chrono::Duration>,
}

impl SessionStore {
    pub fn new(store: Box<dyn StorageProvider>, ttl: Option<chrono::Duration>) -> Self {
        Self { store, ttl }
    }

    /// Store rooted at the configured sessions directory with the
    /// configured TTL.
    pub fn from_config(config: &CoreConfig) -> CoreResult<Self> {
        let store = plover_store::FileStore::open(&config.sessions_dir())?;
        Ok(Self::new(Box::new(store), config.session_ttl()))
    }

    fn key(name: &SessionName) -> String {
        format!("{name}.{DOCUMENT_EXT}")
    }

    fn encode(session: &LockSession) -> CoreResult<Vec<u8>> {
        serde_yaml::to_string(session)
            .map(String::into_bytes)
            .map_err(|e| CoreError::DocumentMalformed {
                format: "yaml".into(),
                detail: format!("failed to encode session '{}': {e}", session.name),
            })
    }

    fn decode(key: &str, bytes: &[u8]) -> CoreResult<LockSession> {
        let text = std::str::from_utf8(bytes).map_err(|e| CoreError::DocumentMalformed {
            format: "yaml".into(),
            detail: format!("session file '{key}' is not UTF-8: {e}"),
        })?;
        let de = serde_yaml::Deserializer::from_str(text);
        serde_path_to_error::deserialize(de).map_err(|e| CoreError::DocumentMalformed {
            format: "yaml".into(),
            detail: format!("session file '{key}': {} at {}", e.inner(), e.path()),
        })
    }

    fn read(&self, name: &SessionName) -> CoreResult<LockSession> {
        let key = Self::key(name);
        match self.store.load(&key) {
            Ok(bytes) => Self::decode(&key, &bytes),
            Err(StoreError::KeyNotFound(_)) => {
                Err(CoreError::SessionNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, session: &LockSession) -> CoreResult<()> {
        self.store
            .save(&Self::key(&session.name), &Self::encode(session)?)?;
        Ok(())
    }

    /// Creates a session.
    ///
    /// # Errors
    ///
    /// `DuplicateSession` if the name exists and `overwrite` is false.
    pub fn create(
        &self,
        name: &SessionName,
        scope: SessionScope,
        description: Option<NonEmptyText>,
        overwrite: bool,
        cancel: &CancelToken,
    ) -> CoreResult<LockSession> {
        cancel.checkpoint()?;
        if !overwrite && self.store.exists(&Self::key(name))? {
            return Err(CoreError::DuplicateSession(name.to_string()));
        }

        let session = LockSession {
            name: name.clone(),
            description,
            scope,
            created_at: Utc::now(),
            values: BTreeMap::new(),
        };
        cancel.checkpoint()?;
        self.write(&session)?;
        tracing::debug!(session = %name, "created lock session");
        Ok(session)
    }

    /// Loads a session by name.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if absent.
    pub fn get(&self, name: &SessionName) -> CoreResult<LockSession> {
        self.read(name)
    }

    /// Summaries of all stored sessions, ordered by name.
    ///
    /// Unreadable entries are skipped with a warning; listing must not fail
    /// because one file is corrupt.
    pub fn list(&self) -> CoreResult<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for key in self.store.list()? {
            let bytes = match self.store.load(&key) {
                Ok(bytes) => bytes,
                // Deleted between list and load by a concurrent process.
                Err(StoreError::KeyNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            match Self::decode(&key, &bytes) {
                Ok(session) => summaries.push(SessionSummary {
                    name: session.name,
                    description: session.description,
                    created_at: session.created_at,
                    value_count: session.values.len(),
                }),
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping unreadable session file");
                }
            }
        }
        Ok(summaries)
    }

    /// Atomic read-modify-write: loads the current session, applies
    /// `transform`, persists the result with an atomic replace.
    pub fn update(
        &self,
        name: &SessionName,
        cancel: &CancelToken,
        transform: impl FnOnce(LockSession) -> CoreResult<LockSession>,
    ) -> CoreResult<LockSession> {
        cancel.checkpoint()?;
        let current = self.read(name)?;
        let next = transform(current)?;
        cancel.checkpoint()?;
        self.write(&next)?;
        Ok(next)
    }

    /// Removes a session.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if absent.
    pub fn remove(&self, name: &SessionName, cancel: &CancelToken) -> CoreResult<()> {
        cancel.checkpoint()?;
        match self.store.delete(&Self::key(name)) {
            Ok(()) => {
                tracing::debug!(session = %name, "removed lock session");
                Ok(())
            }
            Err(StoreError::KeyNotFound(_)) => {
                Err(CoreError::SessionNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent upsert of one locked value.
    ///
    /// No validation against any message type happens here — one session can
    /// span multiple message types, so values are validated at the point of
    /// use, against the standard actually being generated.
    pub fn set_value(
        &self,
        name: &SessionName,
        path: &SemanticPath,
        value: impl Into<String>,
        reason: Option<NonEmptyText>,
        cancel: &CancelToken,
    ) -> CoreResult<LockSession> {
        let value = value.into();
        self.update(name, cancel, |mut session| {
            session.values.insert(
                path.clone(),
                LockedValue {
                    value,
                    reason,
                    updated_at: Utc::now(),
                },
            );
            Ok(session)
        })
    }

    /// Unlocks one value.
    ///
    /// # Errors
    ///
    /// `ValueNotFound` if the path was not locked in this session.
    pub fn remove_value(
        &self,
        name: &SessionName,
        path: &SemanticPath,
        cancel: &CancelToken,
    ) -> CoreResult<LockSession> {
        self.update(name, cancel, |mut session| {
            if session.values.remove(path).is_none() {
                return Err(CoreError::ValueNotFound {
                    session: name.to_string(),
                    path: path.clone(),
                });
            }
            Ok(session)
        })
    }

    /// The read path used by message generation: path → value, ordered.
    ///
    /// Always re-reads from storage so it reflects the most recently
    /// committed set/remove, not a stale in-memory copy.
    pub fn locked_values(
        &self,
        name: &SessionName,
    ) -> CoreResult<BTreeMap<SemanticPath, String>> {
        Ok(self
            .read(name)?
            .values
            .into_iter()
            .map(|(path, locked)| (path, locked.value))
            .collect())
    }

    /// Removes every session whose TTL has elapsed.
    ///
    /// Best-effort per item: one corrupt or vanishing file never prevents
    /// cleanup of the rest. With no TTL configured this is a no-op.
    pub fn cleanup_expired(&self, cancel: &CancelToken) -> CoreResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let Some(ttl) = self.ttl else {
            return Ok(report);
        };
        let now = Utc::now();

        for key in self.store.list()? {
            cancel.checkpoint()?;
            let bytes = match self.store.load(&key) {
                Ok(bytes) => bytes,
                Err(StoreError::KeyNotFound(_)) => continue,
                Err(e) => {
                    report.skipped.push((key, e.to_string()));
                    continue;
                }
            };
            let session = match Self::decode(&key, &bytes) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(key, error = %e, "cleanup skipping unreadable session file");
                    report.skipped.push((key, e.to_string()));
                    continue;
                }
            };

            if !session.is_expired(ttl, now) {
                continue;
            }

            match self.store.delete(&key) {
                Ok(()) => report.removed += 1,
                // Already gone: a concurrent cleanup got there first.
                Err(StoreError::KeyNotFound(_)) => {}
                Err(e) => report.skipped.push((key, e.to_string())),
            }
        }

        if report.removed > 0 {
            tracing::debug!(removed = report.removed, "purged expired sessions");
        }
        Ok(report)
    }

    /// Persists an already-built session, used by document import.
    ///
    /// # Errors
    ///
    /// `DuplicateSession` if the name exists and `overwrite` is false.
    pub(crate) fn put(
        &self,
        session: &LockSession,
        overwrite: bool,
        cancel: &CancelToken,
    ) -> CoreResult<()> {
        cancel.checkpoint()?;
        if !overwrite && self.store.exists(&Self::key(&session.name))? {
            return Err(CoreError::DuplicateSession(session.name.to_string()));
        }
        cancel.checkpoint()?;
        self.write(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plover_store::{FileStore, MemoryStore};
    use tempfile::TempDir;

    fn name(n: &str) -> SessionName {
        SessionName::parse(n).unwrap()
    }

    fn path(p: &str) -> SemanticPath {
        SemanticPath::parse(p).unwrap()
    }

    fn memory_store(ttl: Option<chrono::Duration>) -> SessionStore {
        SessionStore::new(Box::new(MemoryStore::new()), ttl)
    }

    fn create_demo(store: &SessionStore) -> LockSession {
        store
            .create(
                &name("demo"),
                SessionScope::unrestricted(),
                None,
                false,
                &CancelToken::new(),
            )
            .unwrap()
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = memory_store(None);
        let created = store
            .create(
                &name("demo"),
                SessionScope::unrestricted(),
                Some(NonEmptyText::new("demo session").unwrap()),
                false,
                &CancelToken::new(),
            )
            .unwrap();

        let loaded = store.get(&name("demo")).unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn create_twice_without_overwrite_is_duplicate() {
        let store = memory_store(None);
        create_demo(&store);
        let err = store
            .create(
                &name("demo"),
                SessionScope::unrestricted(),
                None,
                false,
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateSession(n) if n == "demo"));
    }

    #[test]
    fn create_with_overwrite_resets_values() {
        let store = memory_store(None);
        create_demo(&store);
        store
            .set_value(&name("demo"), &path("patient.mrn"), "REG123456", None, &CancelToken::new())
            .unwrap();

        store
            .create(
                &name("demo"),
                SessionScope::unrestricted(),
                None,
                true,
                &CancelToken::new(),
            )
            .unwrap();
        assert!(store.locked_values(&name("demo")).unwrap().is_empty());
    }

    #[test]
    fn get_missing_session_is_session_not_found() {
        let store = memory_store(None);
        assert!(matches!(
            store.get(&name("absent")),
            Err(CoreError::SessionNotFound(n)) if n == "absent"
        ));
    }

    #[test]
    fn set_value_is_visible_to_locked_values() {
        let store = memory_store(None);
        create_demo(&store);
        store
            .set_value(&name("demo"), &path("patient.mrn"), "REG123456", None, &CancelToken::new())
            .unwrap();

        let values = store.locked_values(&name("demo")).unwrap();
        assert_eq!(values.get(&path("patient.mrn")).map(String::as_str), Some("REG123456"));
    }

    #[test]
    fn set_value_overwrites_instead_of_accumulating() {
        let store = memory_store(None);
        create_demo(&store);
        let n = name("demo");
        let p = path("patient.mrn");
        let cancel = CancelToken::new();

        store.set_value(&n, &p, "FIRST", None, &cancel).unwrap();
        store.set_value(&n, &p, "SECOND", None, &cancel).unwrap();

        let session = store.get(&n).unwrap();
        assert_eq!(session.values.len(), 1);
        assert_eq!(session.values[&p].value, "SECOND");
    }

    #[test]
    fn remove_value_unlocks_and_missing_value_errors() {
        let store = memory_store(None);
        create_demo(&store);
        let n = name("demo");
        let p = path("patient.mrn");
        let cancel = CancelToken::new();

        store.set_value(&n, &p, "REG123456", None, &cancel).unwrap();
        store.remove_value(&n, &p, &cancel).unwrap();
        assert!(store.locked_values(&n).unwrap().is_empty());

        let err = store.remove_value(&n, &p, &cancel).unwrap_err();
        assert!(matches!(err, CoreError::ValueNotFound { .. }));
    }

    #[test]
    fn list_orders_by_name_and_counts_values() {
        let store = memory_store(None);
        let cancel = CancelToken::new();
        for n in ["zeta", "alpha"] {
            store
                .create(&name(n), SessionScope::unrestricted(), None, false, &cancel)
                .unwrap();
        }
        store
            .set_value(&name("zeta"), &path("patient.mrn"), "X", None, &cancel)
            .unwrap();

        let summaries = store.list().unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].name, name("alpha"));
        assert_eq!(summaries[1].name, name("zeta"));
        assert_eq!(summaries[1].value_count, 1);
    }

    #[test]
    fn update_applies_transform_atomically() {
        let store = memory_store(None);
        create_demo(&store);
        let updated = store
            .update(&name("demo"), &CancelToken::new(), |mut session| {
                session.description = Some(NonEmptyText::new("after update").unwrap());
                Ok(session)
            })
            .unwrap();
        assert_eq!(updated.description.as_ref().unwrap().as_str(), "after update");
        assert_eq!(store.get(&name("demo")).unwrap(), updated);
    }

    #[test]
    fn failed_transform_leaves_stored_state_untouched() {
        let store = memory_store(None);
        create_demo(&store);
        let before = store.get(&name("demo")).unwrap();

        let err = store
            .update(&name("demo"), &CancelToken::new(), |_| {
                Err(CoreError::InvalidInput("rejected".into()))
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        assert_eq!(store.get(&name("demo")).unwrap(), before);
    }

    #[test]
    fn cancelled_mutation_performs_no_write() {
        let store = memory_store(None);
        create_demo(&store);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = store
            .set_value(&name("demo"), &path("patient.mrn"), "X", None, &cancel)
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert!(store.locked_values(&name("demo")).unwrap().is_empty());
    }

    #[test]
    fn remove_is_terminal_for_the_name() {
        let store = memory_store(None);
        create_demo(&store);
        let cancel = CancelToken::new();

        store.remove(&name("demo"), &cancel).unwrap();
        assert!(matches!(
            store.get(&name("demo")),
            Err(CoreError::SessionNotFound(_))
        ));
        assert!(matches!(
            store.remove(&name("demo"), &cancel),
            Err(CoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn ttl_zero_sessions_are_purged_by_cleanup() {
        let store = memory_store(Some(chrono::Duration::zero()));
        create_demo(&store);

        let report = store.cleanup_expired(&CancelToken::new()).unwrap();
        assert_eq!(report.removed, 1);
        assert!(report.skipped.is_empty());
        assert!(matches!(
            store.get(&name("demo")),
            Err(CoreError::SessionNotFound(_))
        ));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn unexpired_sessions_survive_cleanup() {
        let store = memory_store(Some(chrono::Duration::hours(24)));
        create_demo(&store);

        let report = store.cleanup_expired(&CancelToken::new()).unwrap();
        assert_eq!(report.removed, 0);
        assert!(store.get(&name("demo")).is_ok());
    }

    #[test]
    fn cleanup_without_ttl_is_a_no_op() {
        let store = memory_store(None);
        create_demo(&store);
        let report = store.cleanup_expired(&CancelToken::new()).unwrap();
        assert_eq!(report.removed, 0);
        assert!(store.get(&name("demo")).is_ok());
    }

    #[test]
    fn cleanup_skips_corrupt_files_but_purges_the_rest() {
        let temp = TempDir::new().unwrap();
        let file_store = FileStore::open(temp.path()).unwrap();
        file_store
            .save("broken.yaml", b"{{{ not yaml")
            .unwrap();

        let store = SessionStore::new(Box::new(file_store), Some(chrono::Duration::zero()));
        create_demo(&store);

        let report = store.cleanup_expired(&CancelToken::new()).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "broken.yaml");
    }

    #[test]
    fn sessions_survive_process_restart() {
        let temp = TempDir::new().unwrap();
        let cancel = CancelToken::new();

        {
            let store = SessionStore::new(
                Box::new(FileStore::open(temp.path()).unwrap()),
                None,
            );
            create_demo(&store);
            store
                .set_value(&name("demo"), &path("patient.mrn"), "REG123456", None, &cancel)
                .unwrap();
        }

        // A fresh store over the same directory models a new invocation.
        let store = SessionStore::new(Box::new(FileStore::open(temp.path()).unwrap()), None);
        let values = store.locked_values(&name("demo")).unwrap();
        assert_eq!(values[&path("patient.mrn")], "REG123456");
    }

    #[test]
    fn scope_admits_prefixes_and_standards() {
        let scope = SessionScope {
            standards: vec!["hl7v23".into()],
            path_prefixes: vec!["patient".into()],
        };
        assert!(scope.admits_standard("HL7v23"));
        assert!(!scope.admits_standard("fhir-r4"));
        assert!(scope.admits_path(&path("patient.mrn")));
        assert!(!scope.admits_path(&path("patients.mrn")));
        assert!(!scope.admits_path(&path("encounter.location")));

        let open = SessionScope::unrestricted();
        assert!(open.admits_standard("anything"));
        assert!(open.admits_path(&path("encounter.location")));
    }
}
