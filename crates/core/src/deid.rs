//! De-identification: stable, irreversible substitution of real identifiers.
//!
//! The mapper is the inverse of value locking. Generation pins a chosen
//! value so every synthetic message agrees; de-identification takes *real*
//! messages and replaces every distinct identifying value with a synthetic
//! substitute — the same substitute everywhere that value appears, so the
//! batch still describes coherent patients after scrubbing.
//!
//! ## The map
//!
//! Entries are keyed by `(identifier type, salted SHA-256 digest of the raw
//! value)`; the raw value itself is never stored, which is what makes the
//! substitution irreversible. Each entry also carries a second,
//! independently-salted `verifier` digest: if a lookup key matches but the
//! verifier does not, two distinct raw values have collided on the lookup
//! digest, and the mapper refuses to merge them (`MappingCollision`).
//!
//! ## Determinism
//!
//! Substitutes are *derived* from the salted digest, not drawn from an RNG,
//! so re-running the same batch with the same salt reproduces byte-identical
//! output — including across separate invocations sharing a persisted map.
//! The date-shift offset is likewise salt-derived unless given explicitly.
//!
//! ## Shape preservation
//!
//! A substitute keeps the shape class of its source: digits map to digits,
//! letters to letters of the same case, punctuation passes through. An MRN
//! that looked like `REG123456` comes out looking like `QZK507213`.

use crate::cancel::CancelToken;
use crate::config::CoreConfig;
use crate::constants::DEFAULT_DEID_MAP_KEY;
use crate::error::{CoreError, CoreResult};
use crate::resolver::PathResolver;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use plover_standards::FieldPathPlugin;
use plover_store::{StorageProvider, StoreError};
use plover_types::SemanticPath;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// One identifier-to-substitute binding. Append-only within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub identifier_type: String,
    pub digest: String,
    pub verifier: String,
    pub substitute: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted document form of a de-identification map.
#[derive(Debug, Serialize, Deserialize)]
struct MapDocument {
    salt: String,
    #[serde(default)]
    entries: Vec<MappingEntry>,
}

/// The identifier-to-substitute map, persisted through the same storage
/// discipline as sessions so a multi-day export run stays consistent.
pub struct DeidMap {
    store: Box<dyn StorageProvider>,
    key: String,
    salt: String,
    /// (identifier type, digest) → entry
    entries: BTreeMap<(String, String), MappingEntry>,
    /// (identifier type, substitute) → digest, for injectivity checks
    substitutes: BTreeMap<(String, String), String>,
}

impl std::fmt::Debug for DeidMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeidMap")
            .field("key", &self.key)
            .field("salt", &self.salt)
            .field("entries", &self.entries)
            .field("substitutes", &self.substitutes)
            .finish_non_exhaustive()
    }
}

impl DeidMap {
    /// Opens (or creates) the map stored under `key`.
    ///
    /// A fresh map takes `salt` or mints one. An existing map keeps its
    /// recorded salt; supplying a different one is rejected, because a salt
    /// change would silently break the identifier ↔ substitute
    /// correspondence the map exists to preserve.
    pub fn open(
        store: Box<dyn StorageProvider>,
        key: impl Into<String>,
        salt: Option<String>,
    ) -> CoreResult<Self> {
        let key = key.into();
        match store.load(&key) {
            Ok(bytes) => {
                let text =
                    std::str::from_utf8(&bytes).map_err(|e| CoreError::DocumentMalformed {
                        format: "yaml".into(),
                        detail: format!("mapping file '{key}' is not UTF-8: {e}"),
                    })?;
                let de = serde_yaml::Deserializer::from_str(text);
                let document: MapDocument = serde_path_to_error::deserialize(de).map_err(|e| {
                    CoreError::DocumentMalformed {
                        format: "yaml".into(),
                        detail: format!("mapping file '{key}': {} at {}", e.inner(), e.path()),
                    }
                })?;

                if let Some(requested) = salt {
                    if requested != document.salt {
                        return Err(CoreError::InvalidInput(format!(
                            "salt does not match the one recorded in '{key}'; \
                             reusing a map requires its original salt"
                        )));
                    }
                }

                let mut map = Self {
                    store,
                    key,
                    salt: document.salt,
                    entries: BTreeMap::new(),
                    substitutes: BTreeMap::new(),
                };
                for entry in document.entries {
                    map.substitutes.insert(
                        (entry.identifier_type.clone(), entry.substitute.clone()),
                        entry.digest.clone(),
                    );
                    map.entries
                        .insert((entry.identifier_type.clone(), entry.digest.clone()), entry);
                }
                Ok(map)
            }
            Err(StoreError::KeyNotFound(_)) => Ok(Self {
                store,
                key,
                salt: salt.unwrap_or_else(mint_salt),
                entries: BTreeMap::new(),
                substitutes: BTreeMap::new(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Default map under the configured deid directory.
    pub fn from_config(config: &CoreConfig, salt: Option<String>) -> CoreResult<Self> {
        let store = plover_store::FileStore::open(&config.deid_dir())?;
        Self::open(Box::new(store), DEFAULT_DEID_MAP_KEY, salt)
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the stable substitute for `raw`, minting one on first sight.
    ///
    /// # Errors
    ///
    /// `MappingCollision` when two distinct raw values digest to the same
    /// lookup key — the injective mapping cannot be preserved, so the entry
    /// aborts rather than silently merging two identities.
    pub fn substitute(&mut self, identifier_type: &str, raw: &str) -> CoreResult<String> {
        let digest = hex::encode(keyed_digest(&self.salt, 0, identifier_type, raw.as_bytes()));
        let verifier = hex::encode(keyed_digest(&self.salt, 1, identifier_type, raw.as_bytes()));

        if let Some(entry) = self.entries.get(&(identifier_type.to_owned(), digest.clone())) {
            if entry.verifier != verifier {
                return Err(CoreError::MappingCollision {
                    identifier_type: identifier_type.to_owned(),
                    digest,
                });
            }
            return Ok(entry.substitute.clone());
        }

        // Deterministic probing: the candidate is derived from the digest,
        // and the attempt counter only advances when a *different* source
        // value already claimed the same substitute.
        const MAX_ATTEMPTS: u32 = 128;
        for attempt in 0..MAX_ATTEMPTS {
            let seed = mint_seed(&self.salt, identifier_type, raw, attempt);
            let candidate = shape_preserving_substitute(raw, seed);

            let claimed = self
                .substitutes
                .get(&(identifier_type.to_owned(), candidate.clone()));
            if claimed.is_some_and(|existing| *existing != digest) {
                continue;
            }

            self.substitutes.insert(
                (identifier_type.to_owned(), candidate.clone()),
                digest.clone(),
            );
            self.entries.insert(
                (identifier_type.to_owned(), digest.clone()),
                MappingEntry {
                    identifier_type: identifier_type.to_owned(),
                    digest,
                    verifier,
                    substitute: candidate.clone(),
                    created_at: Utc::now(),
                },
            );
            return Ok(candidate);
        }

        Err(CoreError::InvalidInput(format!(
            "could not mint a distinct substitute for identifier type '{identifier_type}' \
             after {MAX_ATTEMPTS} attempts (value shape too constrained)"
        )))
    }

    /// Writes the map through the storage provider's atomic replace.
    pub fn persist(&self, cancel: &CancelToken) -> CoreResult<()> {
        cancel.checkpoint()?;
        let document = MapDocument {
            salt: self.salt.clone(),
            entries: self.entries.values().cloned().collect(),
        };
        let rendered =
            serde_yaml::to_string(&document).map_err(|e| CoreError::DocumentMalformed {
                format: "yaml".into(),
                detail: format!("failed to encode mapping file: {e}"),
            })?;
        cancel.checkpoint()?;
        self.store.save(&self.key, rendered.as_bytes())?;
        Ok(())
    }
}

/// Configuration of one de-identification run.
#[derive(Debug, Clone)]
pub struct DeidOptions {
    /// Semantic paths designated as identifying
    pub identifying_paths: Vec<SemanticPath>,
    /// Explicit date-shift in days; `None` derives one from the salt
    pub date_shift_days: Option<i64>,
    /// Force a standard instead of per-message detection
    pub standard: Option<String>,
}

impl Default for DeidOptions {
    fn default() -> Self {
        Self {
            identifying_paths: default_identifying_paths(),
            date_shift_days: None,
            standard: None,
        }
    }
}

/// The identifying paths scrubbed when the caller does not name their own.
pub fn default_identifying_paths() -> Vec<SemanticPath> {
    [
        "patient.mrn",
        "patient.family_name",
        "patient.given_name",
        "patient.dob",
        "patient.phone",
    ]
    .iter()
    .map(|p| SemanticPath::parse(p).expect("default paths are canonical"))
    .collect()
}

/// Result of de-identifying one message.
#[derive(Debug)]
pub struct DeidOutcome {
    pub message: String,
    pub standard: Option<String>,
    pub message_type: Option<String>,
    pub substituted: usize,
    pub shifted: usize,
    /// Per-message problems that did not stop the batch
    pub warnings: Vec<String>,
    /// Identifying paths that could not be resolved for this message,
    /// flagged for manual review
    pub skipped_paths: Vec<SemanticPath>,
}

/// Streams messages through the resolver and the map.
pub struct DeidEngine<'a> {
    resolver: &'a PathResolver,
    map: DeidMap,
    options: DeidOptions,
    offset_days: i64,
}

impl<'a> DeidEngine<'a> {
    pub fn new(resolver: &'a PathResolver, map: DeidMap, options: DeidOptions) -> Self {
        let offset_days = options
            .date_shift_days
            .unwrap_or_else(|| derived_offset_days(map.salt()));
        Self {
            resolver,
            map,
            options,
            offset_days,
        }
    }

    /// The shift applied to every date/time field this run.
    pub fn offset_days(&self) -> i64 {
        self.offset_days
    }

    pub fn map(&self) -> &DeidMap {
        &self.map
    }

    /// Persists the accumulated identifier map.
    pub fn persist(&self, cancel: &CancelToken) -> CoreResult<()> {
        self.map.persist(cancel)
    }

    /// De-identifies one raw message.
    ///
    /// Per-message problems (undetectable standard, unresolvable path,
    /// unshiftable date) are warnings in the outcome, not errors: the
    /// message passes through with every resolvable field scrubbed and the
    /// rest flagged. Only [`MappingCollision`](CoreError::MappingCollision)
    /// and storage failures abort.
    pub fn deidentify_message(
        &mut self,
        message: &str,
        cancel: &CancelToken,
    ) -> CoreResult<DeidOutcome> {
        cancel.checkpoint()?;

        let mut outcome = DeidOutcome {
            message: message.to_owned(),
            standard: None,
            message_type: None,
            substituted: 0,
            shifted: 0,
            warnings: Vec::new(),
            skipped_paths: Vec::new(),
        };

        let plugin = match &self.options.standard {
            Some(standard) => self.resolver.plugin(standard)?,
            None => match self.resolver.detect(message) {
                Some(plugin) => plugin,
                None => {
                    outcome
                        .warnings
                        .push("no registered standard matches this message".into());
                    outcome.skipped_paths = self.options.identifying_paths.clone();
                    return Ok(outcome);
                }
            },
        };
        let standard = plugin.standard().to_owned();
        outcome.standard = Some(standard.clone());

        let Some(message_type) = plugin.detect_message_type(message) else {
            outcome
                .warnings
                .push(format!("cannot determine {standard} message type"));
            outcome.skipped_paths = self.options.identifying_paths.clone();
            return Ok(outcome);
        };
        outcome.message_type = Some(message_type.clone());

        let paths = self.options.identifying_paths.clone();
        for path in &paths {
            cancel.checkpoint()?;

            let location =
                match self.resolver.resolve(path, &message_type, Some(&standard)) {
                    Ok(location) => location,
                    Err(CoreError::UnresolvablePath { .. }) => {
                        outcome.skipped_paths.push(path.clone());
                        outcome.warnings.push(format!(
                            "'{path}' does not resolve for {standard}/{message_type}; \
                             left for manual review"
                        ));
                        continue;
                    }
                    Err(e) => return Err(e),
                };

            // Absent fields are not warnings; not every message carries
            // every identifying field.
            let Some(raw) = plugin.extract(&outcome.message, &location) else {
                continue;
            };

            if is_date_type(&location.data_type) {
                match shift_date_value(&raw, self.offset_days) {
                    Some(shifted) => match plugin.apply(&outcome.message, &location, &shifted) {
                        Ok(rewritten) => {
                            outcome.message = rewritten;
                            outcome.shifted += 1;
                        }
                        Err(e) => outcome
                            .warnings
                            .push(format!("failed to rewrite {}: {e}", location.locator)),
                    },
                    None => outcome.warnings.push(format!(
                        "could not shift date '{raw}' at {}",
                        location.locator
                    )),
                }
            } else {
                let substitute = self.map.substitute(path.as_str(), &raw)?;
                match plugin.apply(&outcome.message, &location, &substitute) {
                    Ok(rewritten) => {
                        outcome.message = rewritten;
                        outcome.substituted += 1;
                    }
                    Err(e) => outcome
                        .warnings
                        .push(format!("failed to rewrite {}: {e}", location.locator)),
                }
            }
        }

        if !outcome.warnings.is_empty() {
            tracing::warn!(
                standard = outcome.standard.as_deref().unwrap_or("unknown"),
                warnings = outcome.warnings.len(),
                "message de-identified with warnings"
            );
        }
        Ok(outcome)
    }
}

fn is_date_type(data_type: &str) -> bool {
    matches!(data_type, "TS" | "DT" | "date" | "dateTime")
}

fn keyed_digest(salt: &str, domain: u8, identifier_type: &str, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([domain]);
    hasher.update(identifier_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    hasher.finalize().into()
}

fn mint_seed(salt: &str, identifier_type: &str, raw: &str, attempt: u32) -> [u8; 32] {
    let mut payload = raw.as_bytes().to_vec();
    payload.push(0);
    payload.extend_from_slice(&attempt.to_be_bytes());
    keyed_digest(salt, 2, identifier_type, &payload)
}

/// Fresh random salt for a new mapping store.
fn mint_salt() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Deterministic byte stream expanded from a 32-byte seed.
struct DigestStream {
    seed: [u8; 32],
    block: [u8; 32],
    index: usize,
    counter: u32,
}

impl DigestStream {
    fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            block: [0; 32],
            index: 32,
            counter: 0,
        }
    }

    fn next_byte(&mut self) -> u8 {
        if self.index == 32 {
            let mut hasher = Sha256::new();
            hasher.update(self.seed);
            hasher.update(self.counter.to_be_bytes());
            self.block = hasher.finalize().into();
            self.counter += 1;
            self.index = 0;
        }
        let byte = self.block[self.index];
        self.index += 1;
        byte
    }
}

/// Maps each character of `raw` to a fresh character of the same shape
/// class: digits stay digits, letters keep their case, everything else
/// passes through untouched.
fn shape_preserving_substitute(raw: &str, seed: [u8; 32]) -> String {
    let mut stream = DigestStream::new(seed);
    raw.chars()
        .map(|c| match c {
            '0'..='9' => char::from(b'0' + stream.next_byte() % 10),
            'A'..='Z' => char::from(b'A' + stream.next_byte() % 26),
            'a'..='z' => char::from(b'a' + stream.next_byte() % 26),
            other => other,
        })
        .collect()
}

/// Salt-derived date shift in days, non-zero, within ±365.
pub fn derived_offset_days(salt: &str) -> i64 {
    let digest = keyed_digest(salt, 3, "date-shift", &[]);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let span = 365i64;
    let offset = (i64::from_be_bytes(bytes).rem_euclid(2 * span + 1)) - span;
    if offset == 0 {
        1
    } else {
        offset
    }
}

/// Shifts a textual date or timestamp by `days`, preserving its shape.
///
/// Understands the compact `YYYYMMDD[HHMM[SS]]` form carried by segment
/// standards and the ISO `YYYY-MM-DD[Txx…]` form carried by resource
/// standards. Returns `None` when the value does not look like either.
pub fn shift_date_value(value: &str, days: i64) -> Option<String> {
    let shift = Duration::days(days);

    if value.len() >= 8
        && value.len() % 2 == 0
        && value.bytes().all(|b| b.is_ascii_digit())
    {
        let date = NaiveDate::parse_from_str(&value[..8], "%Y%m%d").ok()?;
        let shifted = date.checked_add_signed(shift)?;
        return Some(format!("{}{}", shifted.format("%Y%m%d"), &value[8..]));
    }

    let bytes = value.as_bytes();
    if value.len() >= 10
        && value.is_char_boundary(10)
        && bytes[4] == b'-'
        && bytes[7] == b'-'
    {
        let date = NaiveDate::parse_from_str(&value[..10], "%Y-%m-%d").ok()?;
        let shifted = date.checked_add_signed(shift)?;
        return Some(format!("{}{}", shifted.format("%Y-%m-%d"), &value[10..]));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::PathResolver;
    use plover_standards::default_plugins;
    use plover_store::MemoryStore;

    fn resolver() -> PathResolver {
        PathResolver::with_plugins("hl7v23", default_plugins())
    }

    fn fresh_map(salt: &str) -> DeidMap {
        DeidMap::open(Box::new(MemoryStore::new()), "mapping.yaml", Some(salt.into())).unwrap()
    }

    fn admit(mrn: &str, family: &str) -> String {
        format!(
            "MSH|^~\\&|REG|FAC|LAB|FAC|20240102030405||ADT^A01|MSG0001|P|2.3\r\
             PID|1||{mrn}||{family}^JOHN||19570807|M\r\
             PV1|1|I|WARD1"
        )
    }

    fn result(mrn: &str) -> String {
        format!(
            "MSH|^~\\&|LAB|FAC|EHR|FAC|20240102040000||ORU^R01|MSG0002|P|2.3\r\
             PID|1||{mrn}||SMITH^JOHN||19570807|M\r\
             OBX|1|NM|2345-7^GLUCOSE^LN||98|mg/dL|||||F|||20240102035900"
        )
    }

    #[test]
    fn same_identifier_maps_to_same_substitute_across_messages() {
        let resolver = resolver();
        let mut engine =
            DeidEngine::new(&resolver, fresh_map("salt-a"), DeidOptions::default());
        let cancel = CancelToken::new();

        let a = engine.deidentify_message(&admit("REG123456", "SMITH"), &cancel).unwrap();
        let b = engine.deidentify_message(&result("REG123456"), &cancel).unwrap();

        assert!(!a.message.contains("REG123456"));
        assert!(!b.message.contains("REG123456"));

        // The admission and the lab result now carry the same synthetic MRN.
        let mrn_path = SemanticPath::parse("patient.mrn").unwrap();
        let plugin = resolver.plugin("hl7v23").unwrap();
        let loc_admit = plugin.resolve(&mrn_path, "ADT_ADMIT").unwrap();
        let loc_result = plugin.resolve(&mrn_path, "ORU_RESULT").unwrap();
        assert_eq!(
            plugin.extract(&a.message, &loc_admit),
            plugin.extract(&b.message, &loc_result)
        );
    }

    #[test]
    fn distinct_identifiers_get_distinct_substitutes() {
        let resolver = resolver();
        let mut engine =
            DeidEngine::new(&resolver, fresh_map("salt-b"), DeidOptions::default());
        let cancel = CancelToken::new();

        let mrns = ["REG000001", "REG000002", "REG000003", "REG000004"];
        let mut seen = std::collections::BTreeSet::new();
        let plugin = resolver.plugin("hl7v23").unwrap();
        let loc = plugin
            .resolve(&SemanticPath::parse("patient.mrn").unwrap(), "ADT_ADMIT")
            .unwrap();

        for mrn in mrns {
            let outcome = engine.deidentify_message(&admit(mrn, "SMITH"), &cancel).unwrap();
            seen.insert(plugin.extract(&outcome.message, &loc).unwrap());
        }
        assert_eq!(seen.len(), mrns.len());
        assert_eq!(engine.map().len(), mrns.len() + 2); // + family and given names
    }

    #[test]
    fn rerun_with_same_salt_is_byte_identical() {
        let resolver = resolver();
        let cancel = CancelToken::new();
        let batch = [
            admit("REG123456", "SMITH"),
            result("REG123456"),
            admit("REG999999", "JONES"),
        ];

        let run = |salt: &str| -> Vec<String> {
            let mut engine = DeidEngine::new(&resolver, fresh_map(salt), DeidOptions::default());
            batch
                .iter()
                .map(|m| engine.deidentify_message(m, &cancel).unwrap().message)
                .collect()
        };

        assert_eq!(run("salt-c"), run("salt-c"));
        assert_ne!(run("salt-c"), run("salt-d"));
    }

    #[test]
    fn substitutes_preserve_shape() {
        let mut map = fresh_map("salt-e");
        let substitute = map.substitute("patient.mrn", "REG123456").unwrap();

        assert_eq!(substitute.len(), "REG123456".len());
        assert_ne!(substitute, "REG123456");
        assert!(substitute[..3].bytes().all(|b| b.is_ascii_uppercase()));
        assert!(substitute[3..].bytes().all(|b| b.is_ascii_digit()));

        let phone = map.substitute("patient.phone", "(555)123-4567").unwrap();
        assert_eq!(phone.len(), "(555)123-4567".len());
        assert_eq!(&phone[0..1], "(");
        assert_eq!(&phone[4..5], ")");
        assert_eq!(&phone[8..9], "-");
    }

    #[test]
    fn date_fields_shift_preserving_relative_timing() {
        let resolver = resolver();
        let options = DeidOptions {
            identifying_paths: vec![
                SemanticPath::parse("patient.dob").unwrap(),
                SemanticPath::parse("observation.time").unwrap(),
            ],
            date_shift_days: Some(10),
            standard: None,
        };
        let mut engine = DeidEngine::new(&resolver, fresh_map("salt-f"), options);
        let outcome = engine
            .deidentify_message(&result("REG123456"), &CancelToken::new())
            .unwrap();

        assert_eq!(outcome.shifted, 2);
        assert!(outcome.message.contains("19570817")); // dob + 10d
        assert!(outcome.message.contains("20240112035900")); // obx time + 10d, HMS intact
    }

    #[test]
    fn shift_date_value_handles_both_shapes() {
        assert_eq!(shift_date_value("19570807", 10).as_deref(), Some("19570817"));
        assert_eq!(
            shift_date_value("20240102035900", -2).as_deref(),
            Some("20231231035900")
        );
        assert_eq!(shift_date_value("1957-08-07", 10).as_deref(), Some("1957-08-17"));
        assert_eq!(
            shift_date_value("2024-01-02T03:59:00Z", -2).as_deref(),
            Some("2023-12-31T03:59:00Z")
        );
        assert_eq!(shift_date_value("not-a-date", 10), None);
    }

    #[test]
    fn derived_offset_is_stable_and_nonzero() {
        let a = derived_offset_days("salt-g");
        assert_eq!(a, derived_offset_days("salt-g"));
        assert_ne!(a, 0);
        assert!((-365..=365).contains(&a));
    }

    #[test]
    fn digest_collision_is_fatal_not_merged() {
        let mut map = fresh_map("salt-h");
        let first = map.substitute("patient.mrn", "REG123456").unwrap();

        // Force the collision case: same lookup digest recorded with a
        // different verifier, as if a distinct raw value had produced it.
        let digest = hex::encode(keyed_digest("salt-h", 0, "patient.mrn", b"REG123456"));
        map.entries
            .get_mut(&("patient.mrn".to_owned(), digest.clone()))
            .unwrap()
            .verifier = "tampered".into();

        let err = map.substitute("patient.mrn", "REG123456").unwrap_err();
        match err {
            CoreError::MappingCollision { identifier_type, .. } => {
                assert_eq!(identifier_type, "patient.mrn");
            }
            other => panic!("expected MappingCollision, got {other:?}"),
        }
        let _ = first;
    }

    #[test]
    fn map_persists_and_reopens_with_same_substitutes() {
        let store = Box::new(MemoryStore::new());
        let cancel = CancelToken::new();

        let mut map = DeidMap::open(store, "mapping.yaml", Some("salt-i".into())).unwrap();
        let before = map.substitute("patient.mrn", "REG123456").unwrap();
        map.persist(&cancel).unwrap();

        // Reopen over the same backing store: a later invocation.
        let bytes = map.store.load("mapping.yaml").unwrap();
        let reopened_store = MemoryStore::new();
        reopened_store.save("mapping.yaml", &bytes).unwrap();
        let mut reopened =
            DeidMap::open(Box::new(reopened_store), "mapping.yaml", None).unwrap();

        assert_eq!(reopened.salt(), "salt-i");
        assert_eq!(reopened.len(), 1);
        assert_eq!(
            reopened.substitute("patient.mrn", "REG123456").unwrap(),
            before
        );
    }

    #[test]
    fn reopening_with_wrong_salt_is_rejected() {
        let store = MemoryStore::new();
        {
            let map = DeidMap::open(
                Box::new(MemoryStore::new()),
                "mapping.yaml",
                Some("right".into()),
            )
            .unwrap();
            let document = MapDocument {
                salt: map.salt.clone(),
                entries: vec![],
            };
            store
                .save(
                    "mapping.yaml",
                    serde_yaml::to_string(&document).unwrap().as_bytes(),
                )
                .unwrap();
        }

        let err =
            DeidMap::open(Box::new(store), "mapping.yaml", Some("wrong".into())).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn unresolvable_identifying_path_is_warning_not_error() {
        let resolver = resolver();
        let options = DeidOptions {
            identifying_paths: vec![
                SemanticPath::parse("patient.mrn").unwrap(),
                SemanticPath::parse("encounter.location").unwrap(), // not in ORU
            ],
            date_shift_days: Some(1),
            standard: None,
        };
        let mut engine = DeidEngine::new(&resolver, fresh_map("salt-j"), options);
        let outcome = engine
            .deidentify_message(&result("REG123456"), &CancelToken::new())
            .unwrap();

        assert_eq!(outcome.substituted, 1);
        assert_eq!(
            outcome.skipped_paths,
            vec![SemanticPath::parse("encounter.location").unwrap()]
        );
        assert!(!outcome.message.contains("REG123456"));
    }

    #[test]
    fn unrecognised_message_passes_through_with_warning() {
        let resolver = resolver();
        let mut engine =
            DeidEngine::new(&resolver, fresh_map("salt-k"), DeidOptions::default());
        let outcome = engine
            .deidentify_message("totally unstructured text", &CancelToken::new())
            .unwrap();

        assert_eq!(outcome.message, "totally unstructured text");
        assert!(outcome.standard.is_none());
        assert!(!outcome.warnings.is_empty());
        assert_eq!(outcome.skipped_paths.len(), 5);
    }

    #[test]
    fn fhir_messages_deidentify_through_the_same_map() {
        let resolver = resolver();
        let mut engine =
            DeidEngine::new(&resolver, fresh_map("salt-l"), DeidOptions::default());
        let cancel = CancelToken::new();

        let v2 = engine.deidentify_message(&admit("REG123456", "SMITH"), &cancel).unwrap();
        let fhir = engine
            .deidentify_message(
                r#"{"resourceType": "Patient",
                    "identifier": [{"value": "REG123456"}],
                    "name": [{"family": "SMITH", "given": ["JOHN"]}],
                    "birthDate": "1957-08-07"}"#,
                &cancel,
            )
            .unwrap();

        // Same real MRN, same synthetic MRN, regardless of standard.
        let plugin_v2 = resolver.plugin("hl7v23").unwrap();
        let loc_v2 = plugin_v2
            .resolve(&SemanticPath::parse("patient.mrn").unwrap(), "ADT_ADMIT")
            .unwrap();
        let plugin_fhir = resolver.plugin("fhir-r4").unwrap();
        let loc_fhir = plugin_fhir
            .resolve(&SemanticPath::parse("patient.mrn").unwrap(), "ADT_ADMIT")
            .unwrap();
        assert_eq!(
            plugin_v2.extract(&v2.message, &loc_v2),
            plugin_fhir.extract(&fhir.message, &loc_fhir)
        );
        assert!(!fhir.message.contains("1957-08-07"));
    }
}
