//! Validated string newtypes shared across the Plover workspace.
//!
//! Plover keys almost everything by strings: semantic paths name clinical
//! concepts, session names become file stems, free text carries reasons and
//! descriptions. Each of those has invariants that must hold *everywhere*,
//! so they are enforced once, at construction, by the types in this crate:
//!
//! - [`SemanticPath`] — a standard-agnostic, dot-separated field name
//!   (e.g. `patient.mrn`). Canonical form only; never empty.
//! - [`SessionName`] — a lock-session identifier safe to use verbatim as a
//!   file stem on any platform.
//! - [`NonEmptyText`] — free text guaranteed to contain at least one
//!   non-whitespace character.
//!
//! Once constructed, a value of any of these types can be passed around and
//! persisted without re-validation.

use std::fmt;
use std::str::FromStr;

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
}

/// Errors returned when a semantic path fails validation.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("semantic path cannot be empty")]
    Empty,
    #[error("semantic path exceeds maximum length of {max} characters: '{path}'")]
    TooLong { path: String, max: usize },
    #[error(
        "semantic path must be lowercase dot-separated segments of [a-z0-9_], got: '{0}'"
    )]
    InvalidForm(String),
}

/// Errors returned when a session name fails validation.
#[derive(Debug, thiserror::Error)]
pub enum NameError {
    #[error("session name cannot be empty")]
    Empty,
    #[error("session name exceeds maximum length of {max} characters")]
    TooLong { max: usize },
    #[error(
        "session name must start with an alphanumeric character and contain only [A-Za-z0-9._-], got: '{0}'"
    )]
    InvalidForm(String),
}

/// A string type that guarantees non-empty content.
///
/// Wraps a `String` and ensures it contains at least one non-whitespace
/// character. Input is trimmed of leading and trailing whitespace during
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed; if the trimmed result is empty,
    /// `TextError::Empty` is returned.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// A standard-agnostic, dot-separated field name (e.g. `patient.mrn`).
///
/// Semantic paths are the stable names users refer to clinical concepts by,
/// regardless of which wire standard a message belongs to. The resolver
/// treats them as opaque keys; their meaning is defined entirely by the
/// per-standard plugins.
///
/// # Canonical form
/// - One or more segments separated by single dots
/// - Each segment: one or more of `a-z`, `0-9`, `_`
/// - Maximum total length: 128
///
/// Examples: `patient.mrn`, `encounter.location`, `observation.value`.
///
/// Non-canonical inputs (uppercase, empty segments, other punctuation) are
/// rejected rather than normalised, so that the same concept can never be
/// keyed under two spellings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemanticPath(String);

impl SemanticPath {
    const MAX_LEN: usize = 128;

    /// Validates and wraps a semantic path string.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if the input is empty, too long, or not in
    /// canonical form.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, PathError> {
        let input = input.as_ref();
        if input.is_empty() {
            return Err(PathError::Empty);
        }
        if input.len() > Self::MAX_LEN {
            return Err(PathError::TooLong {
                path: input.to_owned(),
                max: Self::MAX_LEN,
            });
        }
        if !Self::is_canonical(input) {
            return Err(PathError::InvalidForm(input.to_owned()));
        }
        Ok(Self(input.to_owned()))
    }

    /// Returns true if `input` is in canonical semantic-path form.
    ///
    /// Purely syntactic; does not consult any plugin dictionary.
    pub fn is_canonical(input: &str) -> bool {
        !input.is_empty()
            && input.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .bytes()
                        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'_'))
            })
    }

    /// Returns the path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates the dot-separated segments of the path.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for SemanticPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SemanticPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for SemanticPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SemanticPath::parse(s)
    }
}

impl serde::Serialize for SemanticPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for SemanticPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SemanticPath::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A lock-session identifier safe to use verbatim as a file stem.
///
/// Sessions are persisted one file per session, named after the session, so
/// the name is constrained to a conservative character set that cannot
/// escape the sessions directory or collide with platform-reserved names:
///
/// - Length 1..=64
/// - First character alphanumeric
/// - Remaining characters: `A-Z`, `a-z`, `0-9`, `.`, `-`, `_`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionName(String);

impl SessionName {
    const MAX_LEN: usize = 64;

    /// Validates and wraps a session name.
    ///
    /// # Errors
    ///
    /// Returns [`NameError`] if the input is empty, too long, or contains
    /// characters outside the allowed set.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, NameError> {
        let input = input.as_ref();
        if input.is_empty() {
            return Err(NameError::Empty);
        }
        if input.len() > Self::MAX_LEN {
            return Err(NameError::TooLong { max: Self::MAX_LEN });
        }
        let mut bytes = input.bytes();
        let first_ok = bytes
            .next()
            .is_some_and(|b| b.is_ascii_alphanumeric());
        let rest_ok = bytes.all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'.' | b'-' | b'_'));
        if !first_ok || !rest_ok {
            return Err(NameError::InvalidForm(input.to_owned()));
        }
        Ok(Self(input.to_owned()))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionName::parse(s)
    }
}

impl serde::Serialize for SessionName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for SessionName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SessionName::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_text_trims_and_accepts() {
        let t = NonEmptyText::new("  hello  ").unwrap();
        assert_eq!(t.as_str(), "hello");
    }

    #[test]
    fn non_empty_text_rejects_whitespace_only() {
        assert!(matches!(NonEmptyText::new("   "), Err(TextError::Empty)));
    }

    #[test]
    fn semantic_path_accepts_canonical_forms() {
        for p in ["patient.mrn", "encounter.location", "observation.value_units", "mrn"] {
            assert!(SemanticPath::parse(p).is_ok(), "should accept {p}");
        }
    }

    #[test]
    fn semantic_path_rejects_non_canonical_forms() {
        for p in ["", "Patient.mrn", "patient..mrn", ".mrn", "patient.", "patient mrn", "patient/mrn"] {
            assert!(SemanticPath::parse(p).is_err(), "should reject '{p}'");
        }
    }

    #[test]
    fn semantic_path_rejects_overlong() {
        let long = format!("a.{}", "b".repeat(200));
        assert!(matches!(
            SemanticPath::parse(&long),
            Err(PathError::TooLong { .. })
        ));
    }

    #[test]
    fn semantic_path_segments_iterate_in_order() {
        let p = SemanticPath::parse("patient.address.city").unwrap();
        let segs: Vec<_> = p.segments().collect();
        assert_eq!(segs, vec!["patient", "address", "city"]);
    }

    #[test]
    fn semantic_path_serde_round_trips_as_string() {
        let p = SemanticPath::parse("patient.mrn").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"patient.mrn\"");
        let back: SemanticPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn semantic_path_deserialize_rejects_invalid() {
        let res: Result<SemanticPath, _> = serde_json::from_str("\"Not.A.Path\"");
        assert!(res.is_err());
    }

    #[test]
    fn session_name_accepts_file_safe_names() {
        for n in ["demo", "demo-2", "Demo_v1.2", "a"] {
            assert!(SessionName::parse(n).is_ok(), "should accept {n}");
        }
    }

    #[test]
    fn session_name_rejects_unsafe_names() {
        for n in ["", ".hidden", "-dash", "a/b", "a\\b", "a b", "..", "name:colon"] {
            assert!(SessionName::parse(n).is_err(), "should reject '{n}'");
        }
    }

    #[test]
    fn session_name_rejects_overlong() {
        let long = "a".repeat(65);
        assert!(matches!(
            SessionName::parse(&long),
            Err(NameError::TooLong { .. })
        ));
    }
}
