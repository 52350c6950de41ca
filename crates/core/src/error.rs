//! Error taxonomy for the Plover core.
//!
//! Every expected failure travels as a [`CoreError`] value; no operation in
//! this crate relies on panics for expected failure paths. Each variant maps
//! to a stable machine-parseable kind string via [`CoreError::kind`], which
//! the CLI prints alongside its non-zero exit so scripts can branch on the
//! failure category without parsing prose.

use plover_standards::ApplyError;
use plover_store::StoreError;
use plover_types::SemanticPath;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown standard '{standard}' (registered: {})", .known.join(", "))]
    UnknownStandard { standard: String, known: Vec<String> },

    #[error(
        "no mapping for '{path}' in message type '{message_type}' under {standard}{}",
        suggestion_suffix(.suggestion)
    )]
    UnresolvablePath {
        path: SemanticPath,
        message_type: String,
        standard: String,
        suggestion: Option<SemanticPath>,
    },

    #[error(
        "invalid value for '{path}' under {standard}: {reason}{}",
        allowed_suffix(.allowed)
    )]
    InvalidValue {
        path: SemanticPath,
        standard: String,
        reason: String,
        allowed: Vec<String>,
    },

    #[error("no session named '{0}'")]
    SessionNotFound(String),

    #[error("session '{0}' already exists (pass overwrite to replace it)")]
    DuplicateSession(String),

    #[error("session '{session}' has no locked value for '{path}'")]
    ValueNotFound { session: String, path: SemanticPath },

    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),

    #[error("malformed {format} document: {detail}")]
    DocumentMalformed { format: String, detail: String },

    #[error(
        "de-identification mapping collision for identifier type '{identifier_type}': \
         two distinct source values digest to {digest}; refusing to merge them"
    )]
    MappingCollision {
        identifier_type: String,
        digest: String,
    },

    #[error("failed to rewrite message field: {0}")]
    Apply(#[from] ApplyError),

    #[error("operation cancelled")]
    Cancelled,
}

fn suggestion_suffix(suggestion: &Option<SemanticPath>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{s}'?)"))
        .unwrap_or_default()
}

fn allowed_suffix(allowed: &[String]) -> String {
    if allowed.is_empty() {
        String::new()
    } else {
        format!(" (allowed: {})", allowed.join(", "))
    }
}

impl CoreError {
    /// Stable machine-parseable kind string for this failure category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::UnknownStandard { .. } => "unknown_standard",
            Self::UnresolvablePath { .. } => "unresolvable_path",
            Self::InvalidValue { .. } => "invalid_value",
            Self::SessionNotFound(_) => "session_not_found",
            Self::DuplicateSession(_) => "duplicate_session",
            Self::ValueNotFound { .. } => "value_not_found",
            Self::Storage(_) => "storage_unavailable",
            Self::DocumentMalformed { .. } => "document_malformed",
            Self::MappingCollision { .. } => "mapping_collision",
            Self::Apply(_) => "invalid_input",
            Self::Cancelled => "cancelled",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
