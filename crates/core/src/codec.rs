//! Session export/import codec.
//!
//! Sessions become portable documents so that a curated set of locked
//! values — a template — can be shared between users and re-imported
//! elsewhere. Two interchangeable encodings are supported: JSON for
//! machine-to-machine exchange and YAML for hand-editing (comments
//! survive a round trip through an editor, though not through re-export).
//!
//! Import validates structural correctness *before* mutating any stored
//! state; [`SessionCodec::validate_document`] exposes the same check as a
//! side-effect-free call so a user can lint a template without touching
//! their session store.
//!
//! Round-trip law: `import(export(S))` reproduces `S` field-for-field for
//! everything the chosen options preserve — values and paths always,
//! timestamps and metadata when the corresponding options were set on both
//! sides.

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult};
use crate::session::{LockSession, LockedValue, SessionScope, SessionStore};
use chrono::{DateTime, Utc};
use plover_types::{NonEmptyText, SemanticPath, SessionName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Supported export document encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Compact, machine-oriented
    Json,
    /// Comment-friendly, for hand-editing
    Yaml,
}

impl ExportFormat {
    /// Guesses the encoding of a document from its leading syntax.
    pub fn detect(document: &str) -> ExportFormat {
        if document.trim_start().starts_with('{') {
            ExportFormat::Json
        } else {
            ExportFormat::Yaml
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Yaml => "yaml",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExportFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "yaml" | "yml" => Ok(ExportFormat::Yaml),
            other => Err(CoreError::InvalidInput(format!(
                "unknown export format '{other}' (expected json or yaml)"
            ))),
        }
    }
}

/// Marketplace-style template block attached to a shared session document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub verified: bool,
}

/// Options controlling what an export document carries.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Include description and scope
    pub include_metadata: bool,
    /// Include creation and per-value modification timestamps
    pub include_timestamps: bool,
    /// Pretty-print (JSON only; YAML is always block-formatted)
    pub pretty: bool,
    /// Template block to attach, if sharing
    pub template: Option<TemplateMetadata>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_metadata: true,
            include_timestamps: false,
            pretty: true,
            template: None,
        }
    }
}

/// Options controlling how a document becomes a stored session.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Store under this name instead of the document's own
    pub rename: Option<SessionName>,
    /// Replace an existing session of the same name
    pub overwrite: bool,
    /// Keep the document's timestamps instead of stamping "now"
    pub preserve_timestamps: bool,
}

/// One locked value as it appears in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ExportedValue {
    path: SemanticPath,
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<NonEmptyText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

/// The portable document form of a lock session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ExportedSession {
    name: SessionName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<NonEmptyText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<SessionScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    values: Vec<ExportedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    template: Option<TemplateMetadata>,
}

/// Result of a side-effect-free document validation.
#[derive(Debug)]
pub struct DocumentReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub detected_format: ExportFormat,
}

/// Export/import over a [`SessionStore`].
pub struct SessionCodec<'a> {
    sessions: &'a SessionStore,
}

impl<'a> SessionCodec<'a> {
    pub fn new(sessions: &'a SessionStore) -> Self {
        Self { sessions }
    }

    /// Serializes a stored session into a portable document.
    pub fn export(
        &self,
        name: &SessionName,
        format: ExportFormat,
        options: &ExportOptions,
        cancel: &CancelToken,
    ) -> CoreResult<String> {
        cancel.checkpoint()?;
        let session = self.sessions.get(name)?;

        let document = ExportedSession {
            name: session.name,
            description: options
                .include_metadata
                .then_some(session.description)
                .flatten(),
            scope: options.include_metadata.then_some(session.scope),
            created_at: options.include_timestamps.then_some(session.created_at),
            values: session
                .values
                .into_iter()
                .map(|(path, locked)| ExportedValue {
                    path,
                    value: locked.value,
                    reason: locked.reason,
                    updated_at: options.include_timestamps.then_some(locked.updated_at),
                })
                .collect(),
            template: options.template.clone(),
        };

        cancel.checkpoint()?;
        encode(&document, format, options.pretty)
    }

    /// Parses and stores a document as a session.
    ///
    /// The document is fully validated before any store mutation; a
    /// malformed document leaves the session store untouched.
    pub fn import(
        &self,
        document: &str,
        options: &ImportOptions,
        cancel: &CancelToken,
    ) -> CoreResult<LockSession> {
        cancel.checkpoint()?;
        let format = ExportFormat::detect(document);
        let parsed = decode(document, format)?;

        let now = Utc::now();
        let name = options.rename.clone().unwrap_or(parsed.name);
        let created_at = match (options.preserve_timestamps, parsed.created_at) {
            (true, Some(ts)) => ts,
            _ => now,
        };

        let mut values = BTreeMap::new();
        for entry in parsed.values {
            let updated_at = match (options.preserve_timestamps, entry.updated_at) {
                (true, Some(ts)) => ts,
                _ => now,
            };
            // Later entries for the same path win, matching upsert
            // semantics of set_value.
            values.insert(
                entry.path,
                LockedValue {
                    value: entry.value,
                    reason: entry.reason,
                    updated_at,
                },
            );
        }

        let session = LockSession {
            name,
            description: parsed.description,
            scope: parsed.scope.unwrap_or_default(),
            created_at,
            values,
        };

        self.sessions.put(&session, options.overwrite, cancel)?;
        tracing::debug!(session = %session.name, format = %format, "imported session document");
        Ok(session)
    }

    /// Convenience wrapper: reads the document from a file, then imports it.
    pub fn import_from_file(
        &self,
        source: &Path,
        options: &ImportOptions,
        cancel: &CancelToken,
    ) -> CoreResult<LockSession> {
        cancel.checkpoint()?;
        let document = std::fs::read_to_string(source)
            .map_err(|e| CoreError::Storage(plover_store::StoreError::Io(e)))?;
        self.import(&document, options, cancel)
    }

    /// Side-effect-free structural validation with actionable diagnostics.
    ///
    /// Detects the format when none is supplied. Warnings flag suspicious
    /// but importable content (no values, duplicate paths).
    pub fn validate_document(document: &str, format: Option<ExportFormat>) -> DocumentReport {
        let detected = format.unwrap_or_else(|| ExportFormat::detect(document));
        let mut report = DocumentReport {
            valid: false,
            errors: Vec::new(),
            warnings: Vec::new(),
            detected_format: detected,
        };

        let parsed = match decode(document, detected) {
            Ok(parsed) => parsed,
            Err(e) => {
                report.errors.push(e.to_string());
                return report;
            }
        };

        report.valid = true;
        if parsed.values.is_empty() {
            report.warnings.push("document locks no values".into());
        }

        let mut seen = BTreeMap::new();
        for entry in &parsed.values {
            if let Some(prev) = seen.insert(entry.path.clone(), &entry.value) {
                report.warnings.push(format!(
                    "duplicate entry for '{}' ('{prev}' is overridden by '{}')",
                    entry.path, entry.value
                ));
            }
        }

        if let Some(template) = &parsed.template {
            if template.name.trim().is_empty() {
                report.warnings.push("template block has an empty name".into());
            }
        }

        report
    }
}

fn encode(document: &ExportedSession, format: ExportFormat, pretty: bool) -> CoreResult<String> {
    let rendered = match format {
        ExportFormat::Json if pretty => serde_json::to_string_pretty(document)
            .map_err(|e| encode_error(format, e.to_string()))?,
        ExportFormat::Json => serde_json::to_string(document)
            .map_err(|e| encode_error(format, e.to_string()))?,
        ExportFormat::Yaml => serde_yaml::to_string(document)
            .map_err(|e| encode_error(format, e.to_string()))?,
    };
    Ok(rendered)
}

fn encode_error(format: ExportFormat, detail: String) -> CoreError {
    CoreError::DocumentMalformed {
        format: format.name().to_owned(),
        detail,
    }
}

/// Typed parse with path-precise diagnostics: a failure names the exact
/// document fragment (`values[2].path`) that offends.
fn decode(document: &str, format: ExportFormat) -> CoreResult<ExportedSession> {
    match format {
        ExportFormat::Json => {
            let mut de = serde_json::Deserializer::from_str(document);
            serde_path_to_error::deserialize(&mut de).map_err(|e| CoreError::DocumentMalformed {
                format: "json".into(),
                detail: format!("{} at {}", e.inner(), e.path()),
            })
        }
        ExportFormat::Yaml => {
            let de = serde_yaml::Deserializer::from_str(document);
            serde_path_to_error::deserialize(de).map_err(|e| CoreError::DocumentMalformed {
                format: "yaml".into(),
                detail: format!("{} at {}", e.inner(), e.path()),
            })
        }
    }
}
