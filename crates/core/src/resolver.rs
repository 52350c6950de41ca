//! Semantic path resolution.
//!
//! [`PathResolver`] is the single entry point that turns a standard-agnostic
//! semantic path into a concrete field location. It is intentionally dumb:
//! all standard-specific knowledge lives in the registered
//! [`FieldPathPlugin`]s, so adding a new standard never touches this module.
//! The resolver only routes — pick the plugin for the requested (or default)
//! standard, delegate, and shape the outcome into the core error taxonomy,
//! including a close-match suggestion when a path is unknown.

use crate::error::{CoreError, CoreResult};
use plover_standards::{FieldLocation, FieldPathPlugin, ValueOutcome};
use plover_types::SemanticPath;
use std::collections::BTreeMap;

/// Registry of field path plugins keyed by lowercase standard name.
pub struct PathResolver {
    plugins: BTreeMap<String, Box<dyn FieldPathPlugin>>,
    default_standard: String,
}

impl PathResolver {
    /// Creates an empty resolver with the given default standard.
    pub fn new(default_standard: impl Into<String>) -> Self {
        Self {
            plugins: BTreeMap::new(),
            default_standard: default_standard.into().to_lowercase(),
        }
    }

    /// Creates a resolver pre-populated with `plugins`.
    pub fn with_plugins(
        default_standard: impl Into<String>,
        plugins: Vec<Box<dyn FieldPathPlugin>>,
    ) -> Self {
        let mut resolver = Self::new(default_standard);
        for plugin in plugins {
            resolver.register(plugin);
        }
        resolver
    }

    /// Registers a plugin under its standard name. A later registration for
    /// the same name replaces the earlier one.
    pub fn register(&mut self, plugin: Box<dyn FieldPathPlugin>) {
        self.plugins.insert(plugin.standard().to_lowercase(), plugin);
    }

    /// Registered standard names, in lexicographic order.
    pub fn standards(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    /// Standard used when a caller omits one.
    pub fn default_standard(&self) -> &str {
        &self.default_standard
    }

    /// Looks up the plugin for `standard`, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownStandard` listing the registered names.
    pub fn plugin(&self, standard: &str) -> CoreResult<&dyn FieldPathPlugin> {
        self.plugins
            .get(&standard.to_lowercase())
            .map(Box::as_ref)
            .ok_or_else(|| CoreError::UnknownStandard {
                standard: standard.to_owned(),
                known: self.plugins.keys().cloned().collect(),
            })
    }

    fn plugin_for(&self, standard: Option<&str>) -> CoreResult<&dyn FieldPathPlugin> {
        self.plugin(standard.unwrap_or(&self.default_standard))
    }

    /// Resolves `path` to a concrete field location.
    ///
    /// Resolution is always three-argument: a semantic path is meaningless
    /// without a (standard, message type) pair. When `standard` is `None`
    /// the configured default applies.
    ///
    /// # Errors
    ///
    /// `UnknownStandard` if no plugin is registered for the standard;
    /// `UnresolvablePath` (with a close-match suggestion where one exists)
    /// if the plugin has no mapping for the path/message-type combination.
    pub fn resolve(
        &self,
        path: &SemanticPath,
        message_type: &str,
        standard: Option<&str>,
    ) -> CoreResult<FieldLocation> {
        let plugin = self.plugin_for(standard)?;
        match plugin.resolve(path, message_type) {
            Some(location) => {
                tracing::debug!(
                    path = %path,
                    message_type,
                    standard = plugin.standard(),
                    locator = %location.locator,
                    "resolved semantic path"
                );
                Ok(location)
            }
            None => Err(CoreError::UnresolvablePath {
                path: path.clone(),
                message_type: message_type.to_owned(),
                standard: plugin.standard().to_owned(),
                suggestion: closest_path(path, plugin, message_type),
            }),
        }
    }

    /// True iff `resolve` would succeed. Never errors, even for unknown
    /// standards.
    pub fn validate(&self, path: &SemanticPath, message_type: &str, standard: Option<&str>) -> bool {
        self.plugin_for(standard)
            .map(|p| p.resolve(path, message_type).is_some())
            .unwrap_or(false)
    }

    /// Everything the plugin knows for `message_type`: path → description.
    pub fn list_paths(
        &self,
        message_type: &str,
        standard: Option<&str>,
    ) -> CoreResult<BTreeMap<SemanticPath, String>> {
        Ok(self.plugin_for(standard)?.list_paths(message_type))
    }

    /// Validates a candidate value against the field's type and coding table.
    ///
    /// # Errors
    ///
    /// `UnresolvablePath` when the path itself is unknown; an *invalid
    /// value* is not an error but an outcome for the caller to render.
    pub fn validate_value(
        &self,
        path: &SemanticPath,
        value: &str,
        message_type: &str,
        standard: Option<&str>,
    ) -> CoreResult<ValueOutcome> {
        // Resolve first so unknown paths surface with suggestions instead of
        // a generic invalid outcome.
        self.resolve(path, message_type, standard)?;
        Ok(self
            .plugin_for(standard)?
            .validate_value(path, value, message_type))
    }

    /// Cross-standard mode: resolves `path` against every registered plugin,
    /// collecting per-standard outcomes. Never fails the whole call because
    /// one standard lacks the path.
    pub fn resolve_all(
        &self,
        path: &SemanticPath,
        message_type: &str,
    ) -> BTreeMap<String, CoreResult<FieldLocation>> {
        self.plugins
            .keys()
            .map(|standard| {
                (
                    standard.clone(),
                    self.resolve(path, message_type, Some(standard)),
                )
            })
            .collect()
    }

    /// Finds the plugin whose wire format matches `message`, if any.
    pub fn detect(&self, message: &str) -> Option<&dyn FieldPathPlugin> {
        self.plugins
            .values()
            .map(Box::as_ref)
            .find(|p| p.detect(message))
    }
}

/// Closest known path for "did you mean" reporting, across every message
/// type the plugin handles so a typo still gets a suggestion when the path
/// exists only under a sibling message type.
fn closest_path(
    path: &SemanticPath,
    plugin: &dyn FieldPathPlugin,
    message_type: &str,
) -> Option<SemanticPath> {
    let candidates: Vec<SemanticPath> = plugin
        .list_paths(message_type)
        .into_keys()
        .collect();

    candidates
        .into_iter()
        .map(|candidate| {
            let distance = levenshtein(path.as_str(), candidate.as_str());
            (candidate, distance)
        })
        .filter(|(candidate, distance)| *distance <= candidate.as_str().len() / 2)
        .min_by_key(|(_, distance)| *distance)
        .map(|(candidate, _)| candidate)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
