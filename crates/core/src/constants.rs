//! Constants used throughout the Plover core crate.
//!
//! This module contains directory and filename constants to ensure
//! consistency across the codebase and make maintenance easier.

/// Directory name for lock-session storage under the data directory.
pub const SESSIONS_DIR_NAME: &str = "sessions";

/// Directory name for persisted de-identification maps.
pub const DEID_DIR_NAME: &str = "deid";

/// Default data directory when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "plover_data";

/// File extension for session documents and de-identification maps.
pub const DOCUMENT_EXT: &str = "yaml";

/// Storage key of the default de-identification map.
pub const DEFAULT_DEID_MAP_KEY: &str = "mapping.yaml";
