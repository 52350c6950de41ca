//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into
//! core services. The intent is to avoid reading process-wide environment
//! variables during operation handling, which leads to inconsistent
//! behaviour in test harnesses and across concurrent invocations.

use crate::constants::{DEID_DIR_NAME, SESSIONS_DIR_NAME};
use crate::error::{CoreError, CoreResult};
use std::path::{Path, PathBuf};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: PathBuf,
    default_standard: String,
    session_ttl: Option<chrono::Duration>,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if `default_standard` is empty or a
    /// negative TTL is supplied.
    pub fn new(
        data_dir: PathBuf,
        default_standard: impl Into<String>,
        session_ttl: Option<chrono::Duration>,
    ) -> CoreResult<Self> {
        let default_standard = default_standard.into().trim().to_lowercase();
        if default_standard.is_empty() {
            return Err(CoreError::InvalidInput(
                "default standard cannot be empty".into(),
            ));
        }
        if let Some(ttl) = session_ttl {
            if ttl < chrono::Duration::zero() {
                return Err(CoreError::InvalidInput(
                    "session TTL cannot be negative".into(),
                ));
            }
        }

        Ok(Self {
            data_dir,
            default_standard,
            session_ttl,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_DIR_NAME)
    }

    pub fn deid_dir(&self) -> PathBuf {
        self.data_dir.join(DEID_DIR_NAME)
    }

    /// Standard used when a caller omits one. Stored lowercase.
    pub fn default_standard(&self) -> &str {
        &self.default_standard
    }

    /// Time-to-live applied by session cleanup; `None` disables expiry.
    pub fn session_ttl(&self) -> Option<chrono::Duration> {
        self.session_ttl
    }
}
