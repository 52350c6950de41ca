//! # Plover Core
//!
//! Core logic for the Plover healthcare message workbench: one stable name
//! per clinical concept, one set of locked values per generation run, one
//! synthetic identity per real identity.
//!
//! The crate is organised around three cooperating pieces that share a
//! single hard invariant — *the same logical key must always yield the same
//! concrete value, across process restarts, across standards, and across an
//! unbounded set of messages*:
//!
//! - [`resolver::PathResolver`] — indirects a standard-agnostic semantic
//!   path (`patient.mrn`) to a concrete field location per standard, via
//!   registered [`plover_standards::FieldPathPlugin`]s.
//! - [`session::SessionStore`] — remembers chosen values for semantic paths
//!   so independently-invoked generation commands reproduce them;
//!   [`codec::SessionCodec`] moves sessions in and out as portable
//!   documents.
//! - [`deid::DeidEngine`] — the inverse operation: deterministic,
//!   irreversible substitution of real identifiers with synthetic ones,
//!   preserving the one-to-one correspondence across an entire batch.
//!
//! **No API concerns**: argument parsing and presentation belong to the
//! `plover` binary; persistence mechanics below the
//! [`plover_store::StorageProvider`] trait belong to the store crate.

pub mod cancel;
pub mod codec;
pub mod config;
pub mod constants;
pub mod deid;
pub mod error;
pub mod generate;
pub mod resolver;
pub mod session;

pub use cancel::CancelToken;
pub use codec::{DocumentReport, ExportFormat, ExportOptions, ImportOptions, SessionCodec, TemplateMetadata};
pub use config::CoreConfig;
pub use deid::{
    default_identifying_paths, DeidEngine, DeidMap, DeidOptions, DeidOutcome, MappingEntry,
};
pub use error::{CoreError, CoreResult};
pub use generate::apply_session;
pub use resolver::PathResolver;
pub use session::{
    CleanupReport, LockSession, LockedValue, SessionScope, SessionStore, SessionSummary,
};
