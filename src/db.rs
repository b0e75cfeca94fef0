//! Durable JSON document stores.
//!
//! Two documents: accounts (encrypted identity → pending work) and reports
//! (encrypted identity → accumulating result lines). Each logical operation is
//! a whole-document read-modify-write guarded by that store's own
//! `tokio::sync::Mutex`; the lock is never held across a network call.
//! Replacement is atomic: serialize to a sibling temp file, then rename.

pub mod accounts;
pub mod reports;

pub use accounts::{AccountRecord, AccountStore, ModuleEntry, ModuleStatus, WorkItem};
pub use reports::{Outcome, ReportStore};

use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Read a document, defaulting when the file does not exist yet. A file that
/// exists but fails to parse is corruption — fatal, never silently reset.
pub(crate) fn read_doc<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
        path: path.display().to_string(),
        source,
    })
}

/// Atomically replace a document: write a sibling temp file, then rename over
/// the target so readers never observe a half-written document.
pub(crate) fn write_doc<T>(path: &Path, value: &T) -> Result<(), StoreError>
where
    T: Serialize,
{
    let io_error = |source: std::io::Error| StoreError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
    }

    let serialized = serde_json::to_vec(value).expect("store documents always serialize");
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serialized).map_err(io_error)?;
    std::fs::rename(&tmp, path).map_err(io_error)?;
    Ok(())
}
