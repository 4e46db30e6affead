//! The error taxonomy shared by push and fetch operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::depot;
use crate::git::{GitError, Sha1};

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("push canceled: the repo lock was cleared by another party")]
    LockCanceled,

    #[error("cannot push: paths are locked by Git Fusion server {holder}")]
    Conflict { holder: String },

    #[error("user {user} lacks write permission for: {}", paths.join(", "))]
    PermissionDenied { user: String, paths: Vec<String> },

    #[error("{reason}")]
    IllegalInput { reason: String },

    #[error("could not integrate {depot_path} into commit {sha1}: {message}")]
    IntegFailed {
        depot_path: String,
        sha1: Sha1,
        message: String,
    },

    #[error("submit of commit {sha1} failed: {message} (diagnostics written to {dump_path:?})")]
    SubmitFailed {
        sha1: Sha1,
        message: String,
        dump_path: Option<PathBuf>,
    },

    #[error("repo config rejected: {reason}")]
    ConfigInvalid { reason: String },

    #[error(transparent)]
    Depot(#[from] depot::DepotError),

    #[error(transparent)]
    Git(#[from] GitError),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
