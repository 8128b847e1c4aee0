use std::path::PathBuf;
use thiserror::Error;

/// Failures that stop a patch run before any byte is written.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("target file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("access denied opening {} for writing. Run as Administrator.", .0.display())]
    AccessDenied(PathBuf),
}

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("{0}")]
    NotFound(String),
    #[error("permission denied reading {0}. Run as Administrator.")]
    AccessDenied(String),
}
