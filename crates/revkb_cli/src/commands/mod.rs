//! CLI command implementations.

pub mod demo;
pub mod history;
pub mod init;
pub mod inspect;
pub mod verify;

use crate::error::{CliError, CliResult};
use revkb_storage::FileBackend;
use std::path::Path;

/// Opens an existing store, refusing to create one.
pub(crate) fn open_store(path: &Path, sync_on_commit: bool) -> CliResult<FileBackend> {
    if !FileBackend::journal_path(path).exists() {
        return Err(CliError::NoStore(path.to_path_buf()));
    }
    Ok(FileBackend::open(path, sync_on_commit)?)
}
