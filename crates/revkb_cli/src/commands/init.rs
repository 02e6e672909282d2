//! Init command implementation.

use crate::error::CliResult;
use revkb_storage::{FileBackend, StorageBackend};
use std::path::Path;
use tracing::info;

/// Runs the init command.
///
/// Opening a directory without a journal creates one; an existing store is
/// left as it is and only reported.
pub fn run(path: &Path) -> CliResult<()> {
    let existed = FileBackend::journal_path(path).exists();
    let backend = FileBackend::open(path, true)?;
    let last = backend.last_revision()?;

    if existed {
        println!(
            "Store {} already exists at {} (last revision {})",
            backend.store_id(),
            path.display(),
            last
        );
    } else {
        info!(store = %backend.store_id(), "initialized store");
        println!("Created store {} at {}", backend.store_id(), path.display());
    }
    Ok(())
}
