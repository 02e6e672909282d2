//! Inspect command implementation.

use crate::commands::open_store;
use crate::error::CliResult;
use crate::Format;
use revkb_codec::RevisionNumber;
use revkb_storage::{BranchRow, FileBackend, StorageBackend, StorageStats};
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Id generated when the store was created.
    pub store_id: String,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Last committed revision.
    pub last_revision: RevisionNumber,
    /// Summary counts.
    pub stats: StorageStats,
    /// Per-table counts over all branches.
    pub tables: Vec<TableStats>,
    /// Branch rows (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<BranchRow>>,
}

/// Statistics for a single table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table (type) name.
    pub name: String,
    /// Objects with any stored history.
    pub objects: usize,
    /// Objects alive at the last revision.
    pub live: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_branches: bool, format: Format) -> CliResult<()> {
    let result = inspect(path, show_branches)?;

    match format {
        Format::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects the inspection result of the store at `path`.
pub fn inspect(path: &Path, show_branches: bool) -> CliResult<InspectResult> {
    let backend = open_store(path, false)?;
    let journal_size = std::fs::metadata(FileBackend::journal_path(path))?.len();
    let last_revision = backend.last_revision()?;
    let branches = backend.branches()?;

    let mut tables = Vec::new();
    for name in backend.tables()? {
        let mut stats = TableStats {
            name,
            objects: 0,
            live: 0,
        };
        for branch in &branches {
            stats.objects += backend.object_ids(&stats.name, branch.id)?.len();
            stats.live += backend.scan(&stats.name, branch.id, last_revision, &[])?.len();
        }
        tables.push(stats);
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        store_id: backend.store_id().to_string(),
        journal_size,
        last_revision,
        stats: backend.stats()?,
        tables,
        branches: show_branches.then_some(branches),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("revkb Store Inspection");
    println!("======================");
    println!();
    println!("Path:  {}", result.path);
    println!("Store: {}", result.store_id);
    println!();
    println!("Journal:");
    println!("  Size:          {}", format_size(result.journal_size));
    println!("  Last revision: {}", result.last_revision);
    println!("  Revisions:     {}", result.stats.revisions);
    println!("  Branches:      {}", result.stats.branches);
    println!();
    println!("Rows:");
    println!("  Tables:        {}", result.stats.tables);
    println!("  Row versions:  {}", result.stats.row_versions);
    println!("  Live rows:     {}", result.stats.live_rows);
    println!("  Flex versions: {}", result.stats.flex_versions);

    if !result.tables.is_empty() {
        println!();
        println!("Tables:");
        for table in &result.tables {
            println!(
                "  {:<24} {} objects, {} live",
                table.name, table.objects, table.live
            );
        }
    }

    if let Some(branches) = &result.branches {
        println!();
        println!("Branches:");
        for branch in branches {
            match branch.base_branch {
                Some(base) => println!(
                    "  b{} from b{}@r{}, created at r{}",
                    branch.id, base, branch.base_revision, branch.created_at
                ),
                None => println!("  b{} (trunk)", branch.id),
            }
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
