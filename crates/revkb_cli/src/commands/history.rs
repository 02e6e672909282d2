//! History command implementation.

use crate::commands::open_store;
use crate::error::CliResult;
use crate::Format;
use revkb_core::{KnowledgeBase, Revision, Schema};
use std::path::Path;
use std::sync::Arc;

/// Runs the history command.
pub fn run(path: &Path, limit: Option<usize>, format: Format) -> CliResult<()> {
    let revisions = load(path, limit)?;

    match format {
        Format::Json => {
            println!("{}", serde_json::to_string_pretty(&revisions)?);
        }
        Format::Text => print_text_output(&revisions),
    }
    Ok(())
}

/// Committed revisions of the store, newest first.
///
/// No schema is needed to read the revision table.
pub fn load(path: &Path, limit: Option<usize>) -> CliResult<Vec<Revision>> {
    let backend = open_store(path, false)?;
    let kb = KnowledgeBase::open(Arc::new(backend), Schema::new())?;
    let mut revisions = kb.revisions()?;
    revisions.reverse();
    if let Some(limit) = limit {
        revisions.truncate(limit);
    }
    Ok(revisions)
}

fn print_text_output(revisions: &[Revision]) {
    if revisions.is_empty() {
        println!("No revisions committed");
        return;
    }
    for revision in revisions {
        println!(
            "r{:<6} {}  {}",
            revision.number,
            revision.date.format("%Y-%m-%d %H:%M:%S"),
            revision.author
        );
        if !revision.log.is_empty() {
            println!("        {}", revision.log);
        }
    }
}
