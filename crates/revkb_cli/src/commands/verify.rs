//! Verify command implementation.
//!
//! Two passes: the journal frames are checked on disk, then the store is
//! replayed and every row history is checked for overlapping or
//! out-of-range validity.

use crate::commands::open_store;
use crate::error::{CliError, CliResult};
use revkb_codec::{FrameReader, RevisionNumber, CURRENT_REV};
use revkb_storage::{FileBackend, Row, StorageBackend};
use std::path::Path;
use tracing::{debug, warn};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Intact journal frames.
    pub frames: usize,
    /// Bytes of a torn frame at the journal tail, cut off on open.
    pub torn_tail: usize,
    /// Row histories checked.
    pub histories: usize,
    /// Row versions checked.
    pub row_versions: usize,
    /// Problems found.
    pub problems: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> CliResult<()> {
    println!("Verifying store at {}", path.display());
    println!();

    let result = verify(path)?;
    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err(CliError::VerificationFailed(result.problems.len()))
    }
}

/// Verifies the store at `path`.
pub fn verify(path: &Path) -> CliResult<VerifyResult> {
    let journal = FileBackend::journal_path(path);
    if !journal.exists() {
        return Err(CliError::NoStore(path.to_path_buf()));
    }
    let mut result = VerifyResult::default();
    check_frames(&std::fs::read(&journal)?, &mut result);
    if !result.is_ok() {
        // Replaying a corrupt journal fails; report the frame problem instead.
        return Ok(result);
    }

    let backend = open_store(path, false)?;
    let last = backend.last_revision()?;
    for branch in backend.branches()? {
        for table in backend.tables()? {
            for id in backend.object_ids(&table, branch.id)? {
                let history = backend.history(&table, branch.id, id)?;
                result.histories += 1;
                result.row_versions += history.len();
                for problem in check_history(&history, branch.created_at, last) {
                    result
                        .problems
                        .push(format!("{table}@b{} id {id}: {problem}", branch.id));
                }
            }
        }
    }
    debug!(
        histories = result.histories,
        rows = result.row_versions,
        "checked row histories"
    );
    Ok(result)
}

fn check_frames(data: &[u8], result: &mut VerifyResult) {
    let mut reader = FrameReader::new(data);
    let mut valid = 0;
    for frame in reader.by_ref() {
        match frame {
            Ok(_) => {
                result.frames += 1;
                valid += 1;
            }
            Err(e) if e.is_truncation() => {
                break;
            }
            Err(e) => {
                result.problems.push(format!("journal frame {valid}: {e}"));
                return;
            }
        }
    }
    let consumed = reader.offset();
    if consumed < data.len() {
        result.torn_tail = data.len() - consumed;
        warn!(bytes = result.torn_tail, "torn frame at journal tail");
    }
}

/// Checks one row history, oldest first.
///
/// Every row must cover a non-empty range starting no earlier than the
/// revision that created its branch and no later than `last`. Rows must not overlap, and only the
/// newest may be open.
pub fn check_history(
    history: &[Row],
    branch_created: RevisionNumber,
    last: RevisionNumber,
) -> Vec<String> {
    let mut problems = Vec::new();
    for (index, row) in history.iter().enumerate() {
        let range = format!("[{}, {}]", row.rev_min, show(row.rev_max));
        if row.rev_min > row.rev_max {
            problems.push(format!("row {index} has inverted range {range}"));
        }
        if row.rev_min < branch_created.max(1) || row.rev_min > last {
            problems.push(format!(
                "row {index} {range} starts outside [r{}, r{last}]",
                branch_created.max(1)
            ));
        }
        if row.rev_max != CURRENT_REV && row.rev_max >= last {
            problems.push(format!("row {index} {range} closes at or after r{last}"));
        }
        if let Some(newer) = history.get(index + 1) {
            if newer.rev_min <= row.rev_max {
                problems.push(format!(
                    "row {index} {range} overlaps [{}, {}]",
                    newer.rev_min,
                    show(newer.rev_max)
                ));
            }
        }
    }
    problems
}

fn show(revision: RevisionNumber) -> String {
    if revision == CURRENT_REV {
        "current".to_string()
    } else {
        revision.to_string()
    }
}

fn print_result(result: &VerifyResult) {
    println!("Journal:");
    println!("  Frames:       {}", result.frames);
    if result.torn_tail > 0 {
        println!("  Torn tail:    {} bytes (cut off on open)", result.torn_tail);
    }
    println!("Rows:");
    println!("  Histories:    {}", result.histories);
    println!("  Row versions: {}", result.row_versions);

    if !result.problems.is_empty() {
        println!();
        println!("Problems:");
        for problem in &result.problems {
            println!("  - {}", problem);
        }
    }
}
