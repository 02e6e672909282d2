//! Demo command implementation.
//!
//! Walks through the basic revision model on a real store: object X is
//! committed as "a", a second transaction changes it to "b", and every read
//! along the way is printed and checked.

use crate::error::{CliError, CliResult};
use revkb_codec::{RevisionNumber, Value, CURRENT_REV};
use revkb_core::{DbContext, KnowledgeBase, Revision, Schema, TypeDef};
use revkb_storage::{FileBackend, StorageBackend};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const DEMO_TYPE: &str = "DemoItem";

/// Values read during the demo.
#[derive(Debug, Serialize)]
pub struct DemoReport {
    /// Revision that created X.
    pub first: RevisionNumber,
    /// Revision that changed X.
    pub second: RevisionNumber,
    /// X read inside the editing transaction before its commit.
    pub inside: Value,
    /// X read from another transaction at the same time.
    pub outside: Value,
    /// X at the first revision, after the second commit.
    pub at_first: Value,
    /// X at the second revision.
    pub at_second: Value,
    /// X at the current revision.
    pub at_current: Value,
}

/// Runs the demo command.
pub fn run(path: &Path) -> CliResult<()> {
    let report = scenario_at(path)?;

    println!("r{}: X = \"a\" committed", report.first);
    println!("T sets X = \"b\" without committing");
    println!("  inside T:   X = {}", report.inside);
    println!("  outside T:  X = {}", report.outside);
    println!("r{}: T committed", report.second);
    println!("  at r{}:      X = {}", report.first, report.at_first);
    println!("  at r{}:      X = {}", report.second, report.at_second);
    println!("  at current: X = {}", report.at_current);
    Ok(())
}

/// Opens (or creates) the store at `path` and runs the scenario on it.
pub fn scenario_at(path: &Path) -> CliResult<DemoReport> {
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::open(path, true)?);
    let schema = Schema::new().with_type(TypeDef::object(DEMO_TYPE).mandatory_value("name"))?;
    let kb = KnowledgeBase::open(backend, schema)?;
    scenario(&kb)
}

/// Runs the scenario on `kb`, failing if any read differs from what the
/// revision model promises.
pub fn scenario(kb: &KnowledgeBase) -> CliResult<DemoReport> {
    let setup = kb.begin_transaction("demo")?;
    let x = setup.create_item_with(DEMO_TYPE, [("name", Value::from("a"))])?;
    let first = committed(&setup, "create X")?.number;

    let t = kb.begin_transaction("demo")?;
    t.set_value(&x, "name", "b")?;
    let inside = t.value(&x, "name")?;
    let observer = kb.begin_transaction("observer")?;
    let outside = observer.value(&x, "name")?;
    observer.rollback()?;
    let second = committed(&t, "set X to b")?.number;

    let report = DemoReport {
        first,
        second,
        inside,
        outside,
        at_first: x.value_at("name", first)?,
        at_second: x.value_at("name", second)?,
        at_current: x.value_at("name", CURRENT_REV)?,
    };
    info!(first, second, "demo finished");

    let a = Value::from("a");
    let b = Value::from("b");
    let checks = [
        ("inside T", &report.inside, &b),
        ("outside T", &report.outside, &a),
        ("first revision", &report.at_first, &a),
        ("second revision", &report.at_second, &b),
        ("current revision", &report.at_current, &b),
    ];
    for (what, found, expected) in checks {
        if found != expected {
            return Err(CliError::DemoMismatch(format!(
                "{what}: expected {expected}, found {found}"
            )));
        }
    }
    Ok(report)
}

fn committed(ctx: &DbContext, log: &str) -> CliResult<Revision> {
    ctx.commit_with_log(log)?
        .ok_or_else(|| CliError::DemoMismatch(format!("'{log}' committed nothing")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_demo_reads() {
        let dir = TempDir::new().unwrap();
        let report = scenario_at(&dir.path().join("store")).unwrap();
        assert_eq!((report.first, report.second), (1, 2));
        assert_eq!(report.inside, Value::from("b"));
        assert_eq!(report.outside, Value::from("a"));
        assert_eq!(report.at_first, Value::from("a"));
        assert_eq!(report.at_current, Value::from("b"));
    }

    #[test]
    fn test_demo_runs_again_on_same_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");
        scenario_at(&path).unwrap();
        let again = scenario_at(&path).unwrap();
        assert_eq!((again.first, again.second), (3, 4));
    }
}
