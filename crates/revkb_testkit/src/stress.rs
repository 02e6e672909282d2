//! Stress tests for revkb.
//!
//! These runs exercise commits, historic reads and id allocation under
//! load and concurrent access.

use crate::fixtures::{commit, create_person};
use revkb_core::{KnowledgeBase, KnowledgeItem, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Number of distinct items.
    pub item_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            item_count: 100,
        }
    }
}

/// Run a sequential commit stress test: one rename per commit, cycling
/// over `item_count` people.
pub fn stress_sequential_commits(kb: &KnowledgeBase, config: &StressConfig) -> StressTestResult {
    let people = populate(kb, config.item_count);

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let person = &people[i % people.len()];
        let result = kb.begin_transaction("stress").and_then(|ctx| {
            ctx.set_value(person, "city", format!("city_{i}"))?;
            ctx.commit()
        });
        match result {
            Ok(Some(_)) => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a historic read stress test: reads every committed revision of a
/// person renamed `operations` times.
pub fn stress_historic_reads(kb: &KnowledgeBase, config: &StressConfig) -> StressTestResult {
    let people = populate(kb, 1);
    let person = &people[0];
    let mut history = Vec::with_capacity(config.operations);
    for i in 0..config.operations {
        let revision = kb.begin_transaction("stress").and_then(|ctx| {
            ctx.set_value(person, "name", format!("name_{i}"))?;
            ctx.commit()
        });
        if let Ok(Some(revision)) = revision {
            history.push((revision.number, Value::from(format!("name_{i}"))));
        }
    }

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;
    // Newest first, so every read past the first lands below the head.
    for (revision, expected) in history.iter().rev() {
        match person.value_at("name", *revision) {
            Ok(value) if &value == expected => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run concurrent commits on disjoint items. Every commit should
/// succeed: edits of different objects never conflict.
pub fn stress_concurrent_commits(kb: &KnowledgeBase, config: &StressConfig) -> StressTestResult {
    let people = Arc::new(populate(kb, config.threads.max(1)));
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let kb = kb.clone();
            let people = Arc::clone(&people);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);

            thread::spawn(move || {
                for i in 0..ops_per_thread {
                    let result = kb.begin_transaction("stress").and_then(|ctx| {
                        ctx.set_value(&people[t], "city", format!("city_{t}_{i}"))?;
                        ctx.commit()
                    });
                    match result {
                        Ok(Some(_)) => successful.fetch_add(1, Ordering::Relaxed),
                        _ => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run concurrent commits that all edit the same item. Failed operations
/// count commits rejected by merge conflicts; those contexts are rolled
/// back.
pub fn stress_contended_commits(kb: &KnowledgeBase, config: &StressConfig) -> StressTestResult {
    let people = Arc::new(populate(kb, 1));
    let successful = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let kb = kb.clone();
            let people = Arc::clone(&people);
            let successful = Arc::clone(&successful);
            let conflicts = Arc::clone(&conflicts);

            thread::spawn(move || {
                for i in 0..ops_per_thread {
                    let ctx = kb.begin_transaction("stress").expect("Failed to begin transaction");
                    ctx.set_value(&people[0], "city", format!("city_{t}_{i}"))
                        .expect("Failed to set city");
                    match ctx.commit() {
                        Ok(_) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) if e.is_conflict() => {
                            conflicts.fetch_add(1, Ordering::Relaxed);
                            ctx.rollback().expect("Failed to roll back");
                        }
                        Err(e) => panic!("unexpected commit error: {e}"),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run concurrent id allocation through item creation. Returns the result
/// and the number of distinct ids seen, which must equal the number of
/// successful creations.
pub fn stress_id_allocation(kb: &KnowledgeBase, config: &StressConfig) -> (StressTestResult, usize) {
    let ids = Arc::new(Mutex::new(BTreeSet::new()));
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let kb = kb.clone();
            let ids = Arc::clone(&ids);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);

            thread::spawn(move || {
                let ctx = kb.begin_transaction("stress").expect("Failed to begin transaction");
                for _ in 0..ops_per_thread {
                    match ctx.create_item("Person") {
                        Ok(item) => {
                            ids.lock().expect("id set poisoned").insert(item.key().id);
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                let _ = ctx.rollback();
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    let distinct = ids.lock().expect("id set poisoned").len();
    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );
    (result, distinct)
}

fn populate(kb: &KnowledgeBase, count: usize) -> Vec<Arc<KnowledgeItem>> {
    let ctx = kb.begin_transaction("stress").expect("Failed to begin transaction");
    let people = (0..count.max(1))
        .map(|i| create_person(&ctx, &format!("person_{i}")))
        .collect();
    commit(&ctx);
    people
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestKnowledgeBase;

    #[test]
    fn test_sequential_commits() {
        let test_kb = TestKnowledgeBase::memory();
        let config = StressConfig {
            operations: 200,
            item_count: 10,
            ..Default::default()
        };

        let result = stress_sequential_commits(&test_kb, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 200);
        assert_eq!(test_kb.last_revision(), 201);
    }

    #[test]
    fn test_historic_reads() {
        let test_kb = TestKnowledgeBase::memory();
        let config = StressConfig {
            operations: 100,
            ..Default::default()
        };

        let result = stress_historic_reads(&test_kb, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 100);
    }

    #[test]
    fn test_concurrent_commits() {
        let test_kb = TestKnowledgeBase::memory();
        let config = StressConfig {
            operations: 200,
            threads: 4,
            ..Default::default()
        };

        let result = stress_concurrent_commits(&test_kb, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 200);
    }

    #[test]
    fn test_contended_commits() {
        let test_kb = TestKnowledgeBase::memory();
        let config = StressConfig {
            operations: 100,
            threads: 4,
            ..Default::default()
        };

        let result = stress_contended_commits(&test_kb, &config);
        assert_eq!(result.total_ops, 100);
        assert_eq!(
            test_kb.last_revision() as usize,
            result.successful_ops + 1,
            "every success is one revision on top of the fixture"
        );
    }

    #[test]
    fn test_id_allocation() {
        let test_kb = TestKnowledgeBase::memory();
        let config = StressConfig {
            operations: 2_000,
            threads: 8,
            ..Default::default()
        };

        let (result, distinct) = stress_id_allocation(&test_kb, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(distinct, result.successful_ops);
    }
}
