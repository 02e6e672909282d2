//! Cross-crate integration test helpers.
//!
//! [`HistoryHarness`] replays scripts of edits against a knowledge base
//! while keeping a plain model of every committed revision, then checks
//! that each past revision still reads exactly as the model says.

use crate::fixtures::{create_person, TestKnowledgeBase};
use crate::generators::Edit;
use revkb_core::{ItemReader, KnowledgeBase, KnowledgeItem, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Expected committed state of one person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonState {
    /// The `name` attribute.
    pub name: Value,
    /// The `city` attribute.
    pub city: Value,
}

type Snapshot = Vec<Option<PersonState>>;

/// A test harness tracking the expected state of every revision.
pub struct HistoryHarness {
    /// The knowledge base under test.
    pub test_kb: TestKnowledgeBase,
    people: Vec<Arc<KnowledgeItem>>,
    current: Snapshot,
    revisions: BTreeMap<u64, Snapshot>,
}

impl HistoryHarness {
    /// Creates a harness over an in-memory knowledge base.
    pub fn new() -> Self {
        Self::with(TestKnowledgeBase::memory())
    }

    /// Creates a harness over `test_kb`, which must be empty.
    pub fn with(test_kb: TestKnowledgeBase) -> Self {
        assert_eq!(test_kb.last_revision(), 0, "harness needs an empty store");
        Self {
            test_kb,
            people: Vec::new(),
            current: Vec::new(),
            revisions: BTreeMap::new(),
        }
    }

    /// Applies `edits` in one context and commits. Returns the new revision,
    /// or `None` if the edits changed nothing.
    pub fn apply(&mut self, edits: &[Edit]) -> Option<u64> {
        let ctx = self
            .test_kb
            .begin_transaction("harness")
            .expect("Failed to begin transaction");
        let mut next = self.current.clone();

        for edit in edits {
            match edit {
                Edit::Create { name } => {
                    self.people.push(create_person(&ctx, name));
                    next.push(Some(PersonState {
                        name: Value::from(name.as_str()),
                        city: Value::Null,
                    }));
                }
                Edit::Rename { slot, name } => {
                    if let Some(Some(state)) = next.get_mut(*slot) {
                        ctx.set_value(&self.people[*slot], "name", name.as_str())
                            .expect("Failed to rename");
                        state.name = Value::from(name.as_str());
                    }
                }
                Edit::SetCity { slot, city } => {
                    if let Some(Some(state)) = next.get_mut(*slot) {
                        ctx.set_value(&self.people[*slot], "city", city.clone())
                            .expect("Failed to set city");
                        state.city = city.clone();
                    }
                }
                Edit::Delete { slot } => {
                    if let Some(entry @ Some(_)) = next.get_mut(*slot) {
                        ctx.delete(&self.people[*slot]).expect("Failed to delete");
                        *entry = None;
                    }
                }
            }
        }

        let committed = ctx.commit().expect("Failed to commit");
        match committed {
            Some(revision) => {
                self.revisions.insert(revision.number, next.clone());
                self.current = next;
                Some(revision.number)
            }
            None => {
                // Created and deleted again, or nothing at all.
                self.current = next;
                None
            }
        }
    }

    /// Applies every commit of `script`.
    pub fn run(&mut self, script: &[Vec<Edit>]) {
        for edits in script {
            self.apply(edits);
        }
    }

    /// Committed revisions so far.
    pub fn revisions(&self) -> Vec<u64> {
        self.revisions.keys().copied().collect()
    }

    /// Checks every recorded revision through the harness's knowledge base.
    pub fn verify(&self) {
        self.verify_in(&self.test_kb);
    }

    /// Checks every recorded revision through a knowledge base with cold
    /// caches over the same storage.
    pub fn verify_reopened(&self) {
        self.verify_in(&self.test_kb.reopen());
    }

    fn verify_in(&self, kb: &KnowledgeBase) {
        for (&revision, snapshot) in &self.revisions {
            let reader = kb.reader(revision);
            for (slot, person) in self.people.iter().enumerate() {
                let expected = snapshot.get(slot).cloned().flatten();
                let found = reader
                    .resolve(person.key())
                    .expect("Failed to resolve person");
                match (expected, found) {
                    (None, None) => {}
                    (Some(state), Some(item)) => {
                        let values = reader.values(&item).expect("Failed to read values");
                        let actual = PersonState {
                            name: values[0].clone(),
                            city: values[1].clone(),
                        };
                        assert_eq!(
                            actual, state,
                            "slot {slot} at revision {revision}; model: {}",
                            self.to_json()
                        );
                    }
                    (expected, found) => panic!(
                        "slot {slot} at revision {revision}: expected {expected:?}, alive: {}",
                        found.is_some()
                    ),
                }
            }
        }
    }

    /// The model as JSON, for failure messages.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.revisions).unwrap_or_else(|e| format!("<{e}>"))
    }
}

impl Default for HistoryHarness {
    fn default() -> Self {
        Self::new()
    }
}
