//! Property-based test generators using proptest.
//!
//! Provides strategies for attribute values and for scripts of edits that
//! a [`crate::HistoryHarness`] can replay against a knowledge base.

use proptest::prelude::*;
use revkb_codec::Value;

/// Strategy for short person names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

/// Strategy for scalar attribute values, `Null` included.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        1 => Just(Value::Null),
        2 => any::<bool>().prop_map(Value::Bool),
        3 => any::<i64>().prop_map(Value::Integer),
        3 => name_strategy().prop_map(Value::Text),
    ]
}

/// One edit of a generated script.
///
/// Items are addressed by slot: the n-th person created by the script.
/// Slots that do not exist or are deleted make the edit a no-op.
#[derive(Debug, Clone)]
pub enum Edit {
    /// Create a person.
    Create {
        /// Its name.
        name: String,
    },
    /// Rename a person.
    Rename {
        /// Person slot.
        slot: usize,
        /// New name.
        name: String,
    },
    /// Set the city of a person.
    SetCity {
        /// Person slot.
        slot: usize,
        /// New city, `Null` to clear.
        city: Value,
    },
    /// Delete a person.
    Delete {
        /// Person slot.
        slot: usize,
    },
}

/// Strategy for a single edit over at most `slots` people.
pub fn edit_strategy(slots: usize) -> impl Strategy<Value = Edit> {
    let slot = 0..slots.max(1);
    prop_oneof![
        3 => name_strategy().prop_map(|name| Edit::Create { name }),
        3 => (slot.clone(), name_strategy()).prop_map(|(slot, name)| Edit::Rename { slot, name }),
        2 => (slot.clone(), scalar_value_strategy())
            .prop_map(|(slot, city)| Edit::SetCity { slot, city }),
        1 => slot.prop_map(|slot| Edit::Delete { slot }),
    ]
}

/// Strategy for a script of commits, each a non-empty list of edits.
pub fn commit_script_strategy(
    commits: std::ops::Range<usize>,
    edits_per_commit: std::ops::Range<usize>,
    slots: usize,
) -> impl Strategy<Value = Vec<Vec<Edit>>> {
    prop::collection::vec(
        prop::collection::vec(edit_strategy(slots), edits_per_commit),
        commits,
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
