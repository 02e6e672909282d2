//! Revision-bounded snapshot chains.
//!
//! A [`ValidityChain`] node holds one payload valid over the inclusive range
//! `[min_validity, max_validity]` and an optional link to an older node
//! whose range ends before this one starts. Gaps between nodes are allowed,
//! overlaps are not.
//!
//! A node becomes *frozen* when it acquires a successor (when another node
//! links to it as its former). Frozen bounds never change again.
//!
//! The same structure backs committed item values, flex attribute data,
//! association caches and query caches; [`ChainSlot`] is the shared head
//! holder with the lookup, insertion and commit-advance protocols.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use revkb_codec::{RevisionNumber, CURRENT_REV};
use thiserror::Error;
use tracing::debug;

/// A validity chain bookkeeping failure. Indicates a logic defect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidityError {
    /// Attempted to change the bounds of a frozen node.
    #[error("node [{min}, {max}] is frozen")]
    Frozen {
        /// Node start.
        min: RevisionNumber,
        /// Node end.
        max: RevisionNumber,
    },
    /// Bounds with `min > max`.
    #[error("inverted bounds [{min}, {max}]")]
    InvertedBounds {
        /// Requested start.
        min: RevisionNumber,
        /// Requested end.
        max: RevisionNumber,
    },
    /// Linking a former node that reaches into this node's range.
    #[error("former node ends at {former_max}, not before {min}")]
    Overlap {
        /// End of the former node.
        former_max: RevisionNumber,
        /// Start of this node.
        min: RevisionNumber,
    },
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: RevisionNumber,
    max: RevisionNumber,
    frozen: bool,
}

/// One node of a validity chain.
pub struct ValidityChain<V> {
    bounds: Mutex<Bounds>,
    former: Mutex<Option<Arc<ValidityChain<V>>>>,
    payload: V,
}

impl<V> ValidityChain<V> {
    /// Creates an unlinked node valid over `[min, max]`.
    ///
    /// # Errors
    ///
    /// Fails with `InvertedBounds` if `min > max`.
    pub fn new(min: RevisionNumber, max: RevisionNumber, payload: V) -> Result<Arc<Self>, ValidityError> {
        if min > max {
            return Err(ValidityError::InvertedBounds { min, max });
        }
        Ok(Arc::new(Self {
            bounds: Mutex::new(Bounds {
                min,
                max,
                frozen: false,
            }),
            former: Mutex::new(None),
            payload,
        }))
    }

    /// Creates a node for a value that is not yet committed. Its range is
    /// `[CURRENT_REV, CURRENT_REV]` until [`Self::publish_local_validity`].
    #[must_use]
    pub fn local(payload: V) -> Arc<Self> {
        Arc::new(Self {
            bounds: Mutex::new(Bounds {
                min: CURRENT_REV,
                max: CURRENT_REV,
                frozen: false,
            }),
            former: Mutex::new(None),
            payload,
        })
    }

    /// First revision this node is valid for.
    pub fn min_validity(&self) -> RevisionNumber {
        self.bounds.lock().min
    }

    /// Last revision this node is valid for.
    pub fn max_validity(&self) -> RevisionNumber {
        self.bounds.lock().max
    }

    /// Both bounds read atomically.
    pub fn range(&self) -> (RevisionNumber, RevisionNumber) {
        let bounds = self.bounds.lock();
        (bounds.min, bounds.max)
    }

    /// Returns true once a successor links to this node.
    pub fn is_frozen(&self) -> bool {
        self.bounds.lock().frozen
    }

    /// Returns true if this node reaches up to `CURRENT_REV`.
    pub fn is_open(&self) -> bool {
        self.max_validity() == CURRENT_REV
    }

    /// Returns true if `revision` lies within this node's range.
    pub fn contains(&self, revision: RevisionNumber) -> bool {
        let (min, max) = self.range();
        min <= revision && revision <= max
    }

    /// The payload.
    pub fn payload(&self) -> &V {
        &self.payload
    }

    /// The next older node, if linked.
    pub fn former_validity(&self) -> Option<Arc<Self>> {
        self.former.lock().clone()
    }

    /// Moves the end of this node.
    ///
    /// # Errors
    ///
    /// Fails if the node is frozen or `max < min_validity()`.
    pub fn update_max_validity(&self, max: RevisionNumber) -> Result<(), ValidityError> {
        let mut bounds = self.bounds.lock();
        if bounds.frozen {
            return Err(ValidityError::Frozen {
                min: bounds.min,
                max: bounds.max,
            });
        }
        if max < bounds.min {
            return Err(ValidityError::InvertedBounds {
                min: bounds.min,
                max,
            });
        }
        bounds.max = max;
        Ok(())
    }

    /// Moves the start of this node down to `min`, turning a local node into
    /// a committed one.
    ///
    /// # Errors
    ///
    /// Fails if the node is frozen, `min > max_validity()`, or the former
    /// node would overlap.
    pub fn publish_local_validity(&self, min: RevisionNumber) -> Result<(), ValidityError> {
        let former_max = self.former.lock().as_ref().map(|f| f.max_validity());
        let mut bounds = self.bounds.lock();
        if bounds.frozen {
            return Err(ValidityError::Frozen {
                min: bounds.min,
                max: bounds.max,
            });
        }
        if min > bounds.max {
            return Err(ValidityError::InvertedBounds {
                min,
                max: bounds.max,
            });
        }
        if let Some(former_max) = former_max {
            if former_max >= min {
                return Err(ValidityError::Overlap { former_max, min });
            }
        }
        bounds.min = min;
        Ok(())
    }

    /// Links `node` as the next older node and freezes it.
    ///
    /// # Errors
    ///
    /// Fails with `Overlap` if `node.max_validity() >= self.min_validity()`.
    pub fn set_former_validity(&self, node: Arc<Self>) -> Result<(), ValidityError> {
        let min = self.min_validity();
        {
            let mut former_bounds = node.bounds.lock();
            if former_bounds.max >= min {
                return Err(ValidityError::Overlap {
                    former_max: former_bounds.max,
                    min,
                });
            }
            former_bounds.frozen = true;
        }
        *self.former.lock() = Some(node);
        Ok(())
    }

    /// Drops the link to older nodes so they can be freed.
    pub fn cleanup(&self) {
        self.former.lock().take();
    }

    /// Finds the node covering `revision`, starting at this node.
    pub fn find(self: &Arc<Self>, revision: RevisionNumber) -> Option<Arc<Self>> {
        let mut node = Arc::clone(self);
        loop {
            let (min, max) = node.range();
            if revision > max {
                return None;
            }
            if revision >= min {
                return Some(node);
            }
            node = node.former_validity()?;
        }
    }

    /// Iterates from this node towards older ones.
    pub fn iter(self: &Arc<Self>) -> ChainIter<V> {
        ChainIter {
            next: Some(Arc::clone(self)),
        }
    }

    /// Number of linked nodes including this one.
    pub fn len(self: &Arc<Self>) -> usize {
        self.iter().count()
    }

    /// Drops every node that ends before the node covering or preceding
    /// `oldest`. Returns the number of nodes dropped.
    pub fn truncate_before(self: &Arc<Self>, oldest: RevisionNumber) -> usize {
        for node in self.iter() {
            if node.min_validity() <= oldest {
                let dropped = node.former_validity().map_or(0, |f| f.len());
                node.cleanup();
                return dropped;
            }
        }
        0
    }
}

impl<V> Drop for ValidityChain<V> {
    fn drop(&mut self) {
        // Unlink iteratively so long chains do not recurse.
        let mut next = self.former.get_mut().take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.former.get_mut().take(),
                Err(_) => break,
            }
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for ValidityChain<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bounds = *self.bounds.lock();
        f.debug_struct("ValidityChain")
            .field("min", &bounds.min)
            .field("max", &bounds.max)
            .field("frozen", &bounds.frozen)
            .field("payload", &self.payload)
            .field("has_former", &self.former.lock().is_some())
            .finish()
    }
}

/// Iterator over a chain, newest first.
pub struct ChainIter<V> {
    next: Option<Arc<ValidityChain<V>>>,
}

impl<V> Iterator for ChainIter<V> {
    type Item = Arc<ValidityChain<V>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next.take()?;
        self.next = node.former_validity();
        Some(node)
    }
}

/// Result of inserting a loaded node into a chain.
#[derive(Debug)]
pub enum Inserted<V> {
    /// The node was linked into the chain.
    Linked(Arc<ValidityChain<V>>),
    /// The chain already covered part of the node's range; the node was
    /// returned unlinked for one-off use.
    Detached(Arc<ValidityChain<V>>),
}

impl<V> Inserted<V> {
    /// The node, linked or not.
    pub fn node(self) -> Arc<ValidityChain<V>> {
        match self {
            Self::Linked(node) | Self::Detached(node) => node,
        }
    }
}

/// Holder of a chain head.
pub struct ChainSlot<V> {
    head: RwLock<Option<Arc<ValidityChain<V>>>>,
}

impl<V> Default for ChainSlot<V> {
    fn default() -> Self {
        Self {
            head: RwLock::new(None),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for ChainSlot<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainSlot")
            .field("ranges", &self.ranges())
            .finish()
    }
}

impl<V> ChainSlot<V> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The newest node.
    pub fn head(&self) -> Option<Arc<ValidityChain<V>>> {
        self.head.read().clone()
    }

    /// Returns true if no node is loaded.
    pub fn is_empty(&self) -> bool {
        self.head.read().is_none()
    }

    /// The node covering `revision`, if loaded.
    pub fn find(&self, revision: RevisionNumber) -> Option<Arc<ValidityChain<V>>> {
        self.head().and_then(|head| head.find(revision))
    }

    /// Ranges of all nodes, newest first.
    pub fn ranges(&self) -> Vec<(RevisionNumber, RevisionNumber)> {
        self.head()
            .map(|head| head.iter().map(|node| node.range()).collect())
            .unwrap_or_default()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.head().map_or(0, |head| head.len())
    }

    /// Drops all nodes.
    pub fn clear(&self) {
        self.head.write().take();
    }

    /// Inserts a node loaded from storage at its place in the chain.
    ///
    /// A node overlapping a linked one was loaded against an outdated view;
    /// it is returned detached and the chain is left unchanged.
    ///
    /// # Errors
    ///
    /// Fails only on bookkeeping defects.
    pub fn insert(&self, node: Arc<ValidityChain<V>>) -> Result<Inserted<V>, ValidityError> {
        let mut head = self.head.write();
        let Some(newest) = head.clone() else {
            *head = Some(Arc::clone(&node));
            return Ok(Inserted::Linked(node));
        };

        let (min, max) = node.range();
        if min > newest.max_validity() {
            node.set_former_validity(newest)?;
            *head = Some(Arc::clone(&node));
            return Ok(Inserted::Linked(node));
        }

        let mut newer = newest;
        loop {
            let (newer_min, newer_max) = newer.range();
            if max >= newer_min && min <= newer_max {
                debug!(min, max, newer_min, newer_max, "ignoring overlapping load");
                return Ok(Inserted::Detached(node));
            }
            match newer.former_validity() {
                None => {
                    newer.set_former_validity(Arc::clone(&node))?;
                    return Ok(Inserted::Linked(node));
                }
                Some(older) => {
                    if min > older.max_validity() {
                        node.set_former_validity(older)?;
                        newer.set_former_validity(Arc::clone(&node))?;
                        return Ok(Inserted::Linked(node));
                    }
                    newer = older;
                }
            }
        }
    }

    /// Publishes a new committed payload valid from `revision`.
    ///
    /// An open head is closed at `revision - 1`; the new node is valid over
    /// `[revision, CURRENT_REV]`.
    ///
    /// # Errors
    ///
    /// Fails only on bookkeeping defects.
    pub fn advance(&self, revision: RevisionNumber, payload: V) -> Result<Arc<ValidityChain<V>>, ValidityError> {
        let mut head = self.head.write();
        let node = ValidityChain::local(payload);
        node.publish_local_validity(revision)?;
        if let Some(previous) = head.clone() {
            if previous.is_open() {
                previous.update_max_validity(revision.saturating_sub(1))?;
            }
            node.set_former_validity(previous)?;
        }
        *head = Some(Arc::clone(&node));
        Ok(node)
    }

    /// Derives the payload of `revision` from an open head.
    ///
    /// Does nothing if the head is missing or closed, or if `derive` returns
    /// `None` (no change).
    ///
    /// # Errors
    ///
    /// Fails only on bookkeeping defects.
    pub fn derive(
        &self,
        revision: RevisionNumber,
        derive: impl FnOnce(&V) -> Option<V>,
    ) -> Result<bool, ValidityError> {
        let mut head = self.head.write();
        let Some(previous) = head.clone() else {
            return Ok(false);
        };
        if !previous.is_open() || previous.min_validity() >= revision {
            return Ok(false);
        }
        let Some(payload) = derive(previous.payload()) else {
            return Ok(false);
        };
        let node = ValidityChain::local(payload);
        node.publish_local_validity(revision)?;
        previous.update_max_validity(revision - 1)?;
        node.set_former_validity(previous)?;
        *head = Some(node);
        Ok(true)
    }

    /// Truncates history below `oldest`. Returns the number of dropped nodes.
    pub fn truncate_before(&self, oldest: RevisionNumber) -> usize {
        self.head().map_or(0, |head| head.truncate_before(oldest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_rejects_inverted_bounds() {
        assert_eq!(
            ValidityChain::new(5, 4, ()).unwrap_err(),
            ValidityError::InvertedBounds { min: 5, max: 4 }
        );
    }

    #[test]
    fn update_max_validity_respects_min_and_freeze() {
        let old = ValidityChain::new(1, CURRENT_REV, "a").unwrap();
        old.update_max_validity(3).unwrap();
        assert_eq!(old.range(), (1, 3));
        assert!(old.update_max_validity(0).is_err());

        let new = ValidityChain::new(4, CURRENT_REV, "b").unwrap();
        new.set_former_validity(Arc::clone(&old)).unwrap();
        assert!(old.is_frozen());
        assert_eq!(
            old.update_max_validity(5).unwrap_err(),
            ValidityError::Frozen { min: 1, max: 3 }
        );
    }

    #[test]
    fn set_former_rejects_overlap() {
        let old = ValidityChain::new(1, 4, ()).unwrap();
        let new = ValidityChain::new(4, 9, ()).unwrap();
        assert_eq!(
            new.set_former_validity(Arc::clone(&old)).unwrap_err(),
            ValidityError::Overlap { former_max: 4, min: 4 }
        );
        assert!(!old.is_frozen());
    }

    #[test]
    fn publish_local_validity_lowers_start() {
        let node = ValidityChain::local("x");
        node.publish_local_validity(7).unwrap();
        assert_eq!(node.range(), (7, CURRENT_REV));

        let bounded = ValidityChain::new(3, 5, "y").unwrap();
        assert!(bounded.publish_local_validity(6).is_err());
    }

    #[test]
    fn publish_local_validity_checks_former() {
        let node = ValidityChain::local("x");
        let former = ValidityChain::new(1, 6, "w").unwrap();
        *node.former.lock() = Some(former);
        assert_eq!(
            node.publish_local_validity(6).unwrap_err(),
            ValidityError::Overlap { former_max: 6, min: 6 }
        );
        node.publish_local_validity(7).unwrap();
    }

    #[test]
    fn find_walks_to_covering_node() {
        let slot = ChainSlot::new();
        slot.advance(1, "a").unwrap();
        slot.advance(4, "b").unwrap();
        slot.advance(9, "c").unwrap();

        assert_eq!(slot.ranges(), vec![(9, CURRENT_REV), (4, 8), (1, 3)]);
        assert_eq!(*slot.find(2).unwrap().payload(), "a");
        assert_eq!(*slot.find(8).unwrap().payload(), "b");
        assert_eq!(*slot.find(CURRENT_REV).unwrap().payload(), "c");
        assert!(slot.find(0).is_none());
    }

    #[test]
    fn insert_places_older_node_in_gap() {
        let slot = ChainSlot::new();
        slot.insert(ValidityChain::new(10, CURRENT_REV, "new").unwrap())
            .unwrap();
        slot.insert(ValidityChain::new(1, 2, "oldest").unwrap())
            .unwrap();
        let linked = slot
            .insert(ValidityChain::new(4, 6, "middle").unwrap())
            .unwrap();
        assert!(matches!(linked, Inserted::Linked(_)));
        assert_eq!(slot.ranges(), vec![(10, CURRENT_REV), (4, 6), (1, 2)]);
        assert!(slot.find(3).is_none());
        assert_eq!(*slot.find(5).unwrap().payload(), "middle");
    }

    #[test]
    fn insert_detaches_overlapping_load() {
        let slot = ChainSlot::new();
        slot.insert(ValidityChain::new(5, CURRENT_REV, "live").unwrap())
            .unwrap();
        let result = slot
            .insert(ValidityChain::new(3, 6, "stale").unwrap())
            .unwrap();
        assert!(matches!(result, Inserted::Detached(_)));
        assert_eq!(slot.len(), 1);
    }

    #[test]
    fn insert_newer_node_becomes_head() {
        let slot = ChainSlot::new();
        slot.insert(ValidityChain::new(1, 3, "a").unwrap()).unwrap();
        slot.insert(ValidityChain::new(5, 5, "b").unwrap()).unwrap();
        assert_eq!(slot.ranges(), vec![(5, 5), (1, 3)]);
    }

    #[test]
    fn rejected_advance_keeps_chain() {
        let slot = ChainSlot::new();
        slot.insert(ValidityChain::new(1, 10, "a").unwrap()).unwrap();
        assert_eq!(
            slot.advance(5, "b").unwrap_err(),
            ValidityError::Overlap { former_max: 10, min: 5 }
        );
        assert_eq!(slot.ranges(), vec![(1, 10)]);
        assert!(!slot.head().unwrap().is_frozen());

        let open = ChainSlot::new();
        open.advance(4, "a").unwrap();
        assert!(open.advance(4, "b").is_err());
        assert_eq!(open.ranges(), vec![(4, CURRENT_REV)]);
        assert_eq!(*open.find(CURRENT_REV).unwrap().payload(), "a");
    }

    #[test]
    fn derive_only_from_open_head() {
        let slot: ChainSlot<u32> = ChainSlot::new();
        assert!(!slot.derive(2, |v| Some(v + 1)).unwrap());

        slot.insert(ValidityChain::new(1, 1, 10).unwrap()).unwrap();
        assert!(!slot.derive(2, |v| Some(v + 1)).unwrap());

        slot.advance(3, 20).unwrap();
        assert!(!slot.derive(5, |_| None).unwrap());
        assert!(slot.derive(5, |v| Some(v + 1)).unwrap());
        assert_eq!(*slot.find(CURRENT_REV).unwrap().payload(), 21);
        assert_eq!(*slot.find(4).unwrap().payload(), 20);
    }

    #[test]
    fn truncate_drops_unreachable_history() {
        let slot = ChainSlot::new();
        for (rev, payload) in [(1, "a"), (3, "b"), (6, "c"), (9, "d")] {
            slot.advance(rev, payload).unwrap();
        }
        assert_eq!(slot.truncate_before(7), 2);
        assert_eq!(slot.ranges(), vec![(9, CURRENT_REV), (6, 8)]);
        assert_eq!(slot.truncate_before(7), 0);
    }

    #[test]
    fn long_chain_drops_without_recursion() {
        let slot = ChainSlot::new();
        for rev in 1..=100_000 {
            slot.advance(rev, rev).unwrap();
        }
        assert_eq!(slot.len(), 100_000);
        slot.clear();
        assert!(slot.is_empty());
    }

    proptest! {
        #[test]
        fn committed_ranges_never_overlap(steps in prop::collection::vec(1u64..5, 1..40)) {
            let slot = ChainSlot::new();
            let mut revision = 0;
            for (i, step) in steps.iter().enumerate() {
                revision += step;
                slot.advance(revision, i).unwrap();
            }
            let ranges = slot.ranges();
            for pair in ranges.windows(2) {
                let (newer, older) = (pair[0], pair[1]);
                prop_assert!(older.1 < newer.0);
                prop_assert!(older.0 <= older.1);
            }
            let mut at = 0;
            for (i, step) in steps.iter().enumerate() {
                at += step;
                prop_assert_eq!(*slot.find(at).unwrap().payload(), i);
            }
        }
    }
}
