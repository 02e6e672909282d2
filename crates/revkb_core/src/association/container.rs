//! Association containers.
//!
//! Containers are plain values. Committed ones are shared behind `Arc` and
//! never mutated; every change clones first (`Arc::make_mut`), so a reader
//! holding a container never observes a partial update.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use revkb_codec::{ObjectKey, Value};

use super::ContainerShape;

/// A link matching an association query, with its sort or map key value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// The link item.
    pub link: ObjectKey,
    /// Order or key attribute value; `Null` for sets.
    pub sort: Value,
}

/// Links of one association cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Container {
    /// Unordered links.
    Set(BTreeSet<ObjectKey>),
    /// Links sorted by `(order value, key)`.
    List(Vec<(Value, ObjectKey)>),
    /// Links keyed by an attribute value, with the reverse index.
    ///
    /// Several links may share a key value; lookups return the lowest link
    /// key among them.
    Map {
        /// Key value to links.
        forward: BTreeMap<Value, BTreeSet<ObjectKey>>,
        /// Link to key value.
        reverse: HashMap<ObjectKey, Value>,
    },
}

impl Container {
    /// An empty container of the given shape.
    #[must_use]
    pub fn empty(shape: &ContainerShape) -> Self {
        match shape {
            ContainerShape::Set => Self::Set(BTreeSet::new()),
            ContainerShape::OrderedList { .. } => Self::List(Vec::new()),
            ContainerShape::KeyedMap { .. } => Self::Map {
                forward: BTreeMap::new(),
                reverse: HashMap::new(),
            },
        }
    }

    /// Builds a container from members.
    pub fn from_members(shape: &ContainerShape, members: impl IntoIterator<Item = Member>) -> Self {
        let mut container = Self::empty(shape);
        if let Self::List(entries) = &mut container {
            entries.extend(members.into_iter().map(|m| (m.sort, m.link)));
            entries.sort();
            return container;
        }
        for member in members {
            container.insert(member);
        }
        container
    }

    /// Adds a link, replacing an earlier entry for the same link.
    pub fn insert(&mut self, member: Member) {
        self.remove(&member.link);
        match self {
            Self::Set(links) => {
                links.insert(member.link);
            }
            Self::List(entries) => {
                let entry = (member.sort, member.link);
                let at = entries.partition_point(|e| *e < entry);
                entries.insert(at, entry);
            }
            Self::Map { forward, reverse } => {
                forward
                    .entry(member.sort.clone())
                    .or_default()
                    .insert(member.link.clone());
                reverse.insert(member.link, member.sort);
            }
        }
    }

    /// Removes a link. Returns false if it was not contained.
    pub fn remove(&mut self, link: &ObjectKey) -> bool {
        match self {
            Self::Set(links) => links.remove(link),
            Self::List(entries) => match entries.iter().position(|(_, l)| l == link) {
                Some(at) => {
                    entries.remove(at);
                    true
                }
                None => false,
            },
            Self::Map { forward, reverse } => {
                let Some(key) = reverse.remove(link) else {
                    return false;
                };
                if let Some(links) = forward.get_mut(&key) {
                    links.remove(link);
                    if links.is_empty() {
                        forward.remove(&key);
                    }
                }
                true
            }
        }
    }

    /// Returns true if `link` is contained.
    #[must_use]
    pub fn contains(&self, link: &ObjectKey) -> bool {
        match self {
            Self::Set(links) => links.contains(link),
            Self::List(entries) => entries.iter().any(|(_, l)| l == link),
            Self::Map { reverse, .. } => reverse.contains_key(link),
        }
    }

    /// Number of links.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Set(links) => links.len(),
            Self::List(entries) => entries.len(),
            Self::Map { reverse, .. } => reverse.len(),
        }
    }

    /// Returns true if no link is contained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Links in container order: key order for sets, list order for lists,
    /// key value order for maps.
    #[must_use]
    pub fn links(&self) -> Vec<ObjectKey> {
        match self {
            Self::Set(links) => links.iter().cloned().collect(),
            Self::List(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            Self::Map { forward, .. } => forward.values().flatten().cloned().collect(),
        }
    }

    /// Sorted `(order value, link)` entries of a list.
    #[must_use]
    pub fn entries(&self) -> &[(Value, ObjectKey)] {
        match self {
            Self::List(entries) => entries,
            _ => &[],
        }
    }

    /// The link stored under a map key.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<&ObjectKey> {
        match self {
            Self::Map { forward, .. } => forward.get(key).and_then(|links| links.first()),
            _ => None,
        }
    }

    /// The map key of a link.
    #[must_use]
    pub fn key_of(&self, link: &ObjectKey) -> Option<&Value> {
        match self {
            Self::Map { reverse, .. } => reverse.get(link),
            _ => None,
        }
    }

    /// Position of a link in a list.
    #[must_use]
    pub fn position(&self, link: &ObjectKey) -> Option<usize> {
        match self {
            Self::List(entries) => entries.iter().position(|(_, l)| l == link),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revkb_codec::TRUNK;

    fn link(id: u64) -> ObjectKey {
        ObjectKey::current(TRUNK, "hasMember", id)
    }

    fn member(id: u64, sort: impl Into<Value>) -> Member {
        Member {
            link: link(id),
            sort: sort.into(),
        }
    }

    fn ordered() -> ContainerShape {
        ContainerShape::OrderedList {
            order_attribute: "order".into(),
            live: true,
            indexed: false,
        }
    }

    #[test]
    fn list_stays_sorted_and_reorders_on_reinsert() {
        let mut list =
            Container::from_members(&ordered(), [member(1, 30), member(2, 10), member(3, 20)]);
        assert_eq!(list.links(), vec![link(2), link(3), link(1)]);

        list.insert(member(2, 40));
        assert_eq!(list.links(), vec![link(3), link(1), link(2)]);
        assert_eq!(list.position(&link(2)), Some(2));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn list_ties_break_by_key() {
        let list = Container::from_members(&ordered(), [member(9, 1), member(4, 1)]);
        assert_eq!(list.links(), vec![link(4), link(9)]);
    }

    #[test]
    fn map_keeps_both_directions_in_step() {
        let shape = ContainerShape::KeyedMap {
            key_attribute: "role".into(),
        };
        let mut map = Container::from_members(&shape, [member(5, "editor"), member(2, "editor")]);
        assert_eq!(map.get(&Value::from("editor")), Some(&link(2)));

        assert!(map.remove(&link(2)));
        assert_eq!(map.get(&Value::from("editor")), Some(&link(5)));
        assert_eq!(map.key_of(&link(5)), Some(&Value::from("editor")));

        map.insert(member(5, "owner"));
        assert!(map.get(&Value::from("editor")).is_none());
        assert_eq!(map.get(&Value::from("owner")), Some(&link(5)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn set_remove_reports_presence() {
        let mut set = Container::from_members(&ContainerShape::Set, [member(1, Value::Null)]);
        assert!(set.contains(&link(1)));
        assert!(set.remove(&link(1)));
        assert!(!set.remove(&link(1)));
        assert!(set.is_empty());
    }
}
