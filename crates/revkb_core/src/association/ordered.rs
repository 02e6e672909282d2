//! Order attribute assignment for live lists.

use revkb_codec::{ObjectKey, Value};

/// Gap left between order values when a list is renumbered.
pub(crate) const ORDER_STEP: i64 = 1024;

/// Order values to write so that `link` lands at `index` of a list whose
/// other links are `entries` (sorted, without `link`).
///
/// For position-indexed lists every link gets its position. Otherwise only
/// `link` is assigned the midpoint between its new neighbours; when no gap
/// is left, or a neighbour has no integer order, the whole list is
/// renumbered in steps of [`ORDER_STEP`].
pub(crate) fn order_assignments(
    entries: &[(Value, ObjectKey)],
    index: usize,
    link: &ObjectKey,
    indexed: bool,
) -> Vec<(ObjectKey, Value)> {
    let index = index.min(entries.len());
    if indexed {
        return renumber(entries, index, link, |position| position as i64);
    }

    let previous = index.checked_sub(1).map(|i| entries[i].0.as_integer());
    let next = entries.get(index).map(|(order, _)| order.as_integer());
    let slot = match (previous, next) {
        (None, None) => Some(ORDER_STEP),
        (Some(Some(p)), None) => p.checked_add(ORDER_STEP),
        (None, Some(Some(n))) => n.checked_sub(ORDER_STEP),
        (Some(Some(p)), Some(Some(n))) => n
            .checked_sub(p)
            .filter(|gap| *gap >= 2)
            .map(|gap| p + gap / 2),
        _ => None,
    };
    match slot {
        Some(order) => vec![(link.clone(), Value::Integer(order))],
        None => renumber(entries, index, link, |position| {
            (position as i64 + 1) * ORDER_STEP
        }),
    }
}

fn renumber(
    entries: &[(Value, ObjectKey)],
    index: usize,
    link: &ObjectKey,
    order_of: impl Fn(usize) -> i64,
) -> Vec<(ObjectKey, Value)> {
    let unset = Value::Null;
    let mut keys: Vec<(&Value, &ObjectKey)> = entries.iter().map(|(v, k)| (v, k)).collect();
    keys.insert(index, (&unset, link));
    keys.into_iter()
        .enumerate()
        .filter_map(|(position, (old, key))| {
            let order = Value::Integer(order_of(position));
            (key == link || *old != order).then_some((key.clone(), order))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use revkb_codec::TRUNK;

    fn link(id: u64) -> ObjectKey {
        ObjectKey::current(TRUNK, "hasMember", id)
    }

    fn entries(orders: &[i64]) -> Vec<(Value, ObjectKey)> {
        orders
            .iter()
            .enumerate()
            .map(|(i, o)| (Value::Integer(*o), link(i as u64 + 1)))
            .collect()
    }

    #[test]
    fn midpoint_between_neighbours() {
        let list = entries(&[100, 200]);
        assert_eq!(
            order_assignments(&list, 1, &link(9), false),
            vec![(link(9), Value::Integer(150))]
        );
    }

    #[test]
    fn ends_extend_by_step() {
        let list = entries(&[100, 200]);
        assert_eq!(
            order_assignments(&list, 0, &link(9), false),
            vec![(link(9), Value::Integer(100 - ORDER_STEP))]
        );
        assert_eq!(
            order_assignments(&list, 7, &link(9), false),
            vec![(link(9), Value::Integer(200 + ORDER_STEP))]
        );
        assert_eq!(
            order_assignments(&[], 0, &link(9), false),
            vec![(link(9), Value::Integer(ORDER_STEP))]
        );
    }

    #[test]
    fn renumbers_when_no_gap_left() {
        let list = entries(&[5, 6]);
        let assigned = order_assignments(&list, 1, &link(9), false);
        assert_eq!(
            assigned,
            vec![
                (link(1), Value::Integer(ORDER_STEP)),
                (link(9), Value::Integer(2 * ORDER_STEP)),
                (link(2), Value::Integer(3 * ORDER_STEP)),
            ]
        );
    }

    #[test]
    fn extreme_neighbours_fall_back_to_renumbering() {
        let list = entries(&[-5, i64::MAX]);
        let assigned = order_assignments(&list, 1, &link(9), false);
        assert_eq!(
            assigned,
            vec![
                (link(1), Value::Integer(ORDER_STEP)),
                (link(9), Value::Integer(2 * ORDER_STEP)),
                (link(2), Value::Integer(3 * ORDER_STEP)),
            ]
        );

        let list = entries(&[i64::MIN, 0]);
        assert_eq!(
            order_assignments(&list, 0, &link(9), false).len(),
            3,
            "no room below i64::MIN"
        );
        let list = entries(&[0, i64::MAX]);
        assert_eq!(
            order_assignments(&list, 2, &link(9), false).len(),
            3,
            "no room above i64::MAX"
        );
    }

    #[test]
    fn wide_gap_takes_midpoint_without_overflow() {
        let list = entries(&[i64::MIN / 2, i64::MAX / 2]);
        assert_eq!(
            order_assignments(&list, 1, &link(9), false),
            vec![(link(9), Value::Integer(-1))]
        );
    }

    #[test]
    fn indexed_lists_write_positions_that_changed() {
        let list = entries(&[0, 1, 2]);
        let assigned = order_assignments(&list, 1, &link(9), true);
        assert_eq!(
            assigned,
            vec![
                (link(9), Value::Integer(1)),
                (link(2), Value::Integer(2)),
                (link(3), Value::Integer(3)),
            ]
        );
    }
}
