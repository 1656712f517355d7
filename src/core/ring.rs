//! Identifier arithmetic on the overlay ring.
//!
//! The ring is the identifier space `[0, 2^160)` closed on itself. Moving clockwise means moving
//! towards larger identifiers, wrapping from `2^160 - 1` back to `0`.

use std::collections::HashSet;

use primitive_types::U256;

use crate::core::id::NodeId;

/// A distance on the ring; the values never exceed `2^160`.
pub type Distance = U256;

/// Returns the number of identifiers on the ring (`2^160`).
pub fn ring_size() -> Distance {
    U256::one() << NodeId::BITS
}

fn to_u256(id: &NodeId) -> U256 {
    U256::from_big_endian(&id.bytes())
}

fn from_u256(value: U256) -> NodeId {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);

    let mut bytes = [0u8; NodeId::BYTES];
    bytes.copy_from_slice(&buf[32 - NodeId::BYTES..]);

    NodeId::new(bytes)
}

// (b - a) mod 2^160.
fn clockwise_distance(a: &NodeId, b: &NodeId) -> Distance {
    let (a, b) = (to_u256(a), to_u256(b));
    if b >= a {
        b - a
    } else {
        ring_size() - a + b
    }
}

/// Returns the `(clockwise, counterclockwise)` distances travelled from `a` to reach `b`.
///
/// For distinct identifiers the two always add up to [`ring_size`].
pub fn distance(a: &NodeId, b: &NodeId) -> (Distance, Distance) {
    (clockwise_distance(a, b), clockwise_distance(b, a))
}

/// Outcome of a [`nearest_id`] search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nearest {
    /// The candidate closest to the target, `None` if there were no candidates.
    pub nearest: Option<NodeId>,
    /// The numerically highest candidate.
    pub highest: Option<NodeId>,
    /// The numerically lowest candidate.
    pub lowest: Option<NodeId>,
}

// Orders candidates by distance to the target; among equidistant candidates the one lying
// clockwise of the target sorts first.
fn proximity_key(target: &NodeId, candidate: &NodeId, wrap: bool) -> (Distance, bool) {
    if wrap {
        let (cw, ccw) = distance(target, candidate);
        if cw <= ccw {
            (cw, false)
        } else {
            (ccw, true)
        }
    } else {
        let (t, c) = (to_u256(target), to_u256(candidate));
        if c >= t {
            (c - t, false)
        } else {
            (t - c, true)
        }
    }
}

/// Finds the candidate nearest to `target`.
///
/// With `wrap` set the distance is measured around the ring in whichever direction is shorter.
/// Without it the distance is measured along the identifier line, never crossing zero, which keeps
/// the answer inside a bounded range. Equidistant candidates are resolved in favour of the one
/// clockwise of the target, so the result doesn't depend on the order of `candidates`.
pub fn nearest_id<'a, I>(target: &NodeId, candidates: I, wrap: bool) -> Nearest
where
    I: IntoIterator<Item = &'a NodeId>,
{
    let mut res = Nearest::default();
    let mut best_key = None;

    for candidate in candidates {
        let key = proximity_key(target, candidate, wrap);
        if best_key.map_or(true, |best| key < best) {
            best_key = Some(key);
            res.nearest = Some(*candidate);
        }

        if res.highest.map_or(true, |highest| *candidate > highest) {
            res.highest = Some(*candidate);
        }
        if res.lowest.map_or(true, |lowest| *candidate < lowest) {
            res.lowest = Some(*candidate);
        }
    }

    res
}

/// Orders `ids` by their distance from `reference`, walking the ring clockwise (or
/// counterclockwise if `clockwise` is `false`). Duplicates are removed.
pub fn sort_by_distance<'a, I>(reference: &NodeId, ids: I, clockwise: bool) -> Vec<NodeId>
where
    I: IntoIterator<Item = &'a NodeId>,
{
    let mut seen = HashSet::new();
    let mut sorted: Vec<NodeId> = ids.into_iter().copied().filter(|id| seen.insert(*id)).collect();

    sorted.sort_by(|a, b| {
        let (a_cw, a_ccw) = distance(reference, a);
        let (b_cw, b_ccw) = distance(reference, b);
        let ord = if clockwise {
            a_cw.cmp(&b_cw)
        } else {
            a_ccw.cmp(&b_ccw)
        };

        ord.then_with(|| proximity_key(reference, a, true).cmp(&proximity_key(reference, b, true)))
    });

    sorted
}

/// Returns the number of leading hexadecimal digits the two identifiers share.
pub fn common_prefix_len(a: &NodeId, b: &NodeId) -> usize {
    (0..NodeId::DIGITS)
        .find(|&i| a.digit(i) != b.digit(i))
        .unwrap_or(NodeId::DIGITS)
}

/// Returns the identifier half a ring away from `id`.
pub fn diametric_opposite(id: &NodeId) -> NodeId {
    let half = U256::one() << (NodeId::BITS - 1);
    let opposite = (to_u256(id) + half) % ring_size();

    from_u256(opposite)
}
