//! Intra-phase ordering.
//!
//! Interceptors of one phase are ordered by a topological sort over their
//! `before`/`after` constraints, built from the back: among interceptors whose
//! successors are all placed, the one inserted last goes last. The effect
//! matches inserting each interceptor in turn right in front of the first peer
//! that has to follow it, so unconstrained interceptors keep their insertion
//! order and a `before` target is moved only as far as its constraints need.
//! Constraints naming ids outside the sorted group are ignored.
//!
//! A constraint cycle cannot be satisfied. Inside each cycle, edges pointing
//! from a later-inserted interceptor back to an earlier one are dropped, so
//! the members fall back to insertion order.

use std::collections::{BTreeSet, HashMap, VecDeque};

/// Ordering view of one interceptor.
pub(crate) struct SortKey<'a> {
    pub id: &'a str,
    pub before: &'a BTreeSet<String>,
    pub after: &'a BTreeSet<String>,
    pub seq: u64,
}

pub(crate) struct PhaseOrder {
    /// Indices into the input slice, in execution order.
    pub order: Vec<usize>,
    /// How many constraint edges were dropped to break cycles.
    pub cycle_breaks: usize,
}

pub(crate) fn order_phase(keys: &[SortKey<'_>]) -> PhaseOrder {
    let n = keys.len();
    let rank = |position: usize| (keys[position].seq, position);

    let mut by_id: HashMap<&str, Vec<usize>> = HashMap::with_capacity(n);
    for (position, key) in keys.iter().enumerate() {
        by_id.entry(key.id).or_default().push(position);
    }

    // successors[a] holds every b that must run after a.
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for (position, key) in keys.iter().enumerate() {
        for predecessor in key.after {
            for &other in by_id.get(predecessor.as_str()).into_iter().flatten() {
                if other != position {
                    successors[other].insert(position);
                }
            }
        }
        for successor in key.before {
            for &other in by_id.get(successor.as_str()).into_iter().flatten() {
                if other != position {
                    successors[position].insert(other);
                }
            }
        }
    }

    let cycle_breaks = break_cycles(&mut successors, rank);

    let mut pending: Vec<usize> = successors.iter().map(BTreeSet::len).collect();
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (from, targets) in successors.iter().enumerate() {
        for &to in targets {
            predecessors[to].push(from);
        }
    }

    let mut ready: BTreeSet<(u64, usize)> = (0..n)
        .filter(|&position| pending[position] == 0)
        .map(rank)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some((_, position)) = ready.pop_last() {
        order.push(position);
        for &from in &predecessors[position] {
            pending[from] -= 1;
            if pending[from] == 0 {
                ready.insert(rank(from));
            }
        }
    }
    debug_assert_eq!(order.len(), n, "constraint graph still cyclic");
    order.reverse();

    PhaseOrder {
        order,
        cycle_breaks,
    }
}

/// Drops every edge that closes a cycle and points at an earlier-inserted
/// interceptor. Each remaining cycle would have to stay inside one strongly
/// connected component, where every kept edge now points forward in
/// insertion order, so the result is acyclic.
fn break_cycles(successors: &mut [BTreeSet<usize>], rank: impl Fn(usize) -> (u64, usize)) -> usize {
    let reach: Vec<Vec<bool>> = (0..successors.len())
        .map(|from| reachable(successors, from))
        .collect();
    let mut dropped = 0;
    for from in 0..successors.len() {
        let backward: Vec<usize> = successors[from]
            .iter()
            .copied()
            .filter(|&to| reach[to][from] && rank(to) < rank(from))
            .collect();
        for to in backward {
            successors[from].remove(&to);
            dropped += 1;
        }
    }
    dropped
}

fn reachable(successors: &[BTreeSet<usize>], from: usize) -> Vec<bool> {
    let mut seen = vec![false; successors.len()];
    let mut queue = VecDeque::from([from]);
    while let Some(position) = queue.pop_front() {
        for &next in &successors[position] {
            if !seen[next] {
                seen[next] = true;
                queue.push_back(next);
            }
        }
    }
    seen
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
