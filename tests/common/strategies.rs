use proptest::prelude::*;
use proptest::strategy::Just;

/// Task ids plus edges that are acyclic by construction.
///
/// Ids are shuffled so that topological rank and id order disagree; edges
/// only run from a lower to a higher rank.
pub fn acyclic_graph_strategy() -> impl Strategy<Value = (Vec<i64>, Vec<(i64, i64)>)> {
    (1usize..24)
        .prop_flat_map(|n| {
            let ids = Just((1..=n as i64).collect::<Vec<_>>()).prop_shuffle();
            let raw_edges = prop::collection::vec((0..n, 0..n), 0..n * 2);
            (ids, raw_edges)
        })
        .prop_map(|(ids, raw_edges)| {
            let mut edges: Vec<(i64, i64)> = raw_edges
                .into_iter()
                .filter(|(a, b)| a < b)
                .map(|(a, b)| (ids[a], ids[b]))
                .collect();
            edges.sort_unstable();
            edges.dedup();
            (ids, edges)
        })
}

/// Common dependency shapes
pub fn workflow_pattern_strategy() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop_oneof![
        Just(vec![(1, 2)]),
        Just(vec![(1, 2), (2, 3)]),
        Just(vec![(1, 2), (1, 3), (2, 3)]),
        Just(vec![(1, 2), (1, 3)]),
        Just(vec![(1, 3), (2, 3)]),
        Just(vec![(1, 2), (1, 3), (2, 4), (3, 4)]),
    ]
}
