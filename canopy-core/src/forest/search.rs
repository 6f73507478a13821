//! Best-first forest traversal.
//!
//! All trees are searched at once from a single max-heap keyed on how far
//! the query is from being cut off by every plane on the path so far. A
//! subtree on the far side of a plane is not pruned; it is queued with a
//! negative bound and only expanded once closer branches are exhausted.

use crate::distance::Distance;
use crate::node::{ItemId, NodeKind};
use crate::store::NodeStore;
use anyhow::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One search hit
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    /// Item id
    pub id: ItemId,
    /// Distance to the query in user-facing units
    pub distance: f32,
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    /// Closest first, then lowest id
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance).then(self.id.cmp(&other.id))
    }
}

/// Heap entry: a record and the bound it was queued with
#[derive(Debug, Clone, Copy)]
struct Candidate {
    priority: f32,
    index: ItemId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Equal bounds pop the higher record index first
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.total_cmp(&other.priority).then(self.index.cmp(&other.index))
    }
}

/// Approximate `n` nearest items to `query`.
///
/// # Arguments
///
/// * `store` - Records of a built forest
/// * `roots` - Entry record of every tree
/// * `query` - Query vector (must match the store's dimensions)
/// * `n` - Number of neighbors to return
/// * `search_k` - Candidates to collect before stopping; `None` uses
///   `n * roots.len()`
///
/// # Returns
///
/// At most `n` distinct items sorted by distance. Fewer come back when the
/// traversal runs out of candidates.
///
/// # Errors
///
/// Returns an error if the forest references a record outside the store.
pub fn search<D: Distance>(
    store: &NodeStore,
    roots: &[ItemId],
    query: &[f32],
    n: usize,
    search_k: Option<usize>,
) -> Result<Vec<Neighbor>> {
    let search_k = search_k.unwrap_or_else(|| n.saturating_mul(roots.len()));

    let mut queue: BinaryHeap<Candidate> =
        roots.iter().map(|&index| Candidate { priority: f32::INFINITY, index }).collect();
    let mut candidates: Vec<ItemId> = Vec::new();

    while candidates.len() < search_k {
        let Some(top) = queue.pop() else { break };
        let node = store.record(top.index)?;

        match node.kind() {
            NodeKind::Leaf => candidates.push(top.index),
            NodeKind::Bucket => candidates.extend_from_slice(node.bucket_items()),
            NodeKind::Split => {
                let margin = D::margin(node.hyperplane(), query);
                let [left, right] = node.children();
                queue.push(Candidate { priority: top.priority.min(margin), index: right });
                queue.push(Candidate { priority: top.priority.min(-margin), index: left });
            }
            // Ids that were never added
            NodeKind::Empty => {}
        }
    }

    // Items are reachable from every tree; score each one once
    candidates.sort_unstable();
    candidates.dedup();

    let mut neighbors = Vec::with_capacity(candidates.len());
    for id in candidates {
        let node = store.record(id)?;
        if node.kind() == NodeKind::Leaf {
            neighbors.push(Neighbor { id, distance: D::distance(query, node.vector()) });
        }
    }

    let keep = n.min(neighbors.len());
    if keep < neighbors.len() {
        neighbors.select_nth_unstable(keep);
        neighbors.truncate(keep);
    }
    neighbors.sort_unstable();

    for neighbor in &mut neighbors {
        neighbor.distance = D::normalized_distance(neighbor.distance);
    }

    Ok(neighbors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{Angular, Euclidean};
    use crate::forest::{TreeBuilder, TreeCount};
    use crate::node::NodeLayout;
    use crate::random::RngSource;

    fn build<D: Distance>(vectors: &[Vec<f32>], trees: usize) -> (NodeStore, Vec<ItemId>) {
        let dimensions = vectors[0].len();
        let mut store = NodeStore::new(NodeLayout::for_metric::<D>(dimensions));
        store.ensure_len(vectors.len()).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            store.record_mut(i as ItemId).unwrap().write_leaf(v);
        }

        let mut rng = RngSource::seeded(17);
        let roots = TreeBuilder::<D, _>::new(&mut store, &mut rng, false)
            .grow(vectors.len(), TreeCount::Exact(trees))
            .unwrap();
        (store, roots)
    }

    fn line(n: usize) -> Vec<Vec<f32>> {
        (0..n).map(|i| vec![i as f32, 0.5 * i as f32, 1.0]).collect()
    }

    #[test]
    fn test_exhaustive_search_is_exact() {
        let vectors = line(300);
        let (store, roots) = build::<Euclidean>(&vectors, 4);
        let query = [100.2, 50.1, 1.0];

        let results = search::<Euclidean>(&store, &roots, &query, 300, Some(usize::MAX)).unwrap();

        assert_eq!(results.len(), 300);
        let mut expected: Vec<Neighbor> = (0..300)
            .map(|i| Neighbor {
                id: i,
                distance: Euclidean::distance(&query, &vectors[i as usize]).sqrt(),
            })
            .collect();
        expected.sort_unstable();
        let ids: Vec<ItemId> = results.iter().map(|r| r.id).collect();
        let expected_ids: Vec<ItemId> = expected.iter().map(|r| r.id).collect();
        assert_eq!(ids, expected_ids);
    }

    #[test]
    fn test_results_are_distinct_and_sorted() {
        let vectors = line(500);
        let (store, roots) = build::<Angular>(&vectors, 8);

        let results = search::<Angular>(&store, &roots, &vectors[42], 25, None).unwrap();

        assert_eq!(results.len(), 25);
        assert!(results.windows(2).all(|w| w[0] <= w[1]));

        let mut ids: Vec<ItemId> = results.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 25);
    }

    #[test]
    fn test_own_vector_comes_first() {
        let vectors = line(200);
        let (store, roots) = build::<Euclidean>(&vectors, 5);

        let results = search::<Euclidean>(&store, &roots, &vectors[77], 5, Some(200)).unwrap();

        assert_eq!(results[0].id, 77);
        assert_eq!(results[0].distance, 0.0);
    }

    #[test]
    fn test_zero_budget_returns_nothing() {
        let vectors = line(50);
        let (store, roots) = build::<Euclidean>(&vectors, 2);

        let results = search::<Euclidean>(&store, &roots, &vectors[0], 10, Some(0)).unwrap();
        assert!(results.is_empty());

        let results = search::<Euclidean>(&store, &roots, &vectors[0], 0, None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_gaps_are_never_returned() {
        // Ids 1 and 3 were never written
        let mut store = NodeStore::new(NodeLayout::for_metric::<Euclidean>(2));
        store.ensure_len(5).unwrap();
        for id in [0, 2, 4] {
            store.record_mut(id).unwrap().write_leaf(&[id as f32, 0.0]);
        }
        let mut rng = RngSource::seeded(3);
        let roots = TreeBuilder::<Euclidean, _>::new(&mut store, &mut rng, false)
            .grow(5, TreeCount::Exact(1))
            .unwrap();

        let results = search::<Euclidean>(&store, &roots, &[1.0, 0.0], 10, None).unwrap();
        let ids: Vec<ItemId> = results.iter().map(|r| r.id).collect();

        assert_eq!(ids, vec![0, 2, 4]);
    }

    #[test]
    fn test_candidate_ordering() {
        let mut heap = BinaryHeap::new();
        heap.push(Candidate { priority: 1.0, index: 3 });
        heap.push(Candidate { priority: f32::INFINITY, index: 1 });
        heap.push(Candidate { priority: 1.0, index: 7 });
        heap.push(Candidate { priority: -2.0, index: 9 });

        let order: Vec<ItemId> = std::iter::from_fn(|| heap.pop().map(|c| c.index)).collect();
        assert_eq!(order, vec![1, 7, 3, 9]);
    }
}
