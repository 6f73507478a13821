//! Property-based tests for the forest index.
//!
//! These tests verify invariants that should hold regardless of input:
//! - Both metrics are symmetric and non-negative
//! - SIMD kernels agree with the scalar fallbacks
//! - Split planes put their two seed points on opposite sides
//! - An exhaustive search returns exactly the brute-force ranking

use canopy_core::distance::{self, SplitPlane};
use canopy_core::{
    Angular, Distance, Euclidean, ForestIndex, IndexOptions, ItemId, Neighbor, RandomSource,
    TreeCount,
};
use proptest::prelude::*;

prop_compose! {
    fn arb_vector(dim: usize)(vec in prop::collection::vec(-10.0f32..10.0, dim)) -> Vec<f32> {
        vec
    }
}

prop_compose! {
    fn arb_dataset(max_items: usize, dim: usize)(
        vectors in prop::collection::vec(arb_vector(dim), 1..max_items)
    ) -> Vec<Vec<f32>> {
        vectors
    }
}

/// Always picks the first two points
struct FirstPair;

impl RandomSource for FirstPair {
    fn flip(&mut self) -> bool {
        false
    }

    fn index(&mut self, _n: usize) -> usize {
        0
    }
}

fn brute_force<D: Distance>(vectors: &[Vec<f32>], query: &[f32]) -> Vec<ItemId> {
    let mut all: Vec<Neighbor> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| Neighbor {
            id: i as ItemId,
            distance: D::normalized_distance(D::distance(query, v)),
        })
        .collect();
    all.sort_unstable();
    all.into_iter().map(|n| n.id).collect()
}

fn exhaustive<D: Distance>(vectors: &[Vec<f32>], query: &[f32], seed: u64) -> Vec<ItemId> {
    let options = IndexOptions { seed: Some(seed), ..IndexOptions::default() };
    let mut index = ForestIndex::<D>::with_options(query.len(), options).unwrap();
    for (i, v) in vectors.iter().enumerate() {
        index.add_item(i as ItemId, v).unwrap();
    }
    index.build(TreeCount::Exact(3)).unwrap();

    index
        .get_nns_by_vector(query, vectors.len(), Some(usize::MAX))
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn distances_are_symmetric(a in arb_vector(24), b in arb_vector(24)) {
        let close = |x: f32, y: f32| (x - y).abs() <= 1e-4 * x.abs().max(1.0);
        prop_assert!(close(Euclidean::distance(&a, &b), Euclidean::distance(&b, &a)));
        prop_assert!(close(Angular::distance(&a, &b), Angular::distance(&b, &a)));
    }

    #[test]
    fn distances_are_non_negative(a in arb_vector(17), b in arb_vector(17)) {
        prop_assert!(Euclidean::distance(&a, &b) >= 0.0);

        let angular = Angular::distance(&a, &b);
        prop_assert!((0.0..=4.0 + 1e-4).contains(&angular), "angular out of range: {}", angular);
    }

    #[test]
    fn kernels_match_scalar(a in arb_vector(77), b in arb_vector(77)) {
        // Summation order differs, so bound the error by the size of the terms
        let magnitude: f32 = a.iter().zip(&b).map(|(x, y)| (x * y).abs()).sum();
        let dot = distance::dot(&a, &b);
        prop_assert!((dot - distance::dot_scalar(&a, &b)).abs() <= 2e-5 * magnitude + 1e-6);

        let scalar = distance::squared_euclidean_scalar(&a, &b);
        let simd = distance::squared_euclidean(&a, &b);
        prop_assert!((simd - scalar).abs() <= 2e-5 * scalar + 1e-6);
    }

    #[test]
    fn euclidean_split_separates_seed_points(a in arb_vector(8), b in arb_vector(8)) {
        prop_assume!(Euclidean::distance(&a, &b) > 1.0);

        let points = vec![a.as_slice(), b.as_slice()];
        let mut plane = SplitPlane::new(8);
        Euclidean::create_split(&points, &mut FirstPair, &mut plane);

        // index() always returns 0, so the pair is (0, 1)
        let ma = Euclidean::margin(plane.as_hyperplane(), &a);
        let mb = Euclidean::margin(plane.as_hyperplane(), &b);
        prop_assert!(ma > 0.0 && mb < 0.0, "margins {} and {}", ma, mb);
    }

    #[test]
    fn exhaustive_search_matches_brute_force(
        vectors in arb_dataset(60, 4),
        query in arb_vector(4),
        seed in any::<u64>(),
    ) {
        prop_assert_eq!(
            exhaustive::<Euclidean>(&vectors, &query, seed),
            brute_force::<Euclidean>(&vectors, &query)
        );
        prop_assert_eq!(
            exhaustive::<Angular>(&vectors, &query, seed),
            brute_force::<Angular>(&vectors, &query)
        );
    }
}
