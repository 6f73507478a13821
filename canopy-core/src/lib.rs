//! Canopy - Memory-mapped random projection forest for nearest neighbor search
//!
//! Canopy answers "which stored vectors are closest to this one?" without
//! scanning the whole collection. It builds a forest of random projection
//! trees over fixed-dimensional vectors, writes it to a flat file and serves
//! queries straight from a read-only memory map, so any number of processes
//! can share one index without copying it.
//!
//! # Features
//!
//! - Angular (cosine) and Euclidean metrics, selected at compile time
//! - Fixed-stride records: one flat array for leaves, buckets and splits
//! - Save once, then map the file read-only from as many readers as needed
//! - Reproducible builds from a seeded random source
//!
//! # Example
//!
//! ```no_run
//! use canopy_core::{AngularIndex, TreeCount};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut index = AngularIndex::new(3)?;
//!
//! index.add_item(0, &[1.0, 0.0, 0.0])?;
//! index.add_item(1, &[0.0, 1.0, 0.0])?;
//! index.add_item(2, &[0.7, 0.7, 0.0])?;
//!
//! // Add 10 trees, then write the forest and map it back in
//! index.build(TreeCount::Exact(10))?;
//! index.save("vectors.canopy")?;
//!
//! for hit in index.get_nns_by_item(0, 2, None)? {
//!     println!("{} at {}", hit.id, hit.distance);
//! }
//!
//! // Any other process can now map the same file
//! let mut reader = AngularIndex::new(3)?;
//! reader.load("vectors.canopy")?;
//! assert_eq!(reader.get_n_items(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! # Lifecycle
//!
//! An index is either *building* (items and trees live on the heap) or
//! *loaded* (a read-only file mapping). [`ForestIndex::save`] moves from the
//! first to the second, [`ForestIndex::unload`] goes back to an empty index.
//! Items can only be added before the first [`ForestIndex::build`].
//!
//! # File Format
//!
//! The file is the node array itself with no header. Its record size follows
//! from the dimensions and the metric, so a reader must be created with the
//! same `f` and metric the writer used. Roots are found again from the run of
//! root copies that `build` leaves at the end of the array.

/// Logs at `info` when verbose, at `debug` otherwise
macro_rules! progress {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

pub mod distance;
pub mod random;

#[cfg(feature = "internals")]
pub mod forest;
#[cfg(not(feature = "internals"))]
pub(crate) mod forest;

#[cfg(feature = "internals")]
pub mod node;
#[cfg(not(feature = "internals"))]
pub(crate) mod node;

#[cfg(feature = "internals")]
pub mod store;
#[cfg(not(feature = "internals"))]
pub(crate) mod store;

mod persist;

pub use distance::{Angular, Distance, Euclidean, Metric};
pub use forest::{Neighbor, TreeCount};
pub use node::ItemId;
pub use random::{RandomSource, RngSource};

use anyhow::Result;
use forest::{TreeBuilder, write_root_suffix};
use node::{NodeKind, NodeLayout};
use std::marker::PhantomData;
use store::NodeStore;

/// Configuration options for [`ForestIndex`]
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Log build and load progress at `info` instead of `debug`
    pub verbose: bool,

    /// Seed for reproducible builds; `None` seeds from the OS
    pub seed: Option<u64>,

    /// Fault the whole file in when loading (`MAP_POPULATE`)
    pub prefault: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { verbose: false, seed: None, prefault: true }
    }
}

/// Forest index over angular distance
pub type AngularIndex = ForestIndex<Angular>;

/// Forest index over Euclidean distance
pub type EuclideanIndex = ForestIndex<Euclidean>;

/// Approximate nearest neighbor index over a random projection forest.
///
/// `D` selects the metric and `R` the random source used while building.
#[derive(Debug)]
pub struct ForestIndex<D: Distance, R = RngSource> {
    /// Vector dimensionality `f`
    dimensions: usize,

    /// Every record: leaves, then trees, then root copies
    store: NodeStore,

    /// Entry record of every tree
    roots: Vec<ItemId>,

    /// One past the highest item id
    n_items: usize,

    rng: R,
    options: IndexOptions,

    /// Whether `build` has run since the last reset
    built: bool,

    _metric: PhantomData<D>,
}

impl<D: Distance> ForestIndex<D> {
    /// Empty index for `dimensions`-dimensional vectors
    ///
    /// # Errors
    ///
    /// Returns an error if `dimensions` is zero.
    pub fn new(dimensions: usize) -> Result<Self> {
        Self::with_options(dimensions, IndexOptions::default())
    }

    /// Empty index with explicit options
    ///
    /// # Errors
    ///
    /// Returns an error if `dimensions` is zero.
    pub fn with_options(dimensions: usize, options: IndexOptions) -> Result<Self> {
        let rng = options.seed.map_or_else(RngSource::from_entropy, RngSource::seeded);
        Self::with_random(dimensions, options, rng)
    }
}

impl<D: Distance, R: RandomSource> ForestIndex<D, R> {
    /// Empty index drawing build randomness from `rng`
    ///
    /// `options.seed` is ignored since the source is supplied directly.
    ///
    /// # Errors
    ///
    /// Returns an error if `dimensions` is zero.
    pub fn with_random(dimensions: usize, options: IndexOptions, rng: R) -> Result<Self> {
        if dimensions == 0 {
            anyhow::bail!("Index dimensions must be at least 1");
        }

        Ok(Self {
            dimensions,
            store: NodeStore::new(NodeLayout::for_metric::<D>(dimensions)),
            roots: Vec::new(),
            n_items: 0,
            rng,
            options,
            built: false,
            _metric: PhantomData,
        })
    }

    /// Insert or overwrite the vector of item `id`.
    ///
    /// Ids do not have to be contiguous; ids never added read as missing.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The index is loaded from a file or has already been built
    /// - `vector` does not have exactly `dimensions` components
    pub fn add_item(&mut self, id: ItemId, vector: &[f32]) -> Result<()> {
        if self.is_loaded() {
            anyhow::bail!("Cannot add items to a loaded index");
        }
        if self.built {
            anyhow::bail!("Cannot add items after the index has been built");
        }
        self.check_dimensions(vector)?;

        let slot = id as usize;
        self.store.ensure_len(slot + 1)?;
        self.store.record_mut(id)?.write_leaf(vector);
        self.n_items = self.n_items.max(slot + 1);

        Ok(())
    }

    /// Grow trees over every item added so far.
    ///
    /// Calling `build` again appends another forest; the previous trees are
    /// kept and queried alongside the new ones.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The index is loaded from a file
    /// - No item has been added
    /// - `count` is `TreeCount::Exact(0)`
    pub fn build(&mut self, count: TreeCount) -> Result<()> {
        if self.is_loaded() {
            anyhow::bail!("Cannot build a loaded index");
        }
        if self.n_items == 0 {
            anyhow::bail!("Cannot build an index with no items");
        }
        if count == TreeCount::Exact(0) {
            anyhow::bail!("Tree count must be at least 1");
        }

        let verbose = self.options.verbose;
        let new_roots = TreeBuilder::<D, R>::new(&mut self.store, &mut self.rng, verbose)
            .grow(self.n_items, count)?;
        self.roots.extend(new_roots);

        write_root_suffix(&mut self.store, &self.roots)?;
        self.built = true;

        progress!(verbose, trees = self.roots.len(), nodes = self.store.len(), "Forest built");
        Ok(())
    }

    /// Raw distance between two items, in the metric's internal units
    /// (squared chord for angular, squared L2 for Euclidean).
    ///
    /// # Errors
    ///
    /// Returns an error if either id does not name an added item.
    pub fn get_distance(&self, a: ItemId, b: ItemId) -> Result<f32> {
        Ok(D::distance(self.item_vector(a)?, self.item_vector(b)?))
    }

    /// Approximate `n` nearest neighbors of a stored item.
    ///
    /// # Arguments
    ///
    /// * `id` - Item whose vector is the query
    /// * `n` - Number of neighbors to return
    /// * `search_k` - Candidates to inspect; `None` uses `n * n_trees()`
    ///
    /// # Errors
    ///
    /// Returns an error if the index is not built or `id` is missing.
    pub fn get_nns_by_item(
        &self,
        id: ItemId,
        n: usize,
        search_k: Option<usize>,
    ) -> Result<Vec<Neighbor>> {
        self.check_built()?;
        let query = self.item_vector(id)?;
        forest::search::<D>(&self.store, &self.roots, query, n, search_k)
    }

    /// Approximate `n` nearest neighbors of an arbitrary vector
    ///
    /// # Errors
    ///
    /// Returns an error if the index is not built or `query` has the wrong
    /// number of components.
    pub fn get_nns_by_vector(
        &self,
        query: &[f32],
        n: usize,
        search_k: Option<usize>,
    ) -> Result<Vec<Neighbor>> {
        self.check_built()?;
        self.check_dimensions(query)?;
        forest::search::<D>(&self.store, &self.roots, query, n, search_k)
    }

    /// One past the highest item id
    pub fn get_n_items(&self) -> usize {
        self.n_items
    }

    /// Copy of an item's vector
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not name an added item.
    pub fn get_item(&self, id: ItemId) -> Result<Vec<f32>> {
        self.item_vector(id).map(<[f32]>::to_vec)
    }

    /// Borrow an item's vector without copying.
    ///
    /// The slice borrows the index, so the index cannot change while it is
    /// alive:
    ///
    /// ```compile_fail
    /// use canopy_core::AngularIndex;
    ///
    /// let mut index = AngularIndex::new(2).unwrap();
    /// index.add_item(0, &[1.0, 0.0]).unwrap();
    ///
    /// let vector = index.get_item_slice(0).unwrap();
    /// index.add_item(1, &[0.0, 1.0]).unwrap();
    /// println!("{:?}", vector);
    /// ```
    ///
    /// ```compile_fail
    /// use canopy_core::EuclideanIndex;
    ///
    /// let mut index = EuclideanIndex::new(2).unwrap();
    /// index.load("vectors.canopy").unwrap();
    ///
    /// let vector = index.get_item_slice(0).unwrap();
    /// index.unload();
    /// println!("{:?}", vector);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not name an added item.
    pub fn get_item_slice(&self, id: ItemId) -> Result<&[f32]> {
        self.item_vector(id)
    }

    /// Switch progress logging between `info` and `debug`
    pub fn verbose(&mut self, verbose: bool) {
        self.options.verbose = verbose;
    }

    /// Number of tree entry points.
    ///
    /// After a load this counts every record of the trailing root run, which
    /// usually includes the last tree's own root next to its copy.
    pub fn n_trees(&self) -> usize {
        self.roots.len()
    }

    /// Number of records in the node array
    pub fn n_nodes(&self) -> usize {
        self.store.len()
    }

    /// Vector dimensionality `f`
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Metric this index was created for
    pub fn metric(&self) -> Metric {
        D::METRIC
    }

    /// Whether the index is served from a file mapping
    pub fn is_loaded(&self) -> bool {
        self.store.is_mapped()
    }

    /// Whether the index can answer neighbor queries
    pub fn is_built(&self) -> bool {
        self.built || self.is_loaded()
    }

    /// Vector of a leaf record
    fn item_vector(&self, id: ItemId) -> Result<&[f32]> {
        if id as usize >= self.n_items {
            anyhow::bail!("Item {} not found (item count is {})", id, self.n_items);
        }

        let node = self.store.record(id)?;
        if node.kind() != NodeKind::Leaf {
            anyhow::bail!("Item {} was never added", id);
        }

        Ok(node.vector())
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            anyhow::bail!(
                "Vector dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            );
        }
        Ok(())
    }

    fn check_built(&self) -> Result<()> {
        if !self.is_built() {
            anyhow::bail!("Index must be built or loaded before querying");
        }
        Ok(())
    }

    /// Drop every record and return to an empty building state
    fn reset(&mut self) {
        self.store = NodeStore::new(NodeLayout::for_metric::<D>(self.dimensions));
        self.roots.clear();
        self.n_items = 0;
        self.built = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded<D: Distance>(dimensions: usize) -> ForestIndex<D> {
        let options = IndexOptions { seed: Some(42), ..IndexOptions::default() };
        ForestIndex::with_options(dimensions, options).unwrap()
    }

    #[test]
    fn test_index_create_and_add() {
        let mut index = seeded::<Angular>(4);

        assert_eq!(index.get_n_items(), 0);
        assert_eq!(index.dimensions(), 4);
        assert_eq!(index.metric(), Metric::Angular);
        assert!(!index.is_built());

        index.add_item(0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        index.add_item(5, &[4.0, 3.0, 2.0, 1.0]).unwrap();

        // Ids are one past the highest, not a count of added items
        assert_eq!(index.get_n_items(), 6);
        assert_eq!(index.n_nodes(), 6);
        assert_eq!(index.get_item(5).unwrap(), vec![4.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let err = AngularIndex::new(0).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = seeded::<Euclidean>(3);

        let err = index.add_item(0, &[1.0, 2.0]).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));

        index.add_item(0, &[1.0, 2.0, 3.0]).unwrap();
        index.build(TreeCount::Exact(1)).unwrap();

        let err = index.get_nns_by_vector(&[1.0; 4], 1, None).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[test]
    fn test_overwrite_item() {
        let mut index = seeded::<Euclidean>(2);
        index.add_item(1, &[1.0, 1.0]).unwrap();
        index.add_item(1, &[2.0, 2.0]).unwrap();

        assert_eq!(index.get_item_slice(1).unwrap(), &[2.0, 2.0]);
        assert_eq!(index.get_n_items(), 2);
    }

    #[test]
    fn test_missing_items() {
        let mut index = seeded::<Euclidean>(2);
        index.add_item(2, &[1.0, 1.0]).unwrap();

        let err = index.get_item(0).unwrap_err();
        assert!(err.to_string().contains("never added"));

        let err = index.get_distance(2, 9).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_raw_distance_units() {
        let mut index = seeded::<Euclidean>(2);
        index.add_item(0, &[0.0, 0.0]).unwrap();
        index.add_item(1, &[3.0, 4.0]).unwrap();

        assert_eq!(index.get_distance(0, 1).unwrap(), 25.0);
        assert_eq!(index.get_distance(1, 1).unwrap(), 0.0);

        index.build(TreeCount::Exact(1)).unwrap();
        let hits = index.get_nns_by_item(0, 2, None).unwrap();
        assert_eq!(hits[1].id, 1);
        assert_eq!(hits[1].distance, 5.0);
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut index = seeded::<Angular>(2);

        let err = index.build(TreeCount::Auto).unwrap_err();
        assert!(err.to_string().contains("no items"));

        index.add_item(0, &[1.0, 0.0]).unwrap();
        let err = index.get_nns_by_item(0, 1, None).unwrap_err();
        assert!(err.to_string().contains("built or loaded"));

        let err = index.build(TreeCount::Exact(0)).unwrap_err();
        assert!(err.to_string().contains("at least 1"));

        index.build(TreeCount::Exact(2)).unwrap();
        let err = index.add_item(1, &[0.0, 1.0]).unwrap_err();
        assert!(err.to_string().contains("after the index has been built"));
    }

    #[test]
    fn test_repeated_build_appends_trees() {
        let mut index = seeded::<Euclidean>(2);
        for i in 0..100 {
            index.add_item(i, &[i as f32, (i * i % 17) as f32]).unwrap();
        }

        index.build(TreeCount::Exact(3)).unwrap();
        let nodes = index.n_nodes();
        assert_eq!(index.n_trees(), 3);

        index.build(TreeCount::Exact(2)).unwrap();
        assert_eq!(index.n_trees(), 5);
        assert!(index.n_nodes() > nodes + 5);

        let hits = index.get_nns_by_item(50, 1, Some(100)).unwrap();
        assert_eq!(hits[0].id, 50);
    }

    #[test]
    fn test_custom_random_source() {
        let options = IndexOptions::default();
        let mut index: ForestIndex<Angular, RngSource> =
            ForestIndex::with_random(2, options, RngSource::seeded(1)).unwrap();

        index.add_item(0, &[1.0, 0.0]).unwrap();
        index.add_item(1, &[0.0, 1.0]).unwrap();
        index.build(TreeCount::Auto).unwrap();

        assert!(index.is_built());
        assert!(!index.is_loaded());
    }
}
