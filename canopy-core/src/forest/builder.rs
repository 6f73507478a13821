use crate::distance::{Distance, SplitPlane};
use crate::forest::TreeCount;
use crate::node::{ItemId, NodeKind};
use crate::random::RandomSource;
use crate::store::NodeStore;
use anyhow::{Context, Result};
use std::marker::PhantomData;

/// Random hyperplanes tried before falling back to a coin-flip partition
pub const SPLIT_ATTEMPTS: usize = 20;

/// Splits failing above this size are worth a warning in verbose mode
const HUGE_SPLIT: usize = 100_000;

/// Grows random projection trees into a node store.
///
/// Every tree covers all item ids. Internal records are appended after the
/// leaves and children are always written before their parent, so a record
/// only ever points at lower indices.
pub struct TreeBuilder<'a, D, R: ?Sized> {
    store: &'a mut NodeStore,
    rng: &'a mut R,
    verbose: bool,
    _metric: PhantomData<D>,
}

impl<'a, D: Distance, R: RandomSource + ?Sized> TreeBuilder<'a, D, R> {
    /// Builder appending to `store` and drawing from `rng`
    pub fn new(store: &'a mut NodeStore, rng: &'a mut R, verbose: bool) -> Self {
        Self { store, rng, verbose, _metric: PhantomData }
    }

    /// Adds trees over items `0..n_items` and returns their roots in build
    /// order.
    ///
    /// With [`TreeCount::Auto`], passes continue until the records added by
    /// this call reach `n_items`, or until a pass adds nothing (a forest of
    /// one item never grows).
    ///
    /// # Errors
    ///
    /// Returns an error if the store is read-only or a record index is out
    /// of range.
    pub fn grow(&mut self, n_items: usize, count: TreeCount) -> Result<Vec<ItemId>> {
        let n = ItemId::try_from(n_items).context("Too many items for 32-bit ids")?;
        let indices: Vec<ItemId> = (0..n).collect();
        let start = self.store.len();
        let mut roots = Vec::new();

        loop {
            match count {
                TreeCount::Auto if self.store.len() - start >= n_items => break,
                TreeCount::Exact(q) if roots.len() >= q => break,
                _ => {}
            }

            progress!(self.verbose, pass = roots.len(), "Building tree");

            let before = self.store.len();
            roots.push(self.make_tree(&indices)?);

            if count == TreeCount::Auto && self.store.len() == before {
                break;
            }
        }

        Ok(roots)
    }

    /// Builds one subtree over `indices` and returns its record index.
    ///
    /// # Errors
    ///
    /// Returns an error if any index is out of range or the store is
    /// read-only.
    pub fn make_tree(&mut self, indices: &[ItemId]) -> Result<ItemId> {
        let max_bucket = self.store.layout().max_bucket();

        if let [single] = indices {
            return Ok(*single);
        }

        if indices.len() <= max_bucket {
            let index = self.store.allocate()?;
            self.store.record_mut(index)?.write_bucket(indices);
            return Ok(index);
        }

        let (plane, sides) = self.split(indices)?;

        // Smaller side first keeps each subtree's records close together
        let flip = usize::from(sides[0].len() > sides[1].len());
        let mut children = [0; 2];
        for side in 0..2 {
            children[side ^ flip] = self.make_tree(&sides[side ^ flip])?;
        }

        let descendants = u32::try_from(indices.len()).context("Subtree too large")?;
        let index = self.store.allocate()?;
        self.store.record_mut(index)?.write_split(descendants, plane.as_hyperplane(), children);

        Ok(index)
    }

    /// Finds a plane putting at least one item on each side.
    ///
    /// Falls back to a zero plane and a random partition when every attempt
    /// leaves one side empty, which happens for duplicate points.
    fn split(&mut self, indices: &[ItemId]) -> Result<(SplitPlane, [Vec<ItemId>; 2])> {
        let store = &*self.store;
        let rng = &mut *self.rng;

        let points = indices
            .iter()
            .map(|&i| store.record(i).map(|node| node.vector()))
            .collect::<Result<Vec<_>>>()?;

        let mut plane = SplitPlane::new(store.layout().dimensions());
        let mut sides: [Vec<ItemId>; 2] = [Vec::new(), Vec::new()];

        for _ in 0..SPLIT_ATTEMPTS {
            D::create_split(&points, rng, &mut plane);

            sides[0].clear();
            sides[1].clear();
            for (&item, point) in indices.iter().zip(&points) {
                let side = D::side(plane.as_hyperplane(), point, rng);
                sides[usize::from(side)].push(item);
            }

            if !sides[0].is_empty() && !sides[1].is_empty() {
                return Ok((plane, sides));
            }
        }

        if self.verbose && indices.len() > HUGE_SPLIT {
            tracing::warn!(items = indices.len(), "No separating hyperplane, splitting at random");
        } else {
            tracing::debug!(items = indices.len(), "No separating hyperplane, splitting at random");
        }

        plane.clear();
        while sides[0].is_empty() || sides[1].is_empty() {
            sides[0].clear();
            sides[1].clear();
            for &item in indices {
                sides[usize::from(rng.flip())].push(item);
            }
        }

        Ok((plane, sides))
    }
}

/// Copies every root record to a fresh run at the end of the store.
///
/// The run is what lets a loader find the roots without walking the trees.
///
/// # Errors
///
/// Returns an error if the store is read-only or a root is out of range.
pub fn write_root_suffix(store: &mut NodeStore, roots: &[ItemId]) -> Result<()> {
    let start = store.len();
    store.ensure_len(start + roots.len())?;

    for (offset, &root) in roots.iter().enumerate() {
        let target = ItemId::try_from(start + offset).context("Node index space exhausted")?;
        debug_assert_ne!(store.record(root)?.kind(), NodeKind::Empty);
        store.copy_record(root, target)?;
    }

    Ok(())
}
