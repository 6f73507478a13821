//! Saving, loading and unloading a [`ForestIndex`].
//!
//! There is no header. A loader derives the record count from the file size
//! and finds the roots by walking back from the last record over the run of
//! records sharing its descendant count. `build` guarantees that run exists
//! by copying every root to the end of the array, and every root spans all
//! items, so the shared count is also the item count.

use crate::node::{ItemId, NodeLayout};
use crate::random::RandomSource;
use crate::store::NodeStore;
use crate::{Distance, ForestIndex};
use anyhow::{Context, Result};
use std::path::Path;

impl<D: Distance, R: RandomSource> ForestIndex<D, R> {
    /// Write the index to `path` and continue serving it from a mapping of
    /// that file.
    ///
    /// The file is replaced under an exclusive lock and synced before the
    /// in-memory records are dropped. If writing fails the index is left as
    /// it was.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The index has not been built
    /// - The file cannot be created, locked, written or synced
    /// - Another index still has the file loaded
    /// - Mapping the written file fails (the index is then empty)
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();

        if !self.is_built() {
            anyhow::bail!("Index must be built before saving");
        }

        self.store.write_to(path)?;
        progress!(
            self.options.verbose,
            path = %path.display(),
            nodes = self.store.len(),
            "Index written"
        );

        self.reset();
        self.load(path)
    }

    /// Map an index file read-only, replacing whatever this index holds.
    ///
    /// The file must have been written for the same dimensions and metric.
    /// On failure the current contents are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or mapped
    /// - A writer holds the file
    /// - The file size does not fit this index's record size
    /// - The file does not end in a run of root records
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let layout = NodeLayout::for_metric::<D>(self.dimensions());

        let store = NodeStore::open_mapped(path, layout, self.options.prefault)?;
        let (roots, n_items) = discover_roots(&store)
            .with_context(|| format!("Failed to read index file: {}", path.display()))?;

        progress!(
            self.options.verbose,
            path = %path.display(),
            roots = roots.len(),
            items = n_items,
            "Index loaded"
        );

        self.store = store;
        self.roots = roots;
        self.n_items = n_items;
        self.built = false;

        Ok(())
    }

    /// Release the file mapping and return to an empty index.
    ///
    /// Does nothing if no file is loaded.
    pub fn unload(&mut self) {
        if !self.is_loaded() {
            return;
        }

        self.reset();
        progress!(self.options.verbose, "Index unloaded");
    }
}

/// Roots of a saved forest, highest record first, and its item count
fn discover_roots(store: &NodeStore) -> Result<(Vec<ItemId>, usize)> {
    let last = store
        .len()
        .checked_sub(1)
        .and_then(|i| ItemId::try_from(i).ok())
        .context("Index has no records")?;

    let descendants = store.record(last)?.descendants();
    if descendants == 0 {
        anyhow::bail!("Last record is empty, so the file holds no root records");
    }

    // A one-item forest is that item's leaf. The copies after it are leaves
    // too and must not be mistaken for items.
    if descendants == 1 {
        return Ok((vec![0], 1));
    }

    let mut roots = Vec::new();
    for index in (0..=last).rev() {
        if store.record(index)?.descendants() != descendants {
            break;
        }
        roots.push(index);
    }

    Ok((roots, descendants as usize))
}
