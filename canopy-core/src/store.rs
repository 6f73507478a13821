use crate::node::{ItemId, NodeLayout, NodeMut, NodeRef};
use anyhow::{Context, Result};
use fs2::FileExt;
use memmap2::{Mmap, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Flat array of fixed-stride node records.
///
/// While an index is being built the records live in a growable heap
/// buffer. Once it is saved, the same bytes are served straight from a
/// read-only memory map of the file. Records are always addressed by index,
/// never by pointer, so the two backings are interchangeable.
#[derive(Debug)]
pub struct NodeStore {
    layout: NodeLayout,
    backing: Backing,

    /// Number of records in use
    len: usize,
}

#[derive(Debug)]
enum Backing {
    /// Word-aligned growable buffer; its length is always a whole number
    /// of records
    Heap(Vec<u32>),

    /// Read-only mapping of a saved index
    Mapped(MappedFile),
}

/// A mapped index file together with the handle holding its shared lock
#[derive(Debug)]
struct MappedFile {
    file: File,
    mmap: Mmap,
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        // The lock goes away with the descriptor anyway; release it first
        let _ = FileExt::unlock(&self.file);
    }
}

impl NodeStore {
    /// Creates an empty heap-backed store
    #[must_use]
    pub fn new(layout: NodeLayout) -> Self {
        Self { layout, backing: Backing::Heap(Vec::new()), len: 0 }
    }

    /// Maps an index file read-only.
    ///
    /// # Arguments
    ///
    /// * `path` - Path of a file written by [`NodeStore::write_to`]
    /// * `layout` - Layout the file was built with
    /// * `prefault` - Populate the page tables up front (`MAP_POPULATE`)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or mapped
    /// - Another process holds the exclusive lock (a save is in progress)
    /// - The file is empty or its size is not a multiple of the record size
    pub fn open_mapped<P: AsRef<Path>>(path: P, layout: NodeLayout, prefault: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = File::open(path)
            .with_context(|| format!("Failed to open index file: {}", path.display()))?;

        // Readers share the file; a writer truncating it underneath a live
        // mapping would fault every reader
        FileExt::try_lock_shared(&file)
            .with_context(|| format!("Index file is being written: {}", path.display()))?;

        let size = file
            .metadata()
            .with_context(|| format!("Failed to stat index file: {}", path.display()))?
            .len();
        let size = usize::try_from(size).context("Index file too large for this platform")?;
        let record_size = layout.record_size();

        if size == 0 {
            anyhow::bail!("Index file is empty: {}", path.display());
        }

        if size % record_size != 0 {
            anyhow::bail!(
                "Index file size {} is not a multiple of the record size {} \
                 (was it built with different dimensions or metric?): {}",
                size,
                record_size,
                path.display()
            );
        }

        let mut options = MmapOptions::new();
        if prefault {
            options.populate();
        }

        // SAFETY: the file is opened read-only and protected by a shared lock,
        // so no cooperating writer can truncate or rewrite it while mapped
        let mmap = unsafe { options.map(&file) }
            .with_context(|| format!("Failed to map index file: {}", path.display()))?;

        // Mappings are page aligned, so this only fails on exotic platforms
        bytemuck::try_cast_slice::<u8, u32>(&mmap[..])
            .map_err(|e| anyhow::anyhow!("Index mapping is not word aligned: {:?}", e))?;

        Ok(Self {
            layout,
            backing: Backing::Mapped(MappedFile { file, mmap }),
            len: size / record_size,
        })
    }

    /// Writes every record in use to `path`, replacing any previous content.
    ///
    /// The file is held under an exclusive lock while it is rewritten and is
    /// synced to disk before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, locked, written or
    /// synced.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to create index file: {}", path.display()))?;

        // Truncate only after readers are known to be gone
        FileExt::try_lock_exclusive(&file)
            .with_context(|| format!("Index file is in use by another reader: {}", path.display()))?;

        file.set_len(0)?;
        file.write_all(self.as_bytes())
            .with_context(|| format!("Failed to write index file: {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync index file: {}", path.display()))?;

        Ok(())
    }

    /// Record layout of this store
    #[must_use]
    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    /// Number of records in use
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no record is in use
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of records that fit without growing
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.words().len() / self.layout.record_words()
    }

    /// Whether the store is a read-only file mapping
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// Ensures room for at least `n` records.
    ///
    /// Capacity grows to `max(n, 2 * capacity + 2)` and the new region is
    /// zero-filled. Growth may move the buffer, which is why views borrow
    /// the store and records are only ever named by index.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is mapped read-only.
    pub fn allocate_for(&mut self, n: usize) -> Result<()> {
        let record_words = self.layout.record_words();
        let capacity = self.capacity();

        let Backing::Heap(words) = &mut self.backing else {
            anyhow::bail!("Cannot grow a read-only mapped index");
        };

        if n > capacity {
            let new_capacity = n.max(capacity * 2 + 2);
            words.resize(new_capacity * record_words, 0);
        }

        Ok(())
    }

    /// Grows the in-use range to at least `n` records
    ///
    /// # Errors
    ///
    /// Returns an error if the store is mapped read-only.
    pub fn ensure_len(&mut self, n: usize) -> Result<()> {
        self.allocate_for(n)?;
        self.len = self.len.max(n);
        Ok(())
    }

    /// Appends one zeroed record and returns its index
    ///
    /// # Errors
    ///
    /// Returns an error if the store is mapped read-only or the index space
    /// is exhausted.
    pub fn allocate(&mut self) -> Result<ItemId> {
        let index = ItemId::try_from(self.len).context("Node index space exhausted")?;
        self.ensure_len(self.len + 1)?;
        Ok(index)
    }

    /// Read-only view of record `index`
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is not a record in use.
    #[inline]
    pub fn record(&self, index: ItemId) -> Result<NodeRef<'_>> {
        let range = self.record_range(index)?;
        Ok(NodeRef::new(&self.words()[range], self.layout))
    }

    /// Mutable view of record `index`
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is not a record in use or the store is
    /// mapped read-only.
    pub fn record_mut(&mut self, index: ItemId) -> Result<NodeMut<'_>> {
        let range = self.record_range(index)?;
        let layout = self.layout;

        let Backing::Heap(words) = &mut self.backing else {
            anyhow::bail!("Cannot modify a read-only mapped index");
        };

        Ok(NodeMut::new(&mut words[range], layout))
    }

    /// Copies record `from` over record `to`
    ///
    /// # Errors
    ///
    /// Returns an error if either index is out of range or the store is
    /// mapped read-only.
    pub fn copy_record(&mut self, from: ItemId, to: ItemId) -> Result<()> {
        let source = self.record_range(from)?;
        let target = self.record_range(to)?;

        let Backing::Heap(words) = &mut self.backing else {
            anyhow::bail!("Cannot modify a read-only mapped index");
        };

        words.copy_within(source, target.start);
        Ok(())
    }

    /// Bytes of every record in use, exactly as they are written to disk
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.len * self.layout.record_words();
        bytemuck::cast_slice(&self.words()[..end])
    }

    fn words(&self) -> &[u32] {
        match &self.backing {
            Backing::Heap(words) => words,
            // Alignment and length were checked in open_mapped
            Backing::Mapped(mapped) => bytemuck::cast_slice(&mapped.mmap[..]),
        }
    }

    #[inline]
    fn record_range(&self, index: ItemId) -> Result<std::ops::Range<usize>> {
        let index = index as usize;
        if index >= self.len {
            anyhow::bail!("Node index out of bounds: {} (node count is {})", index, self.len);
        }

        let record_words = self.layout.record_words();
        let start = index * record_words;
        Ok(start..start + record_words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{Angular, Euclidean};
    use crate::node::NodeKind;
    use tempfile::NamedTempFile;

    fn layout() -> NodeLayout {
        NodeLayout::for_metric::<Euclidean>(4)
    }

    #[test]
    fn test_growth_doubles_and_zero_fills() {
        let mut store = NodeStore::new(layout());
        assert_eq!(store.capacity(), 0);

        store.allocate_for(1).unwrap();
        assert_eq!(store.capacity(), 2); // max(1, 0 * 2 + 2)

        store.allocate_for(3).unwrap();
        assert_eq!(store.capacity(), 6); // max(3, 2 * 2 + 2)

        store.allocate_for(100).unwrap();
        assert_eq!(store.capacity(), 100);

        // Capacity never shrinks and len is untouched
        store.allocate_for(4).unwrap();
        assert_eq!(store.capacity(), 100);
        assert_eq!(store.len(), 0);

        store.ensure_len(100).unwrap();
        assert!(store.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_indices_survive_growth() {
        let mut store = NodeStore::new(layout());
        store.ensure_len(1).unwrap();
        store.record_mut(0).unwrap().write_leaf(&[1.0, 2.0, 3.0, 4.0]);

        for _ in 0..1000 {
            store.allocate().unwrap();
        }

        let node = store.record(0).unwrap();
        assert_eq!(node.kind(), NodeKind::Leaf);
        assert_eq!(node.vector(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(store.len(), 1001);
    }

    #[test]
    fn test_out_of_bounds_record() {
        let mut store = NodeStore::new(layout());
        store.allocate_for(10).unwrap();

        // Capacity is not the same as records in use
        let err = store.record(0).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn test_copy_record() {
        let mut store = NodeStore::new(layout());
        store.ensure_len(3).unwrap();
        store.record_mut(0).unwrap().write_bucket(&[4, 5, 6]);

        store.copy_record(0, 2).unwrap();

        assert_eq!(store.record(2).unwrap().bucket_items(), &[4, 5, 6]);
        assert_eq!(store.record(1).unwrap().kind(), NodeKind::Empty);
    }

    #[test]
    fn test_write_and_map_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();
        let layout = NodeLayout::for_metric::<Angular>(3);

        let mut store = NodeStore::new(layout);
        store.ensure_len(2).unwrap();
        store.record_mut(0).unwrap().write_leaf(&[0.5, 0.25, 0.125]);
        store.record_mut(1).unwrap().write_leaf(&[1.0, 2.0, 3.0]);
        store.write_to(temp_file.path()).unwrap();

        let mapped = NodeStore::open_mapped(temp_file.path(), layout, true).unwrap();
        assert!(mapped.is_mapped());
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped.as_bytes(), store.as_bytes());
        assert_eq!(mapped.record(1).unwrap().vector(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_mapped_store_is_read_only() {
        let temp_file = NamedTempFile::new().unwrap();
        let layout = layout();

        let mut store = NodeStore::new(layout);
        store.ensure_len(1).unwrap();
        store.write_to(temp_file.path()).unwrap();

        let mut mapped = NodeStore::open_mapped(temp_file.path(), layout, false).unwrap();
        assert!(mapped.record_mut(0).is_err());
        assert!(mapped.allocate().is_err());
        assert!(mapped.copy_record(0, 0).is_err());
    }

    #[test]
    fn test_open_rejects_mismatched_size() {
        let temp_file = NamedTempFile::new().unwrap();

        let mut store = NodeStore::new(NodeLayout::for_metric::<Angular>(3));
        store.ensure_len(3).unwrap();
        store.write_to(temp_file.path()).unwrap();

        // 3 records of 24 bytes do not divide into 28-byte Euclidean records
        let err = NodeStore::open_mapped(temp_file.path(), layout(), false).unwrap_err();
        assert!(err.to_string().contains("not a multiple"));
    }

    #[test]
    fn test_open_rejects_empty_and_missing_files() {
        let temp_file = NamedTempFile::new().unwrap();
        let err = NodeStore::open_mapped(temp_file.path(), layout(), false).unwrap_err();
        assert!(err.to_string().contains("empty"));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.canopy");
        let err = NodeStore::open_mapped(&missing, layout(), false).unwrap_err();
        assert!(err.to_string().contains("Failed to open"));
    }
}
