//! Fixed-width forest node records.
//!
//! # Design Principles
//!
//! Every node in the forest, whatever its role, occupies **the same number of
//! bytes**. That makes the node store a flat array addressed by index:
//! `record_offset = index * record_size`. Child "pointers" are indices into
//! that array, so a store can be grown, written to disk and mapped back in
//! without any relocation.
//!
//! # Layout
//!
//! All fields are 4-byte words in host byte order:
//!
//! ```text
//! Angular   (o = 0): [descendants][child 0][child 1][v0 .. v(f-1)]
//! Euclidean (o = 1): [descendants][offset ][child 0][child 1][v0 .. v(f-1)]
//! ```
//!
//! The descendant count decides how the rest of the record is read:
//!
//! | descendants   | kind   | payload                                      |
//! |---------------|--------|----------------------------------------------|
//! | 0             | empty  | slot never written                           |
//! | 1             | leaf   | item vector in `v`                           |
//! | 2 ..= K       | bucket | item ids from the child slot onwards         |
//! | > K           | split  | plane normal in `v`, two child indices       |
//!
//! `K` is the number of ids that fit between the first child slot and the
//! end of the record, i.e. `f + 2` for both metrics.

use crate::distance::{Distance, Hyperplane};

/// Item id, which is also the index of the item's leaf record.
pub type ItemId = u32;

/// Size of every record field in bytes
pub const WORD_SIZE: usize = std::mem::size_of::<u32>();

/// How a record should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Zero-filled slot that was never written
    Empty,
    /// A single item and its vector
    Leaf,
    /// A short list of item ids
    Bucket,
    /// A hyperplane with two children
    Split,
}

/// Parameters that fix the record stride.
///
/// These are derived from the dimension count and the metric and must match
/// between the process that built an index and every process that loads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    dimensions: usize,
    offset_words: usize,
}

impl NodeLayout {
    /// Layout for `dimensions`-dimensional vectors with `offset_words`
    /// reserved after the descendant count
    #[must_use]
    pub const fn new(dimensions: usize, offset_words: usize) -> Self {
        Self { dimensions, offset_words }
    }

    /// Layout used by metric `D`
    #[must_use]
    pub const fn for_metric<D: Distance>(dimensions: usize) -> Self {
        Self::new(dimensions, D::OFFSET_WORDS)
    }

    /// Vector dimensionality `f`
    #[must_use]
    pub const fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Whether records carry a plane offset word
    #[must_use]
    pub const fn has_offset(&self) -> bool {
        self.offset_words > 0
    }

    /// Word index of the first child slot
    #[must_use]
    pub const fn children_word(&self) -> usize {
        1 + self.offset_words
    }

    /// Word index of the first vector component
    #[must_use]
    pub const fn vector_word(&self) -> usize {
        self.children_word() + 2
    }

    /// Record stride in words
    #[must_use]
    pub const fn record_words(&self) -> usize {
        self.vector_word() + self.dimensions
    }

    /// Record stride in bytes
    #[must_use]
    pub const fn record_size(&self) -> usize {
        self.record_words() * WORD_SIZE
    }

    /// Largest descendant count stored as a bucket (`K`)
    #[must_use]
    pub const fn max_bucket(&self) -> usize {
        self.record_words() - self.children_word()
    }

    /// Classify a record by its descendant count
    #[must_use]
    pub const fn kind(&self, descendants: u32) -> NodeKind {
        match descendants {
            0 => NodeKind::Empty,
            1 => NodeKind::Leaf,
            n if (n as usize) <= self.max_bucket() => NodeKind::Bucket,
            _ => NodeKind::Split,
        }
    }
}

/// Read-only view of one record.
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'a> {
    words: &'a [u32],
    layout: NodeLayout,
}

impl<'a> NodeRef<'a> {
    /// Wrap a record's words. `words.len()` must equal the layout's stride.
    #[must_use]
    pub fn new(words: &'a [u32], layout: NodeLayout) -> Self {
        debug_assert_eq!(words.len(), layout.record_words());
        Self { words, layout }
    }

    /// Number of items below this node
    #[inline]
    #[must_use]
    pub fn descendants(&self) -> u32 {
        self.words[0]
    }

    /// How this record is interpreted
    #[inline]
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.layout.kind(self.descendants())
    }

    /// Item vector (leaf) or plane normal (split)
    #[inline]
    #[must_use]
    pub fn vector(&self) -> &'a [f32] {
        bytemuck::cast_slice(&self.words[self.layout.vector_word()..])
    }

    /// Plane offset; always zero for layouts without an offset word
    #[inline]
    #[must_use]
    pub fn offset(&self) -> f32 {
        if self.layout.has_offset() { f32::from_bits(self.words[1]) } else { 0.0 }
    }

    /// The two child record indices of a split
    #[inline]
    #[must_use]
    pub fn children(&self) -> [ItemId; 2] {
        let c = self.layout.children_word();
        [self.words[c], self.words[c + 1]]
    }

    /// Split plane stored in this record
    #[inline]
    #[must_use]
    pub fn hyperplane(&self) -> Hyperplane<'a> {
        Hyperplane { normal: self.vector(), offset: self.offset() }
    }

    /// Item ids listed in a bucket. Empty for any other kind.
    #[inline]
    #[must_use]
    pub fn bucket_items(&self) -> &'a [ItemId] {
        if self.kind() != NodeKind::Bucket {
            return &[];
        }
        let start = self.layout.children_word();
        let count = self.descendants() as usize;
        &self.words[start..start + count]
    }

    /// Raw words of the record
    #[must_use]
    pub fn as_words(&self) -> &'a [u32] {
        self.words
    }
}

/// Mutable view of one record.
#[derive(Debug)]
pub struct NodeMut<'a> {
    words: &'a mut [u32],
    layout: NodeLayout,
}

impl<'a> NodeMut<'a> {
    /// Wrap a record's words. `words.len()` must equal the layout's stride.
    #[must_use]
    pub fn new(words: &'a mut [u32], layout: NodeLayout) -> Self {
        debug_assert_eq!(words.len(), layout.record_words());
        Self { words, layout }
    }

    /// Overwrite with a leaf holding `vector`.
    ///
    /// `vector.len()` must equal the layout's dimensions.
    pub fn write_leaf(&mut self, vector: &[f32]) {
        self.words.fill(0);
        self.words[0] = 1;
        let v = self.layout.vector_word();
        bytemuck::cast_slice_mut::<u32, f32>(&mut self.words[v..]).copy_from_slice(vector);
    }

    /// Overwrite with a bucket listing `items` in order.
    ///
    /// `items.len()` must be in `2..=K`.
    pub fn write_bucket(&mut self, items: &[ItemId]) {
        debug_assert!(items.len() <= self.layout.max_bucket());
        self.words.fill(0);
        self.words[0] = items.len() as u32;
        let c = self.layout.children_word();
        self.words[c..c + items.len()].copy_from_slice(items);
    }

    /// Overwrite with a split over `descendants` items.
    pub fn write_split(&mut self, descendants: u32, plane: Hyperplane<'_>, children: [ItemId; 2]) {
        debug_assert_eq!(self.layout.kind(descendants), NodeKind::Split);
        self.words[0] = descendants;
        if self.layout.has_offset() {
            self.words[1] = plane.offset.to_bits();
        }
        let c = self.layout.children_word();
        self.words[c] = children[0];
        self.words[c + 1] = children[1];
        let v = self.layout.vector_word();
        bytemuck::cast_slice_mut::<u32, f32>(&mut self.words[v..]).copy_from_slice(plane.normal);
    }
}
