//! Forest construction and traversal over a [`NodeStore`](crate::store::NodeStore).

mod builder;
mod search;

pub use builder::{SPLIT_ATTEMPTS, TreeBuilder, write_root_suffix};
pub use search::{Neighbor, search};

/// How many trees a call to `build` should add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeCount {
    /// Keep adding trees until the records added by this build reach the
    /// item count, roughly doubling the index size
    #[default]
    Auto,

    /// Add exactly this many trees
    Exact(usize),
}

impl From<i32> for TreeCount {
    /// Any negative count requests automatic sizing, as `-1` does at the C
    /// boundary.
    fn from(count: i32) -> Self {
        usize::try_from(count).map_or(TreeCount::Auto, TreeCount::Exact)
    }
}

impl From<usize> for TreeCount {
    fn from(count: usize) -> Self {
        TreeCount::Exact(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_count_from_i32() {
        assert_eq!(TreeCount::from(-1), TreeCount::Auto);
        assert_eq!(TreeCount::from(-7), TreeCount::Auto);
        assert_eq!(TreeCount::from(0), TreeCount::Exact(0));
        assert_eq!(TreeCount::from(10), TreeCount::Exact(10));
        assert_eq!(TreeCount::default(), TreeCount::Auto);
    }
}
