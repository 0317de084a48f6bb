//! Iteration index: the position of a token inside nested collections.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered sequence of non-negative positions. Empty means "the whole
/// value" (top level).
///
/// Ordering is lexicographic, so a prefix sorts before all of its
/// descendants: `[] < [0] < [0, 0] < [0, 1] < [1]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Index(Vec<usize>);

impl Index {
    /// The top-level index.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(positions: impl Into<Vec<usize>>) -> Self {
        Self(positions.into())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn positions(&self) -> &[usize] {
        &self.0
    }

    /// `self` with one more position appended.
    pub fn child(&self, position: usize) -> Self {
        let mut positions = self.0.clone();
        positions.push(position);
        Self(positions)
    }

    /// `self` followed by every position of `suffix`.
    pub fn extend(&self, suffix: &[usize]) -> Self {
        let mut positions = self.0.clone();
        positions.extend_from_slice(suffix);
        Self(positions)
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, head) = self.0.split_last()?;
        Some(Self(head.to_vec()))
    }

    /// True when `self` is `other` or one of its ancestors.
    pub fn is_prefix_of(&self, other: &Index) -> bool {
        other.0.starts_with(&self.0)
    }

    /// True when `self` is an ancestor of `other` but not `other` itself.
    pub fn is_strict_prefix_of(&self, other: &Index) -> bool {
        self.0.len() < other.0.len() && self.is_prefix_of(other)
    }

    /// Positions of `self` below `prefix`, if `prefix` is a prefix of `self`.
    pub fn suffix_after(&self, prefix: &Index) -> Option<&[usize]> {
        if prefix.is_prefix_of(self) {
            Some(&self.0[prefix.0.len()..])
        } else {
            None
        }
    }
}

impl From<Vec<usize>> for Index {
    fn from(positions: Vec<usize>) -> Self {
        Self(positions)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, position) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{position}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn root_is_empty() {
        assert!(Index::root().is_root());
        assert_eq!(Index::root().len(), 0);
        assert_eq!(Index::root().to_string(), "[]");
    }

    #[test]
    fn ordering_is_lexicographic() {
        let mut indices = vec![
            Index::new([1]),
            Index::new([0, 1]),
            Index::root(),
            Index::new([0]),
            Index::new([0, 0]),
        ];
        indices.sort();
        assert_eq!(
            indices,
            vec![
                Index::root(),
                Index::new([0]),
                Index::new([0, 0]),
                Index::new([0, 1]),
                Index::new([1]),
            ]
        );
    }

    #[rstest]
    #[case::root_of_anything(vec![], vec![2, 3], true)]
    #[case::equal(vec![2], vec![2], true)]
    #[case::ancestor(vec![2], vec![2, 0], true)]
    #[case::sibling(vec![1], vec![2, 0], false)]
    #[case::descendant(vec![2, 0], vec![2], false)]
    fn prefix_relation(#[case] a: Vec<usize>, #[case] b: Vec<usize>, #[case] expected: bool) {
        assert_eq!(Index::new(a).is_prefix_of(&Index::new(b)), expected);
    }

    #[test]
    fn strict_prefix_excludes_self() {
        let index = Index::new([4]);
        assert!(!index.is_strict_prefix_of(&index));
        assert!(Index::root().is_strict_prefix_of(&index));
    }

    #[test]
    fn child_parent_and_suffix() {
        let parent = Index::new([3]);
        let child = parent.child(7).child(1);
        assert_eq!(child, Index::new([3, 7, 1]));
        assert_eq!(child.parent(), Some(Index::new([3, 7])));
        assert_eq!(child.suffix_after(&parent), Some(&[7, 1][..]));
        assert_eq!(Index::new([4]).suffix_after(&parent), None);
        assert_eq!(Index::root().parent(), None);
    }
}
