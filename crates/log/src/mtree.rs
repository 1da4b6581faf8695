//! Merkle accumulator over transaction inner hashes
//!
//! An append-only binary Merkle tree in the Certificate Transparency style
//! (RFC 6962): leaves are hashed with a `0x00` prefix, interior nodes with
//! `0x01`, and the tree over `n` leaves is defined recursively by splitting
//! at the largest power of two smaller than `n`.
//!
//! The accumulator keeps the raw leaf digests in memory, so roots and audit
//! paths can be computed for any historical tree size. It is rebuilt from
//! the commit log on startup.

use sha2::{Digest as Sha2Digest, Sha256};

use veri_core::{Digest, Error, Result, NULL_DIGEST};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Hash of a leaf value.
pub fn leaf_hash(value: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(value);
    hasher.finalize().into()
}

/// Hash of an interior node.
pub fn node_hash(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Largest power of two strictly smaller than `n`. Requires `n > 1`.
fn split_point(n: u64) -> u64 {
    debug_assert!(n > 1);
    1 << (63 - (n - 1).leading_zeros())
}

/// Append-only Merkle tree over transaction inner hashes.
#[derive(Debug, Default, Clone)]
pub struct MerkleAccumulator {
    leaves: Vec<Digest>,
}

impl MerkleAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves appended so far.
    pub fn size(&self) -> u64 {
        self.leaves.len() as u64
    }

    /// Append one leaf (a transaction's inner hash).
    pub fn append(&mut self, value: Digest) {
        self.leaves.push(value);
    }

    /// Drop leaves beyond `size` (commit-log tail truncation).
    pub fn truncate(&mut self, size: u64) {
        self.leaves.truncate(size as usize);
    }

    /// Root over the current tree.
    pub fn root(&self) -> Digest {
        self.subtree_root(0, self.size())
    }

    /// Root over the first `size` leaves.
    pub fn root_at(&self, size: u64) -> Result<Digest> {
        if size > self.size() {
            return Err(Error::InvalidArgument(format!(
                "tree size {} beyond accumulator size {}",
                size,
                self.size()
            )));
        }
        Ok(self.subtree_root(0, size))
    }

    fn subtree_root(&self, start: u64, end: u64) -> Digest {
        let n = end - start;
        match n {
            0 => NULL_DIGEST,
            1 => leaf_hash(&self.leaves[start as usize]),
            _ => {
                let k = split_point(n);
                node_hash(
                    &self.subtree_root(start, start + k),
                    &self.subtree_root(start + k, end),
                )
            }
        }
    }

    /// Audit path proving leaf `index` (0-based) within the first `size`
    /// leaves, ordered leaf to root.
    pub fn inclusion_path(&self, index: u64, size: u64) -> Result<Vec<Digest>> {
        if size > self.size() || index >= size {
            return Err(Error::InvalidArgument(format!(
                "inclusion path for leaf {} of tree size {} (have {})",
                index,
                size,
                self.size()
            )));
        }
        let mut path = Vec::new();
        self.path_rec(index, 0, size, &mut path);
        Ok(path)
    }

    fn path_rec(&self, index: u64, start: u64, end: u64, out: &mut Vec<Digest>) {
        let n = end - start;
        if n <= 1 {
            return;
        }
        let k = split_point(n);
        if index - start < k {
            self.path_rec(index, start, start + k, out);
            out.push(self.subtree_root(start + k, end));
        } else {
            self.path_rec(index, start + k, end, out);
            out.push(self.subtree_root(start, start + k));
        }
    }

    /// Consistency path proving the tree over the first `old_size` leaves is
    /// a prefix of the tree over the first `new_size` leaves.
    pub fn consistency_path(&self, old_size: u64, new_size: u64) -> Result<Vec<Digest>> {
        if new_size > self.size() || old_size > new_size || old_size == 0 {
            return Err(Error::InvalidArgument(format!(
                "consistency path {} -> {} (have {})",
                old_size,
                new_size,
                self.size()
            )));
        }
        let mut path = Vec::new();
        if old_size < new_size {
            self.subproof(old_size, 0, new_size, true, &mut path);
        }
        Ok(path)
    }

    fn subproof(&self, m: u64, start: u64, end: u64, complete: bool, out: &mut Vec<Digest>) {
        let n = end - start;
        if m == n {
            if !complete {
                out.push(self.subtree_root(start, end));
            }
            return;
        }
        let k = split_point(n);
        if m <= k {
            self.subproof(m, start, start + k, complete, out);
            out.push(self.subtree_root(start + k, end));
        } else {
            self.subproof(m - k, start + k, end, false, out);
            out.push(self.subtree_root(start, start + k));
        }
    }
}

/// Recompute the root implied by an inclusion path (RFC 6962 verification).
pub fn root_from_inclusion(
    leaf: &Digest,
    index: u64,
    size: u64,
    path: &[Digest],
) -> Result<Digest> {
    if index >= size {
        return Err(Error::InvalidArgument(format!(
            "leaf index {} out of tree of size {}",
            index, size
        )));
    }
    let mut fn_ = index;
    let mut sn = size - 1;
    let mut r = leaf_hash(leaf);
    for sibling in path {
        if sn == 0 {
            return Err(Error::InvalidArgument("inclusion path too long".into()));
        }
        if fn_ & 1 == 1 || fn_ == sn {
            r = node_hash(sibling, &r);
            while fn_ & 1 == 0 {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            r = node_hash(&r, sibling);
        }
        fn_ >>= 1;
        sn >>= 1;
    }
    if sn != 0 {
        return Err(Error::InvalidArgument("inclusion path too short".into()));
    }
    Ok(r)
}

/// Recompute the (old, new) roots implied by a consistency path.
pub fn roots_from_consistency(
    old_size: u64,
    new_size: u64,
    old_root: &Digest,
    path: &[Digest],
) -> Result<(Digest, Digest)> {
    if old_size == 0 || old_size > new_size {
        return Err(Error::InvalidArgument(format!(
            "consistency verification {} -> {}",
            old_size, new_size
        )));
    }
    if old_size == new_size {
        if !path.is_empty() {
            return Err(Error::InvalidArgument(
                "non-empty path for identical sizes".into(),
            ));
        }
        return Ok((*old_root, *old_root));
    }

    let mut iter = path.iter();
    let mut fn_ = old_size - 1;
    let mut sn = new_size - 1;
    while fn_ & 1 == 1 {
        fn_ >>= 1;
        sn >>= 1;
    }
    let mut fr;
    let mut sr;
    if fn_ > 0 {
        let first = iter
            .next()
            .ok_or_else(|| Error::InvalidArgument("consistency path too short".into()))?;
        fr = *first;
        sr = *first;
    } else {
        fr = *old_root;
        sr = *old_root;
    }

    for sibling in iter {
        if sn == 0 {
            return Err(Error::InvalidArgument("consistency path too long".into()));
        }
        if fn_ & 1 == 1 || fn_ == sn {
            fr = node_hash(sibling, &fr);
            sr = node_hash(sibling, &sr);
            while fn_ & 1 == 0 && fn_ != 0 {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            sr = node_hash(&sr, sibling);
        }
        fn_ >>= 1;
        sn >>= 1;
    }
    if sn != 0 {
        return Err(Error::InvalidArgument("consistency path too short".into()));
    }
    Ok((fr, sr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(i: u8) -> Digest {
        [i; 32]
    }

    fn tree(n: u8) -> MerkleAccumulator {
        let mut acc = MerkleAccumulator::new();
        for i in 0..n {
            acc.append(leaf(i));
        }
        acc
    }

    #[test]
    fn test_empty_and_single() {
        let acc = MerkleAccumulator::new();
        assert_eq!(acc.root(), NULL_DIGEST);

        let acc = tree(1);
        assert_eq!(acc.root(), leaf_hash(&leaf(0)));
    }

    #[test]
    fn test_root_matches_manual_two_leaves() {
        let acc = tree(2);
        let expect = node_hash(&leaf_hash(&leaf(0)), &leaf_hash(&leaf(1)));
        assert_eq!(acc.root(), expect);
    }

    #[test]
    fn test_historical_roots() {
        let acc = tree(7);
        let small = tree(3);
        assert_eq!(acc.root_at(3).unwrap(), small.root());
        assert!(acc.root_at(8).is_err());
    }

    #[test]
    fn test_inclusion_paths_verify() {
        for n in 1..=16u8 {
            let acc = tree(n);
            let root = acc.root();
            for i in 0..n as u64 {
                let path = acc.inclusion_path(i, n as u64).unwrap();
                let got = root_from_inclusion(&leaf(i as u8), i, n as u64, &path).unwrap();
                assert_eq!(got, root, "leaf {} of {}", i, n);
            }
        }
    }

    #[test]
    fn test_inclusion_rejects_wrong_leaf() {
        let acc = tree(8);
        let path = acc.inclusion_path(3, 8).unwrap();
        let got = root_from_inclusion(&leaf(99), 3, 8, &path).unwrap();
        assert_ne!(got, acc.root());
    }

    #[test]
    fn test_consistency_paths_verify() {
        for n in 1..=16u64 {
            let acc = tree(16);
            let old_root = acc.root_at(n).unwrap();
            let new_root = acc.root();
            let path = acc.consistency_path(n, 16).unwrap();
            let (fr, sr) = roots_from_consistency(n, 16, &old_root, &path).unwrap();
            assert_eq!(fr, old_root, "old root for size {}", n);
            assert_eq!(sr, new_root, "new root for size {}", n);
        }
    }

    #[test]
    fn test_consistency_rejects_forked_history() {
        let acc = tree(8);
        let mut forked = tree(4);
        forked.truncate(3);
        forked.append(leaf(200));
        let old_root = forked.root();

        let path = acc.consistency_path(4, 8).unwrap();
        let (fr, _) = roots_from_consistency(4, 8, &old_root, &path).unwrap();
        assert_ne!(fr, old_root);
    }

    #[test]
    fn test_truncate_restores_earlier_root() {
        let mut acc = tree(10);
        let root6 = acc.root_at(6).unwrap();
        acc.truncate(6);
        assert_eq!(acc.root(), root6);
        assert_eq!(acc.size(), 6);
    }
}
