//! Dense interference matrix over a fixed universe of keys.

use bitvec::order::Lsb0;
use bitvec::vec::BitVec;

/// Square, symmetric bit-matrix recording which keys are live at the same time.
///
/// Keys are dense indices in `0..size`. A per-key degree counter is kept up to date on every
/// [`insert`](Self::insert), so [`count_interferences`](Self::count_interferences) is O(1).
///
/// All methods panic if a key is `>= size`, like slice indexing does.
#[derive(Debug, Clone)]
pub struct InterferenceMatrix {
    size: usize,
    bits: BitVec<usize, Lsb0>,
    degrees: Vec<u32>,
}

impl InterferenceMatrix {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            bits: BitVec::repeat(false, size * size),
            degrees: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Records that `x` and `y` interfere. Inserting an existing edge, or a key with itself, does
    /// nothing.
    pub fn insert(&mut self, x: usize, y: usize) {
        self.check(x);
        self.check(y);
        if x == y || self.bits[x * self.size + y] {
            return;
        }
        self.bits.set(x * self.size + y, true);
        self.bits.set(y * self.size + x, true);
        self.degrees[x] += 1;
        self.degrees[y] += 1;
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        self.check(x);
        self.check(y);
        self.bits[x * self.size + y]
    }

    /// Every key interfering with `key`, in ascending order.
    pub fn get_interferences(&self, key: usize) -> impl Iterator<Item = usize> + '_ {
        self.check(key);
        self.bits[key * self.size..(key + 1) * self.size].iter_ones()
    }

    pub fn count_interferences(&self, key: usize) -> usize {
        self.check(key);
        self.degrees[key] as usize
    }

    /// Removes all edges, keeping the size.
    pub fn clear(&mut self) {
        self.bits.fill(false);
        self.degrees.fill(0);
    }

    fn check(&self, key: usize) {
        assert!(
            key < self.size,
            "key {key} out of range for interference matrix of size {}",
            self.size
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_is_symmetric() {
        let mut matrix = InterferenceMatrix::new(4);
        matrix.insert(1, 3);
        assert!(matrix.get(1, 3));
        assert!(matrix.get(3, 1));
        assert!(!matrix.get(1, 2));
        assert_eq!(matrix.get_interferences(3).collect::<Vec<_>>(), [1]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut matrix = InterferenceMatrix::new(3);
        matrix.insert(0, 2);
        matrix.insert(0, 2);
        matrix.insert(2, 0);
        assert_eq!(matrix.count_interferences(0), 1);
        assert_eq!(matrix.count_interferences(2), 1);
        assert_eq!(matrix.count_interferences(1), 0);
    }

    #[test]
    fn test_self_edge_ignored() {
        let mut matrix = InterferenceMatrix::new(2);
        matrix.insert(1, 1);
        assert!(!matrix.get(1, 1));
        assert_eq!(matrix.count_interferences(1), 0);
    }

    #[test]
    fn test_clear() {
        let mut matrix = InterferenceMatrix::new(2);
        matrix.insert(0, 1);
        matrix.clear();
        assert!(!matrix.get(0, 1));
        assert_eq!(matrix.count_interferences(0), 0);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_key() {
        InterferenceMatrix::new(2).insert(0, 2);
    }

    proptest! {
        #[test]
        fn test_degree_matches_neighbours(edges in proptest::collection::vec((0usize..16, 0usize..16), 0..64)) {
            let mut matrix = InterferenceMatrix::new(16);
            for &(x, y) in &edges {
                matrix.insert(x, y);
                matrix.insert(x, y);
            }
            for x in 0..16 {
                prop_assert_eq!(matrix.count_interferences(x), matrix.get_interferences(x).count());
                for y in 0..16 {
                    prop_assert_eq!(matrix.get(x, y), matrix.get(y, x));
                }
            }
            for &(x, y) in &edges {
                prop_assert_eq!(matrix.get(x, y), x != y);
            }
        }
    }
}
