//! A vector that keeps its first few items inline.

/// Holds up to `N` items inline and moves to the heap once it grows past that.
///
/// Once on the heap it stays there, even if cleared.
#[derive(Debug, Clone)]
pub enum MaybeVec<T: Copy + Default, const N: usize> {
    Inline { items: [T; N], len: usize },
    Heap(Vec<T>),
}

impl<T: Copy + Default, const N: usize> Default for MaybeVec<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default, const N: usize> MaybeVec<T, N> {
    pub fn new() -> Self {
        Self::Inline {
            items: [T::default(); N],
            len: 0,
        }
    }

    pub fn push(&mut self, value: T) {
        match self {
            Self::Inline { items, len } if *len < N => {
                items[*len] = value;
                *len += 1;
            }
            Self::Inline { items, len } => {
                let mut heap = Vec::with_capacity(*len * 2 + 1);
                heap.extend_from_slice(&items[..*len]);
                heap.push(value);
                *self = Self::Heap(heap);
            }
            Self::Heap(heap) => heap.push(value),
        }
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            Self::Inline { items, len } => &items[..*len],
            Self::Heap(heap) => heap,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn clear(&mut self) {
        match self {
            Self::Inline { len, .. } => *len = 0,
            Self::Heap(heap) => heap.clear(),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }
}

impl<T: Copy + Default + PartialEq, const N: usize> MaybeVec<T, N> {
    pub fn contains(&self, value: &T) -> bool {
        self.as_slice().contains(value)
    }
}

impl<'a, T: Copy + Default, const N: usize> IntoIterator for &'a MaybeVec<T, N> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
