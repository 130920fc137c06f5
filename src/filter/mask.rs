/// One bit per record; set bits pass the filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMask {
    bits: Vec<u64>,
    len: usize,
    count: usize,
}

impl RowMask {
    pub fn all_true(len: usize) -> Self {
        let words = (len + 63) / 64;
        let mut bits = vec![u64::MAX; words];
        if len % 64 != 0 {
            bits[words - 1] = (1u64 << (len % 64)) - 1;
        }
        Self {
            bits,
            len,
            count: len,
        }
    }

    pub fn all_false(len: usize) -> Self {
        Self {
            bits: vec![0u64; (len + 63) / 64],
            len,
            count: 0,
        }
    }

    /// Mask with exactly `indices` set; out-of-range indices are ignored
    pub fn from_indices(len: usize, indices: &[usize]) -> Self {
        let mut mask = Self::all_false(len);
        for &index in indices {
            mask.set(index);
        }
        mask
    }

    /// Mask of records for which `pass` is true
    pub fn from_fn<F>(len: usize, mut pass: F) -> Self
    where
        F: FnMut(usize) -> bool,
    {
        let mut mask = Self::all_false(len);
        for index in 0..len {
            if pass(index) {
                mask.set(index);
            }
        }
        mask
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        (self.bits[index / 64] & (1u64 << (index % 64))) != 0
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        if index >= self.len {
            return;
        }
        let word = &mut self.bits[index / 64];
        let bit = 1u64 << (index % 64);
        if *word & bit == 0 {
            *word |= bit;
            self.count += 1;
        }
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        if index >= self.len {
            return;
        }
        let word = &mut self.bits[index / 64];
        let bit = 1u64 << (index % 64);
        if *word & bit != 0 {
            *word &= !bit;
            self.count -= 1;
        }
    }

    /// Intersection
    pub fn and(&mut self, other: &RowMask) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a &= *b;
        }
        self.recount();
    }

    /// Union
    pub fn or(&mut self, other: &RowMask) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
        self.recount();
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn any(&self) -> bool {
        self.count > 0
    }

    #[inline]
    pub fn all(&self) -> bool {
        self.count == self.len
    }

    /// Passing record indices in ascending order
    pub fn indices(&self) -> Vec<usize> {
        let mut result = Vec::with_capacity(self.count);
        for (word_idx, &word) in self.bits.iter().enumerate() {
            let base = word_idx * 64;
            let mut w = word;
            while w != 0 {
                result.push(base + w.trailing_zeros() as usize);
                w &= w - 1;
            }
        }
        result
    }

    /// Keep the entries of `indices` whose bit is set, preserving their order
    pub fn select(&self, indices: &[usize]) -> Vec<usize> {
        indices.iter().copied().filter(|&i| self.get(i)).collect()
    }

    fn recount(&mut self) {
        self.count = self.bits.iter().map(|w| w.count_ones() as usize).sum();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
