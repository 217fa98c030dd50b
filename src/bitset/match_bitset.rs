use bytes::{Buf, BufMut};
use crate::core::error::{Error, Result};

const WORD_BITS: usize = 64;

/// Fixed-universe bit vector holding the matched records of one block.
///
/// Indices at or beyond the universe are ignored by mutators and read as unset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchBitset {
    words: Vec<u64>,
    len: usize,
}

#[inline]
fn words_for(len: usize) -> usize {
    len.div_ceil(WORD_BITS)
}

impl MatchBitset {
    /// Empty bitset over `len` records.
    pub fn new(len: usize) -> Self {
        MatchBitset {
            words: vec![0; words_for(len)],
            len,
        }
    }

    /// Every record in `0..len` set.
    pub fn all_set(len: usize) -> Self {
        let mut bs = MatchBitset {
            words: vec![u64::MAX; words_for(len)],
            len,
        };
        bs.clear_tail();
        bs
    }

    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut bs = MatchBitset::new(len);
        for i in indices {
            bs.add_matched_record(i);
        }
        bs
    }

    /// Universe size.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn add_matched_record(&mut self, i: usize) {
        if i < self.len {
            self.words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
        }
    }

    #[inline]
    pub fn clear_bit(&mut self, i: usize) {
        if i < self.len {
            self.words[i / WORD_BITS] &= !(1u64 << (i % WORD_BITS));
        }
    }

    #[inline]
    pub fn is_set(&self, i: usize) -> bool {
        i < self.len && self.words[i / WORD_BITS] & (1u64 << (i % WORD_BITS)) != 0
    }

    /// Flips every bit in `lo..hi`, clamped to the universe.
    pub fn flip_range(&mut self, lo: usize, hi: usize) {
        let hi = hi.min(self.len);
        if lo >= hi {
            return;
        }
        let (first, last) = (lo / WORD_BITS, (hi - 1) / WORD_BITS);
        for w in first..=last {
            let start = if w == first { lo % WORD_BITS } else { 0 };
            let end = if w == last { (hi - 1) % WORD_BITS + 1 } else { WORD_BITS };
            let mask = if end - start == WORD_BITS {
                u64::MAX
            } else {
                ((1u64 << (end - start)) - 1) << start
            };
            self.words[w] ^= mask;
        }
    }

    /// Complement over the universe.
    pub fn flip_all(&mut self) {
        let len = self.len;
        self.flip_range(0, len);
    }

    pub fn reset_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Keeps only bits also set in `other`; bits past `other`'s universe are cleared.
    pub fn in_place_intersection(&mut self, other: &MatchBitset) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or(0);
        }
        self.clear_tail();
    }

    /// Adds bits set in `other` that fall inside this universe.
    pub fn in_place_union(&mut self, other: &MatchBitset) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= *o;
        }
        self.clear_tail();
    }

    /// Clears every bit set in `other`.
    pub fn in_place_difference(&mut self, other: &MatchBitset) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= !*o;
        }
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    pub fn all(&self) -> bool {
        self.count() == self.len
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Truncates the universe to `n` records, dropping any bits beyond it.
    pub fn shrink(&mut self, n: usize) {
        if n >= self.len {
            return;
        }
        self.len = n;
        self.words.truncate(words_for(n));
        self.clear_tail();
    }

    /// Grows the universe to `n` records; new records take `value`.
    pub fn grow(&mut self, n: usize, value: bool) {
        if n <= self.len {
            return;
        }
        let old = self.len;
        self.words.resize(words_for(n), 0);
        self.len = n;
        if value {
            self.flip_range(old, n);
        }
    }

    /// Set indices in ascending order.
    pub fn iter_set(&self) -> SetBits<'_> {
        SetBits {
            words: &self.words,
            word_idx: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }

    pub fn encoded_len(&self) -> usize {
        8 + 8 * self.words.len()
    }

    /// Binary form: universe size as big-endian u64, then each word big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.len as u64);
        for w in &self.words {
            buf.put_u64(*w);
        }
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::corrupted(format!("bitset header needs 8 bytes, got {}", data.len())));
        }
        let len = data.get_u64() as usize;
        let nwords = words_for(len);
        if data.len() < nwords * 8 {
            return Err(Error::corrupted(format!(
                "bitset of {} records needs {} bytes, got {}",
                len,
                nwords * 8,
                data.len()
            )));
        }
        let words = (0..nwords).map(|_| data.get_u64()).collect();
        let mut bs = MatchBitset { words, len };
        bs.clear_tail();
        Ok(bs)
    }

    fn clear_tail(&mut self) {
        let rem = self.len % WORD_BITS;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }
}

pub struct SetBits<'a> {
    words: &'a [u64],
    word_idx: usize,
    current: u64,
}

impl Iterator for SetBits<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.word_idx * WORD_BITS + bit);
            }
            self.word_idx += 1;
            if self.word_idx >= self.words.len() {
                return None;
            }
            self.current = self.words[self.word_idx];
        }
    }
}
