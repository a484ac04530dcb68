//! KLL quantile sketch over i64 streams.
//!
//! Compactor-based implementation with the standard (2/3)^depth capacity
//! decay: level capacities shrink geometrically from `k`, which bounds
//! total space at O(k) while keeping rank error proportional to 1/k.
//! Sketches are mergeable and serialize into reports at bucket close.

use rand::Rng;

/// Default accuracy parameter. Rank error is roughly 1.65/k.
pub const DEFAULT_K: usize = 200;

#[derive(Debug, Clone)]
pub struct KllSketch {
    k: usize,
    /// compactors[0] holds weight-1 items; level h items carry weight 2^h.
    compactors: Vec<Vec<i64>>,
    /// Items currently stored across all levels.
    size: usize,
    /// Storage bound; exceeding it triggers a compaction pass.
    max_size: usize,
    /// Stream length.
    n: u64,
}

impl Default for KllSketch {
    fn default() -> Self {
        Self::new(DEFAULT_K)
    }
}

impl KllSketch {
    pub fn new(k: usize) -> Self {
        let mut sketch = Self {
            k: k.max(8),
            compactors: vec![Vec::new()],
            size: 0,
            max_size: 0,
            n: 0,
        };
        sketch.update_max_size();
        sketch
    }

    /// Capacity of `level`, counted from the bottom.
    fn capacity(&self, level: usize) -> usize {
        let depth = self.compactors.len();
        let height = depth - 1 - level;
        let mut cap = self.k as f64;
        for _ in 0..height {
            cap *= 2.0 / 3.0;
        }
        (cap.ceil() as usize).max(2)
    }

    fn update_max_size(&mut self) {
        self.max_size = (0..self.compactors.len()).map(|l| self.capacity(l)).sum();
    }

    pub fn insert(&mut self, value: i64) {
        self.compactors[0].push(value);
        self.size += 1;
        self.n += 1;
        if self.size >= self.max_size {
            self.compress();
        }
    }

    /// Compacts the first over-full level: sort, keep a random parity of
    /// the items, promote survivors one level up at double weight.
    fn compress(&mut self) {
        for level in 0..self.compactors.len() {
            if self.compactors[level].len() >= self.capacity(level) {
                if level + 1 == self.compactors.len() {
                    self.compactors.push(Vec::new());
                    self.update_max_size();
                }
                let mut items = std::mem::take(&mut self.compactors[level]);
                items.sort_unstable();
                // An odd item count leaves one item behind at this level so
                // no weight is lost.
                if items.len() % 2 == 1 {
                    let leftover = items.pop().expect("non-empty after parity check");
                    self.compactors[level].push(leftover);
                }
                let offset = usize::from(rand::thread_rng().gen::<bool>());
                let promoted: Vec<i64> =
                    items.iter().skip(offset).step_by(2).copied().collect();
                self.compactors[level + 1].extend(promoted);
                self.size = self.compactors.iter().map(Vec::len).sum();
                return;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Estimated value at quantile `q` in [0, 1].
    pub fn quantile(&self, q: f64) -> Option<i64> {
        if self.n == 0 {
            return None;
        }
        let mut weighted: Vec<(i64, u64)> = Vec::with_capacity(self.size);
        for (level, items) in self.compactors.iter().enumerate() {
            let weight = 1u64 << level;
            weighted.extend(items.iter().map(|&v| (v, weight)));
        }
        weighted.sort_unstable_by_key(|(v, _)| *v);

        let total: u64 = weighted.iter().map(|(_, w)| *w).sum();
        let target = (q.clamp(0.0, 1.0) * total as f64).round() as u64;
        let mut cumulative = 0u64;
        for (value, weight) in &weighted {
            cumulative += weight;
            if cumulative >= target {
                return Some(*value);
            }
        }
        weighted.last().map(|(v, _)| *v)
    }

    /// Merges `other` into `self`.
    pub fn merge(&mut self, other: &KllSketch) {
        while self.compactors.len() < other.compactors.len() {
            self.compactors.push(Vec::new());
        }
        self.update_max_size();
        for (level, items) in other.compactors.iter().enumerate() {
            self.compactors[level].extend_from_slice(items);
        }
        self.n += other.n;
        self.size = self.compactors.iter().map(Vec::len).sum();
        while self.size >= self.max_size {
            let before = self.size;
            self.compress();
            if self.size == before {
                break;
            }
        }
    }

    /// Compact binary encoding: k, n, then per-level item lists.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.k as u32).to_le_bytes());
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&(self.compactors.len() as u32).to_le_bytes());
        for items in &self.compactors {
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                out.extend_from_slice(&item.to_le_bytes());
            }
        }
        out
    }

    /// Inverse of [`KllSketch::encode`]; None on malformed input.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        fn read_u32(bytes: &[u8], pos: &mut usize) -> Option<u32> {
            let out = u32::from_le_bytes(bytes.get(*pos..*pos + 4)?.try_into().ok()?);
            *pos += 4;
            Some(out)
        }
        fn read_u64(bytes: &[u8], pos: &mut usize) -> Option<u64> {
            let out = u64::from_le_bytes(bytes.get(*pos..*pos + 8)?.try_into().ok()?);
            *pos += 8;
            Some(out)
        }

        let mut pos = 0usize;
        let k = read_u32(bytes, &mut pos)? as usize;
        let n = read_u64(bytes, &mut pos)?;
        let levels = read_u32(bytes, &mut pos)? as usize;
        let mut compactors = Vec::with_capacity(levels);
        for _ in 0..levels {
            let len = read_u32(bytes, &mut pos)? as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(read_u64(bytes, &mut pos)? as i64);
            }
            compactors.push(items);
        }
        if compactors.is_empty() {
            compactors.push(Vec::new());
        }
        let mut sketch = Self {
            k,
            size: compactors.iter().map(Vec::len).sum(),
            compactors,
            max_size: 0,
            n,
        };
        sketch.update_max_size();
        Some(sketch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sketch() {
        let sketch = KllSketch::default();
        assert!(sketch.is_empty());
        assert_eq!(sketch.quantile(0.5), None);
    }

    #[test]
    fn test_exact_below_capacity() {
        let mut sketch = KllSketch::new(64);
        for v in 1..=50 {
            sketch.insert(v);
        }
        assert_eq!(sketch.count(), 50);
        // No compaction happened; quantiles are exact.
        assert_eq!(sketch.quantile(0.0), Some(1));
        assert_eq!(sketch.quantile(0.5), Some(25));
        assert_eq!(sketch.quantile(1.0), Some(50));
    }

    #[test]
    fn test_approximate_quantiles_large_stream() {
        let mut sketch = KllSketch::default();
        for v in 0..10_000 {
            sketch.insert(v);
        }
        assert_eq!(sketch.count(), 10_000);

        let median = sketch.quantile(0.5).expect("non-empty");
        // Rank error for k=200 stays well within 5%.
        assert!((4_500..=5_500).contains(&median), "median={median}");

        let p99 = sketch.quantile(0.99).expect("non-empty");
        assert!((9_700..=10_000).contains(&p99), "p99={p99}");
    }

    #[test]
    fn test_space_is_bounded() {
        let mut sketch = KllSketch::default();
        for v in 0..100_000 {
            sketch.insert(v);
        }
        let stored: usize = sketch.compactors.iter().map(Vec::len).sum();
        assert!(stored <= 3 * DEFAULT_K, "stored={stored}");
    }

    #[test]
    fn test_merge_combines_streams() {
        let mut a = KllSketch::default();
        let mut b = KllSketch::default();
        for v in 0..1_000 {
            a.insert(v);
        }
        for v in 1_000..2_000 {
            b.insert(v);
        }
        a.merge(&b);
        assert_eq!(a.count(), 2_000);
        let median = a.quantile(0.5).expect("non-empty");
        assert!((800..=1_200).contains(&median), "median={median}");
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut sketch = KllSketch::default();
        for v in 0..5_000 {
            sketch.insert(v * 3);
        }
        let decoded = KllSketch::decode(&sketch.encode()).expect("decodes");
        assert_eq!(decoded.count(), sketch.count());
        assert_eq!(decoded.quantile(0.5), sketch.quantile(0.5));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let mut sketch = KllSketch::default();
        sketch.insert(1);
        let bytes = sketch.encode();
        assert!(KllSketch::decode(&bytes[..bytes.len() - 1]).is_none());
    }
}
