//! Key decomposition for node pages and indirect page trees.
//!
//! A node key splits into a node-page key (`key >> E`) and an in-page offset.
//! Both the revision index and the node index are fixed-height radix trees of
//! indirect pages; walking one for key `K` takes, per level `i`,
//! `offset_i = K >> exponent[i]` and continues with `K - (offset_i << exponent[i])`.
//!
//! ```text
//! exponents = [14, 7, 0]   (fanout 128, height 3)
//! K = 20_000  ->  offsets [1, 28, 32]   since 1*16384 + 28*128 + 32 = 20_000
//! ```

use crate::error::{Error, Result};

/// Returns the key of the node page holding `node_key`.
#[inline]
pub fn node_page_key(node_key: u64, exponent: u8) -> u64 {
    node_key >> exponent
}

/// Returns the slot of `node_key` inside its node page.
#[inline]
pub fn node_page_offset(node_key: u64, exponent: u8) -> usize {
    (node_key - (node_page_key(node_key, exponent) << exponent)) as usize
}

/// Level layout of one indirect page tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectLevels {
    /// Shift amount per level, root level first, strictly descending to 0.
    exponents: Vec<u8>,
    /// References per indirect page, as a power of two.
    fanout_exponent: u8,
}

impl IndirectLevels {
    /// Creates the layout for a tree of `height` levels with `2^fanout_exponent`
    /// references per page.
    pub fn new(fanout_exponent: u8, height: u8) -> Self {
        let exponents = (0..height).rev().map(|level| level * fanout_exponent).collect();
        Self { exponents, fanout_exponent }
    }

    /// Shift amounts per level, root level first.
    pub fn exponents(&self) -> &[u8] {
        &self.exponents
    }

    /// Number of indirect levels between the root reference and a leaf reference.
    pub fn height(&self) -> usize {
        self.exponents.len()
    }

    /// References per indirect page.
    pub fn fanout(&self) -> usize {
        1 << self.fanout_exponent
    }

    /// Number of distinct keys the tree can address.
    pub fn capacity(&self) -> u64 {
        1u64 << (u32::from(self.fanout_exponent) * self.exponents.len() as u32)
    }

    /// Decomposes `key` into one slot offset per level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyOutOfRange`] if `key` does not fit the tree.
    pub fn offsets(&self, key: u64) -> Result<Vec<usize>> {
        if key >= self.capacity() {
            return Err(Error::KeyOutOfRange { key, capacity: self.capacity() });
        }
        let mut remaining = key;
        let mut offsets = Vec::with_capacity(self.exponents.len());
        for &exponent in &self.exponents {
            let offset = remaining >> exponent;
            remaining -= offset << exponent;
            offsets.push(offset as usize);
        }
        Ok(offsets)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_node_page_split() {
        assert_eq!(node_page_key(0, 7), 0);
        assert_eq!(node_page_offset(0, 7), 0);
        assert_eq!(node_page_key(127, 7), 0);
        assert_eq!(node_page_offset(127, 7), 127);
        assert_eq!(node_page_key(128, 7), 1);
        assert_eq!(node_page_offset(128, 7), 0);
        assert_eq!(node_page_key(1000, 7), 7);
        assert_eq!(node_page_offset(1000, 7), 104);
    }

    #[test]
    fn test_level_exponents() {
        let levels = IndirectLevels::new(7, 3);
        assert_eq!(levels.exponents(), &[14, 7, 0]);
        assert_eq!(levels.height(), 3);
        assert_eq!(levels.fanout(), 128);
        assert_eq!(levels.capacity(), 1 << 21);
    }

    #[test]
    fn test_offsets_worked_example() {
        let levels = IndirectLevels::new(7, 3);
        assert_eq!(levels.offsets(20_000).unwrap(), vec![1, 28, 32]);
        assert_eq!(levels.offsets(0).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_offsets_rejects_key_beyond_capacity() {
        let levels = IndirectLevels::new(2, 2);
        assert_eq!(levels.offsets(15).unwrap(), vec![3, 3]);
        let err = levels.offsets(16).unwrap_err();
        assert!(matches!(err, Error::KeyOutOfRange { key: 16, capacity: 16 }));
    }

    proptest! {
        #[test]
        fn prop_page_key_and_offset_recompose(key in any::<u64>(), exponent in 1u8..=16) {
            let offset = node_page_offset(key, exponent);
            prop_assert!(offset < (1usize << exponent));
            prop_assert_eq!((node_page_key(key, exponent) << exponent) + offset as u64, key);
        }

        #[test]
        fn prop_offsets_recompose(fanout in 1u8..=8, height in 1u8..=6, raw in any::<u64>()) {
            let levels = IndirectLevels::new(fanout, height);
            let key = raw % levels.capacity();
            let offsets = levels.offsets(key).unwrap();

            let mut rebuilt = 0u64;
            for (offset, exponent) in offsets.iter().zip(levels.exponents()) {
                prop_assert!(*offset < levels.fanout());
                rebuilt += (*offset as u64) << exponent;
            }
            prop_assert_eq!(rebuilt, key);
        }
    }
}
