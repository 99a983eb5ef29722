//! Sparse bucket accumulator for the displacement builder.

/// Key indices grouped under one level-0 slot.
pub(crate) struct Bucket {
    pub slot: u32,
    pub keys: Vec<u32>,
}

/// Accumulates key indices per level-0 slot, then yields the non-empty
/// buckets largest-first. Slot id breaks size ties so that construction is
/// reproducible run to run; dumps of the same corpus must match.
pub(crate) struct BucketSet {
    slots: Vec<Vec<u32>>,
}

impl BucketSet {
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: vec![Vec::new(); num_slots],
        }
    }

    #[inline]
    pub fn insert(&mut self, slot: usize, key_idx: u32) {
        self.slots[slot].push(key_idx);
    }

    pub fn into_ordered(self) -> Vec<Bucket> {
        let mut buckets: Vec<Bucket> = self
            .slots
            .into_iter()
            .enumerate()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(slot, keys)| Bucket {
                slot: slot as u32,
                keys,
            })
            .collect();
        buckets.sort_unstable_by(|a, b| {
            b.keys
                .len()
                .cmp(&a.keys.len())
                .then_with(|| a.slot.cmp(&b.slot))
        });
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_size_desc_then_slot() {
        let mut set = BucketSet::new(8);
        set.insert(5, 0);
        set.insert(2, 1);
        set.insert(2, 2);
        set.insert(7, 3);
        set.insert(7, 4);
        set.insert(1, 5);
        set.insert(1, 6);
        set.insert(1, 7);

        let ordered = set.into_ordered();
        let shape: Vec<(u32, usize)> = ordered.iter().map(|b| (b.slot, b.keys.len())).collect();
        assert_eq!(shape, vec![(1, 3), (2, 2), (7, 2), (5, 1)]);
    }

    #[test]
    fn skips_empty_slots() {
        let mut set = BucketSet::new(16);
        set.insert(3, 9);
        let ordered = set.into_ordered();
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].slot, 3);
        assert_eq!(ordered[0].keys, vec![9]);
    }

    #[test]
    fn preserves_insertion_order_within_bucket() {
        let mut set = BucketSet::new(4);
        set.insert(0, 2);
        set.insert(0, 0);
        set.insert(0, 1);
        let ordered = set.into_ordered();
        assert_eq!(ordered[0].keys, vec![2, 0, 1]);
    }
}
