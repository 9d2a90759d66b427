//! Binary min-heap of cache records ordered by access frequency.
//!
//! The sift operations follow the classic array-backed layout: the parent of
//! slot `i` is `(i - 1) / 2`, its children are `2i + 1` and `2i + 2`. Only a
//! strictly smaller frequency moves a record, so ties keep whatever relative
//! position the insert/remove history produced. That order is deterministic
//! for a given operation sequence but otherwise unspecified.

/// One live record in the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Record {
    pub(crate) key: String,
    pub(crate) size: usize,
    pub(crate) frequency: u64,
}

#[derive(Debug, Default)]
pub(crate) struct FrequencyHeap {
    records: Vec<Record>,
}

impl FrequencyHeap {
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn push(&mut self, record: Record) {
        self.records.push(record);
        self.up(self.records.len() - 1);
    }

    /// Removes and returns the record with the lowest frequency.
    pub(crate) fn pop(&mut self) -> Option<Record> {
        let last = self.records.len().checked_sub(1)?;
        self.records.swap(0, last);
        self.down(0, last);
        self.records.pop()
    }

    /// Removes the record at slot `i`.
    pub(crate) fn remove(&mut self, i: usize) -> Option<Record> {
        let last = self.records.len().checked_sub(1)?;
        if i > last {
            return None;
        }
        if i != last {
            self.records.swap(i, last);
            if !self.down(i, last) {
                self.up(i);
            }
        }
        self.records.pop()
    }

    /// Slot of the first record for `key`, scanning in array order.
    pub(crate) fn position(&self, key: &str) -> Option<usize> {
        self.records.iter().position(|r| r.key == key)
    }

    /// Bumps the frequency of the first record for `key` and restores order.
    ///
    /// Linear in the number of records to find the slot, logarithmic to fix it.
    pub(crate) fn increment(&mut self, key: &str) -> bool {
        let Some(i) = self.position(key) else {
            return false;
        };
        self.records[i].frequency += 1;
        self.fix(i);
        true
    }

    #[cfg(test)]
    pub(crate) fn records(&self) -> &[Record] {
        &self.records
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.records[i].frequency < self.records[j].frequency
    }

    fn fix(&mut self, i: usize) {
        let n = self.records.len();
        if !self.down(i, n) {
            self.up(i);
        }
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let i = (j - 1) / 2;
            if !self.less(j, i) {
                break;
            }
            self.records.swap(i, j);
            j = i;
        }
    }

    // Sifts slot `i0` down within the first `n` slots; returns whether it moved.
    fn down(&mut self, i0: usize, n: usize) -> bool {
        let mut i = i0;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut j = left;
            let right = left + 1;
            if right < n && self.less(right, left) {
                j = right;
            }
            if !self.less(j, i) {
                break;
            }
            self.records.swap(i, j);
            i = j;
        }
        i > i0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, frequency: u64) -> Record {
        Record {
            key: key.to_string(),
            size: 1,
            frequency,
        }
    }

    fn assert_heap_order(heap: &FrequencyHeap) {
        let r = heap.records();
        for child in 1..r.len() {
            let parent = (child - 1) / 2;
            assert!(
                r[parent].frequency <= r[child].frequency,
                "slot {parent} ({}) > slot {child} ({})",
                r[parent].frequency,
                r[child].frequency
            );
        }
    }

    #[test]
    fn pops_in_ascending_frequency() {
        let mut heap = FrequencyHeap::default();
        for (key, freq) in [("a", 5), ("b", 1), ("c", 3), ("d", 0), ("e", 4)] {
            heap.push(record(key, freq));
            assert_heap_order(&heap);
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).map(|r| r.key).collect();
        assert_eq!(order, vec!["d", "b", "c", "e", "a"]);
        assert_eq!(heap.len(), 0);
    }

    #[test]
    fn pop_empty() {
        let mut heap = FrequencyHeap::default();
        assert!(heap.pop().is_none());
        assert!(heap.remove(0).is_none());
    }

    #[test]
    fn ties_pop_insertion_order_for_equal_frequencies() {
        let mut heap = FrequencyHeap::default();
        heap.push(record("first", 0));
        heap.push(record("second", 0));
        assert_eq!(heap.pop().unwrap().key, "first");
        assert_eq!(heap.pop().unwrap().key, "second");
    }

    #[test]
    fn increment_reorders() {
        let mut heap = FrequencyHeap::default();
        heap.push(record("a", 0));
        heap.push(record("b", 0));
        heap.push(record("c", 0));
        assert!(heap.increment("a"));
        assert!(heap.increment("a"));
        assert!(heap.increment("b"));
        assert!(!heap.increment("missing"));
        assert_heap_order(&heap);
        assert_eq!(heap.pop().unwrap().key, "c");
        assert_eq!(heap.pop().unwrap().key, "b");
        assert_eq!(heap.pop().unwrap().key, "a");
    }

    #[test]
    fn remove_keeps_order() {
        let mut heap = FrequencyHeap::default();
        for (i, key) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
            heap.push(record(key, i as u64));
        }
        let slot = heap.position("b").unwrap();
        assert_eq!(heap.remove(slot).unwrap().key, "b");
        assert_eq!(heap.len(), 5);
        assert_heap_order(&heap);
        assert!(heap.position("b").is_none());
    }
}
