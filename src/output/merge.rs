use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// An entry together with the index of the input it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged<T> {
    pub source: usize,
    pub entry: T,
}

struct Head<T> {
    timestamp: DateTime<Utc>,
    source: usize,
    entry: T,
}

// Reversed so the max-heap pops the earliest timestamp; ties go to the lower source index.
impl<T> Ord for Head<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl<T> PartialOrd for Head<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Head<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Head<T> {}

/// K-way merge of inputs that are each ordered by timestamp.
pub fn merge_sorted<T: Timestamped>(inputs: Vec<Vec<T>>) -> Vec<Tagged<T>> {
    let total = inputs.iter().map(Vec::len).sum();
    let mut iters: Vec<_> = inputs.into_iter().map(Vec::into_iter).collect();
    let mut heap = BinaryHeap::with_capacity(iters.len());

    for (source, iter) in iters.iter_mut().enumerate() {
        if let Some(entry) = iter.next() {
            heap.push(Head {
                timestamp: entry.timestamp(),
                source,
                entry,
            });
        }
    }

    let mut merged = Vec::with_capacity(total);
    while let Some(Head { source, entry, .. }) = heap.pop() {
        if let Some(next) = iters[source].next() {
            heap.push(Head {
                timestamp: next.timestamp(),
                source,
                entry: next,
            });
        }
        merged.push(Tagged { source, entry });
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry(i64);

    impl Timestamped for Entry {
        fn timestamp(&self) -> DateTime<Utc> {
            Utc.timestamp_opt(self.0, 0).unwrap()
        }
    }

    fn entries(times: &[i64]) -> Vec<Entry> {
        times.iter().copied().map(Entry).collect()
    }

    #[test]
    fn merges_in_timestamp_order_with_sources() {
        let merged = merge_sorted(vec![entries(&[1, 4, 9]), entries(&[2, 3]), entries(&[5])]);
        let order: Vec<(usize, i64)> = merged.iter().map(|t| (t.source, t.entry.0)).collect();
        assert_eq!(
            order,
            vec![(0, 1), (1, 2), (1, 3), (0, 4), (2, 5), (0, 9)]
        );
    }

    #[test]
    fn equal_timestamps_prefer_lower_source() {
        let merged = merge_sorted(vec![entries(&[7]), entries(&[7])]);
        assert_eq!(merged[0].source, 0);
        assert_eq!(merged[1].source, 1);
    }

    #[test]
    fn empty_inputs() {
        let merged: Vec<Tagged<Entry>> = merge_sorted(vec![Vec::new(), Vec::new()]);
        assert!(merged.is_empty());
    }
}
