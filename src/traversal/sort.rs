use super::TreeNode;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SortKey {
    /// Enumeration order
    #[default]
    Unsorted,
    Name,
    Count,
    ShallowSize,
    /// Needs converged retained sizes for the GC roots; unknown sizes sort as 0
    RetainedSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Sort {
    pub key: SortKey,
    pub descending: bool,
}

impl Sort {
    pub fn ascending(key: SortKey) -> Sort {
        Sort {
            key,
            descending: false,
        }
    }

    pub fn descending(key: SortKey) -> Sort {
        Sort {
            key,
            descending: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SortValue {
    Text(String),
    Number(u64),
}

/// A node and where it ranks. Smaller ranks come first on the page.
pub(crate) struct Ranked {
    pub(crate) value: SortValue,
    pub(crate) id: u64,
    /// Enumeration order, separates nodes with the same id
    pub(crate) seq: u64,
    pub(crate) descending: bool,
    pub(crate) node: TreeNode,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_value = if self.descending {
            other.value.cmp(&self.value)
        } else {
            self.value.cmp(&other.value)
        };
        by_value
            .then(self.id.cmp(&other.id))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// Keeps the `bound` best ranked nodes seen so far
pub(crate) struct TopN {
    bound: usize,
    heap: BinaryHeap<Ranked>,
}

impl TopN {
    pub(crate) fn new(bound: usize) -> Self {
        TopN {
            bound,
            heap: BinaryHeap::with_capacity(bound.min(1 << 16) + 1),
        }
    }

    pub(crate) fn push(&mut self, ranked: Ranked) {
        if self.bound == 0 {
            return;
        }
        if self.heap.len() == self.bound {
            // the max-heap top is the worst node kept
            match self.heap.peek() {
                Some(worst) if ranked < *worst => {
                    self.heap.pop();
                }
                _ => return,
            }
        }
        self.heap.push(ranked);
    }

    /// Best first
    pub(crate) fn into_sorted(self) -> Vec<TreeNode> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|r| r.node)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(value: u64, id: u64, descending: bool) -> Ranked {
        Ranked {
            value: SortValue::Number(value),
            id,
            seq: id,
            descending,
            node: TreeNode::Instance {
                id,
                class_name: String::new(),
                shallow_size: value,
            },
        }
    }

    fn ids(nodes: Vec<TreeNode>) -> Vec<u64> {
        nodes.iter().map(|n| n.id()).collect()
    }

    #[test]
    fn test_top_n_keeps_best() {
        let mut top = TopN::new(3);
        for (v, id) in [(5, 1), (1, 2), (9, 3), (1, 4), (7, 5)] {
            top.push(ranked(v, id, false));
        }
        assert_eq!(ids(top.into_sorted()), vec![2, 4, 1]);

        let mut top = TopN::new(2);
        for (v, id) in [(5, 1), (9, 2), (9, 3), (7, 4)] {
            top.push(ranked(v, id, true));
        }
        // equal sizes fall back to id order
        assert_eq!(ids(top.into_sorted()), vec![2, 3]);
    }

    #[test]
    fn test_zero_bound() {
        let mut top = TopN::new(0);
        top.push(ranked(1, 1, false));
        assert!(top.into_sorted().is_empty());
    }
}
