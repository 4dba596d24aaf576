use super::{HeapIndex, NodeIdx};
use crate::error::Result;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Compressed rows of node numbers: row `i` is `items[starts[i]..starts[i + 1]]`
#[derive(Default, Debug)]
pub(crate) struct Csr {
    starts: Vec<u64>,
    items: Vec<u32>,
}

impl Csr {
    /// Build from per-row counts and a second pass that emits `(row, item)`
    /// in the order items should appear within each row
    pub(crate) fn from_counts<F>(counts: &[u64], fill: F) -> Csr
    where
        F: FnOnce(&mut dyn FnMut(usize, u32)),
    {
        let mut starts = Vec::with_capacity(counts.len() + 1);
        let mut total = 0u64;
        starts.push(0);
        for c in counts {
            total += c;
            starts.push(total);
        }
        let mut items = vec![0u32; total as usize];
        let mut cursors: Vec<u64> = starts[..counts.len()].to_vec();
        fill(&mut |row, item| {
            items[cursors[row] as usize] = item;
            cursors[row] += 1;
        });
        Csr { starts, items }
    }

    #[cfg(test)]
    pub(crate) fn rows(&self) -> usize {
        self.starts.len().saturating_sub(1)
    }

    pub(crate) fn get(&self, row: usize) -> &[u32] {
        &self.items[self.starts[row] as usize..self.starts[row + 1] as usize]
    }

    pub(crate) fn total(&self) -> usize {
        self.items.len()
    }
}

fn chunks(n: usize, threads: usize) -> Vec<Range<usize>> {
    let threads = threads.max(1);
    let size = n.div_ceil(threads).max(1);
    (0..n).step_by(size).map(|s| s..(s + size).min(n)).collect()
}

/// Run `f` over disjoint chunks of `0..n` on scoped worker threads
fn par_chunks<F>(n: usize, threads: usize, f: F) -> Result<()>
where
    F: Fn(Range<usize>) -> Result<()> + Sync,
{
    let ranges = chunks(n, threads);
    let f = &f;
    crossbeam::scope(|s| {
        let handles: Vec<_> = ranges
            .into_iter()
            .map(|r| s.spawn(move |_| f(r)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect::<Result<()>>()
    })
    .unwrap_or_else(|e| std::panic::resume_unwind(e))
}

/// Build the full referrer index: node → sorted, unique referrers.
///
/// The dump only records forward edges, so this is a second pass over
/// every node after the node table is complete.
pub(crate) fn build_reverse(index: &HeapIndex, data: &[u8], threads: usize) -> Result<Csr> {
    let n = index.node_count();
    let counts: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(0)).collect();
    par_chunks(n, threads, |range| {
        for node in range {
            index.for_each_edge(data, node as NodeIdx, |t, _| {
                counts[t as usize].fetch_add(1, Ordering::Relaxed);
            })?;
        }
        Ok(())
    })?;

    let mut starts = Vec::with_capacity(n + 1);
    let mut total = 0u64;
    starts.push(0);
    for c in &counts {
        total += c.load(Ordering::Relaxed);
        starts.push(total);
    }
    let cursors: Vec<AtomicU64> = starts[..n].iter().map(|s| AtomicU64::new(*s)).collect();
    let slots: Vec<AtomicU32> = (0..total).map(|_| AtomicU32::new(0)).collect();
    par_chunks(n, threads, |range| {
        for node in range {
            index.for_each_edge(data, node as NodeIdx, |t, _| {
                let at = cursors[t as usize].fetch_add(1, Ordering::Relaxed);
                slots[at as usize].store(node as u32, Ordering::Relaxed);
            })?;
        }
        Ok(())
    })?;
    let mut raw: Vec<u32> = slots.into_iter().map(AtomicU32::into_inner).collect();

    // Fill order depends on thread timing, sort rows and drop duplicate
    // referrers (an object pointing at the same target from several slots)
    let mut items = Vec::with_capacity(raw.len());
    let mut compact_starts = Vec::with_capacity(n + 1);
    compact_starts.push(0u64);
    for row in 0..n {
        let slice = &mut raw[starts[row] as usize..starts[row + 1] as usize];
        slice.sort_unstable();
        let mut last = None;
        for r in slice.iter() {
            if last != Some(*r) {
                items.push(*r);
                last = Some(*r);
            }
        }
        compact_starts.push(items.len() as u64);
    }
    debug!(
        "Reverse index holds {} referrers for {} edges",
        items.len(),
        total
    );
    Ok(Csr {
        starts: compact_starts,
        items,
    })
}

/// Referrers of one node found by scanning the node table window by window
pub(crate) struct LazyReferrers<'h> {
    index: &'h HeapIndex,
    data: &'h [u8],
    target: NodeIdx,
    next: usize,
    window: usize,
    found: VecDeque<NodeIdx>,
}

impl<'h> LazyReferrers<'h> {
    pub(crate) fn new(index: &'h HeapIndex, data: &'h [u8], target: NodeIdx, window: usize) -> Self {
        LazyReferrers {
            index,
            data,
            target,
            next: 0,
            window: window.max(1),
            found: VecDeque::new(),
        }
    }
}

impl<'h> Iterator for LazyReferrers<'h> {
    type Item = Result<NodeIdx>;

    fn next(&mut self) -> Option<Result<NodeIdx>> {
        loop {
            if let Some(n) = self.found.pop_front() {
                return Some(Ok(n));
            }
            let n = self.index.node_count();
            if self.next >= n {
                return None;
            }
            let end = (self.next + self.window).min(n);
            for node in self.next..end {
                let mut hit = false;
                let target = self.target;
                if let Err(e) = self
                    .index
                    .for_each_edge(self.data, node as NodeIdx, |t, _| hit |= t == target)
                {
                    self.next = n;
                    return Some(Err(e));
                }
                if hit {
                    self.found.push_back(node as NodeIdx);
                }
            }
            self.next = end;
        }
    }
}
