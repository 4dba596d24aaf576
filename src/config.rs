/// How the referrer (reverse reference) index is built
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReverseIndexMode {
    /// Build the whole index at load time. O(edges) memory, O(1) lookups.
    Eager,
    /// Keep nothing; answer referrer queries by scanning `window` instances
    /// at a time.
    Lazy { window: usize },
}

#[derive(Clone, Debug)]
pub struct HeapConfig {
    pub reverse_index: ReverseIndexMode,
    /// Upper bound on dominator fixed-point passes, `None` runs to convergence
    pub max_dominator_iterations: Option<u32>,
    pub index_threads: usize,
    pub details_cache_capacity: usize,
    pub class_cache_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            reverse_index: ReverseIndexMode::Eager,
            max_dominator_iterations: None,
            index_threads: num_cpus::get(),
            details_cache_capacity: 64 * 1024,
            class_cache_capacity: 4096,
        }
    }
}

impl HeapConfig {
    const DEFAULT_WINDOW: usize = 4096;

    pub fn reverse_index(mut self, mode: ReverseIndexMode) -> Self {
        self.reverse_index = mode;
        self
    }

    pub fn max_dominator_iterations(mut self, cap: Option<u32>) -> Self {
        self.max_dominator_iterations = cap;
        self
    }

    pub fn index_threads(mut self, threads: usize) -> Self {
        self.index_threads = threads.max(1);
        self
    }

    pub fn details_cache_capacity(mut self, capacity: usize) -> Self {
        self.details_cache_capacity = capacity;
        self
    }

    pub fn class_cache_capacity(mut self, capacity: usize) -> Self {
        self.class_cache_capacity = capacity;
        self
    }

    /// Nodes scanned per step when referrers are found by scanning
    pub(crate) fn lazy_window(&self) -> usize {
        match self.reverse_index {
            ReverseIndexMode::Lazy { window } => window.max(1),
            ReverseIndexMode::Eager => Self::DEFAULT_WINDOW,
        }
    }
}
