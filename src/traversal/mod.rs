//! Paged, cancellable tree expansion for browsing a dump.
//!
//! Every call produces at most one page of child nodes. Nodes are plain
//! owned values, so a page can be handed to another thread and a later call
//! can pick up with the next offset.

mod sort;

pub use sort::{Sort, SortKey};

use crate::dominator::{RetainedSizes, RootSet};
use crate::error::Result;
use crate::heapdump::{GcRoot, HeapDump, ThreadInfo};
use crate::model::{Direction, Instance, Reference, ReferenceKind};
use crate::util::progress::{CancelToken, ProgressSink, ProgressTracker};
use sort::{Ranked, SortValue, TopN};
use std::sync::Arc;
use std::time::Instant;

/// One row of the browsing tree
#[derive(Clone, Debug, PartialEq)]
pub enum TreeNode {
    Class {
        id: u64,
        name: String,
        instance_count: u64,
        /// Summed over the instances
        shallow_size: u64,
    },
    Instance {
        id: u64,
        class_name: String,
        shallow_size: u64,
    },
    /// An edge, seen from the instance it was expanded from. `target` is
    /// the other end.
    Reference {
        reference: Reference,
        direction: Direction,
        target: u64,
        class_name: String,
        shallow_size: u64,
    },
    GcRoot {
        root: GcRoot,
        class_name: String,
        shallow_size: u64,
    },
    Thread(ThreadInfo),
}

impl TreeNode {
    /// The class, instance or thread object the node stands for
    pub fn id(&self) -> u64 {
        match self {
            TreeNode::Class { id, .. } | TreeNode::Instance { id, .. } => *id,
            TreeNode::Reference { target, .. } => *target,
            TreeNode::GcRoot { root, .. } => root.object_id,
            TreeNode::Thread(t) => t.object_id,
        }
    }

    pub fn name(&self) -> String {
        match self {
            TreeNode::Class { name, .. } => name.clone(),
            TreeNode::Instance { id, class_name, .. } => format!("{}#{:#x}", class_name, id),
            TreeNode::Reference { reference, .. } => match &reference.kind {
                ReferenceKind::Field(name) => name.to_string(),
                ReferenceKind::Static(name) => format!("static {}", name),
                ReferenceKind::ArrayItem(i) => format!("[{}]", i),
            },
            TreeNode::GcRoot { root, .. } => root.kind.name().to_string(),
            TreeNode::Thread(t) => t
                .name
                .clone()
                .unwrap_or_else(|| format!("thread {}", t.serial)),
        }
    }

    pub fn shallow_size(&self) -> u64 {
        match self {
            TreeNode::Class { shallow_size, .. }
            | TreeNode::Instance { shallow_size, .. }
            | TreeNode::Reference { shallow_size, .. }
            | TreeNode::GcRoot { shallow_size, .. } => *shallow_size,
            TreeNode::Thread(_) => 0,
        }
    }

    /// Instances for a class, frames for a thread
    pub fn count(&self) -> u64 {
        match self {
            TreeNode::Class { instance_count, .. } => *instance_count,
            TreeNode::Thread(t) => t.frames.len() as u64,
            _ => 0,
        }
    }
}

/// Where a tree starts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeRoot {
    Classes,
    GcRoots,
    Threads,
    InstancesOf(u64),
}

pub type NodeFilter = Arc<dyn Fn(&TreeNode) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct PageRequest {
    /// Matching nodes to skip
    pub offset: usize,
    pub limit: usize,
    pub filter: Option<NodeFilter>,
    pub sort: Sort,
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest {
            offset: 0,
            limit: 1000,
            filter: None,
            sort: Sort::default(),
        }
    }
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        PageRequest {
            offset,
            limit,
            ..Default::default()
        }
    }

    pub fn filter(mut self, f: impl Fn(&TreeNode) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    fn accepts(&self, node: &TreeNode) -> bool {
        self.filter.as_ref().map_or(true, |f| f(node))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Page {
    pub nodes: Vec<TreeNode>,
    pub offset: usize,
    /// Candidate nodes looked at, filtered or not
    pub scanned: u64,
    /// `false` when cancelled; `nodes` then holds what was gathered so far
    pub complete: bool,
    /// More matching nodes exist past this page. Only meaningful when complete.
    pub has_more: bool,
}

/// Expands tree nodes one page at a time
#[derive(Clone)]
pub struct Executor {
    heap: HeapDump,
    retained: Option<RetainedSizes>,
}

impl Executor {
    /// Sorting by retained size uses whatever the dump already computed for
    /// its GC roots.
    pub fn new(heap: &HeapDump) -> Self {
        Executor {
            retained: heap.cached_retained_sizes(&RootSet::GcRoots),
            heap: heap.clone(),
        }
    }

    pub fn with_retained_sizes(mut self, sizes: RetainedSizes) -> Self {
        self.retained = Some(sizes);
        self
    }

    pub fn roots(
        &self,
        root: TreeRoot,
        request: &PageRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<Page> {
        let heap = &self.heap;
        match root {
            TreeRoot::Classes => {
                let classes = heap.classes().filter(|c| !c.is_synthetic() || c.instance_count() > 0);
                let nodes = classes.map(|c| {
                    Ok(TreeNode::Class {
                        id: c.id(),
                        name: c.name().to_string(),
                        instance_count: c.instance_count(),
                        shallow_size: c.total_shallow_size(),
                    })
                });
                self.page(nodes, heap.index().classes.len() as u64, request, sink, cancel)
            }
            TreeRoot::GcRoots => {
                let total = heap.index().roots.len() as u64;
                let nodes = heap.gc_roots().map(|r| self.root_node(r));
                self.page(nodes, total, request, sink, cancel)
            }
            TreeRoot::Threads => {
                let threads = heap.threads();
                let total = threads.len() as u64;
                self.page(threads.into_iter().map(|t| Ok(TreeNode::Thread(t))), total, request, sink, cancel)
            }
            TreeRoot::InstancesOf(class_id) => {
                let instances = heap.instances(class_id)?;
                let total = instances.len() as u64;
                let nodes = instances.map(|i| Ok(instance_node(&i)));
                self.page(nodes, total, request, sink, cancel)
            }
        }
    }

    /// Children of `node`. Classes expand to their instances and threads to
    /// the roots they hold. Everything else expands to its references in
    /// `direction`.
    pub fn children(
        &self,
        node: &TreeNode,
        direction: Direction,
        request: &PageRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<Page> {
        match node {
            TreeNode::Class { id, .. } => self.roots(TreeRoot::InstancesOf(*id), request, sink, cancel),
            TreeNode::Thread(t) => {
                let roots = self.heap.thread_local_roots(t.serial);
                let total = roots.len() as u64;
                let nodes = roots.into_iter().map(|r| self.root_node(r));
                self.page(nodes, total, request, sink, cancel)
            }
            _ => {
                let instance = self.heap.instance(node.id())?;
                let references = instance.references(direction);
                let nodes = references.map(|r| self.reference_node(r?, direction));
                self.page(nodes, 0, request, sink, cancel)
            }
        }
    }

    fn root_node(&self, root: GcRoot) -> Result<TreeNode> {
        let target = self.heap.instance(root.object_id)?;
        Ok(TreeNode::GcRoot {
            root,
            class_name: target.class().name().to_string(),
            shallow_size: target.shallow_size(),
        })
    }

    fn reference_node(&self, reference: Reference, direction: Direction) -> Result<TreeNode> {
        let target = self.heap.instance(reference.other(direction))?;
        Ok(TreeNode::Reference {
            target: target.id(),
            class_name: target.class().name().to_string(),
            shallow_size: target.shallow_size(),
            reference,
            direction,
        })
    }

    fn retained_size(&self, node: &TreeNode) -> u64 {
        let sizes = match &self.retained {
            Some(s) => s,
            None => return 0,
        };
        match node {
            TreeNode::Class { id, .. } => match self.heap.instances(*id) {
                Ok(instances) => instances
                    .filter_map(|i| sizes.retained_of_node(i.node()))
                    .sum(),
                Err(_) => 0,
            },
            TreeNode::Thread(t) => sizes.retained_size(t.object_id).ok().flatten().unwrap_or(0),
            _ => sizes.retained_size(node.id()).ok().flatten().unwrap_or(0),
        }
    }

    fn sort_value(&self, key: SortKey, node: &TreeNode) -> SortValue {
        match key {
            SortKey::Unsorted => SortValue::Number(0),
            SortKey::Name => SortValue::Text(node.name()),
            SortKey::Count => SortValue::Number(node.count()),
            SortKey::ShallowSize => SortValue::Number(node.shallow_size()),
            SortKey::RetainedSize => SortValue::Number(self.retained_size(node)),
        }
    }

    /// Filter, order and cut one page out of `nodes`. `total` is only used
    /// for progress and may be 0 when unknown.
    fn page<I>(
        &self,
        nodes: I,
        total: u64,
        request: &PageRequest,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<Page>
    where
        I: Iterator<Item = Result<TreeNode>>,
    {
        let start = Instant::now();
        let mut progress = ProgressTracker::new(sink, total);
        let mut page = Page {
            nodes: vec![],
            offset: request.offset,
            scanned: 0,
            complete: true,
            has_more: false,
        };
        let wanted = request.offset.saturating_add(request.limit);
        let mut matched = 0usize;

        if request.sort.key == SortKey::Unsorted {
            for node in nodes {
                if cancel.is_cancelled() {
                    page.complete = false;
                    break;
                }
                let node = node?;
                page.scanned += 1;
                progress.advance(1);
                if !request.accepts(&node) {
                    continue;
                }
                matched += 1;
                if matched > wanted {
                    page.has_more = true;
                    break;
                }
                if matched > request.offset {
                    page.nodes.push(node);
                }
            }
        } else {
            let mut top = TopN::new(wanted);
            for (seq, node) in nodes.enumerate() {
                if cancel.is_cancelled() {
                    page.complete = false;
                    break;
                }
                let node = node?;
                page.scanned += 1;
                progress.advance(1);
                if !request.accepts(&node) {
                    continue;
                }
                matched += 1;
                top.push(Ranked {
                    value: self.sort_value(request.sort.key, &node),
                    id: node.id(),
                    seq: seq as u64,
                    descending: request.sort.descending,
                    node,
                });
            }
            page.has_more = matched > wanted;
            page.nodes = top.into_sorted().into_iter().skip(request.offset).collect();
        }
        progress.finish();
        if !page.complete {
            debug!("Page at {} cancelled after {} nodes", request.offset, page.scanned);
        }
        trace!(
            "Produced {} of {} scanned nodes in {} ms",
            page.nodes.len(),
            page.scanned,
            start.elapsed().as_micros() as f64 / 1000f64
        );
        Ok(page)
    }
}

fn instance_node(instance: &Instance) -> TreeNode {
    TreeNode::Instance {
        id: instance.id(),
        class_name: instance.class().name().to_string(),
        shallow_size: instance.shallow_size(),
    }
}
