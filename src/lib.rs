//! Load HPROF heap dumps and answer queries over the object graph:
//! classes, instances, references in both directions, GC roots, threads,
//! retained sizes, and paged tree expansion for browsers.

#[macro_use]
extern crate log;

mod cache;
mod config;
mod dominator;
mod error;
mod heapdump;
pub mod hprof;
mod index;
mod model;
mod sanity;
mod traversal;
mod util;

pub use crate::cache::{
    Cache, CacheBuilder, MemoryPressure, NoPersistence, Persistor, Strength,
};
pub use crate::config::{HeapConfig, ReverseIndexMode};
pub use crate::dominator::{RetainedSizeJob, RetainedSizeRecord, RetainedSizes, RootSet};
pub use crate::error::{Corruption, HeapError, Result};
pub use crate::heapdump::{load_heap, ByteSource, GcRoot, HeapDump, ThreadInfo};
pub use crate::hprof::{java_class_name, BasicType, DumpReader, HeapRecord, Record, RootKind, Value};
pub use crate::index::{FieldDescriptor, NodeKind, StackFrame};
pub use crate::model::{
    ArrayItem, ClassInfo, Direction, FieldValue, Instance, Instances, Reference, ReferenceKind,
    References,
};
pub use crate::sanity::sanity_trace;
pub use crate::traversal::{
    Executor, NodeFilter, Page, PageRequest, Sort, SortKey, TreeNode, TreeRoot,
};
pub use crate::util::progress::{CancelToken, NoProgress, ProgressSink};
