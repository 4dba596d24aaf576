//! Single-flight retained size computations.
//!
//! At most one computation runs per dump and root set. Later requesters
//! attach to the running one, receive its progress and share its result.
//! The computation stops only once every attached requester has cancelled.

use super::{compute, DominatorTree, RetainedSizes, RootSet};
use crate::cache::Strength;
use crate::error::{HeapError, Result};
use crate::heapdump::HeapDump;
use crate::index::NodeIdx;
use crate::sanity::sanity_trace;
use crate::util::progress::{CancelToken, ProgressSink};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// How often a blocked waiter looks at its own cancel token
const CANCEL_POLL: Duration = Duration::from_millis(50);

type Outcome = std::result::Result<Arc<DominatorTree>, HeapError>;

struct Requester {
    id: usize,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelToken,
    detached: bool,
}

struct FlightState {
    progress: (u64, u64, bool),
    outcome: Option<Outcome>,
    requesters: Vec<Requester>,
    /// Every requester cancelled; new requesters must start over
    abandoned: bool,
}

/// One running (or finished) computation and everyone waiting on it
pub(crate) struct Flight {
    /// Sweep limit of the running computation
    max_iterations: Option<u32>,
    state: Mutex<FlightState>,
    changed: Condvar,
}

impl Flight {
    fn new(max_iterations: Option<u32>, outcome: Option<Outcome>) -> Flight {
        Flight {
            max_iterations,
            state: Mutex::new(FlightState {
                progress: (0, 0, false),
                outcome,
                requesters: vec![],
                abandoned: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// A requester may share this run when the run gives up no earlier
    /// than the requester would
    fn serves(&self, max_iterations: Option<u32>) -> bool {
        match (self.max_iterations, max_iterations) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(run), Some(wanted)) => run >= wanted,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlightState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Join this flight, or `None` if it is winding down after cancellation.
    ///
    /// Returns the requester id and the progress so far. The caller reports
    /// that progress to its sink once it holds no locks.
    fn attach(
        &self,
        sink: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Option<(usize, (u64, u64, bool))> {
        let mut state = self.lock();
        if state.abandoned {
            return None;
        }
        let id = state.requesters.len();
        state.requesters.push(Requester {
            id,
            sink,
            cancel,
            detached: false,
        });
        Some((id, state.progress))
    }

    fn detach(&self, requester: usize) {
        let mut state = self.lock();
        if let Some(r) = state.requesters.iter_mut().find(|r| r.id == requester) {
            r.detached = true;
        }
    }

    /// True once every requester has cancelled. Seals the flight so no
    /// one else attaches to a computation that is about to stop.
    fn all_cancelled(&self) -> bool {
        let mut state = self.lock();
        if state.abandoned {
            return true;
        }
        let all = state
            .requesters
            .iter()
            .all(|r| r.detached || r.cancel.is_cancelled());
        if all {
            debug!("Every requester cancelled, stopping retained size computation");
            state.abandoned = true;
        }
        all
    }

    fn finish(&self, outcome: Outcome) {
        let mut state = self.lock();
        if outcome.is_ok() {
            state.progress.2 = true;
        }
        state.outcome = Some(outcome);
        self.changed.notify_all();
    }
}

/// Forwards progress to every attached requester
struct Broadcast<'a>(&'a Flight);

impl ProgressSink for Broadcast<'_> {
    fn on_progress(&self, current: u64, total: u64, finished: bool) {
        let sinks: Vec<Arc<dyn ProgressSink>> = {
            let mut state = self.0.lock();
            state.progress = (current, total, finished);
            state
                .requesters
                .iter()
                .filter(|r| !r.detached && !r.cancel.is_cancelled())
                .map(|r| r.sink.clone())
                .collect()
        };
        for sink in sinks {
            sink.on_progress(current, total, finished);
        }
    }
}

/// Handle on a retained size computation, possibly shared with other
/// requesters
pub struct RetainedSizeJob {
    heap: HeapDump,
    flight: Arc<Flight>,
    requester: usize,
    cancel: CancelToken,
}

impl RetainedSizeJob {
    fn outcome(&self, state: &FlightState) -> Option<Result<RetainedSizes>> {
        state.outcome.as_ref().map(|o| match o {
            Ok(tree) => Ok(RetainedSizes::new(self.heap.clone(), tree.clone())),
            Err(e) => Err(e.replicate()),
        })
    }

    /// Block until the computation finishes or this requester cancels.
    ///
    /// A result that was complete before the cancellation was noticed is
    /// still returned.
    pub fn wait(self) -> Result<RetainedSizes> {
        let mut state = self.flight.lock();
        loop {
            if let Some(outcome) = self.outcome(&state) {
                return outcome;
            }
            if self.cancel.is_cancelled() {
                drop(state);
                self.flight.detach(self.requester);
                return Err(HeapError::Cancelled);
            }
            state = match self.flight.changed.wait_timeout(state, CANCEL_POLL) {
                Ok((guard, _)) => guard,
                Err(p) => p.into_inner().0,
            };
        }
    }

    /// The result, if the computation is already over
    pub fn try_result(&self) -> Option<Result<RetainedSizes>> {
        let state = self.flight.lock();
        self.outcome(&state)
    }

    pub fn is_finished(&self) -> bool {
        self.flight.lock().outcome.is_some()
    }

    /// Last reported `(current, total, finished)`
    pub fn progress(&self) -> (u64, u64, bool) {
        self.flight.lock().progress
    }

    /// Stop waiting. The shared computation continues while any other
    /// requester still wants it.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.flight.changed.notify_all();
    }
}

/// Attach to the running computation for `roots`, or start one
pub(crate) fn start(
    heap: &HeapDump,
    roots: RootSet,
    max_iterations: Option<u32>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelToken,
) -> Result<RetainedSizeJob> {
    let nodes = roots.resolve(heap)?;
    // The worker publishes before it leaves the map, so under the map lock
    // a run is either still listed or already cached
    let mut flights = heap.inner.flights.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(tree) = heap.inner.retained.peek(&roots) {
        drop(flights);
        let n = tree.reachable as u64;
        sink.on_progress(n, n, true);
        return Ok(RetainedSizeJob {
            heap: heap.clone(),
            flight: Arc::new(Flight::new(None, Some(Ok(tree)))),
            requester: 0,
            cancel,
        });
    }

    // One listed run per root set. A run with a tighter limit than this
    // requester's is left to finish alone and replaced in the map.
    if let Some(flight) = flights
        .get(&roots)
        .filter(|f| f.serves(max_iterations))
        .cloned()
    {
        if let Some((requester, (current, total, finished))) =
            flight.attach(sink.clone(), cancel.clone())
        {
            drop(flights);
            debug!("Attached to running retained size computation");
            sink.on_progress(current, total, finished);
            return Ok(RetainedSizeJob {
                heap: heap.clone(),
                flight,
                requester,
                cancel,
            });
        }
    }

    let flight = Arc::new(Flight::new(max_iterations, None));
    let (requester, _) = flight
        .attach(sink.clone(), cancel.clone())
        .unwrap_or((0, (0, 0, false)));
    flights.insert(roots.clone(), flight.clone());
    drop(flights);
    sink.on_progress(0, 0, false);

    let worker_heap = heap.clone();
    let worker_flight = flight.clone();
    let spawned = std::thread::Builder::new()
        .name("retained-sizes".to_string())
        .spawn(move || run(worker_heap, roots, nodes, worker_flight));
    if let Err(e) = spawned {
        let mut flights = heap.inner.flights.lock().unwrap_or_else(|p| p.into_inner());
        flights.retain(|_, f| !Arc::ptr_eq(f, &flight));
        return Err(HeapError::Io(e));
    }
    Ok(RetainedSizeJob {
        heap: heap.clone(),
        flight,
        requester,
        cancel,
    })
}

fn run(heap: HeapDump, key: RootSet, roots: Vec<NodeIdx>, flight: Arc<Flight>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        compute(
            heap.index(),
            heap.data(),
            &roots,
            flight.max_iterations,
            &Broadcast(&flight),
            &|| flight.all_cancelled(),
        )
    }))
    .unwrap_or_else(|_| {
        error!("Retained size computation panicked");
        Err(HeapError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "retained size computation panicked",
        )))
    })
    .map(Arc::new);

    match &outcome {
        Ok(tree) => {
            if cfg!(debug_assertions) && log_enabled!(log::Level::Debug) {
                let ids: Vec<u64> = roots.iter().map(|n| heap.index().nodes.ids[*n as usize]).collect();
                if let Ok(marked) = sanity_trace(&heap, &ids) {
                    debug!(
                        "Sanity trace marked {} objects, dominator tree holds {}",
                        marked, tree.reachable
                    );
                }
            }
            // Published whole, before anyone can see the flight finish
            heap.inner
                .retained
                .put(key.clone(), tree.clone(), Strength::Strong);
        }
        Err(HeapError::Cancelled) => debug!("Retained size computation cancelled"),
        Err(e) => warn!("Retained size computation failed: {}", e),
    }

    {
        let mut flights = heap.inner.flights.lock().unwrap_or_else(|p| p.into_inner());
        if flights.get(&key).map_or(false, |f| Arc::ptr_eq(f, &flight)) {
            flights.remove(&key);
        }
    }
    flight.finish(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hprof::writer::TestHeap;
    use crate::hprof::{BasicType, Value};
    use crate::util::progress::NoProgress;
    use crate::{load_heap, ByteSource, HeapConfig};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;

    /// A long chain so the computation takes a while
    fn chain(len: u64) -> HeapDump {
        let mut h = TestHeap::new();
        h.class(0x20, "c/Link", TestHeap::OBJECT, &[("next", BasicType::Object)]);
        for i in 0..len {
            let next = if i + 1 < len { 0x1000 + i + 1 } else { 0 };
            h.object(0x1000 + i, 0x20, &[Value::Object(next)]);
        }
        h.root(0x1000);
        load_heap(ByteSource::Bytes(h.bytes()), HeapConfig::default()).unwrap()
    }

    #[test]
    fn test_concurrent_requesters_share_one_run() {
        let _ = env_logger::builder().is_test(true).try_init();
        let heap = chain(20_000);
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let job = heap
                        .retained_sizes(RootSet::GcRoots, Arc::new(NoProgress), CancelToken::new())
                        .unwrap();
                    job.wait().unwrap()
                })
            })
            .collect();
        let results: Vec<RetainedSizes> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results {
            assert_eq!(r.retained_size(0x1000).unwrap(), Some(20_000 * 24));
            assert_eq!(r.reachable_count(), 20_000);
        }
        // Late requesters get the published result without a new run
        let progress = Arc::new(AtomicU64::new(0));
        let seen = progress.clone();
        let sink = move |c: u64, _t: u64, f: bool| {
            if f {
                seen.store(c, Ordering::SeqCst)
            }
        };
        let job = heap
            .retained_sizes(RootSet::GcRoots, Arc::new(sink), CancelToken::new())
            .unwrap();
        assert!(job.is_finished());
        assert_eq!(progress.load(Ordering::SeqCst), 20_000);
    }

    #[test]
    fn test_cancel_publishes_nothing() {
        let heap = chain(50_000);
        let cancel = CancelToken::new();
        cancel.cancel();
        let job = heap
            .retained_sizes(RootSet::GcRoots, Arc::new(NoProgress), cancel)
            .unwrap();
        match job.wait() {
            Err(HeapError::Cancelled) => {
                // Wait for the worker to notice and wind down
                for _ in 0..200 {
                    if heap.inner.flights.lock().unwrap().is_empty() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                assert!(heap.cached_retained_sizes(&RootSet::GcRoots).is_none());
            }
            Ok(sizes) => assert_eq!(sizes.reachable_count(), 50_000),
            Err(e) => panic!("unexpected {}", e),
        }
    }

    #[test]
    fn test_one_cancelling_requester_does_not_stop_others() {
        let heap = chain(30_000);
        let quitter = CancelToken::new();
        let first = heap
            .retained_sizes(RootSet::GcRoots, Arc::new(NoProgress), quitter.clone())
            .unwrap();
        let second = heap
            .retained_sizes(RootSet::GcRoots, Arc::new(NoProgress), CancelToken::new())
            .unwrap();
        first.cancel();
        let sizes = second.wait().unwrap();
        assert_eq!(sizes.retained_size(0x1000).unwrap(), Some(30_000 * 24));
        assert!(heap.cached_retained_sizes(&RootSet::GcRoots).is_some());
    }

    #[test]
    fn test_not_converged_is_reported_and_not_cached() {
        let heap = chain(10);
        let job = heap
            .retained_sizes_capped(
                RootSet::GcRoots,
                Some(1),
                Arc::new(NoProgress),
                CancelToken::new(),
            )
            .unwrap();
        assert!(matches!(
            job.wait(),
            Err(HeapError::NotConverged { iterations: 1 })
        ));
        assert!(heap.cached_retained_sizes(&RootSet::GcRoots).is_none());
    }

    #[test]
    fn test_capped_requester_shares_unlimited_run() {
        let heap = chain(30_000);
        let unlimited = heap
            .retained_sizes(RootSet::GcRoots, Arc::new(NoProgress), CancelToken::new())
            .unwrap();
        // A chain needs a second, confirming sweep, so a run of its own with
        // this limit could not converge
        let capped = heap
            .retained_sizes_capped(
                RootSet::GcRoots,
                Some(1),
                Arc::new(NoProgress),
                CancelToken::new(),
            )
            .unwrap();
        let sizes = capped.wait().unwrap();
        assert_eq!(sizes.retained_size(0x1000).unwrap(), Some(30_000 * 24));
        assert_eq!(unlimited.wait().unwrap().reachable_count(), 30_000);
    }

    #[test]
    fn test_unlimited_requester_does_not_join_capped_run() {
        let heap = chain(30_000);
        let capped = heap
            .retained_sizes_capped(
                RootSet::GcRoots,
                Some(1),
                Arc::new(NoProgress),
                CancelToken::new(),
            )
            .unwrap();
        let unlimited = heap
            .retained_sizes(RootSet::GcRoots, Arc::new(NoProgress), CancelToken::new())
            .unwrap();
        assert!(matches!(
            capped.wait(),
            Err(HeapError::NotConverged { iterations: 1 })
        ));
        assert_eq!(unlimited.wait().unwrap().reachable_count(), 30_000);
        assert!(heap.cached_retained_sizes(&RootSet::GcRoots).is_some());
    }

    #[test]
    fn test_progress_sink_may_request_again() {
        let heap = chain(1000);
        let nested: Arc<Mutex<Option<RetainedSizeJob>>> = Arc::new(Mutex::new(None));
        let slot = nested.clone();
        let again = heap.clone();
        let sink = move |_c: u64, _t: u64, _f: bool| {
            let mut slot = slot.lock().unwrap();
            if slot.is_none() {
                let job = again
                    .retained_sizes(RootSet::GcRoots, Arc::new(NoProgress), CancelToken::new())
                    .unwrap();
                *slot = Some(job);
            }
        };
        let job = heap
            .retained_sizes(RootSet::GcRoots, Arc::new(sink), CancelToken::new())
            .unwrap();
        let first = job.wait().unwrap();
        let inner = nested.lock().unwrap().take().unwrap();
        assert_eq!(inner.wait().unwrap().reachable_count(), first.reachable_count());
    }
}
