//! The per-period stage machine and its worker pool.
//!
//! A period runs eight real stages in fixed order: the four inter-period
//! stages, then the intra-period loop (initialize, reset, optimize,
//! reoptimize, repeated while any reoptimizer requests a redo), then apply
//! and finish.  Within a stage, subscribed members are grouped into priority
//! buckets and each bucket is dispatched as one parallel batch: workers pull
//! members off a shared cursor and invoke the stage hook.  Buckets are
//! barriers: the master waits for every worker to rejoin, then applies any
//! deferred spawn/remove requests, then moves on.
//!
//! With `max_threads == 0` the pool is bypassed entirely: buckets run inline
//! on the calling thread and member locks are fake.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::id::MemberId;
use crate::member::MemberHandle;
use crate::sim::Simulation;

// ============================================================================
// Stages, priorities, subscriptions
// ============================================================================

/// The ten stages of a period, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    InterBegin,
    InterOptimize,
    InterApply,
    InterAdvance,
    IntraInitialize,
    IntraReset,
    IntraOptimize,
    IntraReoptimize,
    IntraApply,
    IntraFinish,
}

impl Stage {
    /// All stages, in period order.
    pub const ALL: [Stage; 10] = [
        Stage::InterBegin,
        Stage::InterOptimize,
        Stage::InterApply,
        Stage::InterAdvance,
        Stage::IntraInitialize,
        Stage::IntraReset,
        Stage::IntraOptimize,
        Stage::IntraReoptimize,
        Stage::IntraApply,
        Stage::IntraFinish,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Stage::InterBegin => 0,
            Stage::InterOptimize => 1,
            Stage::InterApply => 2,
            Stage::InterAdvance => 3,
            Stage::IntraInitialize => 4,
            Stage::IntraReset => 5,
            Stage::IntraOptimize => 6,
            Stage::IntraReoptimize => 7,
            Stage::IntraApply => 8,
            Stage::IntraFinish => 9,
        }
    }

    pub fn is_inter(self) -> bool {
        matches!(
            self,
            Stage::InterBegin | Stage::InterOptimize | Stage::InterApply | Stage::InterAdvance
        )
    }

    pub fn is_intra(self) -> bool {
        !self.is_inter()
    }
}

/// A stage participation declared by a member at insertion time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Subscription {
    pub stage: Stage,
    pub priority: f64,
}

impl Subscription {
    /// Subscribes at the default priority 0.
    pub fn new(stage: Stage) -> Subscription {
        Subscription {
            stage,
            priority: 0.0,
        }
    }

    /// Subscribes at an explicit priority.  Buckets run in ascending
    /// priority order; order within a bucket is unspecified.
    pub fn at(stage: Stage, priority: f64) -> Subscription {
        Subscription { stage, priority }
    }
}

/// Total-ordered wrapper so `f64` priorities can key a `BTreeMap`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Priority(pub f64);

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0).is_eq()
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ============================================================================
// Scheduler state
// ============================================================================

type BucketMap = std::collections::BTreeMap<Priority, Vec<MemberId>>;

#[derive(Default)]
pub(crate) struct StageTable {
    buckets: [BucketMap; 10],
    /// Reverse index so removal can unsubscribe without scanning.
    by_member: std::collections::HashMap<MemberId, Vec<(Stage, Priority)>>,
}

impl StageTable {
    fn subscribe(&mut self, id: MemberId, sub: Subscription) {
        let p = Priority(sub.priority);
        self.buckets[sub.stage.index()].entry(p).or_default().push(id);
        self.by_member.entry(id).or_default().push((sub.stage, p));
    }

    fn unsubscribe(&mut self, id: MemberId) {
        if let Some(entries) = self.by_member.remove(&id) {
            for (stage, p) in entries {
                let map = &mut self.buckets[stage.index()];
                if let Some(ids) = map.get_mut(&p) {
                    ids.retain(|m| *m != id);
                    if ids.is_empty() {
                        map.remove(&p);
                    }
                }
            }
        }
    }

    /// Size of the largest priority bucket across all stages.
    fn plurality(&self) -> usize {
        self.buckets
            .iter()
            .flat_map(|m| m.values())
            .map(|ids| ids.len())
            .max()
            .unwrap_or(0)
    }

    fn stage_buckets(&self, stage: Stage) -> Vec<(f64, Vec<MemberId>)> {
        self.buckets[stage.index()]
            .iter()
            .map(|(p, ids)| (p.0, ids.clone()))
            .collect()
    }
}

/// A deferred membership mutation requested from inside a priority bucket.
pub(crate) enum Deferred {
    Insert(MemberHandle),
    Remove(MemberId),
}

/// One published priority bucket.
struct Bucket {
    stage: Stage,
    members: Vec<MemberHandle>,
    next: AtomicUsize,
}

struct WorkState {
    epoch: u64,
    bucket: Option<Arc<Bucket>>,
    /// Workers whose index is at or beyond this exit at the next wakeup.
    pool_size: usize,
}

/// State shared between the master and the worker pool.
struct SchedShared {
    work: Mutex<WorkState>,
    stage_cv: Condvar,
    done: Mutex<usize>,
    done_cv: Condvar,
    redo_intra: AtomicBool,
    first_error: Mutex<Option<Error>>,
}

pub(crate) struct Scheduler {
    pub(crate) stages: Mutex<StageTable>,
    pub(crate) deferred: Mutex<Vec<Deferred>>,
    in_bucket: AtomicBool,
    shared: Arc<SchedShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new() -> Scheduler {
        Scheduler {
            stages: Mutex::new(StageTable::default()),
            deferred: Mutex::new(Vec::new()),
            in_bucket: AtomicBool::new(false),
            shared: Arc::new(SchedShared {
                work: Mutex::new(WorkState {
                    epoch: 0,
                    bucket: None,
                    pool_size: 0,
                }),
                stage_cv: Condvar::new(),
                done: Mutex::new(0),
                done_cv: Condvar::new(),
                redo_intra: AtomicBool::new(false),
                first_error: Mutex::new(None),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn in_bucket(&self) -> bool {
        self.in_bucket.load(Ordering::SeqCst)
    }

    pub(crate) fn defer(&self, action: Deferred) {
        self.deferred.lock().push(action);
    }

    pub(crate) fn subscribe_all(&self, id: MemberId, subs: &[Subscription]) {
        let mut table = self.stages.lock();
        for sub in subs {
            table.subscribe(id, *sub);
        }
    }

    pub(crate) fn unsubscribe_all(&self, id: MemberId) {
        self.stages.lock().unsubscribe(id);
    }

    /// Grows or shrinks the pool to `target` threads.  Only called between
    /// periods, from the master.
    fn resize_pool(&self, target: usize) {
        let mut workers = self.workers.lock();
        let current = workers.len();
        if current == target {
            return;
        }
        if current > target {
            debug!(current, target, "retiring excess workers");
            {
                let mut ws = self.shared.work.lock();
                ws.pool_size = target;
                ws.epoch += 1;
                ws.bucket = None;
            }
            self.shared.stage_cv.notify_all();
            for handle in workers.drain(target..) {
                let _ = handle.join();
            }
            return;
        }
        debug!(current, target, "spawning workers");
        self.shared.work.lock().pool_size = target;
        for index in current..target {
            let shared = Arc::clone(&self.shared);
            let initial_epoch = shared.work.lock().epoch;
            let handle = thread::Builder::new()
                .name(format!("agora-worker-{index}"))
                .spawn(move || worker_loop(shared, index, initial_epoch))
                .expect("failed to spawn simulation worker");
            workers.push(handle);
        }
    }

    fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub(crate) fn shutdown(&self) {
        self.resize_pool(0);
    }
}

fn worker_loop(shared: Arc<SchedShared>, index: usize, initial_epoch: u64) {
    let mut last_seen = initial_epoch;
    loop {
        let bucket = {
            let mut ws = shared.work.lock();
            loop {
                if ws.pool_size <= index {
                    return;
                }
                if ws.epoch != last_seen {
                    break;
                }
                shared.stage_cv.wait(&mut ws);
            }
            last_seen = ws.epoch;
            ws.bucket.clone()
        };
        let Some(bucket) = bucket else { continue };

        loop {
            let i = bucket.next.fetch_add(1, Ordering::SeqCst);
            let Some(member) = bucket.members.get(i) else {
                break;
            };
            if let Err(err) = invoke_stage_hook(member, bucket.stage, &shared.redo_intra) {
                let mut slot = shared.first_error.lock();
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
        }

        let mut done = shared.done.lock();
        *done += 1;
        drop(done);
        shared.done_cv.notify_all();
    }
}

/// Dispatches one member's hook for `stage`, containing panics and folding
/// `intra_reoptimize` results into the redo flag.
fn invoke_stage_hook(member: &MemberHandle, stage: Stage, redo: &AtomicBool) -> Result<()> {
    let call = || -> anyhow::Result<()> {
        match stage {
            Stage::InterBegin => member.inter_begin(),
            Stage::InterOptimize => member.inter_optimize(),
            Stage::InterApply => member.inter_apply(),
            Stage::InterAdvance => member.inter_advance(),
            Stage::IntraInitialize => member.intra_initialize(),
            Stage::IntraReset => member.intra_reset(),
            Stage::IntraOptimize => member.intra_optimize(),
            Stage::IntraReoptimize => {
                if member.intra_reoptimize()? {
                    redo.store(true, Ordering::SeqCst);
                }
                Ok(())
            }
            Stage::IntraApply => member.intra_apply(),
            Stage::IntraFinish => member.intra_finish(),
        }
    };
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Hook(e)),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "member hook panicked".to_string());
            Err(Error::Hook(anyhow::anyhow!("member hook panicked: {msg}")))
        }
    }
}

// ============================================================================
// The per-period protocol, on Simulation
// ============================================================================

impl Simulation {
    /// Runs one period: increments `t`, runs the four inter stages, loops
    /// the intra optimization stages while any reoptimizer requests a redo,
    /// then applies and finishes.  Holds the run lock exclusively for the
    /// duration.
    ///
    /// The first member-hook failure (or panic) aborts the period after the
    /// active priority bucket drains and is returned from here.
    pub fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("run() is already in progress"));
        }
        let result = self.run_inner();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_inner(&self) -> Result<()> {
        let _run_guard = self.run_mutex.write();

        let max_threads = self.max_threads();
        if max_threads > 0 {
            let plurality = self.sched.stages.lock().plurality();
            self.sched.resize_pool(max_threads.min(plurality));
        } else {
            self.sched.shutdown();
        }
        *self.sched.shared.first_error.lock() = None;

        let t = self.t.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(t, "period start");

        for stage in [
            Stage::InterBegin,
            Stage::InterOptimize,
            Stage::InterApply,
            Stage::InterAdvance,
        ] {
            self.run_stage(stage)?;
        }

        self.intraopt_count.store(0, Ordering::SeqCst);
        loop {
            self.intraopt_count.fetch_add(1, Ordering::SeqCst);
            self.sched.shared.redo_intra.store(false, Ordering::SeqCst);
            for stage in [
                Stage::IntraInitialize,
                Stage::IntraReset,
                Stage::IntraOptimize,
                Stage::IntraReoptimize,
            ] {
                self.run_stage(stage)?;
            }
            if !self.sched.shared.redo_intra.load(Ordering::SeqCst) {
                break;
            }
            trace!(t, "intra reoptimization requested; rerunning");
        }

        for stage in [Stage::IntraApply, Stage::IntraFinish] {
            self.run_stage(stage)?;
        }

        debug!(t, rounds = self.intraopt_count(), "period complete");
        Ok(())
    }

    fn run_stage(&self, stage: Stage) -> Result<()> {
        let buckets = self.sched.stages.lock().stage_buckets(stage);
        for (priority, ids) in buckets {
            let members: Vec<MemberHandle> = {
                let registry = self.registry.lock();
                ids.iter()
                    .filter_map(|id| registry.handle(*id))
                    .collect()
            };
            if members.is_empty() {
                continue;
            }
            trace!(?stage, priority, count = members.len(), "bucket start");

            self.sched.in_bucket.store(true, Ordering::SeqCst);
            let bucket_result = if self.max_threads() == 0 {
                self.run_bucket_inline(stage, &members)
            } else {
                self.run_bucket_parallel(stage, members)
            };
            self.sched.in_bucket.store(false, Ordering::SeqCst);

            // Deferred membership changes apply between buckets, in request
            // order, regardless of how the bucket itself ended.
            self.drain_deferred();
            bucket_result?;
        }
        Ok(())
    }

    fn run_bucket_inline(&self, stage: Stage, members: &[MemberHandle]) -> Result<()> {
        for member in members {
            invoke_stage_hook(member, stage, &self.sched.shared.redo_intra)?;
        }
        Ok(())
    }

    fn run_bucket_parallel(&self, stage: Stage, members: Vec<MemberHandle>) -> Result<()> {
        let shared = &self.sched.shared;
        let workers = self.sched.worker_count();
        if workers == 0 {
            // No pool exists (every bucket so far was empty); run inline.
            return self.run_bucket_inline(stage, &members);
        }

        *shared.done.lock() = 0;
        {
            let mut ws = shared.work.lock();
            ws.epoch += 1;
            ws.bucket = Some(Arc::new(Bucket {
                stage,
                members,
                next: AtomicUsize::new(0),
            }));
        }
        shared.stage_cv.notify_all();

        let mut done = shared.done.lock();
        while *done < workers {
            shared.done_cv.wait(&mut done);
        }
        drop(done);
        shared.work.lock().bucket = None;

        if let Some(err) = shared.first_error.lock().take() {
            return Err(err);
        }
        Ok(())
    }

    /// Applies queued spawn/remove requests in order.  Runs with the
    /// in-bucket flag clear, so actions requested by `added()` hooks of
    /// freshly inserted members apply immediately rather than re-deferring.
    fn drain_deferred(&self) {
        loop {
            let batch: Vec<Deferred> = std::mem::take(&mut *self.sched.deferred.lock());
            if batch.is_empty() {
                return;
            }
            for action in batch {
                match action {
                    Deferred::Insert(handle) => self.insert_now(handle),
                    Deferred::Remove(id) => {
                        // A cascade earlier in the queue may have taken this
                        // member out already.
                        if let Err(err) = self.remove_now(id) {
                            trace!(%id, %err, "deferred removal skipped");
                        }
                    }
                }
            }
        }
    }

    /// Number of intra-period optimization rounds in the last `run()`;
    /// -1 before the first run.
    pub fn intraopt_count(&self) -> i64 {
        self.intraopt_count.load(Ordering::SeqCst)
    }

    /// Holds off the next period while held: `run()` takes this lock
    /// exclusively, so a shared holder observes a consistent snapshot.
    pub fn run_lock_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.run_mutex.read()
    }

    /// Non-blocking [`run_lock_shared`](Simulation::run_lock_shared).
    pub fn try_run_lock_shared(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.run_mutex.try_read()
    }
}
