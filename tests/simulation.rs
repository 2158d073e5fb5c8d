//! End-to-end scenarios for the simulation kernel: stage ordering, cascade
//! removal, deferred membership changes, the member lock under contention,
//! and error propagation out of `run()`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use agora::{
    Error, Member, MemberClass, MemberCore, MemberHandle, MemberId, Simulation, Stage,
    Subscription,
};

type StageLog = Arc<Mutex<Vec<(&'static str, Stage)>>>;

/// Opt-in kernel tracing for debugging test failures: run with
/// `RUST_LOG=agora=trace`.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// A member that records every stage hook invocation.
struct Recorder {
    core: MemberCore,
    label: &'static str,
    subs: Vec<Subscription>,
    log: StageLog,
}

impl Recorder {
    fn new(label: &'static str, subs: Vec<Subscription>, log: StageLog) -> Recorder {
        Recorder {
            core: MemberCore::new(),
            label,
            subs,
            log,
        }
    }

    fn record(&self, stage: Stage) -> anyhow::Result<()> {
        self.log.lock().push((self.label, stage));
        Ok(())
    }
}

impl Member for Recorder {
    fn core(&self) -> &MemberCore {
        &self.core
    }
    fn classify(&self) -> MemberClass {
        MemberClass::Agent
    }
    fn subscriptions(&self) -> Vec<Subscription> {
        self.subs.clone()
    }
    fn inter_begin(&self) -> anyhow::Result<()> {
        self.record(Stage::InterBegin)
    }
    fn inter_optimize(&self) -> anyhow::Result<()> {
        self.record(Stage::InterOptimize)
    }
    fn inter_apply(&self) -> anyhow::Result<()> {
        self.record(Stage::InterApply)
    }
    fn inter_advance(&self) -> anyhow::Result<()> {
        self.record(Stage::InterAdvance)
    }
    fn intra_initialize(&self) -> anyhow::Result<()> {
        self.record(Stage::IntraInitialize)
    }
    fn intra_reset(&self) -> anyhow::Result<()> {
        self.record(Stage::IntraReset)
    }
    fn intra_optimize(&self) -> anyhow::Result<()> {
        self.record(Stage::IntraOptimize)
    }
    fn intra_reoptimize(&self) -> anyhow::Result<bool> {
        self.record(Stage::IntraReoptimize)?;
        Ok(false)
    }
    fn intra_apply(&self) -> anyhow::Result<()> {
        self.record(Stage::IntraApply)
    }
    fn intra_finish(&self) -> anyhow::Result<()> {
        self.record(Stage::IntraFinish)
    }
}

fn all_stage_subs() -> Vec<Subscription> {
    Stage::ALL.iter().map(|s| Subscription::new(*s)).collect()
}

#[test]
fn stages_fire_in_period_order() {
    init_tracing();
    let sim = Simulation::new();
    let log: StageLog = Arc::new(Mutex::new(Vec::new()));
    sim.spawn(Recorder::new("m", all_stage_subs(), Arc::clone(&log)));

    sim.run().unwrap();
    assert_eq!(sim.t(), 1);

    let stages: Vec<Stage> = log.lock().iter().map(|(_, s)| *s).collect();
    assert_eq!(stages, Stage::ALL.to_vec());
}

#[test]
fn priority_buckets_run_in_ascending_order() {
    init_tracing();
    // A and C at priority 1.0, B at 2.0: A and C (in either order) must
    // both fire before B.  Exercise the real worker pool.
    let sim = Simulation::with_threads(2);
    let log: StageLog = Arc::new(Mutex::new(Vec::new()));
    sim.spawn(Recorder::new(
        "A",
        vec![Subscription::at(Stage::InterOptimize, 1.0)],
        Arc::clone(&log),
    ));
    sim.spawn(Recorder::new(
        "B",
        vec![Subscription::at(Stage::InterOptimize, 2.0)],
        Arc::clone(&log),
    ));
    sim.spawn(Recorder::new(
        "C",
        vec![Subscription::at(Stage::InterOptimize, 1.0)],
        Arc::clone(&log),
    ));

    sim.run().unwrap();

    let order: Vec<&'static str> = log.lock().iter().map(|(l, _)| *l).collect();
    assert_eq!(order.len(), 3);
    let pos = |l: &str| order.iter().position(|x| *x == l).unwrap();
    assert!(pos("A") < pos("B"));
    assert!(pos("C") < pos("B"));
}

/// A member that asks for `redos` reoptimization rounds.
struct Reoptimizer {
    core: MemberCore,
    remaining: AtomicU32,
    rounds_seen: AtomicU32,
}

impl Member for Reoptimizer {
    fn core(&self) -> &MemberCore {
        &self.core
    }
    fn subscriptions(&self) -> Vec<Subscription> {
        vec![
            Subscription::new(Stage::IntraReset),
            Subscription::new(Stage::IntraReoptimize),
        ]
    }
    fn intra_reset(&self) -> anyhow::Result<()> {
        self.rounds_seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn intra_reoptimize(&self) -> anyhow::Result<bool> {
        Ok(self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok())
    }
}

#[test]
fn reoptimize_redo_loops_the_intra_stages() {
    let sim = Simulation::new();
    let m = sim.spawn(Reoptimizer {
        core: MemberCore::new(),
        remaining: AtomicU32::new(3),
        rounds_seen: AtomicU32::new(0),
    });

    sim.run().unwrap();
    // Three redos means four rounds in total.
    assert_eq!(sim.intraopt_count(), 4);
    assert_eq!(m.rounds_seen.load(Ordering::SeqCst), 4);
}

/// Cascade removal: M2 depends on M1, M3 on M2, and a watcher weakly
/// depends on each of the three.
struct Watcher {
    core: MemberCore,
    notified: Arc<Mutex<Vec<MemberId>>>,
}

impl Member for Watcher {
    fn core(&self) -> &MemberCore {
        &self.core
    }
    fn weak_dep_removed(&self, removed: MemberId) {
        self.notified.lock().push(removed);
    }
}

struct Plain {
    core: MemberCore,
}

impl Plain {
    fn new() -> Plain {
        Plain {
            core: MemberCore::new(),
        }
    }
}

impl Member for Plain {
    fn core(&self) -> &MemberCore {
        &self.core
    }
}

#[test]
fn cascade_removal_clears_chain_and_notifies_watcher() {
    let sim = Simulation::new();
    let m1 = sim.spawn(Plain::new());
    let m2 = sim.spawn(Plain::new());
    let m3 = sim.spawn(Plain::new());
    let notified = Arc::new(Mutex::new(Vec::new()));
    let m4 = sim.spawn(Watcher {
        core: MemberCore::new(),
        notified: Arc::clone(&notified),
    });
    let (id1, id2, id3, id4) = (
        m1.core().id(),
        m2.core().id(),
        m3.core().id(),
        m4.core().id(),
    );

    sim.register_dependency(id2, id1).unwrap();
    sim.register_dependency(id3, id2).unwrap();
    for target in [id1, id2, id3] {
        sim.register_weak_dependency(id4, target).unwrap();
    }

    sim.remove(id1).unwrap();

    // The whole strong chain is gone; the watcher saw each removal once.
    assert!(!sim.has_other(id1) && !sim.has_other(id2) && !sim.has_other(id3));
    let mut seen = notified.lock().clone();
    seen.sort();
    let mut expected = vec![id1, id2, id3];
    expected.sort();
    assert_eq!(seen, expected);

    // Removed members no longer resolve a simulation.
    assert!(matches!(m1.core().simulation(), Err(Error::NoSimulation)));
    assert!(matches!(m3.core().simulation(), Err(Error::NoSimulation)));

    // The watcher is untouched until removed explicitly.
    assert!(sim.has_other(id4));
    sim.remove(id4).unwrap();
    assert_eq!(sim.count_all_others(), 0);
    assert!(matches!(m4.core().simulation(), Err(Error::NoSimulation)));
}

/// A member that spawns another member from inside a stage hook; the
/// spawned member's `added()` spawns a third (the multi-level deferral
/// edge case).
struct SpawnerChild {
    core: MemberCore,
    grandchild_id: Arc<Mutex<Option<MemberId>>>,
}

impl Member for SpawnerChild {
    fn core(&self) -> &MemberCore {
        &self.core
    }
    fn added(&self) {
        // Runs during the deferred-queue drain: not inside a bucket, so
        // this nested spawn applies immediately.
        let sim = self.core.simulation().expect("added implies a simulation");
        let g = sim.spawn(Plain::new());
        *self.grandchild_id.lock() = Some(g.core().id());
    }
}

struct Spawner {
    core: MemberCore,
    child_id: Arc<Mutex<Option<MemberId>>>,
    grandchild_id: Arc<Mutex<Option<MemberId>>>,
}

impl Member for Spawner {
    fn core(&self) -> &MemberCore {
        &self.core
    }
    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(Stage::InterOptimize)]
    }
    fn inter_optimize(&self) -> anyhow::Result<()> {
        let sim = self.core.simulation()?;
        let child = sim.spawn(SpawnerChild {
            core: MemberCore::new(),
            grandchild_id: Arc::clone(&self.grandchild_id),
        });
        *self.child_id.lock() = Some(child.core().id());
        // Deferred: the child is not yet queryable inside the bucket.
        assert!(sim.handle(child.core().id()).is_err());
        Ok(())
    }
}

#[test]
fn spawns_during_a_stage_are_deferred_then_applied_in_order() {
    let sim = Simulation::new();
    let child_id = Arc::new(Mutex::new(None));
    let grandchild_id = Arc::new(Mutex::new(None));
    sim.spawn(Spawner {
        core: MemberCore::new(),
        child_id: Arc::clone(&child_id),
        grandchild_id: Arc::clone(&grandchild_id),
    });

    sim.run().unwrap();

    let child = child_id.lock().expect("spawner ran");
    let grandchild = grandchild_id.lock().expect("child's added ran");
    assert!(sim.handle(child).is_ok());
    assert!(sim.handle(grandchild).is_ok());
    assert_eq!(sim.count_all_others(), 3);
}

/// A member that removes itself during its stage hook.
struct SelfRemover {
    core: MemberCore,
}

impl Member for SelfRemover {
    fn core(&self) -> &MemberCore {
        &self.core
    }
    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(Stage::InterBegin)]
    }
    fn inter_begin(&self) -> anyhow::Result<()> {
        let sim = self.core.simulation()?;
        sim.remove(self.core.id())?;
        // Still present until the bucket finishes.
        assert!(sim.handle(self.core.id()).is_ok());
        Ok(())
    }
}

#[test]
fn removal_during_a_stage_is_deferred() {
    let sim = Simulation::new();
    let m = sim.spawn(SelfRemover {
        core: MemberCore::new(),
    });
    let id = m.core().id();
    sim.run().unwrap();
    assert!(sim.handle(id).is_err());
    assert!(matches!(m.core().simulation(), Err(Error::NoSimulation)));
}

/// A member whose hook fails.
struct Failing {
    core: MemberCore,
}

impl Member for Failing {
    fn core(&self) -> &MemberCore {
        &self.core
    }
    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(Stage::IntraOptimize)]
    }
    fn intra_optimize(&self) -> anyhow::Result<()> {
        anyhow::bail!("market data went missing")
    }
}

#[test]
fn hook_errors_propagate_out_of_run() {
    let sim = Simulation::new();
    sim.spawn(Failing {
        core: MemberCore::new(),
    });
    let err = sim.run().unwrap_err();
    assert!(matches!(err, Error::Hook(_)));
    assert!(err.to_string().contains("market data went missing"));

    // The simulation is usable again afterwards.
    assert_eq!(sim.t(), 1);
    assert!(sim.run().is_err());
    assert_eq!(sim.t(), 2);
}

/// A member whose hook panics, under the threaded dispatcher.
struct Panicking {
    core: MemberCore,
}

impl Member for Panicking {
    fn core(&self) -> &MemberCore {
        &self.core
    }
    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(Stage::InterApply)]
    }
    fn inter_apply(&self) -> anyhow::Result<()> {
        panic!("hook blew up");
    }
}

#[test]
fn hook_panics_are_contained_and_reported() {
    let sim = Simulation::with_threads(2);
    sim.spawn(Panicking {
        core: MemberCore::new(),
    });
    let err = sim.run().unwrap_err();
    assert!(matches!(err, Error::Hook(_)));
    assert!(err.to_string().contains("panicked"));
}

#[test]
fn run_lock_is_shared_outside_and_exclusive_inside_run() {
    let sim = Simulation::new();
    // Outside a run the shared lock is freely available.
    {
        let _g1 = sim.run_lock_shared();
        let _g2 = sim.try_run_lock_shared().expect("shared is reentrant");
    }

    struct Probe {
        core: MemberCore,
        saw_exclusive: Arc<Mutex<bool>>,
    }
    impl Member for Probe {
        fn core(&self) -> &MemberCore {
            &self.core
        }
        fn subscriptions(&self) -> Vec<Subscription> {
            vec![Subscription::new(Stage::InterBegin)]
        }
        fn inter_begin(&self) -> anyhow::Result<()> {
            let sim = self.core.simulation()?;
            *self.saw_exclusive.lock() = sim.try_run_lock_shared().is_none();
            Ok(())
        }
    }

    let saw = Arc::new(Mutex::new(false));
    sim.spawn(Probe {
        core: MemberCore::new(),
        saw_exclusive: Arc::clone(&saw),
    });
    sim.run().unwrap();
    assert!(*saw.lock(), "run() must hold the run lock exclusively");
}

#[test]
fn single_threaded_mode_hands_out_fake_locks() {
    let sim = Simulation::new();
    let a = sim.spawn(Plain::new());
    let b = sim.spawn(Plain::new());
    let bh = sim.handle(b.core().id()).unwrap();

    let lock = a.core().write_lock([bh]);
    assert!(lock.is_fake());
    assert!(lock.is_locked() && lock.is_write());
    lock.unlock().unwrap();
    lock.lock().unwrap();
}

#[test]
fn opposing_lock_orders_do_not_deadlock_across_threads() {
    // Two threads lock the same pair in opposite orders, one exclusively,
    // one shared, thousands of times.  Completing at all is the assertion.
    let sim = Simulation::with_threads(2);
    let x = sim.spawn(Plain::new());
    let y = sim.spawn(Plain::new());
    let xh = sim.handle(x.core().id()).unwrap();
    let yh = sim.handle(y.core().id()).unwrap();

    let t1 = {
        let (x, yh) = (Arc::clone(&x), yh.clone());
        std::thread::spawn(move || {
            for _ in 0..3000 {
                let lock = x.core().write_lock([yh.clone()]);
                assert!(lock.is_locked());
            }
        })
    };
    let t2 = {
        let (y, xh) = (Arc::clone(&y), xh.clone());
        std::thread::spawn(move || {
            for _ in 0..3000 {
                let lock = y.core().read_lock([xh.clone()]);
                assert!(lock.is_locked());
            }
        })
    };
    t1.join().unwrap();
    t2.join().unwrap();
}

#[test]
fn lock_add_remove_round_trip_preserves_coverage() {
    let sim = Simulation::with_threads(1);
    let a = sim.spawn(Plain::new());
    let b = sim.spawn(Plain::new());
    let bh = sim.handle(b.core().id()).unwrap();

    let lock = a.core().write_lock(None::<MemberHandle>);
    assert_eq!(lock.len(), 1);
    lock.add(&bh);
    assert_eq!(lock.len(), 2);
    let split = lock.remove([bh.clone()]).unwrap();
    assert_eq!(lock.len(), 1);
    drop(split);

    // b is lockable again by someone else.
    let other = MemberHandle::new(b).write_lock_probe();
    assert!(other);
}

/// Helper: can this member be write-locked right now without blocking?
trait Probe {
    fn write_lock_probe(self) -> bool;
}

impl Probe for MemberHandle {
    fn write_lock_probe(self) -> bool {
        let lock = self.core().write_lock(None::<MemberHandle>);
        let ok = lock.is_locked();
        lock.unlock().ok();
        ok
    }
}

#[test]
fn nested_run_is_rejected() {
    struct Nested {
        core: MemberCore,
        result: Arc<Mutex<Option<String>>>,
    }
    impl Member for Nested {
        fn core(&self) -> &MemberCore {
            &self.core
        }
        fn subscriptions(&self) -> Vec<Subscription> {
            vec![Subscription::new(Stage::InterBegin)]
        }
        fn inter_begin(&self) -> anyhow::Result<()> {
            let sim = self.core.simulation()?;
            *self.result.lock() = Some(sim.run().unwrap_err().to_string());
            Ok(())
        }
    }

    let sim = Simulation::new();
    let result = Arc::new(Mutex::new(None));
    sim.spawn(Nested {
        core: MemberCore::new(),
        result: Arc::clone(&result),
    });
    sim.run().unwrap();
    let msg = result.lock().clone().expect("hook ran");
    assert!(msg.contains("already in progress"));
}

#[test]
fn max_threads_is_immutable_during_run() {
    struct Changer {
        core: MemberCore,
        result: Arc<Mutex<Option<String>>>,
    }
    impl Member for Changer {
        fn core(&self) -> &MemberCore {
            &self.core
        }
        fn subscriptions(&self) -> Vec<Subscription> {
            vec![Subscription::new(Stage::InterBegin)]
        }
        fn inter_begin(&self) -> anyhow::Result<()> {
            let sim = self.core.simulation()?;
            *self.result.lock() = Some(sim.set_max_threads(8).unwrap_err().to_string());
            Ok(())
        }
    }

    let sim = Simulation::new();
    let result = Arc::new(Mutex::new(None));
    sim.spawn(Changer {
        core: MemberCore::new(),
        result: Arc::clone(&result),
    });
    sim.run().unwrap();
    assert!(result.lock().clone().unwrap().contains("max_threads"));

    sim.set_max_threads(4).unwrap();
    assert_eq!(sim.max_threads(), 4);
}
