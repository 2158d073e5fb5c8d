//! The simulation: member registry, dependency graph, and the period
//! scheduler.
//!
//! A [`Simulation`] owns every live member through one of four typed
//! containers (agents, goods, markets, others), keeps strong and weak
//! dependency edges between members, and drives the per-period stage
//! protocol (see [`scheduler`]).  Members hold only a weak back-reference,
//! so dropping the last `Arc<Simulation>` tears everything down.
//!
//! Membership changes requested while a priority bucket is executing are
//! deferred and applied, in request order, when the bucket's workers have
//! rejoined.

pub mod scheduler;

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::id::MemberId;
use crate::member::{Member, MemberClass, MemberHandle};
use scheduler::{Deferred, Scheduler};

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct Registry {
    agents: HashMap<MemberId, MemberHandle>,
    goods: HashMap<MemberId, MemberHandle>,
    markets: HashMap<MemberId, MemberHandle>,
    others: HashMap<MemberId, MemberHandle>,
    class_of: HashMap<MemberId, MemberClass>,

    /// Memoized dynamic-type filters: `(class, TypeId)` → matching members.
    /// Invalidated wholesale per class on any insert/remove of that class.
    filter_cache: HashMap<MemberClass, HashMap<TypeId, Vec<MemberHandle>>>,

    /// Strong dependents, keyed by the depended-upon member: removing the
    /// key removes every member in the set.
    dependents: HashMap<MemberId, HashSet<MemberId>>,
    /// Weak dependents, keyed the same way: removal only notifies.
    weak_dependents: HashMap<MemberId, HashSet<MemberId>>,
}

impl Registry {
    fn container(&self, class: MemberClass) -> &HashMap<MemberId, MemberHandle> {
        match class {
            MemberClass::Agent => &self.agents,
            MemberClass::Good => &self.goods,
            MemberClass::Market => &self.markets,
            MemberClass::Other => &self.others,
        }
    }

    fn container_mut(&mut self, class: MemberClass) -> &mut HashMap<MemberId, MemberHandle> {
        match class {
            MemberClass::Agent => &mut self.agents,
            MemberClass::Good => &mut self.goods,
            MemberClass::Market => &mut self.markets,
            MemberClass::Other => &mut self.others,
        }
    }

    fn handle(&self, id: MemberId) -> Option<MemberHandle> {
        let class = *self.class_of.get(&id)?;
        self.container(class).get(&id).cloned()
    }

    fn insert(&mut self, handle: MemberHandle, class: MemberClass) {
        let id = handle.id();
        self.class_of.insert(id, class);
        self.container_mut(class).insert(id, handle);
        self.filter_cache.remove(&class);
    }

    fn remove(&mut self, id: MemberId) -> Option<(MemberHandle, MemberClass)> {
        let class = self.class_of.remove(&id)?;
        let handle = self.container_mut(class).remove(&id)?;
        self.filter_cache.remove(&class);
        Some((handle, class))
    }

    /// The `(class, T)` filter cache, built on first use.
    fn cached_of_type<T: Member>(&mut self, class: MemberClass) -> Vec<MemberHandle> {
        let type_id = TypeId::of::<T>();
        let cached = self
            .filter_cache
            .get(&class)
            .map_or(false, |per_class| per_class.contains_key(&type_id));
        if !cached {
            let matches: Vec<MemberHandle> = self
                .container(class)
                .values()
                .filter(|h| h.is::<T>())
                .cloned()
                .collect();
            self.filter_cache
                .entry(class)
                .or_default()
                .insert(type_id, matches);
        }
        self.filter_cache[&class][&type_id].clone()
    }

    /// Transitive strong-dependent closure of `victim` in removal order:
    /// leaves first, the victim last.  Cycles are tolerated via the visited
    /// set.
    fn removal_order(&self, victim: MemberId) -> Vec<MemberId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // Iterative post-order: (id, expanded?)
        let mut stack = vec![(victim, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            if let Some(deps) = self.dependents.get(&id) {
                for dep in deps {
                    if !visited.contains(dep) && self.class_of.contains_key(dep) {
                        stack.push((*dep, false));
                    }
                }
            }
        }
        order
    }

    /// Drops every dependency edge that references a removed member.
    fn purge_dependencies(&mut self, removed: &[MemberId]) {
        for id in removed {
            self.dependents.remove(id);
            self.weak_dependents.remove(id);
        }
        let gone: HashSet<MemberId> = removed.iter().copied().collect();
        for set in self.dependents.values_mut() {
            set.retain(|d| !gone.contains(d));
        }
        for set in self.weak_dependents.values_mut() {
            set.retain(|d| !gone.contains(d));
        }
    }
}

// ============================================================================
// Simulation
// ============================================================================

/// The centre of a model: registry, dependency graph, and scheduler.
/// Created through [`Simulation::new`]; always handled through an `Arc`.
pub struct Simulation {
    registry: Mutex<Registry>,
    pub(crate) sched: Scheduler,
    max_threads: AtomicUsize,
    pub(crate) t: AtomicU64,
    pub(crate) running: AtomicBool,
    pub(crate) intraopt_count: AtomicI64,
    pub(crate) run_mutex: RwLock<()>,
    self_weak: Weak<Simulation>,
}

impl Simulation {
    /// Creates a simulation with threading disabled (`max_threads == 0`):
    /// stage hooks run inline and member locks are no-ops.
    pub fn new() -> Arc<Simulation> {
        Simulation::with_threads(0)
    }

    /// Creates a simulation that will use up to `max_threads` workers.
    pub fn with_threads(max_threads: usize) -> Arc<Simulation> {
        Arc::new_cyclic(|weak| Simulation {
            registry: Mutex::new(Registry::default()),
            sched: Scheduler::new(),
            max_threads: AtomicUsize::new(max_threads),
            t: AtomicU64::new(0),
            running: AtomicBool::new(false),
            intraopt_count: AtomicI64::new(-1),
            run_mutex: RwLock::new(()),
            self_weak: weak.clone(),
        })
    }

    /// The current period number; 0 until the first `run()`, incremented
    /// immediately before each period's first inter stage.
    pub fn t(&self) -> u64 {
        self.t.load(Ordering::SeqCst)
    }

    /// Maximum worker threads for the current (or next) `run()`.
    pub fn max_threads(&self) -> usize {
        self.max_threads.load(Ordering::SeqCst)
    }

    /// Changes the worker limit.  Not permitted during `run()`.
    pub fn set_max_threads(&self, max_threads: usize) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "max_threads cannot change during run()",
            ));
        }
        self.max_threads.store(max_threads, Ordering::SeqCst);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Adds a freshly constructed member to the simulation and returns the
    /// shared reference to it.  If called from inside an executing priority
    /// bucket the insertion is deferred until the bucket completes, so the
    /// member may not be queryable immediately.
    pub fn spawn<T: Member>(&self, member: T) -> Arc<T> {
        let arc = Arc::new(member);
        let handle = MemberHandle::new(Arc::clone(&arc));
        if self.sched.in_bucket() {
            self.sched.defer(Deferred::Insert(handle));
        } else {
            self.insert_now(handle);
        }
        arc
    }

    /// Removes a member (and, transitively, its strong dependents).
    /// Deferred like [`spawn`](Simulation::spawn) when called from inside a
    /// bucket.
    pub fn remove(&self, id: MemberId) -> Result<()> {
        if !self.registry.lock().class_of.contains_key(&id) {
            return Err(Error::NotFound { id });
        }
        if self.sched.in_bucket() {
            self.sched.defer(Deferred::Remove(id));
            Ok(())
        } else {
            self.remove_now(id)
        }
    }

    pub(crate) fn insert_now(&self, handle: MemberHandle) {
        let class = handle.classify();
        let id = handle.id();
        debug!(%id, %class, "member inserted");
        self.registry.lock().insert(handle.clone(), class);

        let me = self
            .self_weak
            .upgrade()
            .expect("insert_now runs on a live simulation");
        handle.core().set_simulation(Some(&me));

        let subs = handle.subscriptions();
        if !subs.is_empty() {
            self.sched.subscribe_all(id, &subs);
        }

        // Hook runs with no kernel locks held; it may re-enter the
        // simulation freely.
        handle.added();
    }

    pub(crate) fn remove_now(&self, victim: MemberId) -> Result<()> {
        let order = {
            let registry = self.registry.lock();
            if !registry.class_of.contains_key(&victim) {
                return Err(Error::NotFound { id: victim });
            }
            registry.removal_order(victim)
        };

        // Strong cascade: every member leaves its container and gets its
        // `removed()` hook before any weak notification happens.
        let mut removed: Vec<(MemberId, MemberHandle)> = Vec::with_capacity(order.len());
        for id in &order {
            let taken = {
                let mut registry = self.registry.lock();
                registry.remove(*id)
            };
            let Some((handle, class)) = taken else {
                continue; // lost to a concurrent or nested removal
            };
            debug!(%id, %class, "member removed");
            self.sched.unsubscribe_all(*id);
            handle.removed();
            handle.core().set_simulation(None);
            removed.push((*id, handle));
        }

        // Weak notification, per removed member in removal order.  Collect
        // targets under the lock, call hooks outside it.
        let removed_ids: Vec<MemberId> = removed.iter().map(|(id, _)| *id).collect();
        let mut notifications: Vec<(MemberHandle, MemberId)> = Vec::new();
        {
            let mut registry = self.registry.lock();
            for id in &removed_ids {
                if let Some(weak_deps) = registry.weak_dependents.get(id) {
                    for dep in weak_deps {
                        if let Some(handle) = registry.handle(*dep) {
                            notifications.push((handle, *id));
                        }
                    }
                }
            }
            registry.purge_dependencies(&removed_ids);
        }
        for (handle, removed_id) in notifications {
            handle.weak_dep_removed(removed_id);
        }
        Ok(())
    }

    /// Adds a stage subscription for a live member, beyond whatever its
    /// `subscriptions()` declared at insertion.  Typically called from an
    /// `added()` hook.
    pub fn subscribe(&self, id: MemberId, sub: scheduler::Subscription) -> Result<()> {
        if !self.registry.lock().class_of.contains_key(&id) {
            return Err(Error::NotFound { id });
        }
        self.sched.subscribe_all(id, &[sub]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    /// Records `dependent` as strongly dependent on `target`: removing
    /// `target` removes `dependent` (after `target`'s own dependents).
    pub fn register_dependency(&self, dependent: MemberId, target: MemberId) -> Result<()> {
        self.registry
            .lock()
            .dependents
            .entry(target)
            .or_default()
            .insert(dependent);
        Ok(())
    }

    /// Records `dependent` as weakly dependent on `target`: removing
    /// `target` invokes `dependent.weak_dep_removed(target)`.
    pub fn register_weak_dependency(&self, dependent: MemberId, target: MemberId) -> Result<()> {
        self.registry
            .lock()
            .weak_dependents
            .entry(target)
            .or_default()
            .insert(dependent);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// The untyped handle for any live member.
    pub fn handle(&self, id: MemberId) -> Result<MemberHandle> {
        self.registry
            .lock()
            .handle(id)
            .ok_or(Error::NotFound { id })
    }

    fn lookup<T: Member>(&self, class: MemberClass, id: MemberId) -> Result<Arc<T>> {
        let handle = {
            let registry = self.registry.lock();
            registry
                .container(class)
                .get(&id)
                .cloned()
                .ok_or(Error::NotFound { id })?
        };
        handle.downcast::<T>()
    }

    fn of_type<T: Member>(&self, class: MemberClass) -> Vec<Arc<T>> {
        let cached = self.registry.lock().cached_of_type::<T>(class);
        cached
            .iter()
            .filter_map(|h| h.downcast::<T>().ok())
            .collect()
    }

    fn count_of_type<T: Member>(&self, class: MemberClass) -> usize {
        self.registry.lock().cached_of_type::<T>(class).len()
    }

    fn all_of_class(&self, class: MemberClass) -> Vec<MemberHandle> {
        self.registry.lock().container(class).values().cloned().collect()
    }

    fn count_of_class(&self, class: MemberClass) -> usize {
        self.registry.lock().container(class).len()
    }
}

/// Generates the per-classification lookup surface.
macro_rules! class_api {
    ($class:expr, $one:ident, $many:ident, $many_where:ident,
     $count:ident, $count_where:ident, $all:ident, $count_all:ident, $has:ident) => {
        impl Simulation {
            /// Typed lookup by id; fails with `NotFound` or `InvalidCast`.
            pub fn $one<T: Member>(&self, id: MemberId) -> Result<Arc<T>> {
                self.lookup::<T>($class, id)
            }

            /// Every member of this classification whose dynamic type is
            /// `T`.  The per-`(class, T)` result set is memoized until any
            /// member of the classification is inserted or removed.
            pub fn $many<T: Member>(&self) -> Vec<Arc<T>> {
                self.of_type::<T>($class)
            }

            /// The unfiltered enumeration, narrowed by a predicate.
            pub fn $many_where<T, F>(&self, filter: F) -> Vec<Arc<T>>
            where
                T: Member,
                F: Fn(&T) -> bool,
            {
                self.of_type::<T>($class)
                    .into_iter()
                    .filter(|m| filter(m))
                    .collect()
            }

            /// Count of dynamic-type-`T` members; short-circuits to the
            /// cache size.
            pub fn $count<T: Member>(&self) -> usize {
                self.count_of_type::<T>($class)
            }

            /// Count under a predicate.
            pub fn $count_where<T, F>(&self, filter: F) -> usize
            where
                T: Member,
                F: Fn(&T) -> bool,
            {
                self.of_type::<T>($class)
                    .into_iter()
                    .filter(|m| filter(m))
                    .count()
            }

            /// Every member of this classification, untyped.
            pub fn $all(&self) -> Vec<MemberHandle> {
                self.all_of_class($class)
            }

            /// Total member count of this classification.
            pub fn $count_all(&self) -> usize {
                self.count_of_class($class)
            }

            /// True if a member of this classification has the given id.
            pub fn $has(&self, id: MemberId) -> bool {
                self.registry.lock().container($class).contains_key(&id)
            }
        }
    };
}

class_api!(
    MemberClass::Agent,
    agent,
    agents,
    agents_where,
    count_agents,
    count_agents_where,
    all_agents,
    count_all_agents,
    has_agent
);
class_api!(
    MemberClass::Good,
    good,
    goods,
    goods_where,
    count_goods,
    count_goods_where,
    all_goods,
    count_all_goods,
    has_good
);
class_api!(
    MemberClass::Market,
    market,
    markets,
    markets_where,
    count_markets,
    count_markets_where,
    all_markets,
    count_all_markets,
    has_market
);
class_api!(
    MemberClass::Other,
    other,
    others,
    others_where,
    count_others,
    count_others_where,
    all_others,
    count_all_others,
    has_other
);

impl Drop for Simulation {
    fn drop(&mut self) {
        self.sched.shutdown();
    }
}
