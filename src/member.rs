//! Simulation members: the common identity, classification, lifecycle and
//! stage-hook surface shared by agents, goods, markets and auxiliary
//! optimizer objects.
//!
//! A member is any `T: Member`.  The kernel talks to members exclusively
//! through [`MemberHandle`] (a shared, id-keyed reference) and the trait's
//! hook methods; concrete member types embed a [`MemberCore`] that carries
//! the process-unique id, the weak back-reference to the owning
//! [`Simulation`](crate::sim::Simulation), and the raw word used by the
//! composable member lock.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::MemberId;
use crate::lock::{MemberLock, RawMemberLock};
use crate::sim::scheduler::Subscription;
use crate::sim::Simulation;

/// The four exclusive classifications of a member.  Fixed for the member's
/// lifetime; decides which typed container of the registry holds it and
/// which lookup surface can find it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberClass {
    Agent,
    Good,
    Market,
    Other,
}

impl fmt::Display for MemberClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberClass::Agent => "agent",
            MemberClass::Good => "good",
            MemberClass::Market => "market",
            MemberClass::Other => "other",
        };
        f.write_str(name)
    }
}

/// Object-safe `Any` access for trait objects; blanket-implemented for every
/// candidate member type so typed downcasts can go through `Arc<dyn Member>`.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Per-member kernel state embedded in every concrete member type.
pub struct MemberCore {
    id: MemberId,
    simulation: RwLock<Weak<Simulation>>,
    pub(crate) raw_lock: RawMemberLock,
}

impl MemberCore {
    /// Creates a fresh core with the next process-unique id and no owning
    /// simulation.
    pub fn new() -> MemberCore {
        MemberCore {
            id: MemberId::next(),
            simulation: RwLock::new(Weak::new()),
            raw_lock: RawMemberLock::new(),
        }
    }

    /// The member's process-unique id.
    pub fn id(&self) -> MemberId {
        self.id
    }

    /// True if the member currently belongs to a simulation.
    pub fn has_simulation(&self) -> bool {
        self.simulation.read().strong_count() > 0
    }

    /// Resolves the owning simulation, or [`Error::NoSimulation`] if the
    /// member has been removed or was never inserted.
    pub fn simulation(&self) -> Result<Arc<Simulation>> {
        self.simulation.read().upgrade().ok_or(Error::NoSimulation)
    }

    /// Shortcut for `simulation()?.t()`.
    pub fn sim_t(&self) -> Result<u64> {
        Ok(self.simulation()?.t())
    }

    /// Records `self` as strongly dependent on `target`: when `target` is
    /// removed from the simulation, this member is removed as well.
    pub fn depends_on(&self, target: MemberId) -> Result<()> {
        self.simulation()?.register_dependency(self.id, target)
    }

    /// Records `self` as weakly dependent on `target`: when `target` is
    /// removed, this member's `weak_dep_removed` hook is invoked but the
    /// member itself stays.
    pub fn depends_weakly_on(&self, target: MemberId) -> Result<()> {
        self.simulation()?.register_weak_dependency(self.id, target)
    }

    /// Obtains a shared lock over this member plus `others`.  With threading
    /// disabled (`max_threads == 0`) the returned lock is fake: it carries no
    /// members and only tracks mode/state.
    pub fn read_lock<I>(&self, others: I) -> MemberLock
    where
        I: IntoIterator<Item = MemberHandle>,
    {
        self.rw_lock(false, others)
    }

    /// Exclusive counterpart of [`read_lock`](MemberCore::read_lock).
    pub fn write_lock<I>(&self, others: I) -> MemberLock
    where
        I: IntoIterator<Item = MemberHandle>,
    {
        self.rw_lock(true, others)
    }

    fn rw_lock<I>(&self, write: bool, others: I) -> MemberLock
    where
        I: IntoIterator<Item = MemberHandle>,
    {
        let sim = self.simulation.read().upgrade();
        if let Some(sim) = &sim {
            if sim.max_threads() == 0 {
                return MemberLock::fake(write);
            }
        }
        let mut members: Vec<MemberHandle> = others.into_iter().collect();
        if let Some(sim) = &sim {
            // Self can only be covered when the registry can hand back the
            // shared wrapper around it.
            if let Ok(me) = sim.handle(self.id) {
                members.push(me);
            }
        }
        if members.is_empty() {
            return MemberLock::fake(write);
        }
        MemberLock::acquire(write, members)
    }

    pub(crate) fn set_simulation(&self, sim: Option<&Arc<Simulation>>) {
        *self.simulation.write() = match sim {
            Some(s) => Arc::downgrade(s),
            None => Weak::new(),
        };
    }
}

impl Default for MemberCore {
    fn default() -> Self {
        MemberCore::new()
    }
}

impl fmt::Debug for MemberCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberCore")
            .field("id", &self.id)
            .field("has_simulation", &self.has_simulation())
            .finish()
    }
}

/// A simulation member.
///
/// All hooks default to no-ops; a member only participates in the stages it
/// names in [`subscriptions`](Member::subscriptions), which the simulation
/// reads once at insertion time.  Stage hooks return `anyhow::Result` so a
/// failing member aborts the period: the first error is carried out of
/// `Simulation::run()` after the active priority bucket drains.
pub trait Member: AsAny + Send + Sync + 'static {
    /// Access to the embedded kernel state.
    fn core(&self) -> &MemberCore;

    /// The member's classification; fixed for its lifetime.
    fn classify(&self) -> MemberClass {
        MemberClass::Other
    }

    /// Called once, right after insertion into the simulation.  Typical use:
    /// register dependencies.  Stage participation is declared through
    /// [`subscriptions`](Member::subscriptions) instead.
    fn added(&self) {}

    /// Called once, right after the member has been taken out of its
    /// container; `core().id()` and `core().simulation()` still resolve.
    fn removed(&self) {}

    /// Called when a member this one weakly depends on has been removed,
    /// after that member's own `removed()` and after the strong cascade.
    fn weak_dep_removed(&self, _removed: MemberId) {}

    /// The stages (and priorities) this member participates in.  Read once
    /// at insertion.
    fn subscriptions(&self) -> Vec<Subscription> {
        Vec::new()
    }

    // Inter-period stage hooks, called at most once per period each.
    fn inter_begin(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn inter_optimize(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn inter_apply(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn inter_advance(&self) -> anyhow::Result<()> {
        Ok(())
    }

    // Intra-period stage hooks.  `intra_reoptimize` returning true requests
    // another intra round; the result is OR-ed across all implementers.
    fn intra_initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn intra_reset(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn intra_optimize(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn intra_reoptimize(&self) -> anyhow::Result<bool> {
        Ok(false)
    }
    fn intra_apply(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn intra_finish(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A shared owning reference to a member.  Clones are cheap; two handles are
/// equal (and hash equal) iff they reference the same member.
#[derive(Clone)]
pub struct MemberHandle(Arc<dyn Member>);

impl MemberHandle {
    pub fn new<T: Member>(member: Arc<T>) -> MemberHandle {
        MemberHandle(member)
    }

    pub fn from_dyn(member: Arc<dyn Member>) -> MemberHandle {
        MemberHandle(member)
    }

    pub fn id(&self) -> MemberId {
        self.0.core().id()
    }

    /// The underlying shared trait object.
    pub fn as_dyn(&self) -> &Arc<dyn Member> {
        &self.0
    }

    /// Attempts a typed conversion, failing with [`Error::InvalidCast`] if
    /// the member's dynamic type is not `T`.
    pub fn downcast<T: Member>(&self) -> Result<Arc<T>> {
        let id = self.id();
        self.0
            .clone()
            .as_any_arc()
            .downcast::<T>()
            .map_err(|_| Error::InvalidCast { id })
    }

    /// True if the member's dynamic type is `T`.
    pub fn is<T: Member>(&self) -> bool {
        self.0.as_any().is::<T>()
    }
}

impl std::ops::Deref for MemberHandle {
    type Target = dyn Member;
    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for MemberHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for MemberHandle {}

impl Hash for MemberHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for MemberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberHandle[{}]", self.id())
    }
}
