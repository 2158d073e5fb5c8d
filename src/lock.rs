//! Composable shared/exclusive locking over a *set* of members.
//!
//! Every member carries a [`RawMemberLock`]: a tiny reader/writer word (a
//! `writer` flag plus a reader count) guarded by a mutex, with a condvar for
//! blocked waiters.  A [`MemberLock`] owns a set of members, a mode (shared
//! or exclusive) and a state (held or released), and acquires the whole set
//! without ever holding one member's word while blocking on another:
//!
//! ```text
//! loop:
//!     claim each member's word with TRY semantics, in ascending id order
//!     if all claims succeeded: done
//!     else:
//!         undo every claim made in this attempt
//!         wait (on its condvar) until the failed member looks available
//!         restart
//! ```
//!
//! Clones of a `MemberLock` share their mode and state: releasing or
//! converting one converts all of them.  The lock is released when the last
//! clone drops.
//!
//! When the owning simulation runs single-threaded (`max_threads == 0`),
//! member locks are *fake*: they carry no members and every operation only
//! tracks mode/state, so calling code observes identical semantics with no
//! locking overhead.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::member::MemberHandle;

// ============================================================================
// Per-member raw state
// ============================================================================

#[derive(Default)]
struct RawState {
    writer: bool,
    readers: usize,
}

/// The per-member lock word.  Lives inside `MemberCore`; only this module
/// touches it.
pub(crate) struct RawMemberLock {
    state: Mutex<RawState>,
    available: Condvar,
}

impl RawMemberLock {
    pub(crate) fn new() -> RawMemberLock {
        RawMemberLock {
            state: Mutex::new(RawState::default()),
            available: Condvar::new(),
        }
    }

    fn try_shared(&self) -> bool {
        let mut st = self.state.lock();
        if st.writer {
            false
        } else {
            st.readers += 1;
            true
        }
    }

    fn try_exclusive(&self) -> bool {
        let mut st = self.state.lock();
        if st.writer || st.readers > 0 {
            false
        } else {
            st.writer = true;
            true
        }
    }

    fn release_shared(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.readers > 0);
        st.readers -= 1;
        drop(st);
        self.available.notify_all();
    }

    fn release_exclusive(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.writer);
        st.writer = false;
        drop(st);
        self.available.notify_all();
    }

    /// Blocks until a shared claim would succeed, then returns *without*
    /// holding anything.  Only this member's word mutex is touched, and the
    /// condvar wait releases it, so no lock is held while blocked.
    fn wait_shared_available(&self) {
        let mut st = self.state.lock();
        while st.writer {
            self.available.wait(&mut st);
        }
    }

    fn wait_exclusive_available(&self) {
        let mut st = self.state.lock();
        while st.writer || st.readers > 0 {
            self.available.wait(&mut st);
        }
    }
}

fn try_claim(member: &MemberHandle, write: bool) -> bool {
    let raw = &member.core().raw_lock;
    if write {
        raw.try_exclusive()
    } else {
        raw.try_shared()
    }
}

fn release_claim(member: &MemberHandle, write: bool) {
    let raw = &member.core().raw_lock;
    if write {
        raw.release_exclusive();
    } else {
        raw.release_shared();
    }
}

/// Blocking multi-member acquisition per the module-level algorithm.
fn acquire_all(members: &[MemberHandle], write: bool) {
    loop {
        let mut failed = None;
        for (i, m) in members.iter().enumerate() {
            if !try_claim(m, write) {
                failed = Some(i);
                break;
            }
        }
        match failed {
            None => return,
            Some(i) => {
                for m in &members[..i] {
                    release_claim(m, write);
                }
                let raw = &members[i].core().raw_lock;
                if write {
                    raw.wait_exclusive_available();
                } else {
                    raw.wait_shared_available();
                }
            }
        }
    }
}

/// Non-blocking variant: true if the whole set was claimed, false (with no
/// claims outstanding) otherwise.
fn try_acquire_all(members: &[MemberHandle], write: bool) -> bool {
    for (i, m) in members.iter().enumerate() {
        if !try_claim(m, write) {
            for held in &members[..i] {
                release_claim(held, write);
            }
            return false;
        }
    }
    true
}

fn release_all(members: &[MemberHandle], write: bool) {
    for m in members {
        release_claim(m, write);
    }
}

// ============================================================================
// MemberLock
// ============================================================================

struct LockInner {
    /// Sorted by id and deduplicated; the sort order is the fixed claim
    /// order of the acquisition loop.
    members: Vec<MemberHandle>,
    write: bool,
    locked: bool,
}

impl LockInner {
    fn insert(&mut self, member: MemberHandle) -> bool {
        match self.members.binary_search_by_key(&member.id(), |m| m.id()) {
            Ok(_) => false,
            Err(pos) => {
                self.members.insert(pos, member);
                true
            }
        }
    }

    fn position(&self, member: &MemberHandle) -> Option<usize> {
        self.members
            .binary_search_by_key(&member.id(), |m| m.id())
            .ok()
    }
}

/// A shared/exclusive lock over a set of members.  See the module docs for
/// the acquisition algorithm and the fake (threadless) flavour.
pub struct MemberLock {
    data: Arc<Mutex<LockInner>>,
}

impl MemberLock {
    /// Builds a lock over `members` and acquires it in the requested mode
    /// before returning.
    pub(crate) fn acquire<I>(write: bool, members: I) -> MemberLock
    where
        I: IntoIterator<Item = MemberHandle>,
    {
        let lock = MemberLock::released(write, members);
        {
            let inner = lock.data.lock();
            acquire_all(&inner.members, inner.write);
        }
        lock.data.lock().locked = true;
        lock
    }

    /// Builds a lock over `members` without acquiring anything.
    pub(crate) fn released<I>(write: bool, members: I) -> MemberLock
    where
        I: IntoIterator<Item = MemberHandle>,
    {
        let mut inner = LockInner {
            members: Vec::new(),
            write,
            locked: false,
        };
        for m in members {
            inner.insert(m);
        }
        MemberLock {
            data: Arc::new(Mutex::new(inner)),
        }
    }

    /// A memberless lock: every operation is a no-op that still tracks
    /// mode and held/released state.  Starts out held, like any freshly
    /// obtained lock.
    pub(crate) fn fake(write: bool) -> MemberLock {
        MemberLock {
            data: Arc::new(Mutex::new(LockInner {
                members: Vec::new(),
                write,
                locked: true,
            })),
        }
    }

    fn with_state(write: bool, locked: bool, members: Vec<MemberHandle>) -> MemberLock {
        MemberLock {
            data: Arc::new(Mutex::new(LockInner {
                members,
                write,
                locked,
            })),
        }
    }

    /// True if this lock is in exclusive (write) mode.
    pub fn is_write(&self) -> bool {
        self.data.lock().write
    }

    /// Alias for `!is_write()`.
    pub fn is_read(&self) -> bool {
        !self.is_write()
    }

    /// True if the lock is currently held.  Shared among all clones.
    pub fn is_locked(&self) -> bool {
        self.data.lock().locked
    }

    /// True for a memberless lock (threading disabled, or an empty member
    /// set).
    pub fn is_fake(&self) -> bool {
        self.data.lock().members.is_empty()
    }

    /// Number of members covered by this lock.
    pub fn len(&self) -> usize {
        self.data.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquires the lock.  Fails with [`Error::LockInvalidState`] if it is
    /// already held (acquiring twice from the same thread would deadlock).
    pub fn lock(&self) -> Result<()> {
        let mut inner = self.data.lock();
        if inner.locked {
            return Err(Error::LockInvalidState(
                "lock() called on an already-held lock",
            ));
        }
        acquire_all(&inner.members, inner.write);
        inner.locked = true;
        Ok(())
    }

    /// Attempts to acquire without blocking.  Fails like [`lock`] when
    /// already held; otherwise returns whether the acquisition succeeded.
    pub fn try_lock(&self) -> Result<bool> {
        let mut inner = self.data.lock();
        if inner.locked {
            return Err(Error::LockInvalidState(
                "try_lock() called on an already-held lock",
            ));
        }
        if try_acquire_all(&inner.members, inner.write) {
            inner.locked = true;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Releases the held lock.  Fails with [`Error::LockInvalidState`] if
    /// the lock is not currently held.
    pub fn unlock(&self) -> Result<()> {
        let mut inner = self.data.lock();
        if !inner.locked {
            return Err(Error::LockInvalidState(
                "unlock() called on a released lock",
            ));
        }
        release_all(&inner.members, inner.write);
        inner.locked = false;
        Ok(())
    }

    /// Converts to exclusive mode, (re)establishing the lock.  A held shared
    /// lock is released and reacquired exclusively; a released lock is
    /// acquired.  Does nothing if already a held write lock.
    pub fn write(&self) {
        self.convert(true);
    }

    /// Converts to shared mode, (re)establishing the lock.
    pub fn read(&self) {
        self.convert(false);
    }

    /// Non-blocking [`write`](MemberLock::write): on failure the lock is
    /// left released but its mode is still switched, so a later `lock()`
    /// acquires exclusively.
    pub fn try_write(&self) -> bool {
        self.try_convert(true)
    }

    /// Non-blocking [`read`](MemberLock::read).
    pub fn try_read(&self) -> bool {
        self.try_convert(false)
    }

    fn convert(&self, write: bool) {
        let mut inner = self.data.lock();
        if inner.locked && inner.write == write {
            return;
        }
        if inner.locked {
            release_all(&inner.members, inner.write);
        }
        inner.write = write;
        acquire_all(&inner.members, write);
        inner.locked = true;
    }

    fn try_convert(&self, write: bool) -> bool {
        let mut inner = self.data.lock();
        if inner.locked && inner.write == write {
            return true;
        }
        if inner.locked {
            release_all(&inner.members, inner.write);
            inner.locked = false;
        }
        inner.write = write;
        if try_acquire_all(&inner.members, write) {
            inner.locked = true;
            true
        } else {
            false
        }
    }

    /// Adds a member if that is possible without blocking: always succeeds
    /// on a released lock, and on a held one iff the member's word can be
    /// claimed immediately.  Returns false (and leaves the lock unchanged)
    /// otherwise.  Adding an already-covered member is a no-op success.
    pub fn try_add(&self, member: &MemberHandle) -> bool {
        let mut inner = self.data.lock();
        if inner.position(member).is_some() {
            return true;
        }
        if inner.locked && !try_claim(member, inner.write) {
            return false;
        }
        inner.insert(member.clone());
        true
    }

    /// Adds a member, blocking if necessary.  If the member cannot be
    /// claimed immediately, every held claim is released first and the whole
    /// (extended) set is reacquired, preserving deadlock freedom.
    pub fn add(&self, member: &MemberHandle) {
        if self.try_add(member) {
            return;
        }
        let mut inner = self.data.lock();
        release_all(&inner.members, inner.write);
        inner.insert(member.clone());
        acquire_all(&inner.members, inner.write);
    }

    /// Container-accepting [`add`](MemberLock::add).
    pub fn add_all<I>(&self, members: I)
    where
        I: IntoIterator<Item = MemberHandle>,
    {
        let mut relock = false;
        for m in members {
            if !self.try_add(&m) {
                // Release once, absorb the remainder unheld, reacquire at
                // the end.
                let mut inner = self.data.lock();
                if inner.locked {
                    release_all(&inner.members, inner.write);
                    inner.locked = false;
                    relock = true;
                }
                inner.insert(m);
            }
        }
        if relock {
            let mut inner = self.data.lock();
            acquire_all(&inner.members, inner.write);
            inner.locked = true;
        }
    }

    /// Removes `members` from this lock, transferring them (with their held
    /// claims, if any) into a new lock of the same mode and state.  Cannot
    /// block.  Dropping the returned lock releases the removed members.
    ///
    /// Fails with [`Error::NotFound`] if any requested member is not
    /// covered; nothing is removed in that case.
    pub fn remove<I>(&self, members: I) -> Result<MemberLock>
    where
        I: IntoIterator<Item = MemberHandle>,
    {
        let requested: Vec<MemberHandle> = members.into_iter().collect();
        let mut inner = self.data.lock();
        if requested.is_empty() {
            return Ok(MemberLock::with_state(inner.write, inner.locked, Vec::new()));
        }
        for m in &requested {
            if inner.position(m).is_none() {
                return Err(Error::NotFound { id: m.id() });
            }
        }
        let mut moved = Vec::with_capacity(requested.len());
        for m in &requested {
            if let Some(pos) = inner.position(m) {
                moved.push(inner.members.remove(pos));
            }
        }
        Ok(MemberLock::with_state(inner.write, inner.locked, moved))
    }

    /// Single-member [`remove`](MemberLock::remove).
    pub fn remove_one(&self, member: &MemberHandle) -> Result<MemberLock> {
        self.remove([member.clone()])
    }

    /// Moves every member of `from` into this lock.  Both locks must share
    /// mode and state ([`Error::LockMismatch`] otherwise); afterwards `from`
    /// is empty (fake).
    pub fn transfer(&self, from: &MemberLock) -> Result<()> {
        if Arc::ptr_eq(&self.data, &from.data) {
            return Ok(());
        }
        // Two distinct allocations; order by address so two opposing
        // transfers cannot deadlock on the data mutexes.
        let self_first = Arc::as_ptr(&self.data) < Arc::as_ptr(&from.data);
        let (mut dst_guard, mut src_guard);
        if self_first {
            dst_guard = self.data.lock();
            src_guard = from.data.lock();
        } else {
            src_guard = from.data.lock();
            dst_guard = self.data.lock();
        }
        let (dst, src) = (&mut *dst_guard, &mut *src_guard);
        if dst.write != src.write || dst.locked != src.locked {
            return Err(Error::LockMismatch);
        }
        for m in src.members.drain(..) {
            if !dst.insert(m.clone()) && dst.locked {
                // Duplicate coverage: the destination already holds this
                // member, so the source's claim must be dropped rather than
                // leaked.
                release_claim(&m, dst.write);
            }
        }
        Ok(())
    }

    /// Scope-based [`add_all`](MemberLock::add_all): the returned guard
    /// removes (and releases) the supplemented members when dropped.
    pub fn supplement<I>(&self, members: I) -> SupplementGuard
    where
        I: IntoIterator<Item = MemberHandle>,
    {
        let members: Vec<MemberHandle> = members.into_iter().collect();
        // Only members not already covered are removed again at scope end.
        let added: Vec<MemberHandle> = {
            let inner = self.data.lock();
            members
                .iter()
                .filter(|m| inner.position(m).is_none())
                .cloned()
                .collect()
        };
        self.add_all(members);
        SupplementGuard {
            lock: self.clone(),
            added,
        }
    }
}

impl Clone for MemberLock {
    fn clone(&self) -> Self {
        MemberLock {
            data: Arc::clone(&self.data),
        }
    }
}

impl Drop for MemberLock {
    fn drop(&mut self) {
        // Release only when the last clone goes away.
        if let Some(mutex) = Arc::get_mut(&mut self.data) {
            let inner = mutex.get_mut();
            if inner.locked {
                release_all(&inner.members, inner.write);
                inner.locked = false;
            }
        }
    }
}

impl std::fmt::Debug for MemberLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.data.lock();
        f.debug_struct("MemberLock")
            .field("members", &inner.members.len())
            .field("write", &inner.write)
            .field("locked", &inner.locked)
            .finish()
    }
}

/// RAII guard returned by [`MemberLock::supplement`]; removes the
/// supplemented members on drop.
pub struct SupplementGuard {
    lock: MemberLock,
    added: Vec<MemberHandle>,
}

impl Drop for SupplementGuard {
    fn drop(&mut self) {
        for m in self.added.drain(..) {
            // Dropping the split-off lock releases the member's claim.
            let _ = self.lock.remove_one(&m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{Member, MemberCore};
    use std::sync::Arc;

    struct Plain {
        core: MemberCore,
    }

    impl Plain {
        fn handle() -> MemberHandle {
            MemberHandle::new(Arc::new(Plain {
                core: MemberCore::new(),
            }))
        }
    }

    impl Member for Plain {
        fn core(&self) -> &MemberCore {
            &self.core
        }
    }

    #[test]
    fn exclusive_excludes_and_shared_coexists() {
        let a = Plain::handle();
        let b = Plain::handle();

        let w = MemberLock::acquire(true, [a.clone(), b.clone()]);
        assert!(w.is_locked() && w.is_write());

        let r = MemberLock::released(false, [a.clone()]);
        assert!(!r.try_lock().unwrap());
        w.unlock().unwrap();
        assert!(r.try_lock().unwrap());

        // A second reader gets in while the first still holds.
        let r2 = MemberLock::released(false, [a.clone()]);
        assert!(r2.try_lock().unwrap());

        // A writer cannot get in until both readers are gone.
        let w2 = MemberLock::released(true, [a.clone()]);
        assert!(!w2.try_lock().unwrap());
        r.unlock().unwrap();
        assert!(!w2.try_lock().unwrap());
        r2.unlock().unwrap();
        assert!(w2.try_lock().unwrap());
    }

    #[test]
    fn lock_state_errors() {
        let a = Plain::handle();
        let l = MemberLock::acquire(true, [a.clone()]);
        assert!(matches!(l.lock(), Err(Error::LockInvalidState(_))));
        l.unlock().unwrap();
        assert!(matches!(l.unlock(), Err(Error::LockInvalidState(_))));
        l.lock().unwrap();
    }

    #[test]
    fn mode_conversion_shares_state_across_clones() {
        let a = Plain::handle();
        let l = MemberLock::acquire(false, [a.clone()]);
        let l2 = l.clone();
        l.write();
        assert!(l2.is_write() && l2.is_locked());
        l2.read();
        assert!(l.is_read());
    }

    #[test]
    fn add_remove_round_trip() {
        let a = Plain::handle();
        let b = Plain::handle();
        let l = MemberLock::acquire(true, [a.clone()]);
        l.add(&b);
        assert_eq!(l.len(), 2);

        let split = l.remove([b.clone()]).unwrap();
        assert_eq!(l.len(), 1);
        assert!(split.is_locked() && split.is_write());
        assert_eq!(split.len(), 1);

        // b is still exclusively held, via the split lock.
        let probe = MemberLock::released(false, [b.clone()]);
        assert!(!probe.try_lock().unwrap());
        drop(split);
        assert!(probe.try_lock().unwrap());
    }

    #[test]
    fn remove_absent_member_fails() {
        let a = Plain::handle();
        let b = Plain::handle();
        let l = MemberLock::acquire(true, [a]);
        assert!(matches!(
            l.remove([b.clone()]),
            Err(Error::NotFound { id }) if id == b.id()
        ));
    }

    #[test]
    fn transfer_requires_matching_mode_and_state() {
        let a = Plain::handle();
        let b = Plain::handle();
        let l1 = MemberLock::acquire(true, [a.clone()]);
        let l2 = MemberLock::acquire(false, [b.clone()]);
        assert!(matches!(l1.transfer(&l2), Err(Error::LockMismatch)));

        l2.write();
        l1.transfer(&l2).unwrap();
        assert_eq!(l1.len(), 2);
        assert!(l2.is_empty() && l2.is_fake());
    }

    #[test]
    fn supplement_restores_on_scope_exit() {
        let a = Plain::handle();
        let b = Plain::handle();
        let l = MemberLock::acquire(true, [a.clone()]);
        {
            let _extra = l.supplement([b.clone()]);
            assert_eq!(l.len(), 2);
            let probe = MemberLock::released(false, [b.clone()]);
            assert!(!probe.try_lock().unwrap());
        }
        assert_eq!(l.len(), 1);
        let probe = MemberLock::released(false, [b.clone()]);
        assert!(probe.try_lock().unwrap());
    }

    #[test]
    fn fake_lock_tracks_state_only() {
        let l = MemberLock::fake(false);
        assert!(l.is_fake() && l.is_locked() && l.is_read());
        l.write();
        assert!(l.is_write());
        l.unlock().unwrap();
        assert!(!l.is_locked());
        assert!(matches!(l.unlock(), Err(Error::LockInvalidState(_))));
        l.lock().unwrap();
        assert!(l.is_locked());
    }

    #[test]
    fn opposing_order_acquisition_does_not_deadlock() {
        // Two threads lock {x, y} built in opposite orders, one exclusive,
        // one shared, many times.  Completion within the test timeout is the
        // assertion.
        let x = Plain::handle();
        let y = Plain::handle();

        let t1 = {
            let (x, y) = (x.clone(), y.clone());
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let l = MemberLock::acquire(true, [x.clone(), y.clone()]);
                    l.unlock().unwrap();
                }
            })
        };
        let t2 = {
            let (x, y) = (x.clone(), y.clone());
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let l = MemberLock::acquire(false, [y.clone(), x.clone()]);
                    l.unlock().unwrap();
                }
            })
        };
        t1.join().unwrap();
        t2.join().unwrap();
    }
}
