//! Multi-good quantity containers.
//!
//! A bundle maps good ids to real quantities.  Two variants exist:
//!
//! - [`BundleSigned`]: any finite quantity, positive or negative.
//! - [`Bundle`]: the non-negative refinement.  Every read operation of
//!   `BundleSigned` is available through `Deref`; every write is re-exposed
//!   with a negativity check that fails with
//!   [`Error::Negativity`](crate::Error::Negativity) and rolls back.
//!
//! Absent goods read as zero and do not appear in iteration or `len()`.
//!
//! # Transactions
//!
//! Each bundle owns a stack of full quantity snapshots; the top of the stack
//! is the visible state.  [`begin_transaction`](BundleSigned::begin_transaction)
//! pushes a copy, `commit` propagates the top downward, `abort` discards it.
//! An *encompassing* frame absorbs nested begin/commit/abort triples into
//! no-ops (they must still be matched).  Compound mutations on the
//! non-negative variant run inside their own transaction, so a failed
//! operation leaves the bundle untouched.
//!
//! # Comparisons
//!
//! Bundle-vs-bundle relations hold iff they hold for *every* good present in
//! either operand (absent goods read as 0).  The resulting order is not
//! total: `a.ge(&b)` and `b.ge(&a)` can both be false, and `a.ge(&b)` does
//! not imply `a.gt(&b) || a == b`.  Only `==`/`!=` are each other's
//! negation.  Scalar comparisons quantify over the *present* goods only and
//! are vacuously true on an empty bundle (except `any_ne`).  Note that
//! `all_eq(0.0)` and `is_empty()` differ: a bundle holding an explicit zero
//! quantity is zero-equivalent but not empty.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::id::GoodId;

/// Default relative tolerance for [`BundleSigned::transfer`] and the
/// `has_approx` predicates.
pub const DEFAULT_TRANSFER_EPSILON: f64 = 1e-12;

// ============================================================================
// Encompassing bookkeeping
// ============================================================================

/// One encompassing scope.  `Real` frames were opened by
/// `begin_transaction(true)` and own a snapshot; `Fake` frames come from
/// `begin_encompassing` and own nothing.  `pending` counts absorbed nested
/// begins that still await their matching commit/abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EncKind {
    Real,
    Fake,
}

#[derive(Clone, Debug)]
struct Encompass {
    kind: EncKind,
    pending: usize,
}

// ============================================================================
// BundleSigned
// ============================================================================

/// A signed multi-good quantity container.  See the module docs.
#[derive(Clone, Debug)]
pub struct BundleSigned {
    /// Snapshot stack; the last element is the visible state.  Depth ≥ 1.
    frames: Vec<HashMap<GoodId, f64>>,
    encompassed: Vec<Encompass>,
}

impl BundleSigned {
    /// Creates an empty bundle.
    pub fn new() -> BundleSigned {
        BundleSigned {
            frames: vec![HashMap::new()],
            encompassed: Vec::new(),
        }
    }

    /// Creates a bundle holding a single good.
    pub fn single(good: GoodId, quantity: f64) -> BundleSigned {
        let mut b = BundleSigned::new();
        b.set(good, quantity);
        b
    }

    fn top(&self) -> &HashMap<GoodId, f64> {
        self.frames.last().expect("bundle frame stack is never empty")
    }

    fn top_mut(&mut self) -> &mut HashMap<GoodId, f64> {
        self.frames.last_mut().expect("bundle frame stack is never empty")
    }

    /// Quantity of `good`; 0 if absent.
    pub fn get(&self, good: GoodId) -> f64 {
        self.top().get(&good).copied().unwrap_or(0.0)
    }

    /// Sets the quantity of `good`.
    pub fn set(&mut self, good: GoodId, quantity: f64) {
        self.top_mut().insert(good, quantity);
    }

    /// Removes `good`; true if it was present.
    pub fn erase(&mut self, good: GoodId) -> bool {
        self.top_mut().remove(&good).is_some()
    }

    /// Removes `good` and returns its previous quantity (0 if absent).
    pub fn remove(&mut self, good: GoodId) -> f64 {
        self.top_mut().remove(&good).unwrap_or(0.0)
    }

    /// Drops every good whose quantity is exactly 0.
    pub fn clear_zeros(&mut self) {
        self.top_mut().retain(|_, q| *q != 0.0);
    }

    /// Number of goods present (including explicit zeros).
    pub fn len(&self) -> usize {
        self.top().len()
    }

    /// True if no goods are present.  Distinct from zero-equivalence; see
    /// the module docs.
    pub fn is_empty(&self) -> bool {
        self.top().is_empty()
    }

    /// Iterates over the present `(good, quantity)` pairs.  Order is
    /// unspecified but stable between mutations.
    pub fn iter(&self) -> impl Iterator<Item = (GoodId, f64)> + '_ {
        self.top().iter().map(|(g, q)| (*g, *q))
    }

    /// Iterates over the present good ids.
    pub fn goods(&self) -> impl Iterator<Item = GoodId> + '_ {
        self.top().keys().copied()
    }

    /// True if `good` is present (even with quantity 0).
    pub fn contains(&self, good: GoodId) -> bool {
        self.top().contains_key(&good)
    }

    // ------------------------------------------------------------------
    // Sign splits
    // ------------------------------------------------------------------

    /// The strictly positive part, as a non-negative bundle.
    pub fn positive(&self) -> Bundle {
        let mut out = BundleSigned::new();
        for (g, q) in self.iter() {
            if q > 0.0 {
                out.set(g, q);
            }
        }
        Bundle { inner: out }
    }

    /// The strictly negative part, negated into a non-negative bundle.
    pub fn negative(&self) -> Bundle {
        let mut out = BundleSigned::new();
        for (g, q) in self.iter() {
            if q < 0.0 {
                out.set(g, -q);
            }
        }
        Bundle { inner: out }
    }

    /// The goods present with a quantity of exactly 0.
    pub fn zeros(&self) -> Bundle {
        let mut out = BundleSigned::new();
        for (g, q) in self.iter() {
            if q == 0.0 {
                out.set(g, 0.0);
            }
        }
        Bundle { inner: out }
    }

    // ------------------------------------------------------------------
    // Comparisons (non-total; see module docs)
    // ------------------------------------------------------------------

    fn compare_all(&self, other: &BundleSigned, rel: impl Fn(f64, f64) -> bool) -> bool {
        for (g, q) in self.iter() {
            if !rel(q, other.get(g)) {
                return false;
            }
        }
        for (g, q) in other.iter() {
            if !self.contains(g) && !rel(0.0, q) {
                return false;
            }
        }
        true
    }

    /// True iff every quantity in `self` is at least the matching quantity
    /// in `other`.
    pub fn ge(&self, other: &BundleSigned) -> bool {
        self.compare_all(other, |a, b| a >= b)
    }

    /// True iff every quantity in `self` strictly exceeds the matching
    /// quantity in `other`.
    pub fn gt(&self, other: &BundleSigned) -> bool {
        self.compare_all(other, |a, b| a > b)
    }

    pub fn le(&self, other: &BundleSigned) -> bool {
        self.compare_all(other, |a, b| a <= b)
    }

    pub fn lt(&self, other: &BundleSigned) -> bool {
        self.compare_all(other, |a, b| a < b)
    }

    /// True iff every *present* quantity is ≥ `q`.  Vacuously true when
    /// empty.
    pub fn all_ge(&self, q: f64) -> bool {
        self.iter().all(|(_, v)| v >= q)
    }

    pub fn all_gt(&self, q: f64) -> bool {
        self.iter().all(|(_, v)| v > q)
    }

    pub fn all_le(&self, q: f64) -> bool {
        self.iter().all(|(_, v)| v <= q)
    }

    pub fn all_lt(&self, q: f64) -> bool {
        self.iter().all(|(_, v)| v < q)
    }

    /// True iff every *present* quantity equals `q`.  Vacuously true when
    /// empty: `all_eq(0.0)` on `{g: 0}` and on `{}` are both true even
    /// though only the latter `is_empty()`.
    pub fn all_eq(&self, q: f64) -> bool {
        self.iter().all(|(_, v)| v == q)
    }

    /// Negation of [`all_eq`](BundleSigned::all_eq).
    pub fn any_ne(&self, q: f64) -> bool {
        !self.all_eq(q)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Opens a transaction.  With `encompassing`, transactions begun before
    /// this one ends are absorbed into it (their begin/commit/abort calls
    /// become matched no-ops).  Inside an existing encompassing scope this
    /// is itself absorbed.
    pub fn begin_transaction(&mut self, encompassing: bool) {
        if let Some(top) = self.encompassed.last_mut() {
            top.pending += 1;
            return;
        }
        let snapshot = self.top().clone();
        self.frames.push(snapshot);
        if encompassing {
            self.encompassed.push(Encompass {
                kind: EncKind::Real,
                pending: 0,
            });
        }
    }

    /// Commits the innermost open transaction, propagating its quantities
    /// into the enclosing frame (or the base state).
    pub fn commit_transaction(&mut self) -> Result<()> {
        if let Some(top) = self.encompassed.last_mut() {
            if top.pending > 0 {
                top.pending -= 1;
                return Ok(());
            }
            match top.kind {
                EncKind::Real => {
                    // This commit matches the encompassing begin itself.
                    self.encompassed.pop();
                }
                EncKind::Fake => {
                    return Err(Error::NoTransaction(
                        "commit inside begin_encompassing with no open transaction",
                    ));
                }
            }
        } else if self.frames.len() < 2 {
            return Err(Error::NoTransaction("commit with no open transaction"));
        }
        let committed = self.frames.pop().expect("depth checked above");
        *self.top_mut() = committed;
        Ok(())
    }

    /// Aborts the innermost open transaction, restoring the quantities from
    /// before the matching begin.  Inside an encompassing scope the abort is
    /// absorbed (the changes stand).
    pub fn abort_transaction(&mut self) -> Result<()> {
        if let Some(top) = self.encompassed.last_mut() {
            if top.pending > 0 {
                top.pending -= 1;
                return Ok(());
            }
            match top.kind {
                EncKind::Real => {
                    self.encompassed.pop();
                }
                EncKind::Fake => {
                    return Err(Error::NoTransaction(
                        "abort inside begin_encompassing with no open transaction",
                    ));
                }
            }
        } else if self.frames.len() < 2 {
            return Err(Error::NoTransaction("abort with no open transaction"));
        }
        self.frames.pop();
        Ok(())
    }

    /// Starts a fake encompassing scope: until [`end_encompassing`]
    /// (BundleSigned::end_encompassing), begin/commit/abort triples are
    /// tracked but perform no snapshotting.
    pub fn begin_encompassing(&mut self) {
        self.encompassed.push(Encompass {
            kind: EncKind::Fake,
            pending: 0,
        });
    }

    /// Ends a fake encompassing scope.  Fails if no such scope is open or
    /// if an absorbed begin inside it is still unmatched.
    pub fn end_encompassing(&mut self) -> Result<()> {
        match self.encompassed.last() {
            Some(enc) if enc.kind == EncKind::Fake => {
                if enc.pending > 0 {
                    return Err(Error::NoTransaction(
                        "end_encompassing with outstanding absorbed transactions",
                    ));
                }
                self.encompassed.pop();
                Ok(())
            }
            _ => Err(Error::NoTransaction(
                "end_encompassing without begin_encompassing",
            )),
        }
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Approximately, atomically moves quantities between this bundle and
    /// `to`: positive entries of `amount` move from `self` into `to`,
    /// negative entries the other way.  Per good, if the giving side would
    /// be left within `epsilon` (relative) of zero the full quantity moves
    /// instead; failing that, a receiving side that would land within
    /// `epsilon` of zero (only possible when it starts negative) is rounded
    /// to exactly zero.  If a non-negative side would still end up negative
    /// the whole transfer fails atomically and neither bundle is mutated.
    ///
    /// Returns the exact amount transferred, oriented like `amount`.
    /// `clear_zeros` runs on both bundles and the returned delta.
    pub fn transfer<'a, T>(
        &mut self,
        amount: &BundleSigned,
        to: T,
        epsilon: f64,
    ) -> Result<BundleSigned>
    where
        T: Into<TransferTarget<'a>>,
    {
        let target = to.into();
        transfer_impl(
            Side {
                bundle: self,
                non_negative: false,
            },
            amount,
            Some(Side {
                bundle: target.signed,
                non_negative: target.non_negative,
            }),
            epsilon,
        )
    }

    /// One-sided transfer: removes `amount` from this bundle (negative
    /// entries add to it) and returns the exact delta.  Same rounding and
    /// atomicity rules as [`transfer`](BundleSigned::transfer).
    pub fn transfer_out(&mut self, amount: &BundleSigned, epsilon: f64) -> Result<BundleSigned> {
        transfer_impl(
            Side {
                bundle: self,
                non_negative: false,
            },
            amount,
            None,
            epsilon,
        )
    }

    /// Moves everything in this bundle into `to`, leaving it empty.
    pub fn transfer_to<'a, T>(&mut self, to: T, epsilon: f64) -> Result<BundleSigned>
    where
        T: Into<TransferTarget<'a>>,
    {
        let amount = self.clone();
        let moved = self.transfer(&amount, to, epsilon)?;
        // Residual dust from rounding is dropped outright.
        *self.top_mut() = HashMap::new();
        Ok(moved)
    }

    /// True if this bundle holds approximately enough of each positive
    /// entry of `amount`, and `to` approximately enough of each negative
    /// entry, for [`transfer`](BundleSigned::transfer) to succeed.
    pub fn has_approx(&self, amount: &BundleSigned, to: &BundleSigned, epsilon: f64) -> bool {
        amount.iter().all(|(g, q)| {
            if q > 0.0 {
                side_has_approx(self.get(g), q, epsilon)
            } else if q < 0.0 {
                side_has_approx(to.get(g), -q, epsilon)
            } else {
                true
            }
        })
    }

    /// One-sided [`has_approx`](BundleSigned::has_approx): negative entries
    /// of `amount` are ignored.
    pub fn has_approx_out(&self, amount: &BundleSigned, epsilon: f64) -> bool {
        amount
            .iter()
            .filter(|&(_, q)| q > 0.0)
            .all(|(g, q)| side_has_approx(self.get(g), q, epsilon))
    }
}

/// A giving side can satisfy `needed` if it holds it outright, or holds it
/// up to the relative epsilon the transfer rounding would forgive.
fn side_has_approx(available: f64, needed: f64, epsilon: f64) -> bool {
    available >= needed || (available - needed).abs() <= epsilon * available.abs()
}

impl Default for BundleSigned {
    fn default() -> Self {
        BundleSigned::new()
    }
}

impl<const N: usize> From<[(GoodId, f64); N]> for BundleSigned {
    fn from(pairs: [(GoodId, f64); N]) -> Self {
        let mut b = BundleSigned::new();
        for (g, q) in pairs {
            b.set(g, q);
        }
        b
    }
}

impl FromIterator<(GoodId, f64)> for BundleSigned {
    fn from_iter<I: IntoIterator<Item = (GoodId, f64)>>(iter: I) -> Self {
        let mut b = BundleSigned::new();
        for (g, q) in iter {
            b.set(g, q);
        }
        b
    }
}

impl PartialEq for BundleSigned {
    fn eq(&self, other: &Self) -> bool {
        self.compare_all(other, |a, b| a == b)
    }
}

impl fmt::Display for BundleSigned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BundleSigned(")?;
        let mut first = true;
        for (g, q) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "[{g}]={q}")?;
        }
        write!(f, ")")
    }
}

// ----------------------------------------------------------------------
// Signed arithmetic (infallible)
// ----------------------------------------------------------------------

impl AddAssign<&BundleSigned> for BundleSigned {
    fn add_assign(&mut self, rhs: &BundleSigned) {
        for (g, q) in rhs.iter() {
            let cur = self.get(g);
            self.set(g, cur + q);
        }
    }
}

impl SubAssign<&BundleSigned> for BundleSigned {
    fn sub_assign(&mut self, rhs: &BundleSigned) {
        for (g, q) in rhs.iter() {
            let cur = self.get(g);
            self.set(g, cur - q);
        }
    }
}

impl Add<&BundleSigned> for &BundleSigned {
    type Output = BundleSigned;
    fn add(self, rhs: &BundleSigned) -> BundleSigned {
        let mut out = fresh_copy(self);
        out += rhs;
        out
    }
}

impl Sub<&BundleSigned> for &BundleSigned {
    type Output = BundleSigned;
    fn sub(self, rhs: &BundleSigned) -> BundleSigned {
        let mut out = fresh_copy(self);
        out -= rhs;
        out
    }
}

impl Neg for &BundleSigned {
    type Output = BundleSigned;
    fn neg(self) -> BundleSigned {
        self.iter().map(|(g, q)| (g, -q)).collect()
    }
}

impl Mul<f64> for &BundleSigned {
    type Output = BundleSigned;
    fn mul(self, k: f64) -> BundleSigned {
        self.iter().map(|(g, q)| (g, q * k)).collect()
    }
}

impl Mul<&BundleSigned> for f64 {
    type Output = BundleSigned;
    fn mul(self, b: &BundleSigned) -> BundleSigned {
        b * self
    }
}

impl Div<f64> for &BundleSigned {
    type Output = BundleSigned;
    fn div(self, k: f64) -> BundleSigned {
        self.iter().map(|(g, q)| (g, q / k)).collect()
    }
}

impl BundleSigned {
    /// Scales every quantity in place.
    pub fn scale(&mut self, k: f64) {
        let goods: Vec<GoodId> = self.goods().collect();
        for g in goods {
            let cur = self.get(g);
            self.set(g, cur * k);
        }
    }
}

/// Copies only the visible quantities: value-producing operators never
/// inherit the source's transaction stack.
fn fresh_copy(b: &BundleSigned) -> BundleSigned {
    b.iter().collect()
}

// ============================================================================
// Bundle (non-negative)
// ============================================================================

/// The non-negative bundle: a [`BundleSigned`] whose every observable
/// quantity is ≥ 0.  All read operations are available through `Deref`;
/// writes are checked and fail with [`Error::Negativity`].
#[derive(Clone, Debug, Default)]
pub struct Bundle {
    inner: BundleSigned,
}

impl Bundle {
    pub fn new() -> Bundle {
        Bundle {
            inner: BundleSigned::new(),
        }
    }

    /// A bundle holding a single good.  Fails on a negative quantity.
    pub fn single(good: GoodId, quantity: f64) -> Result<Bundle> {
        let mut b = Bundle::new();
        b.set(good, quantity)?;
        Ok(b)
    }

    /// Builds from pairs, rejecting any negative quantity.
    pub fn from_pairs<I: IntoIterator<Item = (GoodId, f64)>>(pairs: I) -> Result<Bundle> {
        let mut b = Bundle::new();
        for (g, q) in pairs {
            b.set(g, q)?;
        }
        Ok(b)
    }

    /// Sets the quantity of `good`; fails if `quantity < 0`.
    pub fn set(&mut self, good: GoodId, quantity: f64) -> Result<()> {
        if quantity < 0.0 {
            return Err(Error::Negativity {
                good,
                value: quantity,
            });
        }
        self.inner.set(good, quantity);
        Ok(())
    }

    pub fn erase(&mut self, good: GoodId) -> bool {
        self.inner.erase(good)
    }

    pub fn remove(&mut self, good: GoodId) -> f64 {
        self.inner.remove(good)
    }

    pub fn clear_zeros(&mut self) {
        self.inner.clear_zeros();
    }

    /// Adds a signed bundle in place, transactionally: if any resulting
    /// quantity would be negative, nothing changes.
    pub fn add_assign_checked(&mut self, rhs: &BundleSigned) -> Result<()> {
        self.apply_checked(rhs, 1.0)
    }

    /// Subtracts a signed bundle in place, transactionally.
    pub fn sub_assign_checked(&mut self, rhs: &BundleSigned) -> Result<()> {
        self.apply_checked(rhs, -1.0)
    }

    fn apply_checked(&mut self, rhs: &BundleSigned, sign: f64) -> Result<()> {
        self.inner.begin_transaction(false);
        for (g, q) in rhs.iter() {
            let v = self.inner.get(g) + sign * q;
            if v < 0.0 {
                self.inner
                    .abort_transaction()
                    .expect("transaction opened above");
                return Err(Error::Negativity { good: g, value: v });
            }
            self.inner.set(g, v);
        }
        self.inner
            .commit_transaction()
            .expect("transaction opened above");
        Ok(())
    }

    /// `self − rhs`, failing if any quantity would go negative.
    pub fn checked_sub(&self, rhs: &BundleSigned) -> Result<Bundle> {
        let mut out = self.fresh();
        out.sub_assign_checked(rhs)?;
        Ok(out)
    }

    /// `self + rhs` for a signed right-hand side, failing if any quantity
    /// would go negative.
    pub fn checked_add(&self, rhs: &BundleSigned) -> Result<Bundle> {
        let mut out = self.fresh();
        out.add_assign_checked(rhs)?;
        Ok(out)
    }

    /// Scales in place; fails on a negative factor.
    pub fn scale_checked(&mut self, k: f64) -> Result<()> {
        if k < 0.0 {
            return Err(Error::Domain(format!(
                "cannot scale a non-negative bundle by {k}"
            )));
        }
        self.inner.scale(k);
        Ok(())
    }

    fn fresh(&self) -> Bundle {
        Bundle {
            inner: fresh_copy(&self.inner),
        }
    }

    // ------------------------------------------------------------------
    // Transactions (delegated)
    // ------------------------------------------------------------------

    pub fn begin_transaction(&mut self, encompassing: bool) {
        self.inner.begin_transaction(encompassing);
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        self.inner.commit_transaction()
    }

    pub fn abort_transaction(&mut self) -> Result<()> {
        self.inner.abort_transaction()
    }

    pub fn begin_encompassing(&mut self) {
        self.inner.begin_encompassing();
    }

    pub fn end_encompassing(&mut self) -> Result<()> {
        self.inner.end_encompassing()
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// See [`BundleSigned::transfer`]; this side additionally refuses to go
    /// negative.
    pub fn transfer<'a, T>(
        &mut self,
        amount: &BundleSigned,
        to: T,
        epsilon: f64,
    ) -> Result<BundleSigned>
    where
        T: Into<TransferTarget<'a>>,
    {
        let target = to.into();
        transfer_impl(
            Side {
                bundle: &mut self.inner,
                non_negative: true,
            },
            amount,
            Some(Side {
                bundle: target.signed,
                non_negative: target.non_negative,
            }),
            epsilon,
        )
    }

    /// See [`BundleSigned::transfer_out`].
    pub fn transfer_out(&mut self, amount: &BundleSigned, epsilon: f64) -> Result<BundleSigned> {
        transfer_impl(
            Side {
                bundle: &mut self.inner,
                non_negative: true,
            },
            amount,
            None,
            epsilon,
        )
    }

    /// See [`BundleSigned::transfer_to`].
    pub fn transfer_to<'a, T>(&mut self, to: T, epsilon: f64) -> Result<BundleSigned>
    where
        T: Into<TransferTarget<'a>>,
    {
        let amount = self.inner.clone();
        let moved = self.transfer(&amount, to, epsilon)?;
        *self.inner.top_mut() = HashMap::new();
        Ok(moved)
    }

    // ------------------------------------------------------------------
    // Coverage family (non-negative only)
    // ------------------------------------------------------------------

    /// True iff this bundle has a strictly positive quantity of every good
    /// `other` holds a strictly positive quantity of.
    pub fn covers(&self, other: &Bundle) -> bool {
        other
            .iter()
            .filter(|&(_, q)| q > 0.0)
            .all(|(g, _)| self.get(g) > 0.0)
    }

    /// The minimum `m ≥ 0` with `m·other ≥ self`.  +∞ if `other` lacks a
    /// strictly positive quantity of some good this bundle holds
    /// positively; NaN if both bundles are zero-equivalent.
    pub fn coverage(&self, other: &Bundle) -> f64 {
        let mut m: f64 = 0.0;
        let mut any_positive = false;
        for (g, q) in self.iter() {
            if q <= 0.0 {
                continue;
            }
            any_positive = true;
            let d = other.get(g);
            if d <= 0.0 {
                return f64::INFINITY;
            }
            m = m.max(q / d);
        }
        if any_positive {
            m
        } else if other.iter().any(|(_, q)| q > 0.0) {
            0.0
        } else {
            f64::NAN
        }
    }

    /// The excess `other · coverage(other) − self`, zeros stripped.  Fails
    /// (with the uncovered good) when the coverage is infinite.
    pub fn coverage_excess(&self, other: &Bundle) -> Result<Bundle> {
        let m = self.coverage(other);
        if m.is_infinite() {
            let uncovered = self
                .iter()
                .find(|&(g, q)| q > 0.0 && other.get(g) <= 0.0)
                .map(|(g, _)| g)
                .expect("infinite coverage implies an uncovered good");
            return Err(Error::Negativity {
                good: uncovered,
                value: -self.get(uncovered),
            });
        }
        let mut out = Bundle::new();
        if m.is_nan() {
            return Ok(out);
        }
        for g in self.goods().chain(other.goods()) {
            if out.contains(g) {
                continue;
            }
            // Mathematically ≥ 0; clamp the one-ulp undershoot at the
            // binding good.
            let v = (other.get(g) * m - self.get(g)).max(0.0);
            if v != 0.0 {
                out.set(g, v).expect("clamped non-negative");
            }
        }
        Ok(out)
    }

    /// The largest `m ≥ 0` with `self ≥ m·other`.  0 if some positive good
    /// of `other` is missing here; +∞ if `other` is zero-equivalent while
    /// this bundle is not; NaN if both are zero-equivalent.
    pub fn multiples(&self, other: &Bundle) -> f64 {
        let mut m = f64::INFINITY;
        let mut any_divisor = false;
        for (g, q) in other.iter() {
            if q <= 0.0 {
                continue;
            }
            any_divisor = true;
            m = m.min(self.get(g) / q);
        }
        if any_divisor {
            m
        } else if self.iter().any(|(_, q)| q > 0.0) {
            f64::INFINITY
        } else {
            f64::NAN
        }
    }

    /// The elementwise minimum over goods present in both operands, with
    /// negative quantities treated as absent.
    pub fn common(a: &BundleSigned, b: &BundleSigned) -> Bundle {
        let mut out = Bundle::new();
        for (g, qa) in a.iter() {
            if qa < 0.0 || !b.contains(g) {
                continue;
            }
            let qb = b.get(g);
            if qb < 0.0 {
                continue;
            }
            out.set(g, qa.min(qb)).expect("min of non-negatives");
        }
        out
    }

    /// [`common`](Bundle::common), subtracted out of both operands.  The
    /// distinct `&mut` receivers make a same-object call unrepresentable.
    pub fn reduce<'a, 'b, A, B>(a: A, b: B) -> Bundle
    where
        A: Into<TransferTarget<'a>>,
        B: Into<TransferTarget<'b>>,
    {
        let a = a.into();
        let b = b.into();
        let c = Bundle::common(a.signed, b.signed);
        // The common part never exceeds either side, so direct subtraction
        // preserves non-negativity for both variants.
        for (g, q) in c.iter() {
            let va = a.signed.get(g) - q;
            a.signed.set(g, va);
            let vb = b.signed.get(g) - q;
            b.signed.set(g, vb);
        }
        c
    }
}

impl std::ops::Deref for Bundle {
    type Target = BundleSigned;
    fn deref(&self) -> &BundleSigned {
        &self.inner
    }
}

impl From<Bundle> for BundleSigned {
    fn from(b: Bundle) -> BundleSigned {
        b.inner
    }
}

impl TryFrom<BundleSigned> for Bundle {
    type Error = Error;
    fn try_from(b: BundleSigned) -> Result<Bundle> {
        if let Some((good, value)) = b.iter().find(|&(_, q)| q < 0.0) {
            return Err(Error::Negativity { good, value });
        }
        Ok(Bundle { inner: b })
    }
}

impl PartialEq for Bundle {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl PartialEq<BundleSigned> for Bundle {
    fn eq(&self, other: &BundleSigned) -> bool {
        self.inner == *other
    }
}

impl PartialEq<Bundle> for BundleSigned {
    fn eq(&self, other: &Bundle) -> bool {
        *self == other.inner
    }
}

impl Add<&Bundle> for &Bundle {
    type Output = Bundle;
    fn add(self, rhs: &Bundle) -> Bundle {
        let mut out = self.fresh();
        for (g, q) in rhs.iter() {
            let v = out.get(g) + q;
            out.set(g, v).expect("sum of non-negatives");
        }
        out
    }
}

impl Neg for &Bundle {
    type Output = BundleSigned;
    fn neg(self) -> BundleSigned {
        -&self.inner
    }
}

impl Mul<f64> for &Bundle {
    type Output = Bundle;
    /// Panics on a negative factor; use [`BundleSigned`] for negative
    /// scaling.
    fn mul(self, k: f64) -> Bundle {
        assert!(
            k >= 0.0 || k.is_nan(),
            "cannot scale a non-negative bundle by {k}"
        );
        Bundle {
            inner: &self.inner * k,
        }
    }
}

impl Mul<&Bundle> for f64 {
    type Output = Bundle;
    fn mul(self, b: &Bundle) -> Bundle {
        b * self
    }
}

impl Div<f64> for &Bundle {
    type Output = Bundle;
    /// Panics on a negative divisor.
    fn div(self, k: f64) -> Bundle {
        assert!(
            k >= 0.0 || k.is_nan(),
            "cannot scale a non-negative bundle by 1/{k}"
        );
        Bundle {
            inner: &self.inner / k,
        }
    }
}

impl fmt::Display for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bundle(")?;
        let mut first = true;
        for (g, q) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "[{g}]={q}")?;
        }
        write!(f, ")")
    }
}

// ============================================================================
// Transfer machinery
// ============================================================================

/// A mutable transfer destination: either bundle variant.  Constructed only
/// through the `From` impls below, so the non-negative invariant cannot be
/// bypassed from outside.
pub struct TransferTarget<'a> {
    signed: &'a mut BundleSigned,
    non_negative: bool,
}

impl<'a> From<&'a mut BundleSigned> for TransferTarget<'a> {
    fn from(b: &'a mut BundleSigned) -> Self {
        TransferTarget {
            signed: b,
            non_negative: false,
        }
    }
}

impl<'a> From<&'a mut Bundle> for TransferTarget<'a> {
    fn from(b: &'a mut Bundle) -> Self {
        TransferTarget {
            signed: &mut b.inner,
            non_negative: true,
        }
    }
}

struct Side<'a> {
    bundle: &'a mut BundleSigned,
    non_negative: bool,
}

/// Shared body of the two- and one-sided transfers.  Runs inside a
/// transaction on every involved bundle; aborts all of them on failure.
fn transfer_impl<'a>(
    mut from: Side<'a>,
    amount: &BundleSigned,
    mut to: Option<Side<'a>>,
    epsilon: f64,
) -> Result<BundleSigned> {
    from.bundle.begin_transaction(false);
    if let Some(t) = to.as_mut() {
        t.bundle.begin_transaction(false);
    }

    let mut delta = BundleSigned::new();
    let mut failure: Option<Error> = None;

    'apply: for (g, q) in amount.iter() {
        if q == 0.0 {
            continue;
        }
        // Orient so that `giver` loses |q| and `taker` gains it.  In the
        // one-sided form the missing side simply doesn't exist.
        let (giver, taker): (Option<&mut Side>, Option<&mut Side>) = if q > 0.0 {
            (Some(&mut from), to.as_mut())
        } else {
            match to.as_mut() {
                Some(t) => (Some(t), Some(&mut from)),
                None => (None, Some(&mut from)),
            }
        };
        let mut amt = q.abs();

        let mut rounded_at_source = false;
        if let Some(giver) = &giver {
            let before = giver.bundle.get(g);
            let after = before - amt;
            if after.abs() <= epsilon * before.abs() {
                amt = before;
                rounded_at_source = true;
            }
        }
        if !rounded_at_source {
            if let Some(taker) = &taker {
                let before = taker.bundle.get(g);
                let after = before + amt;
                if after.abs() <= epsilon * before.abs() {
                    amt = -before;
                }
            }
        }

        if let Some(giver) = giver {
            let v = giver.bundle.get(g) - amt;
            if giver.non_negative && v < 0.0 {
                failure = Some(Error::Negativity { good: g, value: v });
                break 'apply;
            }
            giver.bundle.set(g, v);
        }
        if let Some(taker) = taker {
            let v = taker.bundle.get(g) + amt;
            if taker.non_negative && v < 0.0 {
                failure = Some(Error::Negativity { good: g, value: v });
                break 'apply;
            }
            taker.bundle.set(g, v);
        }
        delta.set(g, if q > 0.0 { amt } else { -amt });
    }

    if let Some(err) = failure {
        from.bundle
            .abort_transaction()
            .expect("transaction opened above");
        if let Some(t) = to.as_mut() {
            t.bundle
                .abort_transaction()
                .expect("transaction opened above");
        }
        return Err(err);
    }

    from.bundle
        .commit_transaction()
        .expect("transaction opened above");
    from.bundle.clear_zeros();
    if let Some(t) = to.as_mut() {
        t.bundle
            .commit_transaction()
            .expect("transaction opened above");
        t.bundle.clear_zeros();
    }
    delta.clear_zeros();
    Ok(delta)
}

// ============================================================================
// Serde: the visible frame only, as (good, quantity) pairs
// ============================================================================

impl Serialize for BundleSigned {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut pairs: Vec<(GoodId, f64)> = self.iter().collect();
        pairs.sort_by_key(|(g, _)| *g);
        let mut seq = serializer.serialize_seq(Some(pairs.len()))?;
        for pair in pairs {
            seq.serialize_element(&pair)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for BundleSigned {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PairsVisitor;
        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = BundleSigned;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sequence of (good, quantity) pairs")
            }
            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<BundleSigned, A::Error> {
                let mut b = BundleSigned::new();
                while let Some((g, q)) = seq.next_element::<(GoodId, f64)>()? {
                    b.set(g, q);
                }
                Ok(b)
            }
        }
        deserializer.deserialize_seq(PairsVisitor)
    }
}

impl Serialize for Bundle {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.inner.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Bundle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let signed = BundleSigned::deserialize(deserializer)?;
        Bundle::try_from(signed).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MemberId;

    fn g(n: u64) -> GoodId {
        MemberId(n)
    }

    fn nn(pairs: &[(u64, f64)]) -> Bundle {
        Bundle::from_pairs(pairs.iter().map(|&(n, q)| (g(n), q))).unwrap()
    }

    fn sg(pairs: &[(u64, f64)]) -> BundleSigned {
        pairs.iter().map(|&(n, q)| (g(n), q)).collect()
    }

    #[test]
    fn absent_goods_read_zero_and_do_not_count() {
        let b = nn(&[(1, 2.0)]);
        assert_eq!(b.get(g(9)), 0.0);
        assert_eq!(b.len(), 1);
        assert!(!b.contains(g(9)));
    }

    #[test]
    fn set_negative_fails_and_leaves_bundle_intact() {
        let mut b = nn(&[(1, 2.0)]);
        let err = b.set(g(1), -0.5).unwrap_err();
        assert!(matches!(err, Error::Negativity { good, value }
            if good == g(1) && value == -0.5));
        assert_eq!(b.get(g(1)), 2.0);
    }

    #[test]
    fn erase_remove_clear_zeros() {
        let mut b = sg(&[(1, 0.0), (2, 3.0)]);
        assert!(b.erase(g(1)));
        assert!(!b.erase(g(1)));
        assert_eq!(b.remove(g(2)), 3.0);
        assert_eq!(b.remove(g(2)), 0.0);

        let mut c = sg(&[(1, 0.0), (2, 3.0)]);
        c.clear_zeros();
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(g(2)), 3.0);
    }

    #[test]
    fn sign_splits_are_strict() {
        let b = sg(&[(1, 2.0), (2, -3.0), (3, 0.0)]);
        assert_eq!(b.positive(), nn(&[(1, 2.0)]));
        assert_eq!(b.negative(), nn(&[(2, 3.0)]));
        assert_eq!(b.zeros(), nn(&[(3, 0.0)]));
    }

    #[test]
    fn signed_algebra_round_trips() {
        let a = sg(&[(1, 2.0), (2, -1.0)]);
        let b = sg(&[(1, 0.5), (3, 4.0)]);
        assert_eq!(&(&a + &b) - &b, a);
        assert_eq!(-&(-&a), a);
        let k = 2.5;
        assert_eq!(&(&a * k) / k, a);
    }

    #[test]
    fn comparisons_are_not_total() {
        // a >= b holds, but neither a > b nor a == b does.
        let a = nn(&[(1, 1.0), (2, 2.0)]);
        let b = nn(&[(1, 1.0), (2, 1.0)]);
        assert!(a.ge(&b));
        assert!(!a.gt(&b));
        assert!(a != b);

        // And both ge directions can fail at once.
        let c = nn(&[(1, 2.0), (2, 1.0)]);
        assert!(!a.ge(&c) && !c.ge(&a));
    }

    #[test]
    fn missing_goods_compare_as_zero() {
        let a = sg(&[(1, 1.0)]);
        let b = sg(&[(2, -1.0)]);
        assert!(a.ge(&b));
        assert!(a.gt(&b));
        assert_eq!(sg(&[(1, 0.0)]), BundleSigned::new());
    }

    #[test]
    fn scalar_comparisons_quantify_present_goods() {
        let e = BundleSigned::new();
        assert!(e.all_ge(5.0) && e.all_eq(5.0) && e.all_lt(-3.0));
        assert!(!e.any_ne(5.0));

        let z = sg(&[(1, 0.0)]);
        assert!(z.all_eq(0.0));
        assert!(!z.is_empty(), "zero-equivalent is not empty");
        assert!(BundleSigned::new().is_empty());
    }

    #[test]
    fn transaction_abort_restores_pre_begin_state() {
        let mut b = sg(&[(1, 5.0)]);
        b.begin_transaction(false);
        b.set(g(1), 9.0);
        b.set(g(2), 1.0);
        b.abort_transaction().unwrap();
        assert_eq!(b, sg(&[(1, 5.0)]));
    }

    #[test]
    fn transaction_commit_propagates() {
        let mut b = sg(&[(1, 5.0)]);
        b.begin_transaction(false);
        b.set(g(1), 9.0);
        b.begin_transaction(false);
        b.set(g(2), 1.0);
        b.commit_transaction().unwrap();
        b.commit_transaction().unwrap();
        assert_eq!(b, sg(&[(1, 9.0), (2, 1.0)]));
        assert!(matches!(
            b.commit_transaction(),
            Err(Error::NoTransaction(_))
        ));
    }

    #[test]
    fn nested_abort_only_unwinds_inner() {
        let mut b = sg(&[(1, 1.0)]);
        b.begin_transaction(false);
        b.set(g(1), 2.0);
        b.begin_transaction(false);
        b.set(g(1), 3.0);
        b.abort_transaction().unwrap();
        assert_eq!(b.get(g(1)), 2.0);
        b.commit_transaction().unwrap();
        assert_eq!(b.get(g(1)), 2.0);
    }

    #[test]
    fn encompassing_transaction_absorbs_nested_pairs() {
        let mut b = sg(&[(1, 1.0)]);
        b.begin_transaction(true);
        b.set(g(1), 2.0);
        b.begin_transaction(false);
        b.set(g(1), 3.0);
        // Absorbed: the abort does not roll anything back.
        b.abort_transaction().unwrap();
        assert_eq!(b.get(g(1)), 3.0);
        // This commit matches the encompassing begin.
        b.commit_transaction().unwrap();
        assert_eq!(b.get(g(1)), 3.0);
        assert!(matches!(
            b.abort_transaction(),
            Err(Error::NoTransaction(_))
        ));
    }

    #[test]
    fn begin_encompassing_tracks_matching() {
        let mut b = sg(&[(1, 1.0)]);
        b.begin_encompassing();
        b.begin_transaction(false);
        b.set(g(1), 7.0);
        assert!(matches!(b.end_encompassing(), Err(Error::NoTransaction(_))));
        b.commit_transaction().unwrap();
        b.end_encompassing().unwrap();
        assert_eq!(b.get(g(1)), 7.0);
        // A bare commit inside a fresh encompassing scope has no match.
        b.begin_encompassing();
        assert!(matches!(
            b.commit_transaction(),
            Err(Error::NoTransaction(_))
        ));
        b.end_encompassing().unwrap();
    }

    #[test]
    fn checked_ops_roll_back_atomically() {
        let mut b = nn(&[(1, 5.0), (2, 1.0)]);
        let rhs = sg(&[(1, -2.0), (2, -3.0)]);
        let err = b.add_assign_checked(&rhs).unwrap_err();
        assert!(matches!(err, Error::Negativity { good, .. } if good == g(2)));
        assert_eq!(b, nn(&[(1, 5.0), (2, 1.0)]));

        b.add_assign_checked(&sg(&[(1, -2.0)])).unwrap();
        assert_eq!(b, nn(&[(1, 3.0), (2, 1.0)]));
    }

    #[test]
    fn transfer_rounds_source_and_conserves() {
        // The worked scenario: goods 1 and 2 trigger source rounding at
        // ε = 1.5e-3, good 3 does not.
        let mut a = nn(&[(1, 999.0), (2, 9999.0), (3, 100_000.0)]);
        let mut b = nn(&[(1, 5000.0), (2, 40_000.0)]);
        let delta = sg(&[(1, 1000.0), (2, 9998.0), (3, 95_000.0)]);

        let total_before = &BundleSigned::from(a.clone()) + &*b;
        let moved = a.transfer(&delta, &mut b, 1.5e-3).unwrap();

        assert_eq!(a, nn(&[(3, 5000.0)]));
        assert_eq!(b, nn(&[(1, 5999.0), (2, 49_999.0), (3, 95_000.0)]));
        let total_after = &BundleSigned::from(a.clone()) + &*b;
        assert_eq!(total_before, total_after);
        assert_eq!(moved, sg(&[(1, 999.0), (2, 9999.0), (3, 95_000.0)]));

        // The symmetric negative transfer from the same initial state ends
        // identically.
        let mut a2 = nn(&[(1, 999.0), (2, 9999.0), (3, 100_000.0)]);
        let mut c = nn(&[(1, 5000.0), (2, 40_000.0)]);
        c.transfer(&-&delta, &mut a2, 1.5e-3).unwrap();
        assert_eq!(a2, nn(&[(3, 5000.0)]));
        assert_eq!(c, nn(&[(1, 5999.0), (2, 49_999.0), (3, 95_000.0)]));
    }

    #[test]
    fn transfer_rounds_negative_destination_to_zero() {
        // Destination rounding applies only when the receiving side starts
        // negative and lands within epsilon of zero.
        let mut an = -&nn(&[(1, 999.0), (2, 9999.0), (3, 100_000.0)]);
        let mut cn = BundleSigned::from(nn(&[(1, 5000.0), (2, 40_000.0)]));
        let delta = sg(&[(1, 1000.0), (2, 9998.0), (3, 95_000.0)]);

        cn.transfer(&delta, &mut an, 1.5e-3).unwrap();
        assert_eq!(an, sg(&[(3, -5000.0)]));
        assert_eq!(cn, sg(&[(1, 4001.0), (2, 30_001.0), (3, -95_000.0)]));
    }

    #[test]
    fn transfer_mixed_signs_and_both_roundings() {
        let mut ab = sg(&[(1, 999.0), (2, -9999.0), (3, 100_000.0), (4, 500.0)]);
        let mut cb = sg(&[(1, 5000.0), (2, 40_000.0), (4, 500.5)]);

        cb.transfer(
            &sg(&[(1, -1000.0), (2, 10_000.0), (3, -95_001.0), (4, 500.0)]),
            &mut ab,
            1.5e-3,
        )
        .unwrap();

        assert_eq!(ab, sg(&[(3, 4999.0), (4, 1000.5)]));
        assert_eq!(cb, sg(&[(1, 5999.0), (2, 30_001.0), (3, 95_001.0)]));
    }

    #[test]
    fn transfer_fails_atomically_on_negativity() {
        let mut a = nn(&[(1, 10.0), (2, 1.0)]);
        let mut b = nn(&[(1, 1.0)]);
        let err = a
            .transfer(&sg(&[(1, 5.0), (2, 50.0)]), &mut b, 1e-12)
            .unwrap_err();
        assert!(matches!(err, Error::Negativity { good, .. } if good == g(2)));
        assert_eq!(a, nn(&[(1, 10.0), (2, 1.0)]));
        assert_eq!(b, nn(&[(1, 1.0)]));
    }

    #[test]
    fn one_sided_transfer_removes_and_returns() {
        let mut a = nn(&[(1, 3.0)]);
        let moved = a.transfer_out(&sg(&[(1, 3.0 - 1e-15)]), 1e-12).unwrap();
        // Source rounding takes the full quantity.
        assert_eq!(moved, sg(&[(1, 3.0)]));
        assert!(a.is_empty());

        let mut s = sg(&[(1, 1.0)]);
        let moved = s.transfer_out(&sg(&[(1, -4.0)]), 1e-12).unwrap();
        assert_eq!(s, sg(&[(1, 5.0)]));
        assert_eq!(moved, sg(&[(1, -4.0)]));
    }

    #[test]
    fn has_approx_predicts_transfer_success() {
        let a = nn(&[(1, 999.0)]);
        let b = nn(&[]);
        let amount = sg(&[(1, 1000.0)]);
        assert!(!a.has_approx(&amount, &b, 1e-12));
        assert!(a.has_approx(&amount, &b, 1.5e-3));
    }

    #[test]
    fn coverage_and_multiples_edge_cases() {
        let a = nn(&[(1, 100.0), (2, 10.0)]);
        let b = nn(&[(2, 1.0)]);
        let b0 = nn(&[(1, 0.0), (2, 1.0)]);
        let c = nn(&[(1, 5.0)]);
        let z = Bundle::new();

        assert_eq!(a.coverage(&b), f64::INFINITY);
        assert_eq!(b.coverage(&a), 0.1);
        assert_eq!(a.multiples(&b), 10.0);
        assert_eq!(a.multiples(&b0), 10.0);
        assert_eq!(b.multiples(&a), 0.0);
        assert_eq!(a.multiples(&c), 20.0);
        assert_eq!(c.multiples(&a), 0.0);
        assert_eq!(z.multiples(&a), 0.0);
        assert_eq!(a.multiples(&z), f64::INFINITY);
        assert!(z.multiples(&z).is_nan());
        assert!(z.coverage(&z).is_nan());
    }

    #[test]
    fn coverage_bounds_hold() {
        let a = nn(&[(1, 2.0), (2, 3.0), (3, 1.0)]);
        let b = nn(&[(1, 1.0), (2, 2.0), (3, 2.5)]);
        let m = a.coverage(&b);
        assert_eq!(m, 2.0);
        assert!((&b * m).ge(&a));
        let k = a.multiples(&b);
        assert!(a.ge(&(&b * k)));

        let excess = a.coverage_excess(&b).unwrap();
        assert_eq!(excess, nn(&[(2, 1.0), (3, 4.0)]));
        // b * coverage == a + excess
        assert_eq!(&b * m, &a + &excess);
    }

    #[test]
    fn coverage_excess_fails_when_uncoverable() {
        let a = nn(&[(1, 1.0)]);
        let b = nn(&[(2, 1.0)]);
        assert!(matches!(
            a.coverage_excess(&b),
            Err(Error::Negativity { good, .. }) if good == g(1)
        ));
    }

    #[test]
    fn covers_ignores_zero_quantities() {
        let a = nn(&[(1, 3.0), (2, 4.0)]);
        let b = nn(&[(1, 1.0), (2, 1.0), (3, 1.0)]);
        let c = nn(&[(1, 0.0), (2, 100.0), (3, 1000.0)]);
        assert!(!a.covers(&b));
        assert!(b.covers(&a));
        assert!(b.covers(&c));
        assert!(!c.covers(&b));
    }

    #[test]
    fn common_treats_negatives_as_absent() {
        let b1 = sg(&[(1, 1.0), (2, 3.0), (3, 1.0), (4, 0.0), (5, -3.0)]);
        let b2 = sg(&[(1, 4.0), (3, 1.0), (4, 4.0), (5, 2.0)]);
        let c = Bundle::common(&b1, &b2);
        assert_eq!(c, nn(&[(1, 1.0), (3, 1.0), (4, 0.0)]));
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn reduce_subtracts_common_from_both() {
        let mut a = nn(&[(1, 3.0), (2, 5.0)]);
        let mut b = nn(&[(1, 1.0), (2, 8.0), (3, 1.0)]);
        let a0 = a.clone();
        let b0 = b.clone();
        let c = Bundle::reduce(&mut a, &mut b);
        assert_eq!(c, Bundle::common(&a0, &b0));
        assert_eq!(a, a0.checked_sub(&BundleSigned::from(c.clone())).unwrap());
        assert_eq!(b, b0.checked_sub(&BundleSigned::from(c.clone())).unwrap());
    }

    #[test]
    fn serde_round_trips_visible_frame() {
        let mut b = sg(&[(1, 1.5), (2, -2.0)]);
        b.begin_transaction(false);
        b.set(g(1), 9.0);
        let json = serde_json::to_string(&b).unwrap();
        let back: BundleSigned = serde_json::from_str(&json).unwrap();
        // Only the visible state travels.
        assert_eq!(back.get(g(1)), 9.0);
        assert_eq!(back.get(g(2)), -2.0);

        let neg = serde_json::to_string(&sg(&[(1, -1.0)])).unwrap();
        assert!(serde_json::from_str::<Bundle>(&neg).is_err());
    }

    #[test]
    #[should_panic(expected = "cannot scale")]
    fn negative_scalar_on_non_negative_panics() {
        let b = nn(&[(1, 1.0)]);
        let _ = &b * -1.0;
    }
}
