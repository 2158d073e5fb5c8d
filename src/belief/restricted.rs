//! Bayesian linear regression with linear inequality restrictions.
//!
//! Restrictions take the form `Rβ ≤ r`, one row at a time (a `≥` form is
//! stored negated, and single-coefficient bounds are rows with one nonzero
//! entry).  Draws honoring the restrictions come from one of two samplers:
//!
//! - *Rejection*: draw unrestricted, discard inadmissible draws.  Cheap
//!   when the admissible region holds most of the posterior mass, hopeless
//!   when it doesn't.
//! - *Gibbs*: sample the truncated multivariate t directly, in the
//!   reparameterized space `z = L⁻¹(β − β̄)/σ` (`L` the Cholesky root of
//!   `s²V`), where conditional on σ each coordinate is an independent
//!   truncated standard normal.  Each iteration first draws the σ
//!   multiplier from a range-truncated χ², then sweeps the z coordinates.
//!
//! The default `Auto` mode starts with rejection and switches this instance
//! permanently to Gibbs once the cumulative acceptance rate proves too low
//! (below `draw_auto_min_success_rate` after at least
//! `draw_auto_min_rejection` attempts).

use std::fmt;
use std::ops::Deref;

use nalgebra::{DMatrix, DVector, RowDVector};
use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::debug;

use crate::belief::BayesianLinear;
use crate::error::{Error, Result};
use crate::random::TruncatedNormal;

/// How [`BayesianLinearRestricted::draw`] produces a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    /// Rejection first; permanent fallback to Gibbs when acceptance is poor.
    Auto,
    Gibbs,
    Rejection,
}

pub struct BayesianLinearRestricted {
    base: BayesianLinear,

    /// Restriction coefficients, one row per restriction (`R` in `Rβ ≤ r`).
    restrict_select: DMatrix<f64>,
    /// Restriction bounds (`r` in `Rβ ≤ r`).
    restrict_values: DVector<f64>,

    /// Requested draw mode.
    pub draw_mode: DrawMode,
    last_draw_mode: DrawMode,

    // Draw statistics.
    draw_rejection_discards_last: u64,
    draw_rejection_success: u64,
    draw_rejection_discards: u64,
    draw_gibbs_success: u64,
    draw_gibbs_discards: u64,

    // Tunables.
    /// Failed draws tolerated by a single `Rejection`-mode call.
    pub draw_rejection_max_discards: u64,
    /// Minimum cumulative rejection attempts before `Auto` gives up.
    pub draw_auto_min_rejection: u64,
    /// Cumulative acceptance rate below which `Auto` switches to Gibbs.
    pub draw_auto_min_success_rate: f64,
    /// Iterations discarded before the first Gibbs draw from a fresh state.
    pub draw_gibbs_burnin: u64,
    /// Every `draw_gibbs_thinning`-th Gibbs iteration is returned.
    pub draw_gibbs_thinning: u64,

    // Gibbs state and caches.
    gibbs_last_z: Option<DVector<f64>>,
    gibbs_burned_in: bool,
    chisq_n_median: Option<f64>,
    /// `r − Rβ̄`, the restriction slack at the posterior mean.
    r_minus_r_beta: Option<DVector<f64>>,
    /// `R·L`: maps z-space moves into restriction space.
    net_restrict: Option<DMatrix<f64>>,
}

impl BayesianLinearRestricted {
    /// Wraps an existing model with an (initially empty) restriction set.
    pub fn new(base: BayesianLinear) -> BayesianLinearRestricted {
        let k = base.k();
        BayesianLinearRestricted {
            base,
            restrict_select: DMatrix::zeros(0, k),
            restrict_values: DVector::zeros(0),
            draw_mode: DrawMode::Auto,
            last_draw_mode: DrawMode::Auto,
            draw_rejection_discards_last: 0,
            draw_rejection_success: 0,
            draw_rejection_discards: 0,
            draw_gibbs_success: 0,
            draw_gibbs_discards: 0,
            draw_rejection_max_discards: 50,
            draw_auto_min_rejection: 50,
            draw_auto_min_success_rate: 0.2,
            draw_gibbs_burnin: 100,
            draw_gibbs_thinning: 2,
            gibbs_last_z: None,
            gibbs_burned_in: false,
            chisq_n_median: None,
            r_minus_r_beta: None,
            net_restrict: None,
        }
    }

    /// A restricted model over a noninformative base.
    pub fn noninformative(k: usize) -> Result<BayesianLinearRestricted> {
        Ok(BayesianLinearRestricted::new(BayesianLinear::noninformative(k)?))
    }

    /// A restricted model over explicit informative parameters.
    pub fn informative(
        beta: DVector<f64>,
        s2: f64,
        v_inv: DMatrix<f64>,
        n: f64,
    ) -> Result<BayesianLinearRestricted> {
        Ok(BayesianLinearRestricted::new(BayesianLinear::informative(
            beta, s2, v_inv, n,
        )?))
    }

    // ------------------------------------------------------------------
    // Base-model mutation (re-exposed so restricted caches stay coherent)
    // ------------------------------------------------------------------

    /// See [`BayesianLinear::update`].
    pub fn update(&mut self, y: &DVector<f64>, x: &DMatrix<f64>) -> Result<()> {
        self.base.update(y, x)?;
        self.reset_restricted();
        Ok(())
    }

    /// See [`BayesianLinear::weaken`].
    pub fn weaken(&mut self, w: f64) -> Result<()> {
        self.base.weaken(w)?;
        self.reset_restricted();
        Ok(())
    }

    pub fn set_names(&mut self, names: Vec<String>) -> Result<()> {
        self.base.set_names(names)
    }

    pub fn discard(&mut self) {
        self.base.discard();
    }

    /// Mutable access to the posterior mean and covariance accessors of the
    /// base model (`beta()`, `v()` cache through `&mut`).
    pub fn base_mut(&mut self) -> &mut BayesianLinear {
        // Callers reaching in this far are expected to leave parameters
        // alone; parameter-changing entry points live on this type.
        &mut self.base
    }

    // ------------------------------------------------------------------
    // Restrictions
    // ------------------------------------------------------------------

    /// The restriction matrix `R`.
    pub fn restrictions(&self) -> &DMatrix<f64> {
        &self.restrict_select
    }

    /// The restriction bounds `r`.
    pub fn restriction_values(&self) -> &DVector<f64> {
        &self.restrict_values
    }

    /// Adds the restriction `row·β ≤ value`.
    pub fn add_restriction(&mut self, row: RowDVector<f64>, value: f64) -> Result<()> {
        if row.len() != self.base.k() {
            return Err(Error::Domain(format!(
                "restriction row has length {}, model has k={}",
                row.len(),
                self.base.k()
            )));
        }
        let rows = self.restrict_select.nrows();
        let mut select = DMatrix::zeros(rows + 1, self.base.k());
        select.rows_mut(0, rows).copy_from(&self.restrict_select);
        select.row_mut(rows).copy_from(&row);
        let mut values = DVector::zeros(rows + 1);
        values.rows_mut(0, rows).copy_from(&self.restrict_values);
        values[rows] = value;
        self.restrict_select = select;
        self.restrict_values = values;
        self.reset_restricted();
        Ok(())
    }

    /// Adds the restriction `row·β ≥ value` (stored negated).
    pub fn add_restriction_ge(&mut self, row: RowDVector<f64>, value: f64) -> Result<()> {
        self.add_restriction(-row, -value)
    }

    /// Adds one `≤` restriction per row of `r_matrix`.
    pub fn add_restrictions(&mut self, r_matrix: &DMatrix<f64>, values: &DVector<f64>) -> Result<()> {
        if r_matrix.nrows() != values.len() {
            return Err(Error::Domain(format!(
                "restriction matrix has {} rows but {} values",
                r_matrix.nrows(),
                values.len()
            )));
        }
        for i in 0..r_matrix.nrows() {
            self.add_restriction(r_matrix.row(i).into_owned(), values[i])?;
        }
        Ok(())
    }

    /// `≥` form of [`add_restrictions`](Self::add_restrictions).
    pub fn add_restrictions_ge(
        &mut self,
        r_matrix: &DMatrix<f64>,
        values: &DVector<f64>,
    ) -> Result<()> {
        self.add_restrictions(&(-r_matrix), &(-values))
    }

    /// Restricts `β[j] ≤ value`.
    pub fn set_upper_bound(&mut self, j: usize, value: f64) -> Result<()> {
        self.add_restriction(self.unit_row(j)?, value)
    }

    /// Restricts `β[j] ≥ value`.
    pub fn set_lower_bound(&mut self, j: usize, value: f64) -> Result<()> {
        self.add_restriction(-self.unit_row(j)?, -value)
    }

    fn unit_row(&self, j: usize) -> Result<RowDVector<f64>> {
        if j >= self.base.k() {
            return Err(Error::Domain(format!(
                "coefficient index {j} out of range for k={}",
                self.base.k()
            )));
        }
        let mut row = RowDVector::zeros(self.base.k());
        row[j] = 1.0;
        Ok(row)
    }

    /// The most binding single-coefficient upper bound on `β[j]`, if any.
    /// Rows with non-unit coefficients are rescaled.
    pub fn upper_bound(&self, j: usize) -> Option<f64> {
        self.single_bound(j, true)
    }

    /// The most binding single-coefficient lower bound on `β[j]`, if any.
    pub fn lower_bound(&self, j: usize) -> Option<f64> {
        self.single_bound(j, false)
    }

    fn single_bound(&self, j: usize, upper: bool) -> Option<f64> {
        let mut best: Option<f64> = None;
        for i in 0..self.restrict_select.nrows() {
            let row = self.restrict_select.row(i);
            let coef = row[j];
            if coef == 0.0 || row.iter().enumerate().any(|(c, v)| c != j && *v != 0.0) {
                continue;
            }
            // coef·β_j ≤ r: a positive coefficient is an upper bound, a
            // negative one a lower bound.
            if (coef > 0.0) != upper {
                continue;
            }
            let bound = self.restrict_values[i] / coef;
            best = Some(match best {
                None => bound,
                Some(b) if upper => b.min(bound),
                Some(b) => b.max(bound),
            });
        }
        best
    }

    /// True iff `Rβ ≤ r` holds componentwise for the first `k` entries of
    /// `beta` (a trailing σ² entry is ignored).
    pub fn admissible(&self, beta: &DVector<f64>) -> bool {
        if self.restrict_select.nrows() == 0 {
            return true;
        }
        let beta = beta.rows(0, self.base.k()).into_owned();
        let vals = &self.restrict_select * beta;
        (0..vals.len()).all(|i| vals[i] <= self.restrict_values[i])
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// The sampler used by the most recent draw (`Auto` until one runs).
    pub fn last_draw_mode(&self) -> DrawMode {
        self.last_draw_mode
    }

    /// Inadmissible draws in the most recent rejection call.
    pub fn rejection_discards_last(&self) -> u64 {
        self.draw_rejection_discards_last
    }

    /// Cumulative accepted rejection draws.
    pub fn rejection_successes(&self) -> u64 {
        self.draw_rejection_success
    }

    /// Cumulative discarded rejection draws.
    pub fn rejection_discards(&self) -> u64 {
        self.draw_rejection_discards
    }

    /// Cumulative returned Gibbs draws.
    pub fn gibbs_successes(&self) -> u64 {
        self.draw_gibbs_success
    }

    /// Cumulative burn-in and thinning Gibbs iterations.
    pub fn gibbs_discards(&self) -> u64 {
        self.draw_gibbs_discards
    }

    // ------------------------------------------------------------------
    // Drawing
    // ------------------------------------------------------------------

    /// Draws `[β; σ²]` honoring the restrictions, per `draw_mode`.
    pub fn draw<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<DVector<f64>> {
        match self.draw_mode {
            DrawMode::Rejection => {
                let cap = self.draw_rejection_max_discards;
                self.draw_rejection(rng, cap)
            }
            DrawMode::Gibbs => self.draw_gibbs(rng),
            DrawMode::Auto => {
                if self.last_draw_mode == DrawMode::Gibbs {
                    // Once auto-mode has fallen back, it stays fallen back.
                    return self.draw_gibbs(rng);
                }
                let attempts = self.draw_rejection_success + self.draw_rejection_discards;
                let need_attempts = self.draw_auto_min_rejection.saturating_sub(attempts);
                // Failures this call that would push the cumulative
                // acceptance rate below the threshold:
                //   success / (attempts + f) < rate  ⇔  f > success/rate − attempts
                let need_failures = {
                    let target = self.draw_rejection_success as f64
                        / self.draw_auto_min_success_rate
                        - attempts as f64;
                    if target < 0.0 {
                        0
                    } else {
                        target.floor() as u64 + 1
                    }
                };
                let cap = need_attempts.max(need_failures).max(1);
                match self.draw_rejection(rng, cap) {
                    Ok(d) => Ok(d),
                    Err(Error::DrawFailure(_)) => {
                        debug!(
                            successes = self.draw_rejection_success,
                            discards = self.draw_rejection_discards,
                            "rejection acceptance too low; switching to Gibbs sampling"
                        );
                        self.draw_gibbs(rng)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Rejection sampling: repeat the unrestricted draw until admissible,
    /// giving up (with [`Error::DrawFailure`]) after `max_discards` failed
    /// attempts.
    pub fn draw_rejection<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        max_discards: u64,
    ) -> Result<DVector<f64>> {
        self.draw_rejection_discards_last = 0;
        loop {
            let d = self.base.draw(rng)?;
            if self.admissible(&d) {
                self.draw_rejection_success += 1;
                self.last_draw_mode = DrawMode::Rejection;
                return Ok(d);
            }
            self.draw_rejection_discards_last += 1;
            self.draw_rejection_discards += 1;
            if self.draw_rejection_discards_last >= max_discards {
                return Err(Error::DrawFailure(format!(
                    "rejection sampling discarded {max_discards} consecutive draws"
                )));
            }
        }
    }

    /// Gibbs sampling of the truncated multivariate t.  See the module
    /// docs for the reparameterization; one returned draw performs
    /// `draw_gibbs_thinning` full iterations (σ step + coordinate sweep),
    /// after a `draw_gibbs_burnin` warm-up from a fresh state.
    pub fn draw_gibbs<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<DVector<f64>> {
        let k = self.base.k();
        if self.restrict_select.nrows() == 0 {
            // No restrictions: the truncated distribution is the plain one.
            let d = self.base.draw(rng)?;
            self.draw_gibbs_success += 1;
            self.last_draw_mode = DrawMode::Gibbs;
            return Ok(d);
        }

        let l = self.base.root_sigma()?;
        let beta_bar = self.base.beta()?;
        self.ensure_restriction_caches(&l, &beta_bar)?;

        if self.gibbs_last_z.is_none() {
            self.seed_gibbs(rng, &l, &beta_bar)?;
        }
        if !self.gibbs_burned_in {
            for _ in 0..self.draw_gibbs_burnin {
                self.gibbs_iterate(rng)?;
                self.draw_gibbs_discards += 1;
            }
            self.gibbs_burned_in = true;
        }

        let thinning = self.draw_gibbs_thinning.max(1);
        let mut last = self.gibbs_iterate(rng)?;
        for _ in 1..thinning {
            self.draw_gibbs_discards += 1;
            last = self.gibbs_iterate(rng)?;
        }
        let (m, sigma2) = last;

        let z = self.gibbs_last_z.as_ref().expect("seeded above");
        let beta = &beta_bar + (&l * z) * m;
        let mut out = DVector::zeros(k + 1);
        out.rows_mut(0, k).copy_from(&beta);
        out[k] = sigma2;

        self.draw_gibbs_success += 1;
        self.last_draw_mode = DrawMode::Gibbs;
        self.base.set_last_draw(out.clone());
        Ok(out)
    }

    /// Projects `initial` (length `k` or `k+1`; a trailing σ² is ignored)
    /// into the admissible region and installs it as the Gibbs state.  The
    /// next Gibbs draw will re-run its burn-in.  The RNG only picks which
    /// violated restriction to walk towards at each step.
    pub fn gibbs_initialize<R: Rng + ?Sized>(
        &mut self,
        initial: &DVector<f64>,
        max_tries: u64,
        rng: &mut R,
    ) -> Result<()> {
        let k = self.base.k();
        if initial.len() != k && initial.len() != k + 1 {
            return Err(Error::Domain(format!(
                "initial vector must have length {k} or {}, got {}",
                k + 1,
                initial.len()
            )));
        }
        let l = self.base.root_sigma()?;
        let beta_bar = self.base.beta()?;
        self.ensure_restriction_caches(&l, &beta_bar)?;

        let beta = initial.rows(0, k).into_owned();
        let centered = &beta - &beta_bar;
        let z0 = l
            .solve_lower_triangular(&centered)
            .ok_or(Error::InvalidState("singular Cholesky root"))?;
        let z = self.project_admissible(z0, max_tries, rng)?;
        self.gibbs_last_z = Some(z);
        self.gibbs_burned_in = false;
        Ok(())
    }

    fn seed_gibbs<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        l: &DMatrix<f64>,
        beta_bar: &DVector<f64>,
    ) -> Result<()> {
        let k = self.base.k();
        let mut last_err = None;
        for _ in 0..10 {
            let d = self.base.draw(rng)?;
            let beta = d.rows(0, k).into_owned();
            let centered = &beta - beta_bar;
            let Some(z0) = l.solve_lower_triangular(&centered) else {
                return Err(Error::InvalidState("singular Cholesky root"));
            };
            match self.project_admissible(z0, 100, rng) {
                Ok(z) => {
                    self.gibbs_last_z = Some(z);
                    self.gibbs_burned_in = false;
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(Error::ConstraintFailure(
            "could not find an admissible Gibbs starting point".into(),
        )))
    }

    /// Walks `z` into `{z : A z ≤ d}` by repeatedly jumping 1.5× the
    /// orthogonal distance to a uniformly chosen violated restriction.
    /// The overshoot keeps acutely angled restriction pairs from pinning
    /// the walk at their intersection.
    fn project_admissible<R: Rng + ?Sized>(
        &self,
        mut z: DVector<f64>,
        max_tries: u64,
        rng: &mut R,
    ) -> Result<DVector<f64>> {
        let a = self.net_restrict.as_ref().expect("caches ensured");
        let d = self.r_minus_r_beta.as_ref().expect("caches ensured");
        for _ in 0..max_tries {
            let slack = a * &z - d;
            let violated: Vec<usize> = (0..slack.len()).filter(|&i| slack[i] > 0.0).collect();
            if violated.is_empty() {
                return Ok(z);
            }
            let row = violated[rng.gen_range(0..violated.len())];
            let g = a.row(row).transpose();
            let norm_sq = g.norm_squared();
            if norm_sq == 0.0 {
                return Err(Error::ConstraintFailure(
                    "degenerate restriction row (all-zero coefficients)".into(),
                ));
            }
            z -= g * (1.5 * slack[row] / norm_sq);
        }
        let slack = a * &z - d;
        if (0..slack.len()).all(|i| slack[i] <= 0.0) {
            return Ok(z);
        }
        Err(Error::ConstraintFailure(format!(
            "no admissible point found within {max_tries} adjustments"
        )))
    }

    /// One full Gibbs iteration: σ-multiplier step then coordinate sweep.
    /// Returns the (multiplier, σ²) pair of the iteration.
    fn gibbs_iterate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(f64, f64)> {
        let n = self.base.n();
        let s2 = self.base.s2();
        let a = self.net_restrict.clone().expect("caches ensured");
        let d = self.r_minus_r_beta.clone().expect("caches ensured");
        let mut z = self.gibbs_last_z.clone().expect("state seeded");

        // --- σ step: admissible multiplier range for the current z.
        // β(m) = β̄ + m·Lz obeys row i iff m·(Az)_i ≤ d_i.
        let az = &a * &z;
        let mut m_lo: f64 = 0.0;
        let mut m_hi = f64::INFINITY;
        for i in 0..az.len() {
            let c = az[i];
            if c > 0.0 {
                m_hi = m_hi.min(d[i] / c);
            } else if c < 0.0 {
                m_lo = m_lo.max(d[i] / c);
            }
            // c == 0 rows do not constrain the multiplier.
        }

        // m = √(n/u) maps the multiplier range onto a χ²(n) interval.
        let u_lo = if m_hi.is_infinite() { 0.0 } else { n / (m_hi * m_hi) };
        let u_hi = if m_lo > 0.0 { n / (m_lo * m_lo) } else { f64::INFINITY };
        let u = self.draw_truncated_chisq(rng, n, u_lo, u_hi)?;
        let sigma2 = n * s2 / u;
        let m = (n / u).sqrt();

        // --- coordinate sweep: each z_j is a truncated standard normal
        // given σ and the other coordinates.
        for j in 0..z.len() {
            let mut lb = f64::NEG_INFINITY;
            let mut ub = f64::INFINITY;
            for i in 0..a.nrows() {
                let coef = m * a[(i, j)];
                if coef == 0.0 {
                    continue;
                }
                let rest: f64 = (0..z.len())
                    .filter(|&c| c != j)
                    .map(|c| a[(i, c)] * z[c])
                    .sum();
                let bound = (d[i] - m * rest) / coef;
                if coef > 0.0 {
                    ub = ub.min(bound);
                } else {
                    lb = lb.max(bound);
                }
            }
            if lb > ub {
                // Numerical pinch: collapse to the midpoint rather than
                // sampling from an empty interval.
                z[j] = 0.5 * (lb + ub);
                continue;
            }
            z[j] = TruncatedNormal::standard(lb, ub)?.sample(rng);
        }

        self.gibbs_last_z = Some(z);
        Ok((m, sigma2))
    }

    /// Draws `u ~ χ²(n)` truncated to `[lo, hi]` by CDF inversion, falling
    /// back to the cached median clamped into the interval when the
    /// interval's probability mass underflows.
    fn draw_truncated_chisq<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        n: f64,
        lo: f64,
        hi: f64,
    ) -> Result<f64> {
        let chi = ChiSquared::new(n)
            .map_err(|e| Error::Domain(format!("chi-squared({n}) invalid: {e}")))?;
        if lo <= 0.0 && hi.is_infinite() {
            return Ok(chi.sample(rng));
        }
        let p_lo = if lo <= 0.0 { 0.0 } else { chi.cdf(lo) };
        let p_hi = if hi.is_infinite() { 1.0 } else { chi.cdf(hi) };
        let span = p_hi - p_lo;
        if span <= f64::EPSILON {
            let median = *self
                .chisq_n_median
                .get_or_insert_with(|| chi.inverse_cdf(0.5));
            return Ok(median.clamp(lo, hi.max(lo)));
        }
        let p = p_lo + rng.gen::<f64>() * span;
        Ok(chi.inverse_cdf(p.clamp(f64::EPSILON, 1.0 - f64::EPSILON)).clamp(lo.max(0.0), hi))
    }

    fn ensure_restriction_caches(
        &mut self,
        l: &DMatrix<f64>,
        beta_bar: &DVector<f64>,
    ) -> Result<()> {
        if self.net_restrict.is_none() {
            self.net_restrict = Some(&self.restrict_select * l);
        }
        if self.r_minus_r_beta.is_none() {
            self.r_minus_r_beta = Some(&self.restrict_values - &self.restrict_select * beta_bar);
        }
        Ok(())
    }

    /// Clears restriction-derived caches and the Gibbs chain.  Called when
    /// restrictions change or the base model updates/weakens.
    fn reset_restricted(&mut self) {
        self.gibbs_last_z = None;
        self.gibbs_burned_in = false;
        self.chisq_n_median = None;
        self.r_minus_r_beta = None;
        self.net_restrict = None;
    }
}

impl Deref for BayesianLinearRestricted {
    type Target = BayesianLinear;
    fn deref(&self) -> &BayesianLinear {
        &self.base
    }
}

impl fmt::Display for BayesianLinearRestricted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Restricted[{} restrictions] over {}",
            self.restrict_select.nrows(),
            self.base
        )
    }
}
