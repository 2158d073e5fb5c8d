//! Natural-conjugate Bayesian linear regression.
//!
//! The model is `y = Xβ + ε`, `ε ~ N(0, σ²)`, with the normal-gamma prior
//! `β | σ² ~ N(β̄, σ²V)` and `n·s²/σ² ~ χ²(n)`.  Parameters are stored as
//! `(V⁻¹, V⁻¹β̄, s², n)`; keeping `V⁻¹β̄` instead of `β̄` lets the update
//!
//! ```text
//! V⁻¹ ← V⁻¹ + XᵀX        V⁻¹β̄ ← V⁻¹β̄ + Xᵀy        n ← n + rows(X)
//! n₁s²₁ = n₀s²₀ + yᵀy + β̄₀·(V₀⁻¹β̄₀) − β̄₁·(V₁⁻¹β̄₁)
//! ```
//!
//! run without inverting anything, and makes updating with `(X₁,y₁)` then
//! `(X₂,y₂)` exactly equivalent to one update with the stacked data.
//!
//! A model constructed *noninformative* buffers its raw data until `XᵀX`
//! reaches full column rank; at that point the posterior is computed from
//! the buffered data alone (ordinary least squares; the placeholder prior
//! parameters never contaminate it) and the model becomes informative.
//!
//! *Weakening* by `w ≥ 1` scales the β covariance by `w²` (i.e. `V⁻¹` and
//! `V⁻¹β̄` shrink by `1/w²`) without touching `β̄`, `s²`, or `n`: the same
//! beliefs, held with deliberately less confidence.

use std::fmt;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::{ChiSquared, Normal};

use crate::error::{Error, Result};

/// `n` of a freshly constructed noninformative model.
pub const NONINFORMATIVE_N: f64 = 1e-3;
/// `s²` of a freshly constructed noninformative model.
pub const NONINFORMATIVE_S2: f64 = 1.0;
/// Diagonal of `V` for a noninformative model (so `V⁻¹ = 1e-8·I`).
pub const NONINFORMATIVE_VARIANCE: f64 = 1e8;

/// Default number of posterior draws backing `predict` when no cache
/// exists and no count is given.
const DEFAULT_PREDICT_DRAWS: usize = 1000;

pub struct BayesianLinear {
    pub(crate) k: usize,
    pub(crate) s2: f64,
    pub(crate) n: f64,
    pub(crate) v_inv: DMatrix<f64>,
    pub(crate) v_inv_beta: DVector<f64>,
    pub(crate) noninformative: bool,

    // Raw data buffered while noninformative, plus the unweakened originals
    // (weakening scales the working copies by 1/w).
    noninf_x: Option<DMatrix<f64>>,
    noninf_y: Option<DVector<f64>>,
    noninf_x_unweakened: Option<DMatrix<f64>>,
    noninf_y_unweakened: Option<DVector<f64>>,

    names: Option<Vec<String>>,

    // Caches, all derived from the parameters above and reset on any
    // update or weakening.  Not thread-safe by design: the owning member's
    // lock provides exclusion.
    beta_cache: Option<DVector<f64>>,
    v_inv_chol: Option<Cholesky<f64, Dyn>>,
    v_cache: Option<DMatrix<f64>>,
    root_sigma_cache: Option<DMatrix<f64>>,
    last_draw: Option<DVector<f64>>,
    prediction_draws: Option<DMatrix<f64>>,
    prediction_errors: Option<DMatrix<f64>>,
}

impl BayesianLinear {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// A `k`-parameter model with a noninformative prior.  The placeholder
    /// parameters (`β̄ = 0`, `s² = 1`, `V⁻¹ = 1e-8·I`, `n = 1e-3`) are never
    /// used once enough data arrives to identify the model.
    pub fn noninformative(k: usize) -> Result<BayesianLinear> {
        if k == 0 {
            return Err(Error::Domain("model size k must be at least 1".into()));
        }
        Ok(BayesianLinear {
            k,
            s2: NONINFORMATIVE_S2,
            n: NONINFORMATIVE_N,
            v_inv: DMatrix::identity(k, k) / NONINFORMATIVE_VARIANCE,
            v_inv_beta: DVector::zeros(k),
            noninformative: true,
            noninf_x: None,
            noninf_y: None,
            noninf_x_unweakened: None,
            noninf_y_unweakened: None,
            names: None,
            beta_cache: None,
            v_inv_chol: None,
            v_cache: None,
            root_sigma_cache: None,
            last_draw: None,
            prediction_draws: None,
            prediction_errors: None,
        })
    }

    /// A noninformative model preloaded with `(X, y)` rows.  If the preload
    /// already has full column rank the model comes out informative.
    pub fn noninformative_with_data(
        k: usize,
        x: DMatrix<f64>,
        y: DVector<f64>,
    ) -> Result<BayesianLinear> {
        let mut model = BayesianLinear::noninformative(k)?;
        model.update(&y, &x)?;
        Ok(model)
    }

    /// An informative model from explicit parameters.
    pub fn informative(
        beta: DVector<f64>,
        s2: f64,
        v_inv: DMatrix<f64>,
        n: f64,
    ) -> Result<BayesianLinear> {
        let k = beta.len();
        if k == 0 {
            return Err(Error::Domain("model size k must be at least 1".into()));
        }
        if v_inv.nrows() != k || v_inv.ncols() != k {
            return Err(Error::Domain(format!(
                "V^-1 must be {k}x{k}, got {}x{}",
                v_inv.nrows(),
                v_inv.ncols()
            )));
        }
        if !(s2 >= 0.0) || !(n >= 0.0) {
            return Err(Error::Domain(format!(
                "s2 and n must be non-negative, got s2={s2}, n={n}"
            )));
        }
        let v_inv_beta = &v_inv * &beta;
        Ok(BayesianLinear {
            k,
            s2,
            n,
            v_inv,
            v_inv_beta,
            noninformative: false,
            noninf_x: None,
            noninf_y: None,
            noninf_x_unweakened: None,
            noninf_y_unweakened: None,
            names: None,
            beta_cache: Some(beta),
            v_inv_chol: None,
            v_cache: None,
            root_sigma_cache: None,
            last_draw: None,
            prediction_draws: None,
            prediction_errors: None,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Number of coefficients.
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n(&self) -> f64 {
        self.n
    }

    pub fn s2(&self) -> f64 {
        self.s2
    }

    pub fn is_noninformative(&self) -> bool {
        self.noninformative
    }

    pub fn v_inv(&self) -> &DMatrix<f64> {
        &self.v_inv
    }

    pub fn v_inv_beta(&self) -> &DVector<f64> {
        &self.v_inv_beta
    }

    /// The posterior coefficient mean `β̄ = V·(V⁻¹β̄)`.
    pub fn beta(&mut self) -> Result<DVector<f64>> {
        if self.beta_cache.is_none() {
            self.ensure_v_inv_chol()?;
            let chol = self.v_inv_chol.as_ref().expect("just ensured");
            let solved = chol.solve(&self.v_inv_beta);
            self.beta_cache = Some(solved);
        }
        Ok(self.beta_cache.clone().expect("filled above"))
    }

    /// The coefficient covariance factor `V = (V⁻¹)⁻¹`.
    pub fn v(&mut self) -> Result<DMatrix<f64>> {
        if self.v_cache.is_none() {
            self.ensure_v_inv_chol()?;
            let inv = self.v_inv_chol.as_ref().expect("just ensured").inverse();
            self.v_cache = Some(inv);
        }
        Ok(self.v_cache.clone().expect("filled above"))
    }

    /// The lower Cholesky root `L` of `s²V`.
    pub(crate) fn root_sigma(&mut self) -> Result<DMatrix<f64>> {
        if self.root_sigma_cache.is_none() {
            let sv = self.v()? * self.s2;
            let chol = Cholesky::new(sv).ok_or(Error::InvalidState(
                "s^2 V is not positive definite",
            ))?;
            self.root_sigma_cache = Some(chol.l());
        }
        Ok(self.root_sigma_cache.clone().expect("filled above"))
    }

    fn ensure_v_inv_chol(&mut self) -> Result<()> {
        if self.v_inv_chol.is_none() {
            let chol = Cholesky::new(self.v_inv.clone()).ok_or(Error::InvalidState(
                "V^-1 is not positive definite",
            ))?;
            self.v_inv_chol = Some(chol);
        }
        Ok(())
    }

    /// The buffered noninformative data, if any.  Reflects weakening (rows
    /// are scaled by `1/w`).
    pub fn noninformative_data(&self) -> Option<(&DMatrix<f64>, &DVector<f64>)> {
        Some((self.noninf_x.as_ref()?, self.noninf_y.as_ref()?))
    }

    /// The buffered noninformative data as originally provided.
    pub fn noninformative_data_unweakened(&self) -> Option<(&DMatrix<f64>, &DVector<f64>)> {
        Some((
            self.noninf_x_unweakened.as_ref()?,
            self.noninf_y_unweakened.as_ref()?,
        ))
    }

    /// Coefficient names; defaults to `"0" .. "k-1"`.
    pub fn names(&self) -> Vec<String> {
        match &self.names {
            Some(names) => names.clone(),
            None => (0..self.k).map(|i| i.to_string()).collect(),
        }
    }

    /// Sets coefficient names; an empty vector restores the defaults.
    pub fn set_names(&mut self, names: Vec<String>) -> Result<()> {
        if names.is_empty() {
            self.names = None;
        } else if names.len() == self.k {
            self.names = Some(names);
        } else {
            return Err(Error::Domain(format!(
                "names must have length 0 or {}, got {}",
                self.k,
                names.len()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Updating and weakening
    // ------------------------------------------------------------------

    /// Incorporates the data `(X, y)`.
    ///
    /// A noninformative model buffers the rows; once the buffered `XᵀX`
    /// becomes invertible the posterior is computed from the buffer alone
    /// and the model turns informative.  An informative model performs the
    /// standard conjugate update.
    pub fn update(&mut self, y: &DVector<f64>, x: &DMatrix<f64>) -> Result<()> {
        if x.nrows() != y.len() {
            return Err(Error::Domain(format!(
                "X has {} rows but y has {}",
                x.nrows(),
                y.len()
            )));
        }
        if x.ncols() != self.k {
            return Err(Error::Domain(format!(
                "X has {} columns but the model has k={}",
                x.ncols(),
                self.k
            )));
        }
        if self.noninformative {
            self.buffer_noninformative(y, x);
            self.try_crossover();
        } else {
            self.update_informative(y, x)?;
        }
        self.reset_caches();
        Ok(())
    }

    /// Consuming form of [`update`](BayesianLinear::update).
    pub fn updated(mut self, y: &DVector<f64>, x: &DMatrix<f64>) -> Result<BayesianLinear> {
        self.update(y, x)?;
        Ok(self)
    }

    /// Scales the β standard deviation by `w ≥ 1` without changing `β̄`:
    /// `V⁻¹` and `V⁻¹β̄` shrink by `1/w²`; buffered noninformative data is
    /// scaled by `1/w` so `(XᵀX)⁻¹` weakens consistently.
    pub fn weaken(&mut self, w: f64) -> Result<()> {
        if !(w >= 1.0) {
            return Err(Error::Domain(format!(
                "weakening factor must be at least 1, got {w}"
            )));
        }
        if w == 1.0 {
            return Ok(());
        }
        let w2 = w * w;
        self.v_inv /= w2;
        self.v_inv_beta /= w2;
        if self.noninformative {
            if let Some(x) = self.noninf_x.as_mut() {
                *x /= w;
            }
            if let Some(y) = self.noninf_y.as_mut() {
                *y /= w;
            }
        }
        self.reset_caches();
        Ok(())
    }

    /// Consuming form of [`weaken`](BayesianLinear::weaken).
    pub fn weakened(mut self, w: f64) -> Result<BayesianLinear> {
        self.weaken(w)?;
        Ok(self)
    }

    /// Weakens, then updates: the usual way a last-period belief becomes
    /// this period's prior.
    pub fn posterior(
        mut self,
        y: &DVector<f64>,
        x: &DMatrix<f64>,
        w: f64,
    ) -> Result<BayesianLinear> {
        self.weaken(w)?;
        self.update(y, x)?;
        Ok(self)
    }

    fn buffer_noninformative(&mut self, y: &DVector<f64>, x: &DMatrix<f64>) {
        append_rows(&mut self.noninf_x, x);
        append_vec(&mut self.noninf_y, y);
        append_rows(&mut self.noninf_x_unweakened, x);
        append_vec(&mut self.noninf_y_unweakened, y);
    }

    /// Promotes a noninformative model once the buffered data identifies
    /// it.  The posterior is plain OLS on the buffer: `V⁻¹ = XᵀX`,
    /// `V⁻¹β̄ = Xᵀy`, `n = rows`, `s² = RSS/n`.
    fn try_crossover(&mut self) {
        let (Some(x), Some(y)) = (self.noninf_x.as_ref(), self.noninf_y.as_ref()) else {
            return;
        };
        let xtx = x.tr_mul(x);
        let Some(chol) = Cholesky::new(xtx.clone()) else {
            return; // still rank-deficient
        };
        let xty = x.tr_mul(y);
        let beta_hat = chol.solve(&xty);
        let resid = y - x * &beta_hat;
        let rows = x.nrows() as f64;

        self.v_inv = xtx;
        self.v_inv_beta = xty;
        self.n = rows;
        self.s2 = resid.norm_squared() / rows;
        self.noninformative = false;
        self.noninf_x = None;
        self.noninf_y = None;
        self.noninf_x_unweakened = None;
        self.noninf_y_unweakened = None;
    }

    fn update_informative(&mut self, y: &DVector<f64>, x: &DMatrix<f64>) -> Result<()> {
        let beta_old = self.beta()?;
        let quad_old = beta_old.dot(&self.v_inv_beta);

        self.v_inv += x.tr_mul(x);
        self.v_inv_beta += x.tr_mul(y);
        let n_old = self.n;
        self.n += x.nrows() as f64;

        self.beta_cache = None;
        self.v_inv_chol = None;
        let beta_new = self.beta()?;
        let quad_new = beta_new.dot(&self.v_inv_beta);

        // n₁s²₁ = n₀s²₀ + yᵀy + β̄₀·(V₀⁻¹β̄₀) − β̄₁·(V₁⁻¹β̄₁); clamp the
        // rounding residue on perfectly fitting data.
        let ns2 = n_old * self.s2 + y.norm_squared() + quad_old - quad_new;
        self.s2 = (ns2 / self.n).max(0.0);
        Ok(())
    }

    /// Clears every derived cache.  Extended by the restricted subclass.
    pub(crate) fn reset_caches(&mut self) {
        self.beta_cache = None;
        self.v_inv_chol = None;
        self.v_cache = None;
        self.root_sigma_cache = None;
        self.last_draw = None;
        self.discard();
    }

    // ------------------------------------------------------------------
    // Drawing and prediction
    // ------------------------------------------------------------------

    /// One posterior draw: `u ~ χ²(n)`, `σ² = n·s²/u`, `β = β̄ + √(n/u)·Lz`
    /// with `z ~ N(0, I)` and `L` the root of `s²V`.  Returns the `K+1`
    /// vector `[β; σ²]`, also cached as [`last_draw`](Self::last_draw).
    /// Model parameters are never modified by draws.
    pub fn draw<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<DVector<f64>> {
        let chi = ChiSquared::new(self.n)
            .map_err(|e| Error::Domain(format!("chi-squared({}) invalid: {e}", self.n)))?;
        let u = chi.sample(rng);
        let sigma2 = self.n * self.s2 / u;
        let mult = (self.n / u).sqrt();

        let l = self.root_sigma()?;
        let beta_bar = self.beta()?;
        let std_normal = Normal::new(0.0, 1.0).expect("unit normal");
        let z = DVector::from_fn(self.k, |_, _| std_normal.sample(rng));
        let beta = beta_bar + (l * z) * mult;

        let mut out = DVector::zeros(self.k + 1);
        out.rows_mut(0, self.k).copy_from(&beta);
        out[self.k] = sigma2;
        self.last_draw = Some(out.clone());
        Ok(out)
    }

    /// The vector returned by the most recent draw, if any.
    pub fn last_draw(&self) -> Option<&DVector<f64>> {
        self.last_draw.as_ref()
    }

    pub(crate) fn set_last_draw(&mut self, draw: DVector<f64>) {
        self.last_draw = Some(draw);
    }

    /// Drops the cached prediction draws and error terms; the next
    /// `predict` performs fresh draws.
    pub fn discard(&mut self) {
        self.prediction_draws = None;
        self.prediction_errors = None;
    }

    /// Predicted mean `y*` for each row of `x`, averaged over `draws`
    /// posterior draws.  Draws, and their per-draw error terms, are
    /// cached and reused, so repeating the call yields numerically
    /// identical results until [`discard`](Self::discard).  `draws == 0`
    /// reuses the whole cache (or 1000 fresh draws if none).
    pub fn predict<R: Rng + ?Sized>(
        &mut self,
        x: &DMatrix<f64>,
        draws: usize,
        rng: &mut R,
    ) -> Result<DVector<f64>> {
        let id: fn(f64) -> f64 = |y| y;
        let m = self.predict_generic(x, &[&id], draws, rng)?;
        Ok(m.column(0).into_owned())
    }

    /// Like [`predict`](Self::predict), with the per-row sample variance of
    /// the predictions in a second column.
    pub fn predict_variance<R: Rng + ?Sized>(
        &mut self,
        x: &DMatrix<f64>,
        draws: usize,
        rng: &mut R,
    ) -> Result<DMatrix<f64>> {
        let id: fn(f64) -> f64 = |y| y;
        let sq: fn(f64) -> f64 = |y| y * y;
        let d = if draws > 0 {
            draws
        } else {
            self.prediction_draws
                .as_ref()
                .map_or(DEFAULT_PREDICT_DRAWS, |m| m.ncols())
        } as f64;
        let m = self.predict_generic(x, &[&id, &sq], draws, rng)?;
        let mut out = DMatrix::zeros(x.nrows(), 2);
        for r in 0..x.nrows() {
            let mean = m[(r, 0)];
            let mean_sq = m[(r, 1)];
            out[(r, 0)] = mean;
            // Sample variance: d/(d-1) · (E[y²] − E[y]²).
            out[(r, 1)] = if d > 1.0 {
                (mean_sq - mean * mean) * d / (d - 1.0)
            } else {
                0.0
            };
        }
        Ok(out)
    }

    /// Column means of `g(y*)` for each supplied `g`, across posterior
    /// draws.  Fails with `InvalidState` on a noninformative model.
    pub fn predict_generic<R: Rng + ?Sized>(
        &mut self,
        x: &DMatrix<f64>,
        g: &[&dyn Fn(f64) -> f64],
        draws: usize,
        rng: &mut R,
    ) -> Result<DMatrix<f64>> {
        if self.noninformative {
            return Err(Error::InvalidState(
                "prediction requires an informative model",
            ));
        }
        if x.ncols() != self.k {
            return Err(Error::Domain(format!(
                "X has {} columns but the model has k={}",
                x.ncols(),
                self.k
            )));
        }
        let want = if draws > 0 {
            draws
        } else {
            self.prediction_draws
                .as_ref()
                .map_or(DEFAULT_PREDICT_DRAWS, |m| m.ncols())
        };
        self.ensure_prediction_draws(want, rng)?;
        self.ensure_prediction_errors(x.nrows(), want, rng);

        let betas = self.prediction_draws.as_ref().expect("ensured above");
        let errors = self.prediction_errors.as_ref().expect("ensured above");
        let rows = x.nrows();
        let mut acc = DMatrix::zeros(rows, g.len());
        for j in 0..want {
            let beta = betas.column(j).rows(0, self.k).into_owned();
            let sigma = betas[(self.k, j)].sqrt();
            let y_star = x * beta;
            for r in 0..rows {
                let y = y_star[r] + sigma * errors[(r, j)];
                for (c, gf) in g.iter().enumerate() {
                    acc[(r, c)] += gf(y);
                }
            }
        }
        acc /= want as f64;
        Ok(acc)
    }

    fn ensure_prediction_draws<R: Rng + ?Sized>(&mut self, want: usize, rng: &mut R) -> Result<()> {
        let have = self.prediction_draws.as_ref().map_or(0, |m| m.ncols());
        if have >= want {
            return Ok(());
        }
        let mut grown = DMatrix::zeros(self.k + 1, want);
        if let Some(old) = &self.prediction_draws {
            grown.columns_mut(0, have).copy_from(old);
        }
        for j in have..want {
            let draw = self.draw(rng)?;
            grown.column_mut(j).copy_from(&draw);
        }
        self.prediction_draws = Some(grown);
        Ok(())
    }

    fn ensure_prediction_errors<R: Rng + ?Sized>(&mut self, rows: usize, cols: usize, rng: &mut R) {
        let (have_r, have_c) = self
            .prediction_errors
            .as_ref()
            .map_or((0, 0), |m| (m.nrows(), m.ncols()));
        if have_r >= rows && have_c >= cols {
            return;
        }
        let std_normal = Normal::new(0.0, 1.0).expect("unit normal");
        let new_r = rows.max(have_r);
        let new_c = cols.max(have_c);
        let mut grown = DMatrix::from_fn(new_r, new_c, |_, _| std_normal.sample(rng));
        if let Some(old) = &self.prediction_errors {
            grown
                .view_mut((0, 0), (have_r, have_c))
                .copy_from(old);
        }
        self.prediction_errors = Some(grown);
    }
}

impl fmt::Display for BayesianLinear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.noninformative {
            return write!(f, "BayesianLinear(noninformative, k={})", self.k);
        }
        // Recompute β̄ without touching the cache (Display takes &self).
        let beta = Cholesky::new(self.v_inv.clone())
            .map(|c| c.solve(&self.v_inv_beta));
        write!(f, "BayesianLinear(k={}, n={}, s2={:.6}", self.k, self.n, self.s2)?;
        if let Some(beta) = beta {
            write!(f, ", beta=[")?;
            let names = self.names();
            for (i, name) in names.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{name}={:.6}", beta[i])?;
            }
            write!(f, "]")?;
        }
        write!(f, ")")
    }
}

fn append_rows(buffer: &mut Option<DMatrix<f64>>, x: &DMatrix<f64>) {
    *buffer = Some(match buffer.take() {
        Some(old) => {
            let mut grown = DMatrix::zeros(old.nrows() + x.nrows(), x.ncols());
            grown.rows_mut(0, old.nrows()).copy_from(&old);
            grown.rows_mut(old.nrows(), x.nrows()).copy_from(x);
            grown
        }
        None => x.clone(),
    });
}

fn append_vec(buffer: &mut Option<DVector<f64>>, y: &DVector<f64>) {
    *buffer = Some(match buffer.take() {
        Some(old) => {
            let mut grown = DVector::zeros(old.len() + y.len());
            grown.rows_mut(0, old.len()).copy_from(&old);
            grown.rows_mut(old.len(), y.len()).copy_from(y);
            grown
        }
        None => y.clone(),
    });
}
