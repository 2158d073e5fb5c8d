//! Truncated univariate normal sampling.
//!
//! Given truncation bounds `[lower, upper]`, the sampler picks, once at
//! construction, whichever of four rejection schemes has the best expected
//! cost for that region:
//!
//! - *normal* rejection when the region straddles the mean and is wide;
//! - *uniform* rejection when the region is narrow (straddling or not);
//! - *half-normal* rejection when the region sits in one tail but close to
//!   the mean;
//! - *exponential* rejection when the region sits far out in a tail.
//!
//! The region thresholds are tuned constants; the exponential branch keeps
//! tail draws exact arbitrarily far out, where a quantile-of-CDF approach
//! would lose all precision past roughly 8σ.  Every scheme redraws until the
//! proposal falls inside `[lower, upper]`, so a returned value can never
//! escape the bounds.

use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::{Exp, Normal};

use crate::error::{Error, Result};

/// Boundary between half-normal and exponential rejection: one-sided
/// regions starting within this many σ of the mean use half-normal.
const HR_BELOW_ER_ABOVE: f64 = 0.7565;
/// Straddling regions narrower than this many σ use uniform rejection
/// instead of normal rejection.
const UR_BELOW_NR_ABOVE: f64 = 1.4621;
/// Above this α the cheap `1/α` approximation of the ER/UR cost threshold
/// is accurate enough.
const SIMPLIFY_ER_UR_ABOVE: f64 = 0.6234;
/// Above this α the exponential rate `(α + √(α²+4))/2` is well approximated
/// by α itself.
const SIMPLIFY_ER_LAMBDA_ABOVE: f64 = 1.6193;
/// Relative cost of an exponential draw versus a uniform draw.
const COST_ER_REL_UR: f64 = 0.9963;

#[derive(Debug, Clone, Copy)]
enum Method {
    /// `lower == upper`: the distribution is a point mass.
    Trivial,
    Normal {
        dist: Normal,
    },
    HalfNormal {
        left_tail: bool,
    },
    Uniform {
        /// `(a − mean)²` for a one-sided region with near bound `a`; 0 when
        /// the region straddles the mean.
        shift: f64,
        inv_2_sigma_sq: f64,
    },
    Exponential {
        left_tail: bool,
        /// Normalized near bound, `≥ 0`.
        alpha: f64,
        /// Normalized far bound; may be infinite.
        beta: f64,
        /// Proposal rate in normalized space.
        lambda: f64,
    },
}

/// A truncated normal distribution with fixed parameters.  Implements
/// `rand::distributions::Distribution<f64>`.
#[derive(Debug, Clone, Copy)]
pub struct TruncatedNormal {
    mean: f64,
    sigma: f64,
    lower: f64,
    upper: f64,
    method: Method,
}

/// 3rd-order Taylor approximation of `e^x`, adequate over the small
/// exponents the half-normal/uniform threshold sees.
fn t3(x: f64) -> f64 {
    1.0 + x * (1.0 + x * (0.5 + x / 6.0))
}

impl TruncatedNormal {
    /// A truncated standard normal over `[lower, upper]`.
    pub fn standard(lower: f64, upper: f64) -> Result<TruncatedNormal> {
        TruncatedNormal::new(0.0, 1.0, lower, upper)
    }

    pub fn new(mean: f64, sigma: f64, lower: f64, upper: f64) -> Result<TruncatedNormal> {
        if !(sigma > 0.0) || lower > upper || mean.is_nan() {
            return Err(Error::Domain(format!(
                "invalid truncated normal parameters: mean={mean}, sigma={sigma}, \
                 range=[{lower}, {upper}]"
            )));
        }
        let method = TruncatedNormal::pick_method(mean, sigma, lower, upper);
        Ok(TruncatedNormal {
            mean,
            sigma,
            lower,
            upper,
            method,
        })
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    fn pick_method(mean: f64, sigma: f64, lower: f64, upper: f64) -> Method {
        if lower == upper {
            return Method::Trivial;
        }
        if lower < mean && mean < upper {
            // Straddling the mean: narrow regions reject too often under
            // plain normal sampling.
            if upper - lower < sigma * UR_BELOW_NR_ABOVE {
                return Method::Uniform {
                    shift: 0.0,
                    inv_2_sigma_sq: 0.5 / (sigma * sigma),
                };
            }
            return Method::Normal {
                dist: Normal::new(mean, sigma).expect("validated parameters"),
            };
        }

        // One-sided: mirror the left tail onto the right so 0 ≤ a < b.
        let (left_tail, a, b) = if lower >= mean {
            (false, lower - mean, upper - mean)
        } else {
            (true, mean - upper, mean - lower)
        };
        let alpha = a / sigma;
        let beta = b / sigma;

        if a <= sigma * HR_BELOW_ER_ABOVE {
            // Near the mean: half-normal unless the region is so short that
            // its acceptance rate loses to uniform rejection.
            let hr_threshold = a + sigma * std::f64::consts::FRAC_PI_2.sqrt() * t3(0.5 * alpha * alpha);
            if b >= hr_threshold {
                Method::HalfNormal { left_tail }
            } else {
                Method::Uniform {
                    shift: a * a,
                    inv_2_sigma_sq: 0.5 / (sigma * sigma),
                }
            }
        } else {
            // Out in the tail: exponential rejection unless the region is
            // narrow enough that uniform rejection is cheaper.  The
            // threshold is ~c/α for large α; below SIMPLIFY_ER_UR_ABOVE the
            // exact expression is worth computing.
            let use_uniform = if alpha >= SIMPLIFY_ER_UR_ABOVE {
                b * a < a * a + sigma * sigma * COST_ER_REL_UR
            } else {
                let sqrt_a2p4 = (alpha * alpha + 4.0).sqrt();
                (b - a) * (alpha + sqrt_a2p4)
                    < sigma
                        * COST_ER_REL_UR
                        * 2.0
                        * (0.5 + 0.25 * (alpha * alpha - alpha * sqrt_a2p4)).exp()
            };
            if use_uniform {
                Method::Uniform {
                    shift: a * a,
                    inv_2_sigma_sq: 0.5 / (sigma * sigma),
                }
            } else {
                let lambda = if alpha >= SIMPLIFY_ER_LAMBDA_ABOVE {
                    alpha
                } else {
                    0.5 * (alpha + (alpha * alpha + 4.0).sqrt())
                };
                Method::Exponential {
                    left_tail,
                    alpha,
                    beta,
                    lambda,
                }
            }
        }
    }
}

impl Distribution<f64> for TruncatedNormal {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self.method {
            Method::Trivial => self.lower,

            Method::Normal { dist } => loop {
                let x = dist.sample(rng);
                if x >= self.lower && x <= self.upper {
                    return x;
                }
            },

            Method::HalfNormal { left_tail } => {
                let std_normal = Normal::new(0.0, 1.0).expect("unit normal");
                let signed_sigma = if left_tail { -self.sigma } else { self.sigma };
                loop {
                    let x = self.mean + signed_sigma * std_normal.sample(rng).abs();
                    if x >= self.lower && x <= self.upper {
                        return x;
                    }
                }
            }

            Method::Uniform {
                shift,
                inv_2_sigma_sq,
            } => loop {
                let x = rng.gen_range(self.lower..self.upper);
                let d = x - self.mean;
                let rho = (inv_2_sigma_sq * (shift - d * d)).exp();
                if rng.gen::<f64>() <= rho {
                    return x;
                }
            },

            Method::Exponential {
                left_tail,
                alpha,
                beta,
                lambda,
            } => {
                let exp1 = Exp::new(1.0).expect("unit exponential");
                loop {
                    // Proposal z = α + Exp(λ), redrawn until it respects the
                    // outer bound.
                    let mut z;
                    loop {
                        z = alpha + exp1.sample(rng) / lambda;
                        if z <= beta {
                            break;
                        }
                    }
                    if 2.0 * exp1.sample(rng) > (z - lambda) * (z - lambda) {
                        return if left_tail {
                            self.mean - z * self.sigma
                        } else {
                            self.mean + z * self.sigma
                        };
                    }
                }
            }
        }
    }
}
