//! Sigma-point generators for the unscented filter.

use nalgebra as na;

use na::{DMatrix, DVector, RealField};
use num_traits::{One, Zero};

use crate::error::Error;
use crate::ud::UdFactor;
use crate::ukf::SigmaProcess;

/// A deterministic sampling scheme for the unscented transform.
///
/// Implementations must emit `w_c` with every non-negative weight ahead of
/// every negative one, so the transform applies its rank-1 updates before
/// its downdates.
pub trait SigmaPoints<R: RealField + Copy> {
    /// Number of sigma points for an `nx`-dimensional state.
    fn num_points(&self, nx: usize) -> usize;

    /// Fill the mean and covariance weight vectors (length
    /// `num_points(nx)`).
    fn weights_into(&self, nx: usize, wm: &mut DVector<R>, wc: &mut DVector<R>);

    /// Fill `sigmas` (one point per row) from the state and covariance
    /// factors, using the model's addition for manifold-valued states.
    /// `scratch` must have length `nx`.
    fn points_into<P: SigmaProcess<R>>(
        &self,
        model: &P,
        x: &DVector<R>,
        p: &UdFactor<R>,
        sigmas: &mut DMatrix<R>,
        scratch: &mut DVector<R>,
    ) -> Result<(), Error>;
}

/// Van der Merwe scaled sigma points: `2n + 1` points parameterized by
/// `(alpha, beta, kappa)`.
///
/// Typical choices are `alpha ∈ (0, 1]`, `beta = 2` for Gaussian priors,
/// and `kappa = 0` or `3 − n`. The center point carries the weights
/// `λ/(n+λ)` and `λ/(n+λ) + 1 − α² + β` and is emitted last, which keeps
/// the covariance weights ordered positives-first whenever the center
/// weight is negative.
#[derive(Debug, Clone, Copy)]
pub struct MerweSigmaPoints<R> {
    /// Spread of the points around the mean.
    pub alpha: R,
    /// Prior-distribution correction applied to the center covariance
    /// weight.
    pub beta: R,
    /// Secondary scaling parameter.
    pub kappa: R,
}

impl<R: RealField + Copy> MerweSigmaPoints<R> {
    /// A generator with the given scaling parameters.
    ///
    /// Panics if `alpha` is not strictly positive.
    pub fn new(alpha: R, beta: R, kappa: R) -> Self {
        assert!(alpha > R::zero(), "sigma-point spread must be positive");
        MerweSigmaPoints { alpha, beta, kappa }
    }

    #[inline]
    fn lambda_plus_n(&self, nx: usize) -> R {
        let n: R = na::convert(nx as f64);
        self.alpha * self.alpha * (n + self.kappa)
    }
}

impl<R: RealField + Copy> SigmaPoints<R> for MerweSigmaPoints<R> {
    fn num_points(&self, nx: usize) -> usize {
        2 * nx + 1
    }

    fn weights_into(&self, nx: usize, wm: &mut DVector<R>, wc: &mut DVector<R>) {
        let n: R = na::convert(nx as f64);
        let a2 = self.alpha * self.alpha;
        let lambda = a2 * (n + self.kappa) - n;
        let np = 2 * nx;

        let center = lambda / (n + lambda);
        wm[np] = center;
        wc[np] = center + (R::one() - a2 + self.beta);

        let c = na::convert::<f64, R>(0.5) / (n + lambda);
        for i in 0..np {
            wm[i] = c;
            wc[i] = c;
        }

        #[cfg(debug_assertions)]
        {
            approx::assert_relative_eq!(wm.sum(), R::one(), max_relative = na::convert(1e-9));
        }
    }

    fn points_into<P: SigmaProcess<R>>(
        &self,
        model: &P,
        x: &DVector<R>,
        p: &UdFactor<R>,
        sigmas: &mut DMatrix<R>,
        scratch: &mut DVector<R>,
    ) -> Result<(), Error> {
        let nx = x.len();
        let lam_n = self.lambda_plus_n(nx);

        // Rows 0..nx and nx..2nx both start as Uᵀ, one column of U per row.
        p.embed_ut_rows(sigmas, 0);
        for i in 0..nx {
            for j in 0..nx {
                sigmas[(nx + i, j)] = sigmas[(i, j)];
            }
        }

        for i in 0..nx {
            let mult = (p.d()[i] * lam_n).sqrt();
            for (row, sign) in [(i, mult), (nx + i, -mult)] {
                for j in 0..nx {
                    scratch[j] = sigmas[(row, j)];
                }
                model.add_scaled_into(scratch, x, sign);
                for j in 0..nx {
                    sigmas[(row, j)] = scratch[j];
                }
            }
        }

        for j in 0..nx {
            sigmas[(2 * nx, j)] = x[j];
        }
        Ok(())
    }
}
