//! UD-factorized Unscented Kalman Filter.
//!
//! The covariance factors are rebuilt from sigma points with weighted
//! Agee–Turner rank-1 updates and downdates instead of a dense outer
//! product, so positive definiteness is preserved through the same packed
//! `U`/`D` machinery the EKF uses. Two update styles are provided: the
//! sequential Bierman-like scalar updates (plain, adaptive, robust,
//! adaptive-robust) and the full-matrix update with its adaptive variant.

use nalgebra as na;

use na::{DMatrix, DVector, RealField};
use num_traits::{One, Zero};

use crate::ekf::default_chi2;
use crate::error::{Error, ErrorKind, Flags};
use crate::sigma::SigmaPoints;
use crate::ud::UdFactor;
use crate::update::{adaptive_correction, bierman_body, robustify, Influence};

/// State-space side of an unscented model: the transition and the
/// geometry of the state manifold.
///
/// Every method has a default suitable for vector-valued states with the
/// identity transition; override the geometry hooks for states holding
/// e.g. wrapped angles or quaternions.
pub trait SigmaProcess<R: RealField + Copy> {
    /// Advance one sigma point in place. Defaults to the identity.
    fn transition(&self, _x: &mut DVector<R>) {}

    /// Weighted mean of the sigma points (one per row of `sigmas`).
    fn mean_into(&self, mu: &mut DVector<R>, sigmas: &DMatrix<R>, wm: &DVector<R>) {
        mu.gemv_tr(R::one(), sigmas, wm, R::zero());
    }

    /// State residual `out = a − b`.
    fn residual_into(&self, out: &mut DVector<R>, a: &DVector<R>, b: &DVector<R>) {
        out.copy_from(a);
        *out -= b;
    }

    /// Scaled addition `delta ← pivot + mult·delta` used when spreading
    /// sigma points around the mean.
    fn add_scaled_into(&self, delta: &mut DVector<R>, pivot: &DVector<R>, mult: R) {
        for i in 0..delta.len() {
            delta[i] = pivot[i] + mult * delta[i];
        }
    }
}

/// Identity process model.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProcess;

impl<R: RealField + Copy> SigmaProcess<R> for IdentityProcess {}

/// Measurement side of an unscented model.
pub trait SigmaMeasurement<R: RealField + Copy> {
    /// Predict the measurement for one sigma point.
    fn measure_into(&self, z: &mut DVector<R>, x: &DVector<R>);

    /// Weighted mean of the measurement sigma points.
    fn mean_into(&self, mu: &mut DVector<R>, sigmas: &DMatrix<R>, wm: &DVector<R>) {
        mu.gemv_tr(R::one(), sigmas, wm, R::zero());
    }

    /// Measurement residual `out = a − b`.
    fn residual_into(&self, out: &mut DVector<R>, a: &DVector<R>, b: &DVector<R>) {
        out.copy_from(a);
        *out -= b;
    }
}

fn copy_row<R: RealField + Copy>(m: &DMatrix<R>, i: usize, out: &mut DVector<R>) {
    for j in 0..out.len() {
        out[j] = m[(i, j)];
    }
}

fn write_row<R: RealField + Copy>(m: &mut DMatrix<R>, i: usize, v: &DVector<R>) {
    for j in 0..v.len() {
        m[(i, j)] = v[j];
    }
}

/// Weighted reconstruction of a mean and UD covariance from sigma points.
///
/// `res` and `sig` are scratch vectors of the output dimension. When
/// `noise` is given the factors start from it, otherwise from zero. The
/// covariance weights must come positives-first so every downdate hits a
/// factor already inflated by the updates.
#[allow(clippy::too_many_arguments)]
fn unscented_transform<R, MF, RF>(
    mean: &mut DVector<R>,
    fac: &mut UdFactor<R>,
    res: &mut DVector<R>,
    sig: &mut DVector<R>,
    sigmas: &DMatrix<R>,
    wm: &DVector<R>,
    wc: &DVector<R>,
    noise: Option<&UdFactor<R>>,
    mf: MF,
    mut rf: RF,
) -> Result<(), Error>
where
    R: RealField + Copy,
    MF: FnOnce(&mut DVector<R>, &DMatrix<R>, &DVector<R>),
    RF: FnMut(&mut DVector<R>, &DVector<R>, &DVector<R>),
{
    mf(mean, sigmas, wm);

    match noise {
        Some(nf) => fac.copy_from(nf),
        None => fac.set_zero(),
    }

    for i in 0..sigmas.nrows() {
        copy_row(sigmas, i, sig);
        rf(res, sig, mean);
        let w = wc[i];
        if w >= R::zero() {
            fac.rank1_update(w, res)?;
        } else {
            fac.rank1_downdate(-w, res)?;
        }
    }
    Ok(())
}

/// UD-factorized Unscented Kalman Filter.
///
/// Sigma points are regenerated at the start of every [`Ukf::predict`];
/// the adaptive full update regenerates them a second time when its
/// divergence test fires. For the robust sequential updates `r.d()`
/// stores measurement standard deviations instead of variances.
#[derive(Debug, Clone)]
pub struct Ukf<R: RealField + Copy, G: SigmaPoints<R>> {
    nx: usize,
    nz: usize,
    np: usize,
    /// Sigma-point generator.
    pub points: G,
    /// State estimate.
    pub x: DVector<R>,
    /// Estimate covariance factors.
    pub p: UdFactor<R>,
    /// Process-noise factors.
    pub q: UdFactor<R>,
    /// Measurement-noise factors. Standard deviations in `d()` for the
    /// robust sequential updates, variances otherwise.
    pub r: UdFactor<R>,
    /// Divergence-test threshold used by the adaptive updates.
    pub chi2: R,
    /// Skip the `U_p`-basis conversion before the sequential scalar
    /// updates. Cheaper but only an approximation unless `U_p` is close
    /// to the identity; the adaptive sequential updates reject it.
    pub fast: bool,
    s: UdFactor<R>,
    z_p: DVector<R>,
    y: DVector<R>,
    zs: DVector<R>,
    sigmas_x: DMatrix<R>,
    sigmas_z: DMatrix<R>,
    wm: DVector<R>,
    wc: DVector<R>,
    pzx: DMatrix<R>,
    sx: DVector<R>,
    sxa: DVector<R>,
    fv: DVector<R>,
    vv: DVector<R>,
}

impl<R: RealField + Copy, G: SigmaPoints<R>> Ukf<R, G> {
    /// A filter with `nx` state components, `nz` measurement components
    /// and the given sigma-point generator.
    ///
    /// Fails with `BadDimension` unless `nx ≥ 2`, `nz ≥ 1` and the
    /// generator produces at least two points.
    pub fn new(nx: usize, nz: usize, points: G) -> Result<Self, Error> {
        if nx < 2 || nz == 0 {
            return Err(ErrorKind::BadDimension.into());
        }
        let np = points.num_points(nx);
        if np < 2 {
            return Err(ErrorKind::BadDimension.into());
        }
        let mut wm = DVector::zeros(np);
        let mut wc = DVector::zeros(np);
        points.weights_into(nx, &mut wm, &mut wc);

        Ok(Ukf {
            nx,
            nz,
            np,
            points,
            x: DVector::zeros(nx),
            p: UdFactor::identity(nx),
            q: UdFactor::identity(nx),
            r: UdFactor::identity(nz),
            chi2: default_chi2(),
            fast: false,
            s: UdFactor::identity(nz),
            z_p: DVector::zeros(nz),
            y: DVector::zeros(nz),
            zs: DVector::zeros(nz),
            sigmas_x: DMatrix::zeros(np, nx),
            sigmas_z: DMatrix::zeros(np, nz),
            wm,
            wc,
            pzx: DMatrix::zeros(nz, nx),
            sx: DVector::zeros(nx),
            sxa: DVector::zeros(nx),
            fv: DVector::zeros(nx),
            vv: DVector::zeros(nx),
        })
    }

    /// State dimension.
    #[inline]
    pub fn state_dim(&self) -> usize {
        self.nx
    }

    /// Measurement dimension.
    #[inline]
    pub fn measurement_dim(&self) -> usize {
        self.nz
    }

    /// Dense copy of the estimate covariance (diagnostic).
    pub fn covariance(&self) -> DMatrix<R> {
        self.p.reconstruct()
    }

    fn generate_sigmas<P: SigmaProcess<R>>(&mut self, model: &P) -> Result<(), Error> {
        self.points
            .points_into(model, &self.x, &self.p, &mut self.sigmas_x, &mut self.sx)
    }

    /// Time update: regenerate the sigma points, propagate each through
    /// the transition, and rebuild `(x, U_p, D_p)` with the unscented
    /// transform and the process noise.
    pub fn predict<P: SigmaProcess<R>>(&mut self, model: &P) -> Result<Flags, Error> {
        self.generate_sigmas(model)?;

        for i in 0..self.np {
            copy_row(&self.sigmas_x, i, &mut self.sx);
            model.transition(&mut self.sx);
            write_row(&mut self.sigmas_x, i, &self.sx);
        }

        unscented_transform(
            &mut self.x,
            &mut self.p,
            &mut self.sx,
            &mut self.sxa,
            &self.sigmas_x,
            &self.wm,
            &self.wc,
            Some(&self.q),
            |mu, sigmas, wm| model.mean_into(mu, sigmas, wm),
            |out, a, b| model.residual_into(out, a, b),
        )?;
        Ok(Flags::empty())
    }

    fn measure_sigmas<M: SigmaMeasurement<R>>(&mut self, model: &M) {
        for i in 0..self.np {
            copy_row(&self.sigmas_x, i, &mut self.sx);
            model.measure_into(&mut self.zs, &self.sx);
            write_row(&mut self.sigmas_z, i, &self.zs);
        }
    }

    /// `P_zx = ∑ w_c[i]·(ζ_i − z_p)·(σ_i − x)ᵀ` with the configured
    /// residuals on both sides.
    fn cross_covariance<P: SigmaProcess<R>, M: SigmaMeasurement<R>>(
        &mut self,
        prc: &P,
        msr: &M,
    ) {
        for i in 0..self.np {
            copy_row(&self.sigmas_z, i, &mut self.zs);
            msr.residual_into(&mut self.y, &self.zs, &self.z_p);
            copy_row(&self.sigmas_x, i, &mut self.sxa);
            prc.residual_into(&mut self.sx, &self.sxa, &self.x);
            let beta = if i == 0 { R::zero() } else { R::one() };
            self.pzx.ger(self.wc[i], &self.y, &self.sx, beta);
        }
    }

    /// Measurement sigmas, predicted measurement, cross-covariance and
    /// decorrelated innovation for the sequential scalar updates.
    fn prepare_sequential<P: SigmaProcess<R>, M: SigmaMeasurement<R>>(
        &mut self,
        prc: &P,
        msr: &M,
        z: &DVector<R>,
    ) -> Result<(), Error> {
        if z.len() != self.nz {
            return Err(ErrorKind::BadDimension.into());
        }
        self.measure_sigmas(msr);
        msr.mean_into(&mut self.z_p, &self.sigmas_z, &self.wm);
        self.cross_covariance(prc, msr);
        msr.residual_into(&mut self.y, z, &self.z_p);

        self.r.u_solve_vec(&mut self.y);
        self.r.u_solve_rows(&mut self.pzx);
        Ok(())
    }

    /// Load cross-covariance row `i` as `(f, v)` for a Bierman body:
    /// `v = U_p⁻¹·P_zx[i]ᵀ` (skipped on the fast path) and `f = D_p⁻¹·v`.
    fn load_cross(&mut self, i: usize) {
        for j in 0..self.nx {
            self.vv[j] = self.pzx[(i, j)];
        }
        if !self.fast {
            self.p.u_solve_vec(&mut self.vv);
        }
        for j in 0..self.nx {
            self.fv[j] = self.vv[j] / self.p.d()[j];
        }
    }

    /// Sequential measurement update, Bierman form.
    ///
    /// Rows are processed in order against the prior cross-covariance;
    /// after decorrelation by `U_r` they are treated as independent.
    pub fn bierman_update<P: SigmaProcess<R>, M: SigmaMeasurement<R>>(
        &mut self,
        prc: &P,
        msr: &M,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        self.prepare_sequential(prc, msr, z)?;
        for i in 0..self.nz {
            self.load_cross(i);
            bierman_body(
                &mut self.x,
                &mut self.p,
                &mut self.fv,
                &mut self.vv,
                self.r.d()[i],
                self.y[i],
                R::one(),
                R::one(),
            )?;
        }
        Ok(Flags::empty())
    }

    /// Sequential Bierman update with chi-square divergence detection.
    ///
    /// Rejects the fast path: the basis conversion it skips is what keeps
    /// the divergence statistic consistent.
    pub fn adaptive_bierman_update<P: SigmaProcess<R>, M: SigmaMeasurement<R>>(
        &mut self,
        prc: &P,
        msr: &M,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        if self.fast {
            return Err(ErrorKind::FastPathUnsupported.into());
        }
        self.prepare_sequential(prc, msr, z)?;
        let mut flags = Flags::empty();
        for i in 0..self.nz {
            self.load_cross(i);
            let r = self.r.d()[i];
            let nu = self.y[i];
            let (ac, _, fl) =
                adaptive_correction(&self.fv, &self.vv, r, nu, R::one(), self.chi2)?;
            flags |= fl;
            bierman_body(
                &mut self.x,
                &mut self.p,
                &mut self.fv,
                &mut self.vv,
                r,
                nu,
                ac,
                R::one(),
            )?;
        }
        Ok(flags)
    }

    /// Sequential Bierman update with an M-estimator influence function.
    /// `r.d()` must hold measurement standard deviations.
    pub fn robust_bierman_update<P, M, I>(
        &mut self,
        prc: &P,
        msr: &M,
        influence: &I,
        z: &DVector<R>,
    ) -> Result<Flags, Error>
    where
        P: SigmaProcess<R>,
        M: SigmaMeasurement<R>,
        I: Influence<R>,
    {
        self.prepare_sequential(prc, msr, z)?;
        let mut flags = Flags::empty();
        for i in 0..self.nz {
            let alpha = self.r.d()[i];
            let (nu, gdot, fl) = robustify(influence, self.y[i], alpha);
            flags |= fl;
            self.load_cross(i);
            bierman_body(
                &mut self.x,
                &mut self.p,
                &mut self.fv,
                &mut self.vv,
                alpha * alpha,
                nu,
                R::one(),
                gdot,
            )?;
        }
        Ok(flags)
    }

    /// Sequential Bierman update with both the robust influence transform
    /// and the chi-square divergence test. Rejects the fast path.
    pub fn adaptive_robust_bierman_update<P, M, I>(
        &mut self,
        prc: &P,
        msr: &M,
        influence: &I,
        z: &DVector<R>,
    ) -> Result<Flags, Error>
    where
        P: SigmaProcess<R>,
        M: SigmaMeasurement<R>,
        I: Influence<R>,
    {
        if self.fast {
            return Err(ErrorKind::FastPathUnsupported.into());
        }
        self.prepare_sequential(prc, msr, z)?;
        let mut flags = Flags::empty();
        for i in 0..self.nz {
            let alpha = self.r.d()[i];
            let (nu, gdot, fl) = robustify(influence, self.y[i], alpha);
            flags |= fl;
            self.load_cross(i);
            let a2 = alpha * alpha;
            let (ac, _, fl) = adaptive_correction(&self.fv, &self.vv, a2, nu, gdot, self.chi2)?;
            flags |= fl;
            bierman_body(
                &mut self.x,
                &mut self.p,
                &mut self.fv,
                &mut self.vv,
                a2,
                nu,
                ac,
                gdot,
            )?;
        }
        Ok(flags)
    }

    /// Unscented transform of the measurement sigmas into
    /// `(z_p, U_s, D_s)`, with or without the measurement noise.
    fn measurement_transform<M: SigmaMeasurement<R>>(
        &mut self,
        msr: &M,
        with_noise: bool,
    ) -> Result<(), Error> {
        let noise = if with_noise { Some(&self.r) } else { None };
        unscented_transform(
            &mut self.z_p,
            &mut self.s,
            &mut self.y,
            &mut self.zs,
            &self.sigmas_z,
            &self.wm,
            &self.wc,
            noise,
            |mu, sigmas, wm| msr.mean_into(mu, sigmas, wm),
            |out, a, b| msr.residual_into(out, a, b),
        )
    }

    /// Mahalanobis distance of the innovation in the `U_s` basis:
    /// `∑ (U_s⁻¹·y)_i² / D_s[i]`.
    fn mahalanobis<M: SigmaMeasurement<R>>(
        &mut self,
        msr: &M,
        z: &DVector<R>,
    ) -> Result<R, Error> {
        msr.residual_into(&mut self.y, z, &self.z_p);
        self.s.u_solve_vec(&mut self.y);
        let mut md = R::zero();
        for i in 0..self.nz {
            let ds = self.s.d()[i];
            if !(ds > R::zero()) {
                return Err(ErrorKind::NotPositiveDefinite.into());
            }
            md += self.y[i] * self.y[i] / ds;
        }
        Ok(md)
    }

    /// Cross-covariance, innovation decorrelation by `U_s`, and the
    /// per-row state shift plus rank-1 downdate of the full update.
    fn finish_full_update<P: SigmaProcess<R>, M: SigmaMeasurement<R>>(
        &mut self,
        prc: &P,
        msr: &M,
        z: &DVector<R>,
    ) -> Result<(), Error> {
        self.cross_covariance(prc, msr);
        msr.residual_into(&mut self.y, z, &self.z_p);
        self.s.u_solve_vec(&mut self.y);
        self.s.u_solve_rows(&mut self.pzx);

        for i in 0..self.nz {
            let ds = self.s.d()[i];
            if !(ds > R::zero()) {
                return Err(ErrorKind::NotPositiveDefinite.into());
            }
            for j in 0..self.nx {
                self.vv[j] = self.pzx[(i, j)];
            }
            self.x.axpy(self.y[i] / ds, &self.vv, R::one());
            self.p.rank1_downdate(R::one() / ds, &mut self.vv)?;
        }
        Ok(())
    }

    /// Full-matrix measurement update through the innovation-covariance
    /// factors `(U_s, D_s)`.
    pub fn update<P: SigmaProcess<R>, M: SigmaMeasurement<R>>(
        &mut self,
        prc: &P,
        msr: &M,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        if z.len() != self.nz {
            return Err(ErrorKind::BadDimension.into());
        }
        self.measure_sigmas(msr);
        self.measurement_transform(msr, true)?;
        self.finish_full_update(prc, msr, z)?;
        Ok(Flags::empty())
    }

    /// Full-matrix update with a whole-vector chi-square divergence test.
    ///
    /// When the Mahalanobis distance of the innovation exceeds `chi2`, the
    /// prior covariance is inflated so the corrected distance meets the
    /// threshold, the sigma points are regenerated, and the measurement
    /// transform is redone before the ordinary update proceeds.
    pub fn adaptive_update<P: SigmaProcess<R>, M: SigmaMeasurement<R>>(
        &mut self,
        prc: &P,
        msr: &M,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        if z.len() != self.nz {
            return Err(ErrorKind::BadDimension.into());
        }
        if !(self.chi2 > R::zero()) {
            return Err(ErrorKind::BadThreshold.into());
        }
        let mut flags = Flags::empty();

        self.measure_sigmas(msr);
        self.measurement_transform(msr, true)?;

        let delta = self.mahalanobis(msr, z)?;
        if delta > self.chi2 {
            // Noise-free innovation factors isolate the part of the
            // distance the prior covariance can absorb.
            self.measurement_transform(msr, false)?;
            let c = self.mahalanobis(msr, z)?;
            let ac = c * (R::one() / self.chi2 - R::one() / delta);
            self.p.scale_d(R::one() + ac);
            trace!("divergence detected, inflating state covariance");

            self.generate_sigmas(prc)?;
            self.measure_sigmas(msr);
            self.measurement_transform(msr, true)?;
            flags |= Flags::ANOMALY;
        }

        self.finish_full_update(prc, msr, z)?;
        Ok(flags)
    }
}
