//! UD-factorized Extended Kalman Filter.
//!
//! The estimator owns its state, covariance factors and scratch buffers,
//! allocated once at construction; process and measurement models are
//! supplied per call through the [`TransitionModel`] and
//! [`MeasurementModel`] traits. Eight measurement updates are available:
//! plain, adaptive, robust and adaptive-robust flavors of both the Bierman
//! (scalar, factor-updating) and Joseph (matrix) forms. All of them are
//! thin compositions over the kernels in [`crate::update`].

use nalgebra as na;

use na::{DMatrix, DVector, RealField};
use num_traits::{One, Zero};

use crate::error::{Error, ErrorKind, Flags};
use crate::ud::UdFactor;
use crate::update::{adaptive_correction, bierman_body, joseph_body, robustify, Influence};

/// 0.999 quantile of the chi-squared distribution with one degree of
/// freedom; the default divergence-test threshold.
#[inline]
pub(crate) fn default_chi2<R: RealField>() -> R {
    na::convert(10.8275662)
}

/// State transition model `x ← f(x)` with its Jacobian.
///
/// The defaults implement the identity transition, so a pure measurement
/// filter only needs a unit struct. The Jacobian is evaluated at the
/// advanced state, after [`TransitionModel::transition`] has run.
pub trait TransitionModel<R: RealField + Copy> {
    /// Advance the state in place. Defaults to the identity.
    fn transition(&self, _x: &mut DVector<R>) {}

    /// Write `∂f/∂x` into `f`. Defaults to the identity matrix.
    fn jacobian_into(&self, f: &mut DMatrix<R>, _x: &DVector<R>) {
        f.fill(R::zero());
        f.fill_diagonal(R::one());
    }
}

/// Identity transition model.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransition;

impl<R: RealField + Copy> TransitionModel<R> for IdentityTransition {}

/// Measurement model `z = h(x)` with its Jacobian.
pub trait MeasurementModel<R: RealField + Copy> {
    /// Predict the measurement for the current state.
    fn measure_into(&self, z: &mut DVector<R>, x: &DVector<R>);

    /// Write `∂h/∂x` into `h`.
    fn jacobian_into(&self, h: &mut DMatrix<R>, x: &DVector<R>);

    /// Measurement residual. Defaults to `z − predicted`; override for
    /// measurements that live on a manifold, e.g. wrapped angles.
    fn residual_into(&self, y: &mut DVector<R>, z: &DVector<R>, predicted: &DVector<R>) {
        y.copy_from(z);
        *y -= predicted;
    }
}

/// UD-factorized Extended Kalman Filter.
///
/// The covariance of the estimate is carried as `U_p·diag(D_p)·U_pᵀ` and
/// is never materialized. `q` holds the process-noise factors, `r` the
/// measurement-noise factors. For the robust updates `r.d()` stores the
/// measurement standard deviations instead of variances.
#[derive(Debug, Clone)]
pub struct Ekf<R: RealField + Copy> {
    nx: usize,
    nz: usize,
    /// State estimate.
    pub x: DVector<R>,
    /// Estimate covariance factors.
    pub p: UdFactor<R>,
    /// Process-noise factors.
    pub q: UdFactor<R>,
    /// Measurement-noise factors. Standard deviations in `d()` for the
    /// robust updates, variances otherwise.
    pub r: UdFactor<R>,
    /// Divergence-test threshold used by the adaptive updates.
    pub chi2: R,
    y: DVector<R>,
    yp: DVector<R>,
    h: DMatrix<R>,
    fjac: DMatrix<R>,
    w: DMatrix<R>,
    dw: DVector<R>,
    hv: DVector<R>,
    fv: DVector<R>,
    vv: DVector<R>,
    kv: DVector<R>,
}

impl<R: RealField + Copy> Ekf<R> {
    /// A filter with `nx` state components and `nz` measurement
    /// components, identity covariance factors and zero state.
    ///
    /// Fails with `BadDimension` unless `nx ≥ 2` and `nz ≥ 1`.
    pub fn new(nx: usize, nz: usize) -> Result<Self, Error> {
        if nx < 2 || nz == 0 {
            return Err(ErrorKind::BadDimension.into());
        }
        Ok(Ekf {
            nx,
            nz,
            x: DVector::zeros(nx),
            p: UdFactor::identity(nx),
            q: UdFactor::identity(nx),
            r: UdFactor::identity(nz),
            chi2: default_chi2(),
            y: DVector::zeros(nz),
            yp: DVector::zeros(nz),
            h: DMatrix::zeros(nz, nx),
            fjac: DMatrix::zeros(nx, nx),
            w: DMatrix::zeros(nx, 2 * nx),
            dw: DVector::zeros(2 * nx),
            hv: DVector::zeros(nx),
            fv: DVector::zeros(nx),
            vv: DVector::zeros(nx),
            kv: DVector::zeros(nx),
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

    /// Time update: advance the state through the transition model and
    /// propagate the covariance factors through its Jacobian plus the
    /// process noise, re-triangularizing with MWGS.
    pub fn predict<M: TransitionModel<R>>(&mut self, model: &M) -> Result<Flags, Error> {
        let nx = self.nx;
        model.transition(&mut self.x);
        model.jacobian_into(&mut self.fjac, &self.x);

        // W = (U_q | F·U_p), weights (D_q ; D_p)
        self.p.right_mul_into(&mut self.w, nx, &self.fjac);
        self.q.embed_u(&mut self.w, 0);
        for i in 0..nx {
            self.dw[i] = self.q.d()[i];
            self.dw[nx + i] = self.p.d()[i];
        }
        self.p.mwgs_into(&mut self.w, 2 * nx, &self.dw)?;
        Ok(Flags::empty())
    }

    /// Predict the measurement, form the residual and decorrelate both the
    /// residual and the Jacobian by `U_r`.
    fn prepare_measurement<M: MeasurementModel<R>>(
        &mut self,
        model: &M,
        z: &DVector<R>,
    ) -> Result<(), Error> {
        if z.len() != self.nz {
            return Err(ErrorKind::BadDimension.into());
        }
        model.measure_into(&mut self.yp, &self.x);
        model.jacobian_into(&mut self.h, &self.x);
        model.residual_into(&mut self.y, z, &self.yp);

        self.r.u_solve_vec(&mut self.y);
        self.r.u_solve_rows(&mut self.h);
        Ok(())
    }

    /// Load row `i` of the decorrelated Jacobian and form `f = h·U_p`,
    /// `v = D_p·fᵀ`.
    fn load_observation(&mut self, i: usize) {
        for j in 0..self.nx {
            self.hv[j] = self.h[(i, j)];
        }
        self.p.row_mul_vec(&mut self.fv, &self.hv);
        for j in 0..self.nx {
            self.vv[j] = self.p.d()[j] * self.fv[j];
        }
    }

    /// Measurement update, Bierman form.
    pub fn bierman_update<M: MeasurementModel<R>>(
        &mut self,
        model: &M,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        self.prepare_measurement(model, z)?;
        for i in 0..self.nz {
            self.load_observation(i);
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

    /// Measurement update, Joseph form.
    pub fn joseph_update<M: MeasurementModel<R>>(
        &mut self,
        model: &M,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        self.prepare_measurement(model, z)?;
        for i in 0..self.nz {
            self.load_observation(i);
            let r = self.r.d()[i];
            let s = r + self.fv.dot(&self.vv);
            joseph_body(
                &mut self.x,
                &mut self.p,
                &mut self.fv,
                &mut self.vv,
                &mut self.kv,
                &mut self.w,
                &mut self.dw,
                self.y[i],
                r,
                s,
                R::one(),
                R::one(),
            )?;
        }
        Ok(Flags::empty())
    }

    /// Bierman update with chi-square divergence detection and innovation
    /// inflation.
    pub fn adaptive_bierman_update<M: MeasurementModel<R>>(
        &mut self,
        model: &M,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        self.prepare_measurement(model, z)?;
        let mut flags = Flags::empty();
        for i in 0..self.nz {
            self.load_observation(i);
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

    /// Joseph update with chi-square divergence detection and innovation
    /// inflation.
    pub fn adaptive_joseph_update<M: MeasurementModel<R>>(
        &mut self,
        model: &M,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        self.prepare_measurement(model, z)?;
        let mut flags = Flags::empty();
        for i in 0..self.nz {
            self.load_observation(i);
            let r = self.r.d()[i];
            let nu = self.y[i];
            let (ac, s, fl) =
                adaptive_correction(&self.fv, &self.vv, r, nu, R::one(), self.chi2)?;
            flags |= fl;
            joseph_body(
                &mut self.x,
                &mut self.p,
                &mut self.fv,
                &mut self.vv,
                &mut self.kv,
                &mut self.w,
                &mut self.dw,
                nu,
                r,
                s,
                ac,
                R::one(),
            )?;
        }
        Ok(flags)
    }

    /// Bierman update with an M-estimator influence function over the
    /// innovation. `r.d()` must hold measurement standard deviations.
    pub fn robust_bierman_update<M: MeasurementModel<R>, I: Influence<R>>(
        &mut self,
        model: &M,
        influence: &I,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        self.prepare_measurement(model, z)?;
        let mut flags = Flags::empty();
        for i in 0..self.nz {
            let alpha = self.r.d()[i];
            let (nu, gdot, fl) = robustify(influence, self.y[i], alpha);
            flags |= fl;
            self.load_observation(i);
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

    /// Joseph update with an M-estimator influence function over the
    /// innovation. `r.d()` must hold measurement standard deviations.
    pub fn robust_joseph_update<M: MeasurementModel<R>, I: Influence<R>>(
        &mut self,
        model: &M,
        influence: &I,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        self.prepare_measurement(model, z)?;
        let mut flags = Flags::empty();
        for i in 0..self.nz {
            let alpha = self.r.d()[i];
            let (nu, gdot, fl) = robustify(influence, self.y[i], alpha);
            flags |= fl;
            self.load_observation(i);
            let a2 = alpha * alpha;
            let s = a2 + gdot * self.fv.dot(&self.vv);
            joseph_body(
                &mut self.x,
                &mut self.p,
                &mut self.fv,
                &mut self.vv,
                &mut self.kv,
                &mut self.w,
                &mut self.dw,
                nu,
                a2,
                s,
                R::one(),
                gdot,
            )?;
        }
        Ok(flags)
    }

    /// Bierman update with both the robust influence transform and the
    /// chi-square divergence test.
    pub fn adaptive_robust_bierman_update<M: MeasurementModel<R>, I: Influence<R>>(
        &mut self,
        model: &M,
        influence: &I,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        self.prepare_measurement(model, z)?;
        let mut flags = Flags::empty();
        for i in 0..self.nz {
            let alpha = self.r.d()[i];
            let (nu, gdot, fl) = robustify(influence, self.y[i], alpha);
            flags |= fl;
            self.load_observation(i);
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

    /// Joseph update with both the robust influence transform and the
    /// chi-square divergence test.
    pub fn adaptive_robust_joseph_update<M: MeasurementModel<R>, I: Influence<R>>(
        &mut self,
        model: &M,
        influence: &I,
        z: &DVector<R>,
    ) -> Result<Flags, Error> {
        self.prepare_measurement(model, z)?;
        let mut flags = Flags::empty();
        for i in 0..self.nz {
            let alpha = self.r.d()[i];
            let (nu, gdot, fl) = robustify(influence, self.y[i], alpha);
            flags |= fl;
            self.load_observation(i);
            let a2 = alpha * alpha;
            let (ac, s, fl) = adaptive_correction(&self.fv, &self.vv, a2, nu, gdot, self.chi2)?;
            flags |= fl;
            joseph_body(
                &mut self.x,
                &mut self.p,
                &mut self.fv,
                &mut self.vv,
                &mut self.kv,
                &mut self.w,
                &mut self.dw,
                nu,
                a2,
                s,
                ac,
                gdot,
            )?;
        }
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Huber;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct LinearTransition {
        f: DMatrix<f64>,
    }

    impl TransitionModel<f64> for LinearTransition {
        fn transition(&self, x: &mut DVector<f64>) {
            let next = &self.f * &*x;
            x.copy_from(&next);
        }

        fn jacobian_into(&self, f: &mut DMatrix<f64>, _x: &DVector<f64>) {
            f.copy_from(&self.f);
        }
    }

    struct LinearMeasurement {
        h: DMatrix<f64>,
    }

    impl MeasurementModel<f64> for LinearMeasurement {
        fn measure_into(&self, z: &mut DVector<f64>, x: &DVector<f64>) {
            z.gemv(1.0, &self.h, x, 0.0);
        }

        fn jacobian_into(&self, h: &mut DMatrix<f64>, _x: &DVector<f64>) {
            h.copy_from(&self.h);
        }
    }

    /// Textbook dense Kalman step (Joseph-form covariance), the reference
    /// all factorized variants must reproduce on linear systems.
    #[allow(clippy::too_many_arguments)]
    fn dense_step(
        x: &mut DVector<f64>,
        p: &mut DMatrix<f64>,
        f: &DMatrix<f64>,
        q: &DMatrix<f64>,
        h: &DMatrix<f64>,
        rm: &DMatrix<f64>,
        z: &DVector<f64>,
    ) {
        *x = f * &*x;
        *p = f * &*p * f.transpose() + q;

        let s = h * &*p * h.transpose() + rm;
        let k = &*p * h.transpose() * s.try_inverse().unwrap();
        let y = z - h * &*x;
        *x += &k * y;
        let ikh = DMatrix::identity(x.len(), x.len()) - &k * h;
        *p = &ikh * &*p * ikh.transpose() + &k * rm * k.transpose();
    }

    fn tracking_system() -> (LinearTransition, LinearMeasurement) {
        (
            LinearTransition {
                f: DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
            },
            LinearMeasurement {
                h: DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]),
            },
        )
    }

    fn filter_with(dp: f64, dq: f64, dr: f64) -> Ekf<f64> {
        let mut kf = Ekf::new(2, 2).unwrap();
        kf.p = UdFactor::from_diagonal(&DVector::from_element(2, dp));
        kf.q = UdFactor::from_diagonal(&DVector::from_element(2, dq));
        kf.r = UdFactor::from_diagonal(&DVector::from_element(2, dr));
        kf
    }

    #[test]
    fn all_variants_match_dense_reference_on_linear_system() {
        let (trans, meas) = tracking_system();
        let q = DMatrix::from_diagonal(&DVector::from_element(2, 1e-3));
        let rm = DMatrix::from_diagonal(&DVector::from_element(2, 0.04));

        let mut rng = StdRng::seed_from_u64(21);
        let zs: Vec<DVector<f64>> = (0..20)
            .map(|k| {
                DVector::from_vec(vec![
                    k as f64 + rng.gen_range(-0.2..0.2),
                    1.0 + rng.gen_range(-0.2..0.2),
                ])
            })
            .collect();

        let mut xd = DVector::zeros(2);
        let mut pd = DMatrix::identity(2, 2);
        for z in &zs {
            dense_step(&mut xd, &mut pd, &trans.f, &q, &meas.h, &rm, z);
        }

        // A Huber point far beyond every normalized innovation keeps the
        // influence an identity, so the robust variants must agree too.
        let wide = Huber::new(1e12);

        // Noise is given as standard deviations to the robust variants.
        fn run<F>(
            trans: &LinearTransition,
            meas: &LinearMeasurement,
            zs: &[DVector<f64>],
            sigma_noise: bool,
            mut step: F,
        ) -> Ekf<f64>
        where
            F: FnMut(&mut Ekf<f64>, &LinearMeasurement, &DVector<f64>),
        {
            let mut kf = filter_with(1.0, 1e-3, if sigma_noise { 0.2 } else { 0.04 });
            // Large chi2 keeps the adaptive branches quiet on clean data.
            kf.chi2 = 1e12;
            for z in zs {
                kf.predict(trans).unwrap();
                step(&mut kf, meas, z);
            }
            kf
        }

        let check = |kf: &Ekf<f64>| {
            assert_relative_eq!(kf.x, xd, epsilon = 1e-9);
            assert_relative_eq!(kf.covariance(), pd, epsilon = 1e-9);
            for i in 0..2 {
                assert!(kf.p.d()[i] > 0.0);
            }
        };

        check(&run(&trans, &meas, &zs, false, |kf, m, z| {
            kf.bierman_update(m, z).unwrap();
        }));
        check(&run(&trans, &meas, &zs, false, |kf, m, z| {
            kf.joseph_update(m, z).unwrap();
        }));
        check(&run(&trans, &meas, &zs, false, |kf, m, z| {
            kf.adaptive_bierman_update(m, z).unwrap();
        }));
        check(&run(&trans, &meas, &zs, false, |kf, m, z| {
            kf.adaptive_joseph_update(m, z).unwrap();
        }));
        check(&run(&trans, &meas, &zs, true, |kf, m, z| {
            kf.robust_bierman_update(m, &wide, z).unwrap();
        }));
        check(&run(&trans, &meas, &zs, true, |kf, m, z| {
            kf.robust_joseph_update(m, &wide, z).unwrap();
        }));
        check(&run(&trans, &meas, &zs, true, |kf, m, z| {
            kf.adaptive_robust_bierman_update(m, &wide, z).unwrap();
        }));
        check(&run(&trans, &meas, &zs, true, |kf, m, z| {
            kf.adaptive_robust_joseph_update(m, &wide, z).unwrap();
        }));
    }

    #[test]
    fn joseph_and_bierman_agree() {
        let (trans, meas) = tracking_system();
        let mut kf_b = filter_with(1.0, 1e-4, 1.0);
        let mut kf_j = kf_b.clone();

        for k in 0..50 {
            let z = DVector::from_vec(vec![k as f64, 1.0]);
            kf_b.predict(&trans).unwrap();
            kf_j.predict(&trans).unwrap();
            kf_b.bierman_update(&meas, &z).unwrap();
            kf_j.joseph_update(&meas, &z).unwrap();
        }
        assert_relative_eq!(kf_b.x, kf_j.x, epsilon = 1e-12);
        assert_relative_eq!(kf_b.covariance(), kf_j.covariance(), epsilon = 1e-12);
    }

    #[test]
    fn constant_signal_converges_with_bierman() {
        let meas = LinearMeasurement {
            h: DMatrix::identity(2, 2),
        };
        let mut kf = filter_with(1.0, 0.01, 0.01);
        let z = DVector::from_element(2, 1.0);
        for _ in 0..10 {
            kf.predict(&IdentityTransition).unwrap();
            kf.bierman_update(&meas, &z).unwrap();
        }
        assert!((&kf.x - &z).norm() < 1e-3);
        for i in 0..2 {
            assert!(kf.p.d()[i] > 0.0 && kf.p.d()[i] < 0.02);
        }
    }

    #[test]
    fn ramp_track_recovers_velocity_with_joseph() {
        let trans = LinearTransition {
            f: DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]),
        };
        let meas = LinearMeasurement {
            h: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
        };
        let mut kf = Ekf::new(2, 1).unwrap();
        kf.q = UdFactor::from_diagonal(&DVector::from_element(2, 1e-4));
        kf.r = UdFactor::from_diagonal(&DVector::from_element(1, 1.0));

        for k in 0..100 {
            kf.predict(&trans).unwrap();
            kf.joseph_update(&meas, &DVector::from_element(1, k as f64))
                .unwrap();
        }
        assert!((kf.x[1] - 1.0).abs() < 0.05);
    }

    #[test]
    fn adaptive_update_flags_and_recovers_from_outlier() {
        let meas = LinearMeasurement {
            h: DMatrix::identity(2, 2),
        };
        let mut kf = filter_with(1.0, 0.01, 0.01);
        let z = DVector::from_element(2, 1.0);
        let outlier = DVector::from_element(2, 100.0);

        let mut saw_anomaly = false;
        for step in 0..10 {
            kf.predict(&IdentityTransition).unwrap();
            let flags = if step == 5 {
                kf.adaptive_bierman_update(&meas, &outlier).unwrap()
            } else {
                kf.adaptive_bierman_update(&meas, &z).unwrap()
            };
            if step == 5 {
                assert!(flags.contains(Flags::ANOMALY));
                saw_anomaly = true;
            }
            if step > 5 {
                for i in 0..2 {
                    assert!(kf.x[i].abs() <= 5.0, "state diverged at step {step}");
                }
            }
        }
        assert!(saw_anomaly);
    }

    #[test]
    fn adaptive_posterior_is_no_tighter_than_plain_on_outlier() {
        let meas = LinearMeasurement {
            h: DMatrix::identity(2, 2),
        };
        let mut plain = filter_with(1.0, 0.01, 0.01);
        let mut adaptive = filter_with(1.0, 0.01, 0.01);
        let outlier = DVector::from_element(2, 50.0);

        plain.predict(&IdentityTransition).unwrap();
        adaptive.predict(&IdentityTransition).unwrap();
        plain.bierman_update(&meas, &outlier).unwrap();
        let flags = adaptive.adaptive_bierman_update(&meas, &outlier).unwrap();

        assert!(flags.contains(Flags::ANOMALY));
        for i in 0..2 {
            assert!(adaptive.p.d()[i] >= plain.p.d()[i] - 1e-12);
        }
    }

    #[test]
    fn robust_update_limits_the_pull_of_an_outlier() {
        let meas = LinearMeasurement {
            h: DMatrix::identity(2, 2),
        };
        let huber = Huber::new(1.345);
        let alpha = 0.1;
        let mut kf = filter_with(0.01, 0.0001, alpha);

        // Track a small constant signal first so the gain settles.
        let z = DVector::from_element(2, 0.05);
        for _ in 0..5 {
            kf.predict(&IdentityTransition).unwrap();
            kf.robust_bierman_update(&meas, &huber, &z).unwrap();
        }
        let before = kf.x.clone();
        let gain_bound = kf.covariance()[(0, 0)] / (alpha * alpha);

        kf.predict(&IdentityTransition).unwrap();
        let flags = kf
            .robust_bierman_update(&meas, &huber, &DVector::from_element(2, 10.0))
            .unwrap();

        assert!(flags.contains(Flags::GLITCH_LARGE) || flags.contains(Flags::GLITCH_SMALL));
        let moved = (&kf.x - &before).norm();
        // The clipped innovation bounds the displacement by |K|·k·alpha.
        assert!(moved <= 2.0 * gain_bound * 1.345 * alpha + 1e-9);
        assert!(kf.x.norm() < 0.5);
    }

    #[test]
    fn covariance_stays_symmetric_positive_definite() {
        let mut rng = StdRng::seed_from_u64(33);
        for _ in 0..20 {
            let nx = rng.gen_range(2..=10);
            let nz = rng.gen_range(1..=5);

            let mut f = DMatrix::identity(nx, nx);
            for i in 0..nx {
                for j in 0..nx {
                    f[(i, j)] += rng.gen_range(-0.1..0.1);
                }
            }
            let trans = LinearTransition { f };
            let meas = LinearMeasurement {
                h: DMatrix::from_fn(nz, nx, |_, _| rng.gen_range(-1.0..1.0)),
            };

            let mut kf = Ekf::new(nx, nz).unwrap();
            kf.q = UdFactor::from_diagonal(&DVector::from_fn(nx, |_, _| {
                rng.gen_range(0.001..0.1)
            }));
            kf.r = UdFactor::from_diagonal(&DVector::from_fn(nz, |_, _| {
                rng.gen_range(0.01..1.0)
            }));

            for step in 0..8 {
                let z = DVector::from_fn(nz, |_, _| rng.gen_range(-1.0..1.0));
                kf.predict(&trans).unwrap();
                if step % 2 == 0 {
                    kf.bierman_update(&meas, &z).unwrap();
                } else {
                    kf.joseph_update(&meas, &z).unwrap();
                }

                for i in 0..nx {
                    assert!(kf.p.d()[i] > 0.0);
                }
                let p = kf.covariance();
                assert_relative_eq!(p, p.transpose(), epsilon = 1e-12);
                let eigs = p.symmetric_eigenvalues();
                assert!(eigs.iter().all(|e| *e > 0.0));
            }
        }
    }

    #[test]
    fn update_rejects_wrong_measurement_length() {
        let meas = LinearMeasurement {
            h: DMatrix::identity(2, 2),
        };
        let mut kf = Ekf::new(2, 2).unwrap();
        let err = kf
            .bierman_update(&meas, &DVector::from_element(3, 0.0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadDimension);
    }

    #[test]
    fn constructor_rejects_degenerate_dimensions() {
        assert!(Ekf::<f64>::new(1, 1).is_err());
        assert!(Ekf::<f64>::new(3, 0).is_err());
    }
}
