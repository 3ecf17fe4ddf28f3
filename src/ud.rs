//! Packed UD covariance factors and the low-level operations on them.
//!
//! A symmetric positive-definite matrix `P` is held as `U·diag(D)·Uᵀ` with
//! `U` unit upper-triangular and `D` a positive diagonal. Only the strictly
//! upper part of `U` is stored, packed in column-major upper order: entry
//! `(i, j)` with `j > i` lives at index `j·(j−1)/2 + i`. The full
//! covariance is never materialized by any filter operation; it can be
//! reconstructed for diagnostics with [`UdFactor::reconstruct`].
//!
//! The rank-1 update is Agee–Turner, the triangularization is Thornton's
//! Modified Weighted Gram-Schmidt. See Bierman, "Factorization Methods for
//! Discrete Sequential Estimation" (1977).

use nalgebra as na;

use na::{DMatrix, DVector, RealField};
use num_traits::{One, Zero};

use crate::error::{Error, ErrorKind};

/// Pivot threshold below which a factorization step is considered
/// degenerate.
#[inline]
pub(crate) fn degeneracy_eps<R: RealField>() -> R {
    na::convert(1.0e-15)
}

#[inline]
fn packed_index(i: usize, j: usize) -> usize {
    debug_assert!(i < j);
    j * (j - 1) / 2 + i
}

/// UD factors of a symmetric positive-definite matrix.
///
/// The unit diagonal of `U` is implicit; writes are only possible to the
/// strictly upper triangle and to `D`, so the factor shape cannot be
/// violated from outside.
#[derive(Debug, Clone, PartialEq)]
pub struct UdFactor<R: RealField + Copy> {
    n: usize,
    u: DVector<R>,
    d: DVector<R>,
}

impl<R: RealField + Copy> UdFactor<R> {
    /// Identity factors: `U = I`, `D = 1`, representing `P = I`.
    pub fn identity(n: usize) -> Self {
        UdFactor {
            n,
            u: DVector::zeros(n * (n - 1) / 2),
            d: DVector::from_element(n, R::one()),
        }
    }

    /// Factors of a diagonal matrix: `U = I`, `D = diag`.
    pub fn from_diagonal(diag: &DVector<R>) -> Self {
        let n = diag.len();
        UdFactor {
            n,
            u: DVector::zeros(n * (n - 1) / 2),
            d: diag.clone(),
        }
    }

    /// Dimension of the factored matrix.
    #[inline]
    pub fn order(&self) -> usize {
        self.n
    }

    /// The diagonal factor `D`.
    #[inline]
    pub fn d(&self) -> &DVector<R> {
        &self.d
    }

    /// Entry `(i, j)` of the full `U`, including the implicit unit
    /// diagonal and the zero lower triangle.
    #[inline]
    pub fn u_entry(&self, i: usize, j: usize) -> R {
        if i == j {
            R::one()
        } else if i < j {
            self.u[packed_index(i, j)]
        } else {
            R::zero()
        }
    }

    /// Overwrite the strictly upper entry `(i, j)`, `j > i`.
    ///
    /// Panics if `(i, j)` is not strictly upper.
    #[inline]
    pub fn set_u_entry(&mut self, i: usize, j: usize, value: R) {
        assert!(i < j, "only strictly upper entries of U are stored");
        self.u[packed_index(i, j)] = value;
    }

    /// Overwrite the diagonal entry `i` of `D`.
    #[inline]
    pub fn set_d(&mut self, i: usize, value: R) {
        self.d[i] = value;
    }

    #[inline]
    pub(crate) fn u_packed(&self, i: usize, j: usize) -> R {
        self.u[packed_index(i, j)]
    }

    #[inline]
    pub(crate) fn set_u_packed(&mut self, i: usize, j: usize, value: R) {
        self.u[packed_index(i, j)] = value;
    }

    /// Scale every entry of `D` by `s`.
    pub fn scale_d(&mut self, s: R) {
        self.d *= s;
    }

    /// Copy both factors from `other`. The orders must match.
    pub fn copy_from(&mut self, other: &UdFactor<R>) {
        debug_assert_eq!(self.n, other.n);
        self.u.copy_from(&other.u);
        self.d.copy_from(&other.d);
    }

    /// Zero both factors, representing `P = 0`.
    pub fn set_zero(&mut self) {
        self.u.fill(R::zero());
        self.d.fill(R::zero());
    }

    /// Reconstruct the dense `P = U·diag(D)·Uᵀ`.
    ///
    /// Diagnostic helper; no filter operation calls it.
    pub fn reconstruct(&self) -> DMatrix<R> {
        let n = self.n;
        let mut p = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in i..n {
                let mut acc = R::zero();
                for k in j..n {
                    acc += self.u_entry(i, k) * self.d[k] * self.u_entry(j, k);
                }
                p[(i, j)] = acc;
                p[(j, i)] = acc;
            }
        }
        p
    }

    /// Solve `U·y' = y` in place (back-substitution against the unit
    /// upper-triangular factor).
    pub fn u_solve_vec(&self, y: &mut DVector<R>) {
        debug_assert_eq!(y.len(), self.n);
        for i in (0..self.n).rev() {
            let mut acc = y[i];
            for k in i + 1..self.n {
                acc -= self.u_packed(i, k) * y[k];
            }
            y[i] = acc;
        }
    }

    /// Solve `U·B = A` in place, treating the rows of `a` as the elements
    /// of the substitution. `a` must have `order()` rows.
    pub fn u_solve_rows(&self, a: &mut DMatrix<R>) {
        debug_assert_eq!(a.nrows(), self.n);
        let ncols = a.ncols();
        for i in (0..self.n).rev() {
            for k in i + 1..self.n {
                let u_ik = self.u_packed(i, k);
                for c in 0..ncols {
                    let t = a[(k, c)] * u_ik;
                    a[(i, c)] -= t;
                }
            }
        }
    }

    /// `y ← Uᵀ·y` in place (forward pass).
    pub fn ut_mul_vec(&self, y: &mut DVector<R>) {
        debug_assert_eq!(y.len(), self.n);
        for j in (0..self.n).rev() {
            let mut acc = y[j];
            for i in 0..j {
                acc += self.u_packed(i, j) * y[i];
            }
            y[j] = acc;
        }
    }

    /// `out ← U·v`.
    pub fn mul_vec(&self, out: &mut DVector<R>, v: &DVector<R>) {
        debug_assert_eq!(v.len(), self.n);
        for i in 0..self.n {
            let mut acc = v[i];
            for j in i + 1..self.n {
                acc += self.u_packed(i, j) * v[j];
            }
            out[i] = acc;
        }
    }

    /// `out ← v·U` (equivalently `Uᵀ·vᵀ` for the row vector `v`).
    pub fn row_mul_vec(&self, out: &mut DVector<R>, v: &DVector<R>) {
        debug_assert_eq!(v.len(), self.n);
        for j in 0..self.n {
            let mut acc = v[j];
            for i in 0..j {
                acc += self.u_packed(i, j) * v[i];
            }
            out[j] = acc;
        }
    }

    /// Agee–Turner rank-1 update: replace `U·diag(D)·Uᵀ` by
    /// `U·diag(D)·Uᵀ + s·v·vᵀ`, `s > 0`, in place.
    ///
    /// `v` is consumed as scratch.
    pub fn rank1_update(&mut self, s: R, v: &mut DVector<R>) -> Result<(), Error> {
        debug_assert_eq!(v.len(), self.n);
        let mut c = s;
        for j in (1..self.n).rev() {
            let vj = v[j];
            let dj = self.d[j];
            let dj_new = dj + c * vj * vj;
            if !dj_new.is_finite() {
                return Err(ErrorKind::NonFinite.into());
            }
            if dj_new == R::zero() {
                // Both the diagonal and the correction vanish at this
                // column (a rank-deficient factor being built up); leave
                // it untouched.
                continue;
            }
            let b = c * vj / dj_new;
            c *= dj / dj_new;
            self.d[j] = dj_new;
            for i in 0..j {
                let uij = self.u_packed(i, j);
                v[i] -= vj * uij;
                self.set_u_packed(i, j, uij + b * v[i]);
            }
        }
        self.d[0] += c * v[0] * v[0];
        Ok(())
    }

    /// Rank-1 downdate: replace `U·diag(D)·Uᵀ` by `U·diag(D)·Uᵀ − s·v·vᵀ`,
    /// `s > 0`, in place. The result must stay positive definite.
    ///
    /// `v` is consumed as scratch.
    pub fn rank1_downdate(&mut self, s: R, v: &mut DVector<R>) -> Result<(), Error> {
        debug_assert_eq!(v.len(), self.n);
        let eps = degeneracy_eps::<R>();
        let mut c = -s;
        for j in (1..self.n).rev() {
            let vj = v[j];
            let dj = self.d[j];
            if vj == R::zero() && dj == R::zero() {
                continue;
            }
            let dj_new = dj + c * vj * vj;
            if !dj_new.is_finite() || dj_new <= eps {
                return Err(ErrorKind::DowndateBreakdown.into());
            }
            let b = c * vj / dj_new;
            c *= dj / dj_new;
            self.d[j] = dj_new;
            for i in 0..j {
                let uij = self.u_packed(i, j);
                v[i] -= vj * uij;
                self.set_u_packed(i, j, uij + b * v[i]);
            }
        }
        if v[0] != R::zero() || self.d[0] != R::zero() {
            let d0 = self.d[0] + c * v[0] * v[0];
            if !d0.is_finite() || d0 <= eps {
                return Err(ErrorKind::DowndateBreakdown.into());
            }
            self.d[0] = d0;
        }
        Ok(())
    }

    /// Modified Weighted Gram-Schmidt triangularization.
    ///
    /// Consumes the first `m` columns of `w` (`order()` rows) and the first
    /// `m` weights of `dw` (all positive), and overwrites the factors so
    /// that `W·diag(dw)·Wᵀ = U·diag(D)·Uᵀ`. Rows are orthogonalized from
    /// `n−1` down to `0`; `w` is destroyed in the process.
    pub fn mwgs_into(
        &mut self,
        w: &mut DMatrix<R>,
        m: usize,
        dw: &DVector<R>,
    ) -> Result<(), Error> {
        debug_assert_eq!(w.nrows(), self.n);
        debug_assert!(w.ncols() >= m && dw.len() >= m);
        let eps = degeneracy_eps::<R>();
        for i in (0..self.n).rev() {
            let mut pivot = R::zero();
            for c in 0..m {
                pivot += w[(i, c)] * dw[c] * w[(i, c)];
            }
            if !pivot.is_finite() {
                return Err(ErrorKind::NonFinite.into());
            }
            if pivot <= eps {
                return Err(ErrorKind::DegeneratePivot.into());
            }
            self.d[i] = pivot;
            for j in 0..i {
                let mut dot = R::zero();
                for c in 0..m {
                    dot += w[(j, c)] * dw[c] * w[(i, c)];
                }
                let uji = dot / pivot;
                self.set_u_packed(j, i, uji);
                for c in 0..m {
                    let t = uji * w[(i, c)];
                    w[(j, c)] -= t;
                }
            }
        }
        Ok(())
    }

    /// Embed the full `U` (unit diagonal included) into `w` starting at
    /// column `col0`.
    pub(crate) fn embed_u(&self, w: &mut DMatrix<R>, col0: usize) {
        for j in 0..self.n {
            for i in 0..self.n {
                w[(i, col0 + j)] = self.u_entry(i, j);
            }
        }
    }

    /// Embed `Uᵀ` into `m` starting at row `row0`: row `row0 + i` receives
    /// the `i`-th column of `U`.
    pub(crate) fn embed_ut_rows(&self, m: &mut DMatrix<R>, row0: usize) {
        for i in 0..self.n {
            for j in 0..self.n {
                m[(row0 + i, j)] = self.u_entry(j, i);
            }
        }
    }

    /// Write `B·U` into `w` starting at column `col0`.
    pub(crate) fn right_mul_into(&self, w: &mut DMatrix<R>, col0: usize, b: &DMatrix<R>) {
        debug_assert_eq!(b.ncols(), self.n);
        let nrows = b.nrows();
        for j in 0..self.n {
            for r in 0..nrows {
                let mut acc = b[(r, j)];
                for i in 0..j {
                    acc += self.u_packed(i, j) * b[(r, i)];
                }
                w[(r, col0 + j)] = acc;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_factor(rng: &mut StdRng, n: usize) -> UdFactor<f64> {
        let mut f = UdFactor::identity(n);
        for j in 1..n {
            for i in 0..j {
                f.set_u_entry(i, j, rng.gen_range(-1.0..1.0));
            }
        }
        for i in 0..n {
            f.set_d(i, rng.gen_range(0.1..2.0));
        }
        f
    }

    #[test]
    fn packed_layout_matches_column_major_upper() {
        let mut f = UdFactor::<f64>::identity(4);
        f.set_u_entry(0, 1, 0.1);
        f.set_u_entry(0, 2, 0.2);
        f.set_u_entry(1, 2, 0.3);
        f.set_u_entry(2, 3, 0.4);
        assert_eq!(f.u_packed(0, 1), 0.1);
        assert_eq!(f.u_packed(1, 2), 0.3);
        assert_eq!(f.u_entry(2, 3), 0.4);
        assert_eq!(f.u_entry(1, 1), 1.0);
        assert_eq!(f.u_entry(3, 1), 0.0);
    }

    #[test]
    fn reconstruct_of_diagonal_factor() {
        let d = DVector::from_vec(vec![2.0, 3.0, 4.0]);
        let f = UdFactor::from_diagonal(&d);
        let p = f.reconstruct();
        assert_relative_eq!(p, DMatrix::from_diagonal(&d), epsilon = 1e-15);
    }

    #[test]
    fn u_solve_inverts_mul() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in 2..=6 {
            let f = random_factor(&mut rng, n);
            let v = DVector::from_fn(n, |_, _| rng.gen_range(-1.0..1.0));
            let mut k = DVector::zeros(n);
            f.mul_vec(&mut k, &v);
            f.u_solve_vec(&mut k);
            assert_relative_eq!(k, v, epsilon = 1e-12);
        }
    }

    #[test]
    fn ut_mul_matches_row_mul() {
        let mut rng = StdRng::seed_from_u64(8);
        let f = random_factor(&mut rng, 5);
        let v = DVector::from_fn(5, |_, _| rng.gen_range(-1.0..1.0));
        let mut by_row = DVector::zeros(5);
        f.row_mul_vec(&mut by_row, &v);
        let mut in_place = v.clone();
        f.ut_mul_vec(&mut in_place);
        assert_relative_eq!(by_row, in_place, epsilon = 1e-14);
    }

    #[test]
    fn u_solve_rows_decorrelates_each_row() {
        let mut rng = StdRng::seed_from_u64(9);
        let f = random_factor(&mut rng, 3);
        let a = DMatrix::from_fn(3, 4, |_, _| rng.gen_range(-1.0..1.0));
        let mut solved = a.clone();
        f.u_solve_rows(&mut solved);
        // Rebuild U·B and compare with the original rows.
        for c in 0..4 {
            let mut col = DVector::from_fn(3, |r, _| solved[(r, c)]);
            let mut rebuilt = DVector::zeros(3);
            f.mul_vec(&mut rebuilt, &col);
            col.copy_from(&rebuilt);
            for r in 0..3 {
                assert_relative_eq!(col[r], a[(r, c)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn rank1_update_matches_dense_sum() {
        let mut rng = StdRng::seed_from_u64(10);
        for n in 2..=8 {
            let mut f = random_factor(&mut rng, n);
            let dense = f.reconstruct();
            let v = DVector::from_fn(n, |_, _| rng.gen_range(-1.0..1.0));
            let s = rng.gen_range(0.1..1.5);
            let mut scratch = v.clone();
            f.rank1_update(s, &mut scratch).unwrap();
            let expected = &dense + &v * v.transpose() * s;
            assert_relative_eq!(f.reconstruct(), expected, epsilon = 1e-10);
        }
    }

    #[test]
    fn up_then_down_restores_factors() {
        let mut rng = StdRng::seed_from_u64(11);
        for n in 2..=8 {
            let mut f = random_factor(&mut rng, n);
            let before = f.reconstruct();
            let v = DVector::from_fn(n, |_, _| rng.gen_range(-1.0..1.0));
            let s = 0.7;
            let mut scratch = v.clone();
            f.rank1_update(s, &mut scratch).unwrap();
            scratch.copy_from(&v);
            f.rank1_downdate(s, &mut scratch).unwrap();
            assert_relative_eq!(f.reconstruct(), before, epsilon = 1e-10);
        }
    }

    #[test]
    fn downdate_refuses_to_lose_definiteness() {
        let mut f = UdFactor::from_diagonal(&DVector::from_vec(vec![1.0, 1.0]));
        let mut v = DVector::from_vec(vec![2.0, 0.0]);
        let err = f.rank1_downdate(1.0, &mut v).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DowndateBreakdown);
    }

    #[test]
    fn mwgs_reproduces_weighted_gram_matrix() {
        let mut rng = StdRng::seed_from_u64(12);
        for n in 2..=8 {
            let m = 2 * n;
            let mut w = DMatrix::from_fn(n, m, |_, _| rng.gen_range(-1.0..1.0));
            let dw = DVector::from_fn(m, |_, _| rng.gen_range(0.1..2.0));
            let expected = &w * DMatrix::from_diagonal(&dw) * w.transpose();
            let mut f = UdFactor::identity(n);
            f.mwgs_into(&mut w, m, &dw).unwrap();
            assert_relative_eq!(f.reconstruct(), expected, epsilon = 1e-10);
            for i in 0..n {
                assert!(f.d()[i] > 0.0);
            }
        }
    }

    #[test]
    fn mwgs_flags_degenerate_pivot() {
        let mut w = DMatrix::zeros(2, 4);
        w[(0, 0)] = 1.0;
        let dw = DVector::from_element(4, 1.0);
        let mut f = UdFactor::<f64>::identity(2);
        let err = f.mwgs_into(&mut w, 4, &dw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DegeneratePivot);
    }

    #[test]
    fn right_mul_embeds_product() {
        let mut rng = StdRng::seed_from_u64(13);
        let f = random_factor(&mut rng, 3);
        let b = DMatrix::from_fn(3, 3, |_, _| rng.gen_range(-1.0..1.0));
        let mut w = DMatrix::zeros(3, 6);
        f.right_mul_into(&mut w, 3, &b);
        let mut u = DMatrix::zeros(3, 3);
        for i in 0..3 {
            for j in 0..3 {
                u[(i, j)] = f.u_entry(i, j);
            }
        }
        let expected = &b * u;
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(w[(i, 3 + j)], expected[(i, j)], epsilon = 1e-13);
            }
        }
    }
}
