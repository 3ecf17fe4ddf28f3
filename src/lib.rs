//! UD-factorized Kalman filtering for embedded and real-time state
//! estimation.
//!
//! Characteristics:
//! - Uses the [nalgebra](https://nalgebra.org) crate for math.
//! - Supports `no_std` to facilitate running on embedded microcontrollers.
//! - Covariances are carried as `U·diag(D)·Uᵀ` factors and never
//!   materialized, with Modified Weighted Gram-Schmidt re-triangularization
//!   preserving positive definiteness where a dense filter would slowly
//!   lose symmetry.
//! - Extended filter ([`Ekf`]) with Bierman (scalar) and Joseph (matrix)
//!   measurement updates, each in plain, adaptive (chi-square divergence
//!   detection), robust (M-estimator influence over the innovation) and
//!   adaptive-robust form.
//! - Unscented filter ([`Ukf`]) over Van der Merwe sigma points, with
//!   sequential Bierman-like updates in the same four forms plus a
//!   full-matrix update and its adaptive variant.
//!
//! Process and measurement models are supplied as trait implementations;
//! every operation returns `Result<Flags, Error>` where [`Flags`] carries
//! OR-able advisory bits and any [`Error`] means the posterior is not to
//! be trusted.
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use udkalman::{Ekf, IdentityTransition, MeasurementModel, UdFactor};
//!
//! struct Position;
//!
//! impl MeasurementModel<f64> for Position {
//!     fn measure_into(&self, z: &mut DVector<f64>, x: &DVector<f64>) {
//!         z.copy_from(x);
//!     }
//!
//!     fn jacobian_into(&self, h: &mut DMatrix<f64>, _x: &DVector<f64>) {
//!         h.fill_with_identity();
//!     }
//! }
//!
//! let mut kf = Ekf::new(2, 2).unwrap();
//! kf.q = UdFactor::from_diagonal(&DVector::from_element(2, 0.01));
//! kf.r = UdFactor::from_diagonal(&DVector::from_element(2, 0.01));
//!
//! for _ in 0..10 {
//!     kf.predict(&IdentityTransition).unwrap();
//!     kf.bierman_update(&Position, &DVector::from_element(2, 1.0)).unwrap();
//! }
//! assert!((kf.x[0] - 1.0).abs() < 1e-3);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

// Without std, create a dummy trace!() macro.
#[cfg(feature = "std")]
macro_rules! trace {
    ($($t:tt)*) => {
        log::trace!($($t)*)
    };
}
#[cfg(not(feature = "std"))]
macro_rules! trace {
    ($($t:tt)*) => {{}};
}

mod error;
pub use error::{Error, ErrorKind, Flags};

mod ud;
pub use ud::UdFactor;

mod update;
pub use update::{Huber, Influence};

mod ekf;
pub use ekf::{Ekf, IdentityTransition, MeasurementModel, TransitionModel};

mod sigma;
pub use sigma::{MerweSigmaPoints, SigmaPoints};

mod ukf;
pub use ukf::{IdentityProcess, SigmaMeasurement, SigmaProcess, Ukf};
