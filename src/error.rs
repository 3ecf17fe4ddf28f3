use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// Error returned by filter operations.
///
/// Any error means the posterior produced by the failing call is
/// unreliable. Argument errors are raised before state is touched;
/// numerical-breakdown errors may leave the covariance factors partially
/// updated, and the estimator should be re-initialized before further use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
}

/// Kinds of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A dimension parameter is out of range (`n_x < 2`, `n_z = 0`) or an
    /// input vector does not match the estimator's dimensions.
    BadDimension,
    /// The divergence-test threshold `chi2` is not strictly positive.
    BadThreshold,
    /// A computed innovation variance or diagonal entry is not strictly
    /// positive.
    NotPositiveDefinite,
    /// A Gram-Schmidt pivot fell below the degeneracy threshold.
    DegeneratePivot,
    /// A rank-1 downdate would produce a non-positive diagonal entry.
    DowndateBreakdown,
    /// A non-finite value appeared inside an update kernel.
    NonFinite,
    /// The fast sequential path was requested by an update that does not
    /// support it.
    FastPathUnsupported,
}

impl Error {
    /// The kind of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Error { kind }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.kind {
            ErrorKind::BadDimension => "dimension parameter or input length out of range",
            ErrorKind::BadThreshold => "divergence threshold must be strictly positive",
            ErrorKind::NotPositiveDefinite => "innovation variance or diagonal entry not positive",
            ErrorKind::DegeneratePivot => "Gram-Schmidt pivot below degeneracy threshold",
            ErrorKind::DowndateBreakdown => "rank-1 downdate lost positive definiteness",
            ErrorKind::NonFinite => "non-finite value in update kernel",
            ErrorKind::FastPathUnsupported => "fast sequential path not supported by this update",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Informational status flags reported by a successful operation.
///
/// Flags are OR-accumulated along the call chain: each measurement row can
/// contribute its own bits and the update returns the union. None of them
/// indicates a failure; they report that an adaptive inflation ran or that
/// a robust influence slope was unusually small.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    /// Chi-square divergence test exceeded its threshold and the
    /// innovation was inflated.
    pub const ANOMALY: Flags = Flags(1);
    /// Robust influence slope fell below `1 - 2ε`.
    pub const GLITCH_SMALL: Flags = Flags(1 << 1);
    /// Robust influence slope fell below `ε`.
    pub const GLITCH_LARGE: Flags = Flags(1 << 2);

    /// No flags set.
    #[inline]
    pub fn empty() -> Flags {
        Flags(0)
    }

    /// `true` if no flag is set.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `true` if every flag in `other` is also set in `self`.
    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    #[inline]
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accumulate() {
        let mut flags = Flags::empty();
        assert!(flags.is_empty());
        flags |= Flags::ANOMALY;
        flags |= Flags::GLITCH_SMALL;
        assert!(flags.contains(Flags::ANOMALY));
        assert!(flags.contains(Flags::ANOMALY | Flags::GLITCH_SMALL));
        assert!(!flags.contains(Flags::GLITCH_LARGE));
    }

    #[test]
    fn error_kind_round_trip() {
        let err: Error = ErrorKind::DegeneratePivot.into();
        assert_eq!(err.kind(), ErrorKind::DegeneratePivot);
    }
}
