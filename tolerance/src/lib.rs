use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ToleranceError {
    #[error("relative tolerance must be positive, got {0}")]
    IllegalRelTol(f64),
    #[error("absolute tolerance must be positive")]
    IllegalAbsTol,
}

/// Absolute tolerance: a single scalar applied to every component, or a
/// per-component vector in the solver's state type.
#[derive(Clone, Debug)]
pub enum AbsTol<V> {
    Scalar(f64),
    Vector(V),
}

/// Relative/absolute tolerance pair controlling the solver's local error test.
///
/// The solver derives per-component error weights from these:
/// `ewt[i] = 1 / (rel_tol * |y[i]| + abs_tol[i])`.
#[derive(Clone, Debug)]
pub struct Tolerances<V> {
    pub rel_tol: f64,
    pub abs_tol: AbsTol<V>,
}

impl<V> Tolerances<V> {
    /// Scalar relative and absolute tolerances.
    pub fn new(rel_tol: f64, abs_tol: f64) -> Self {
        Self { rel_tol, abs_tol: AbsTol::Scalar(abs_tol) }
    }

    /// Scalar relative tolerance with a per-component absolute tolerance.
    pub fn with_vector_abs_tol(rel_tol: f64, abs_tol: V) -> Self {
        Self { rel_tol, abs_tol: AbsTol::Vector(abs_tol) }
    }

    /// Checks the scalar parts. The vector absolute tolerance is validated by
    /// the solver, which owns the component-wise operations.
    pub fn validate_scalars(&self) -> Result<(), ToleranceError> {
        if self.rel_tol <= 0.0 {
            return Err(ToleranceError::IllegalRelTol(self.rel_tol));
        }
        if let AbsTol::Scalar(atol) = self.abs_tol {
            if atol <= 0.0 {
                return Err(ToleranceError::IllegalAbsTol);
            }
        }
        Ok(())
    }
}

impl<V> Default for Tolerances<V> {
    fn default() -> Self {
        Self { rel_tol: 1e-3, abs_tol: AbsTol::Scalar(1e-6) }
    }
}

/// Scalar error weight, `1 / (rel_tol * |y| + abs_tol)`.
pub fn error_weight(y: f64, rel_tol: f64, abs_tol: f64) -> f64 {
    1.0 / (rel_tol * y.abs() + abs_tol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_validation() {
        let tol: Tolerances<Vec<f64>> = Tolerances::new(1e-6, 1e-9);
        assert!(tol.validate_scalars().is_ok());

        let bad: Tolerances<Vec<f64>> = Tolerances::new(-1.0, 1e-9);
        assert_eq!(
            bad.validate_scalars(),
            Err(ToleranceError::IllegalRelTol(-1.0))
        );

        let bad: Tolerances<Vec<f64>> = Tolerances::new(1e-6, 0.0);
        assert_eq!(bad.validate_scalars(), Err(ToleranceError::IllegalAbsTol));
    }

    #[test]
    fn weights() {
        let w = error_weight(-2.0, 1e-2, 1e-3);
        assert!((w - 1.0 / (2e-2 + 1e-3)).abs() < 1e-15);
    }
}
