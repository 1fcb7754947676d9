//! Backend-polymorphic state vectors for the integrator.
//!
//! The stepper, nonlinear solver, and root-finder only touch problem data
//! through the [`OdeVector`] operations, so a serial, distributed, or device
//! vector can sit behind the same integrator. Every operation is treated as a
//! synchronous, possibly collective call into the backend.

use std::fmt::Debug;

pub mod state_vector;

pub use state_vector::StateVector;

/// The complete vector contract the stepper needs.
///
/// All vectors participating in one integration must share the same length
/// and backend; implementations panic on length mismatch.
pub trait OdeVector: Clone + Debug + Default + 'static {
    /// Number of components.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set every component to `c`.
    fn fill(&mut self, c: f64);

    /// `self *= c`
    fn scale(&mut self, c: f64);

    /// `self[i] += c` for every component.
    fn add_scalar(&mut self, c: f64);

    /// `self = a*x + b*y`
    fn linear_sum(&mut self, a: f64, x: &Self, b: f64, y: &Self);

    /// `self += a*x`
    fn axpy(&mut self, a: f64, x: &Self);

    /// `self[i] = x[i] * y[i]`
    fn prod_of(&mut self, x: &Self, y: &Self);

    /// `self[i] = |x[i]|`
    fn abs_of(&mut self, x: &Self);

    /// `self[i] = 1 / x[i]`; the caller guarantees `x` has no zero component.
    fn inv_of(&mut self, x: &Self);

    /// Weighted root-mean-square norm, `sqrt(sum((self[i]*w[i])^2) / n)`.
    fn wrms_norm(&self, w: &Self) -> f64;

    /// Max-norm.
    fn max_norm(&self) -> f64;

    /// Smallest component (not smallest magnitude).
    fn min_component(&self) -> f64;
}
