//! Linear-solver contract consumed by the Newton iteration.
//!
//! The integrator never sees a concrete matrix; it only asks an implementor
//! to prepare and apply a solver for the Newton matrix `M ≈ I - gamma*J`,
//! where `J = df/dy` at the current step. Dense, banded, sparse, and Krylov
//! backends all sit behind this trait.

use crate::error::LinearSolveError;
use crate::state::OdeVector;

pub trait NewtonLinear<V: OdeVector> {
    /// Prepares the solver for `M = I - gamma*J` at `(t, y)`, with `fy =
    /// f(t, y)` available for difference-quotient approximations.
    ///
    /// When `jac_ok` is true the integrator considers the saved Jacobian data
    /// usable and the implementor may skip the (expensive) refresh. Returns
    /// whether the Jacobian data is current after the call.
    fn setup(
        &mut self,
        t: f64,
        y: &V,
        fy: &V,
        gamma: f64,
        jac_ok: bool,
    ) -> Result<bool, LinearSolveError>;

    /// Solves `M x = b` in place. `weight` is the current error-weight vector
    /// for solvers with norm-based stopping criteria; `ycur` and `fcur` are
    /// the current iterate and its derivative.
    fn solve(
        &mut self,
        b: &mut V,
        weight: &V,
        ycur: &V,
        fcur: &V,
    ) -> Result<(), LinearSolveError>;
}
