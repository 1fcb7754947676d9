//! Newton iteration for the implicit corrector equation.
//!
//! Each step of the implicit multistep method requires solving a nonlinear
//! system `F(ycor) = 0` for the correction to the predicted state. The solver
//! here runs a modified Newton iteration against callbacks supplied by the
//! integrator: residual evaluation, linear-system setup, and linear solve.
//! It owns no problem vectors beyond its own correction scratch.

use thiserror::Error;

use crate::error::{LinearSolveError, RhsError};
use crate::state::OdeVector;

/// Default maximum Newton iterations per corrector solve.
const MAX_ITERS: usize = 3;
/// Decay factor applied to the estimated convergence rate.
const CRDOWN: f64 = 0.3;
/// Iteration is declared divergent when the correction norm grows by more
/// than this ratio between iterations.
const RDIV: f64 = 2.0;

/// Callbacks the integrator provides for one corrector solve. The solver
/// holds no reference to the integrator between calls.
pub trait NewtonSystem<V: OdeVector> {
    /// Evaluates the corrector residual `F(ycor)` into `res`.
    fn residual(&mut self, ycor: &V, res: &mut V) -> Result<(), RhsError>;

    /// Prepares the Newton matrix; `jac_bad` forces a Jacobian refresh.
    /// Returns whether the Jacobian is current afterwards.
    fn lsetup(&mut self, jac_bad: bool) -> Result<bool, LinearSolveError>;

    /// Solves the Newton linear system in place: `b` holds the residual on
    /// entry and the correction increment on return.
    fn lsolve(&mut self, b: &mut V) -> Result<(), LinearSolveError>;
}

/// Failure classification for a corrector solve. Recoverable failures ask
/// the integrator to shrink the step and retry with a fresh Jacobian; the
/// fatal variants abort the integration.
#[derive(Debug, Error)]
pub enum NewtonError {
    #[error("corrector iteration failed to converge")]
    Recoverable,
    #[error("residual evaluation failed: {0}")]
    RhsFatal(String),
    #[error("linear solver setup failed: {0}")]
    SetupFatal(String),
    #[error("linear solver solve failed: {0}")]
    SolveFatal(String),
}

/// Modified Newton solver with a geometric convergence-rate heuristic.
#[derive(Debug)]
pub struct NewtonSolver<V: OdeVector> {
    max_iters: usize,
    crdown: f64,
    rdiv: f64,
    /// Estimated convergence rate, reset whenever the Jacobian is refreshed.
    crate_: f64,
    /// Correction norm from the previous iteration.
    delp: f64,
    /// Iterations taken by the solve in progress.
    curiter: usize,
    /// Cumulative Newton iterations.
    niters: u64,
    /// Cumulative nonlinear convergence failures.
    nconvfails: u64,
    /// Newton increment scratch; doubles as residual storage.
    delta: V,
}

impl<V: OdeVector> NewtonSolver<V> {
    pub fn new() -> Self {
        Self {
            max_iters: MAX_ITERS,
            crdown: CRDOWN,
            rdiv: RDIV,
            crate_: 1.0,
            delp: 0.0,
            curiter: 0,
            niters: 0,
            nconvfails: 0,
            delta: V::default(),
        }
    }

    /// Sizes the internal scratch from a problem-sized template vector.
    pub fn resize(&mut self, template: &V) {
        self.delta = template.clone();
        self.delta.fill(0.0);
    }

    pub fn set_max_iters(&mut self, max_iters: usize) {
        self.max_iters = max_iters.max(1);
    }

    pub fn max_iters(&self) -> usize {
        self.max_iters
    }

    pub fn num_iters(&self) -> u64 {
        self.niters
    }

    /// Iterations taken by the most recent solve.
    pub fn cur_iter(&self) -> usize {
        self.curiter
    }

    pub fn num_conv_fails(&self) -> u64 {
        self.nconvfails
    }

    pub fn reset_counters(&mut self) {
        self.niters = 0;
        self.nconvfails = 0;
    }

    /// Solves `F(ycor) = 0` starting from `ycor = 0`.
    ///
    /// `w` is the error-weight vector, `tol` the weighted-norm convergence
    /// target, and `call_lsetup` requests a linear setup before the first
    /// iteration. The predicted state lives inside the system callbacks;
    /// only the correction is iterated here, so the predictor is never
    /// mutated.
    pub fn solve<S: NewtonSystem<V>>(
        &mut self,
        sys: &mut S,
        ycor: &mut V,
        w: &V,
        tol: f64,
        call_lsetup: bool,
    ) -> Result<(), NewtonError> {
        let mut call_lsetup = call_lsetup;
        let mut jbad = false;
        let mut jcur = false;

        ycor.fill(0.0);
        self.curiter = 0;

        // Outer loop: retried at most once more with a forced Jacobian
        // refresh after a recoverable failure with stale Jacobian data.
        loop {
            match sys.residual(ycor, &mut self.delta) {
                Ok(()) => {}
                Err(RhsError::Recoverable) => {
                    self.nconvfails += 1;
                    return Err(NewtonError::Recoverable);
                }
                Err(RhsError::Fatal(msg)) => return Err(NewtonError::RhsFatal(msg)),
            }

            if call_lsetup {
                match sys.lsetup(jbad) {
                    Ok(current) => {
                        jcur = current;
                        self.crate_ = 1.0;
                    }
                    Err(LinearSolveError::Recoverable) => {
                        self.nconvfails += 1;
                        return Err(NewtonError::Recoverable);
                    }
                    Err(LinearSolveError::Fatal(msg)) => {
                        return Err(NewtonError::SetupFatal(msg));
                    }
                }
            }

            let mut m = 0usize;
            self.delp = 0.0;

            // Inner Newton iteration; `converged` is None while iterating,
            // Some(true) on success, Some(false) on a recoverable failure.
            let converged = loop {
                self.niters += 1;
                self.curiter = m + 1;

                match sys.lsolve(&mut self.delta) {
                    Ok(()) => {}
                    Err(LinearSolveError::Recoverable) => break false,
                    Err(LinearSolveError::Fatal(msg)) => {
                        return Err(NewtonError::SolveFatal(msg));
                    }
                }

                // Newton update: ycor -= M^{-1} F(ycor)
                ycor.axpy(-1.0, &self.delta);

                // Convergence test with geometric-rate extrapolation: the
                // rate estimate lets a slowly-contracting iteration pass
                // before max_iters only if it is on track.
                let del = self.delta.wrms_norm(w);
                if m > 0 {
                    self.crate_ = (self.crdown * self.crate_).max(del / self.delp);
                }
                let dcon = del * self.crate_.min(1.0) / tol;
                if dcon <= 1.0 {
                    break true;
                }

                // Divergence heuristic: growing corrections end the solve
                // early rather than burning the remaining iterations.
                if m >= 1 && del > self.rdiv * self.delp {
                    break false;
                }

                m += 1;
                if m == self.max_iters {
                    break false;
                }
                self.delp = del;

                match sys.residual(ycor, &mut self.delta) {
                    Ok(()) => {}
                    Err(RhsError::Recoverable) => break false,
                    Err(RhsError::Fatal(msg)) => return Err(NewtonError::RhsFatal(msg)),
                }
            };

            if converged {
                return Ok(());
            }

            self.nconvfails += 1;

            // Stale Jacobian data: try once more with a forced refresh
            // before reporting the failure to the integrator.
            if !jcur {
                jbad = true;
                call_lsetup = true;
                ycor.fill(0.0);
                continue;
            }
            return Err(NewtonError::Recoverable);
        }
    }
}

impl<V: OdeVector> Default for NewtonSolver<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateVector;

    /// Scalar system F(y) = y - c with exact Newton matrix M = 1.
    #[derive(Debug)]
    struct Shift {
        c: f64,
        setups: usize,
    }

    impl NewtonSystem<StateVector> for Shift {
        fn residual(
            &mut self,
            ycor: &StateVector,
            res: &mut StateVector,
        ) -> Result<(), RhsError> {
            res[0] = ycor[0] - self.c;
            Ok(())
        }

        fn lsetup(&mut self, _jac_bad: bool) -> Result<bool, LinearSolveError> {
            self.setups += 1;
            Ok(true)
        }

        fn lsolve(&mut self, _b: &mut StateVector) -> Result<(), LinearSolveError> {
            Ok(())
        }
    }

    #[test]
    fn converges_on_linear_system() {
        let mut nls = NewtonSolver::new();
        let template = StateVector::zeros(1);
        nls.resize(&template);
        let mut sys = Shift { c: 2.5, setups: 0 };
        let mut ycor = StateVector::zeros(1);
        let w = StateVector::new(vec![1.0]);
        nls.solve(&mut sys, &mut ycor, &w, 0.1, true)
            .unwrap();
        assert!((ycor[0] - 2.5).abs() < 1e-12);
        assert_eq!(sys.setups, 1);
        assert!(nls.num_iters() >= 1);
        assert_eq!(nls.num_conv_fails(), 0);
    }

    /// System whose linear solve always fails recoverably.
    #[derive(Debug)]
    struct BadSolve;

    impl NewtonSystem<StateVector> for BadSolve {
        fn residual(
            &mut self,
            _ycor: &StateVector,
            res: &mut StateVector,
        ) -> Result<(), RhsError> {
            res[0] = 1.0;
            Ok(())
        }

        fn lsetup(&mut self, _jac_bad: bool) -> Result<bool, LinearSolveError> {
            Ok(true)
        }

        fn lsolve(&mut self, _b: &mut StateVector) -> Result<(), LinearSolveError> {
            Err(LinearSolveError::Recoverable)
        }
    }

    #[test]
    fn recoverable_solve_failure_counts_convfail() {
        let mut nls = NewtonSolver::new();
        nls.resize(&StateVector::zeros(1));
        let mut ycor = StateVector::zeros(1);
        let w = StateVector::new(vec![1.0]);
        let err = nls
            .solve(&mut BadSolve, &mut ycor, &w, 0.1, true)
            .unwrap_err();
        assert!(matches!(err, NewtonError::Recoverable));
        assert_eq!(nls.num_conv_fails(), 1);
    }
}
