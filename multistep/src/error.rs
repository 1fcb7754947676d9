use thiserror::Error;
use tolerance::ToleranceError;

/// Outcome of a user right-hand-side or root-function evaluation.
///
/// Recoverable failures tell the solver to retry the step with a smaller step
/// size and a fresh Jacobian; fatal failures abort the integration.
#[derive(Debug, Error)]
pub enum RhsError {
    #[error("right-hand side failed recoverably")]
    Recoverable,
    #[error("right-hand side failed: {0}")]
    Fatal(String),
}

/// Outcome of a linear solver setup or solve call.
#[derive(Debug, Error)]
pub enum LinearSolveError {
    #[error("linear solver failed recoverably")]
    Recoverable,
    #[error("linear solver failed: {0}")]
    Fatal(String),
}

/// Illegal configuration passed to a step-size controller setter.
#[derive(Debug, Error, PartialEq)]
pub enum ControlError {
    #[error("illegal controller input: {0}")]
    IllInput(&'static str),
}

/// Errors surfaced by the integrator. Internal retries (convergence and error
/// test failures within their limits) never appear here; only exhaustion of a
/// retry limit or an unrecoverable condition does. After a fatal step error
/// the last accepted `(t, y)` remains queryable.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("illegal input: {0}")]
    IllInput(String),

    #[error("solver has not been initialized")]
    NotInitialized,

    #[error("maximum internal steps taken before reaching tout (t = {t})")]
    TooMuchWork { t: f64 },

    #[error(
        "tolerances too tight for machine precision at t = {t}; \
         suggested tolerance scale factor {tolsf}"
    )]
    TooMuchAccuracy { t: f64, tolsf: f64 },

    #[error("repeated error test failures or |h| = h_min at t = {t}")]
    ErrFailure { t: f64 },

    #[error("repeated corrector convergence failures or |h| = h_min at t = {t}")]
    ConvFailure { t: f64 },

    #[error("linear solver setup failed unrecoverably at t = {t}: {msg}")]
    SetupFailure { t: f64, msg: String },

    #[error("linear solver solve failed unrecoverably at t = {t}: {msg}")]
    SolveFailure { t: f64, msg: String },

    #[error("right-hand side failed unrecoverably at t = {t}: {msg}")]
    RhsFailure { t: f64, msg: String },

    #[error("right-hand side failed recoverably at the first step")]
    FirstRhsFailure,

    #[error("root function failed at t = {t}: {msg}")]
    RootFailure { t: f64, msg: String },

    #[error("error weight component became non-positive at t = {t}")]
    BadErrorWeight { t: f64 },

    #[error("t = {t} is outside the last step interval [{tmin}, {tmax}]")]
    BadT { t: f64, tmin: f64, tmax: f64 },

    #[error("derivative order k = {k} is outside [0, {qmax}]")]
    BadK { k: usize, qmax: usize },

    #[error(transparent)]
    Tolerance(#[from] ToleranceError),
}

impl SolverError {
    /// True for step-level failures that leave the last accepted state valid.
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            SolverError::TooMuchWork { .. }
                | SolverError::TooMuchAccuracy { .. }
                | SolverError::ErrFailure { .. }
                | SolverError::ConvFailure { .. }
                | SolverError::SetupFailure { .. }
                | SolverError::SolveFailure { .. }
                | SolverError::RhsFailure { .. }
        )
    }
}
