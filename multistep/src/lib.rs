//! Implicit multistep integration for stiff ordinary differential equations.
//!
//! The crate is built around [`bdf::BdfSolver`], a variable-order,
//! variable-step backward-differentiation-formula stepper. Each step solves
//! the implicit corrector equation with a modified Newton iteration
//! ([`newton::NewtonSolver`]) over a user-supplied linear solver
//! ([`linear::NewtonLinear`]), and step sizes come from a predictive
//! Gustafsson controller ([`controller::GustafssonControl`]). Event location
//! ([`rootfind::RootFinder`]) and dense output are available on every
//! accepted step.
//!
//! [`OdeProblem`] wraps the stepper in a driver that integrates over a time
//! span, records accepted steps, and collects located events.

use std::fmt::Debug;
use std::path::PathBuf;

pub mod bdf;
pub mod controller;
pub mod error;
pub mod linear;
pub mod newton;
pub mod rootfind;
pub mod saving;
pub mod state;

pub use bdf::{BdfSolver, SolverStats, StepMode, StepOutcome};
pub use controller::GustafssonControl;
pub use error::{LinearSolveError, RhsError, SolverError};
pub use linear::NewtonLinear;
pub use rootfind::{RootDirection, RootFinder, RootFn};
pub use saving::{MemoryResult, Record, ResultStorage, SaveMethod};
pub use state::{OdeVector, StateVector};
pub use tolerance::{AbsTol, Tolerances};

/// Trait for defining a dynamical system model that can be numerically
/// integrated.
///
/// Implementors compute the right-hand side `ydot = f(t, y)` of the ODE.
/// A recoverable failure asks the solver to retry with a smaller step.
pub trait OdeModel: Debug {
    type State: OdeVector;

    /// Compute the derivative at time `t` and state `state`, storing the
    /// result in `derivative`.
    fn f(
        &mut self,
        t: f64,
        state: &Self::State,
        derivative: &mut Self::State,
    ) -> Result<(), RhsError>;
}

/// Container for a complete integration problem: model, linear solver,
/// tolerances, stop time, event function, and saving strategy.
pub struct OdeProblem<Model, Lin>
where
    Model: OdeModel,
    Model::State: Record,
    Lin: NewtonLinear<Model::State>,
{
    solver: BdfSolver<Model, Lin>,
    tolerances: Tolerances<Model::State>,
    save_file: Option<PathBuf>,
    roots: Vec<(f64, Vec<i8>)>,
}

impl<Model, Lin> OdeProblem<Model, Lin>
where
    Model: OdeModel,
    Model::State: Record,
    Lin: NewtonLinear<Model::State>,
{
    pub fn new(model: Model, linear: Lin) -> Self {
        Self {
            solver: BdfSolver::new(model, linear),
            tolerances: Tolerances::default(),
            save_file: None,
            roots: Vec::new(),
        }
    }

    pub fn with_tolerances(mut self, tolerances: Tolerances<Model::State>) -> Self {
        self.tolerances = tolerances;
        self
    }

    /// Installs an event function with `nrtfn` components; located events
    /// are recorded in [`Self::roots`] and saved as output rows.
    pub fn with_root_fn(mut self, nrtfn: usize, gfun: RootFn<Model::State>) -> Self {
        self.solver = self.solver.with_rootfinder(RootFinder::new(nrtfn, gfun));
        self
    }

    /// The integration will not step past `tstop`.
    pub fn with_stop_time(mut self, tstop: f64) -> Self {
        self.solver.set_stop_time(tstop);
        self
    }

    pub fn with_initial_step(mut self, h0: f64) -> Self {
        self.solver.set_initial_step(h0);
        self
    }

    pub fn with_max_order(mut self, maxord: usize) -> Self {
        self.solver = self.solver.with_max_order(maxord);
        self
    }

    /// Output file for `SaveMethod::File`.
    pub fn with_saving(mut self, save_file: PathBuf) -> Self {
        self.save_file = Some(save_file);
        self
    }

    /// Direct access to the stepper for configuration the builder does not
    /// cover (step bounds, retry limits, controller gains).
    pub fn solver_mut(&mut self) -> &mut BdfSolver<Model, Lin> {
        &mut self.solver
    }

    pub fn solver(&self) -> &BdfSolver<Model, Lin> {
        &self.solver
    }

    /// Events located during the last `solve`, as `(t, directions)` pairs.
    pub fn roots(&self) -> &[(f64, Vec<i8>)] {
        &self.roots
    }

    /// Integrates from `tspan.0` to `tspan.1`, recording every accepted
    /// internal step plus the exact endpoint.
    pub fn solve(
        &mut self,
        x0: &Model::State,
        tspan: (f64, f64),
        save_method: SaveMethod,
    ) -> Result<ResultStorage<Model::State>, SolverError> {
        let (t0, tf) = tspan;
        self.roots.clear();
        self.solver.init(t0, x0, self.tolerances.clone())?;

        let method = match save_method {
            SaveMethod::None => match &self.save_file {
                Some(path) => SaveMethod::File(path.clone()),
                None => SaveMethod::None,
            },
            other => other,
        };
        // Conservative allocation: one save per unit time.
        let capacity = (tf - t0).abs().ceil() as usize + 2;
        let mut result = ResultStorage::build(&method, capacity, x0)?;
        result.save(t0, x0)?;

        let direction = if tf >= t0 { 1.0 } else { -1.0 };
        let mut yout = x0.clone();
        loop {
            match self.solver.step(tf, StepMode::OneStep, &mut yout)? {
                StepOutcome::RootFound(t) => {
                    if (t - tf) * direction > 0.0 {
                        // Root beyond the requested endpoint: stop at tf.
                        self.solver.interpolate(tf, &mut yout)?;
                        result.save(tf, &yout)?;
                        break;
                    }
                    self.roots.push((t, self.solver.root_info().to_vec()));
                    result.save(t, &yout)?;
                }
                StepOutcome::TstopReached(t) => {
                    result.save(t, &yout)?;
                    break;
                }
                StepOutcome::Success(t) => {
                    if (t - tf) * direction >= 0.0 {
                        // Finish exactly at tf by interpolation.
                        self.solver.interpolate(tf, &mut yout)?;
                        result.save(tf, &yout)?;
                        break;
                    }
                    result.save(t, &yout)?;
                }
            }
        }

        result.truncate()?;
        Ok(result)
    }
}
