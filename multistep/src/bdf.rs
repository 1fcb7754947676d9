//! Variable-order, variable-step BDF integrator.
//!
//! The stepper advances the solution with backward differentiation formulas
//! of orders 1 through 5, holding its discretization history in a Nordsieck
//! array `zn`, where `zn[j]` approximates `(h^j / j!) * y^(j)(t_n)`. Each
//! internal step predicts by shifting the history, corrects the prediction
//! with a Newton iteration on the implicit BDF equation, runs a local error
//! test, and on acceptance shifts the history and consults the step-size
//! controller and order-selection heuristics for the next step.
//!
//! All retries (corrector convergence failures, error test failures) are
//! internal and bounded; the caller only sees exhaustion of a retry limit or
//! an unrecoverable callback failure.

use serde::{Deserialize, Serialize};
use tolerance::{AbsTol, Tolerances};

use crate::OdeModel;
use crate::controller::GustafssonControl;
use crate::error::{RhsError, SolverError};
use crate::linear::NewtonLinear;
use crate::newton::{NewtonError, NewtonSolver, NewtonSystem};
use crate::rootfind::RootFinder;
use crate::state::OdeVector;

/// Highest BDF order carried by the history array.
pub const Q_MAX: usize = 5;

const UROUND: f64 = f64::EPSILON;

// Step-size ratio (eta) policy.
const ETAMX1: f64 = 1.0e4; // growth cap on the very first step
const ETAMX: f64 = 10.0; // growth cap afterwards
const ETAMXF: f64 = 0.2; // cap once error-test failures accumulate
const ETAMIN: f64 = 0.1; // smallest shrink from an error-test failure
const ETACF: f64 = 0.25; // shrink after a convergence failure
const ETA_SHRINK_MAX: f64 = 0.9; // an error-test retry must shrink the step
const THRESH: f64 = 1.5; // step-size changes smaller than this are skipped

// Order-selection error biases.
const BIAS1: f64 = 6.0;
const BIAS2: f64 = 6.0;
const BIAS3: f64 = 10.0;
const ADDON: f64 = 1.0e-6;

const ONEPSM: f64 = 1.000001;
const SMALL_NEF: usize = 2;
const MXNEF1: usize = 3;
const LONG_WAIT: usize = 10;

// Nonlinear solve / Jacobian currency policy.
const NLS_COEF: f64 = 0.1;
const MSBP: u64 = 20; // max steps between linear setups
const DGMAX: f64 = 0.3; // gamma drift forcing a linear setup

// Initial step size heuristic.
const HLB_FACTOR: f64 = 100.0;
const HUB_FACTOR: f64 = 0.1;
const H_BIAS: f64 = 0.5;
const MAX_H0_ITERS: usize = 4;

const FUZZ_FACTOR: f64 = 100.0;

const MXSTEP_DEFAULT: usize = 500;
const MXNCF_DEFAULT: usize = 10;
const MXNEF_DEFAULT: usize = 7;
const MXHNIL_DEFAULT: u32 = 10;

/// How a `step` call returns control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepMode {
    /// Step internally until `tout` is reached or passed, then interpolate
    /// to return `y(tout)` without disturbing internal state.
    Normal,
    /// Take exactly one accepted internal step and return the reached time.
    OneStep,
}

/// Successful outcome of a `step` call, carrying the time reached.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepOutcome {
    /// Reached `tout` (normal mode) or completed one step (one-step mode).
    Success(f64),
    /// Halted exactly at the configured stop time.
    TstopReached(f64),
    /// A root of the user's event function was located; `root_info` reports
    /// which components crossed.
    RootFound(f64),
}

/// Cumulative integrator statistics. Counters only reset on `init`/`reinit`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SolverStats {
    pub num_steps: u64,
    pub num_rhs_evals: u64,
    pub num_lin_setups: u64,
    pub num_nonlin_iters: u64,
    pub num_nonlin_conv_fails: u64,
    pub num_err_test_fails: u64,
    pub num_root_evals: u64,
    pub last_order: usize,
    pub current_order: usize,
    pub initial_step: f64,
    pub last_step: f64,
    pub current_step: f64,
    pub current_time: f64,
}

/// The BDF stepper.
///
/// Owns the model, the linear solver, the Newton solver, the step-size
/// controller, and every history/scratch vector; none of that state may be
/// shared between two instances. A single instance is not safe for
/// concurrent use.
#[derive(Debug)]
pub struct BdfSolver<M, L>
where
    M: OdeModel,
    L: NewtonLinear<M::State>,
{
    model: M,
    lsolver: L,
    nls: NewtonSolver<M::State>,
    controller: GustafssonControl,
    tols: Tolerances<M::State>,
    rootfinder: Option<RootFinder<M::State>>,

    initialized: bool,
    first_call_done: bool,

    // Nordsieck history: zn[j] ~ (h^j / j!) y^(j), j = 0..=Q_MAX.
    zn: Vec<M::State>,
    ewt: M::State,
    acor: M::State,
    y: M::State,
    ftemp: M::State,
    tempv: M::State,

    tn: f64,
    tretlast: f64,
    h: f64,
    hprime: f64,
    hscale: f64,
    eta: f64,
    etamax: f64,
    hu: f64,
    h0u: f64,
    hin: Option<f64>,
    hmin: f64,
    hmax_inv: f64,

    q: usize,
    qprime: usize,
    qu: usize,
    qwait: usize,
    maxord: usize,

    l: [f64; Q_MAX + 1],
    tau: [f64; Q_MAX + 2],
    tq: [f64; 6],

    rl1: f64,
    gamma: f64,
    gammap: f64,
    gamrat: f64,
    jcur: bool,
    nstlp: u64,

    acnrm: f64,
    etaq: f64,
    etaqm1: f64,
    etaqp1: f64,
    saved_tq5: f64,
    indx_acor: usize,
    tolsf: f64,

    tstop: Option<f64>,
    max_steps: usize,
    max_err_test_fails: usize,
    max_conv_fails: usize,
    nhnil: u32,

    nst: u64,
    nfe: u64,
    nsetups: u64,
    netf: u64,
    ncfn: u64,
}

/// Borrowed view of the stepper handed to the Newton solver for one
/// corrector solve: the predictor `zn[0]`, the scaled derivative history
/// `zn[1]`, and the callbacks into the model and linear solver.
struct CorrectorSystem<'a, M, L>
where
    M: OdeModel,
    L: NewtonLinear<M::State>,
{
    model: &'a mut M,
    lsolver: &'a mut L,
    tn: f64,
    gamma: f64,
    rl1: f64,
    zn0: &'a M::State,
    zn1: &'a M::State,
    ewt: &'a M::State,
    y: &'a mut M::State,
    ftemp: &'a mut M::State,
    nfe: &'a mut u64,
    nsetups: &'a mut u64,
    nstlp: &'a mut u64,
    nst: u64,
    gammap: &'a mut f64,
    jcur: &'a mut bool,
}

impl<M, L> NewtonSystem<M::State> for CorrectorSystem<'_, M, L>
where
    M: OdeModel,
    L: NewtonLinear<M::State>,
{
    fn residual(&mut self, ycor: &M::State, res: &mut M::State) -> Result<(), RhsError> {
        // Current iterate and its derivative.
        self.y.linear_sum(1.0, self.zn0, 1.0, ycor);
        *self.nfe += 1;
        self.model.f(self.tn, self.y, self.ftemp)?;
        // F(ycor) = ycor + zn[1]/l1 - gamma * f(t, zn[0] + ycor)
        res.linear_sum(self.rl1, self.zn1, 1.0, ycor);
        res.axpy(-self.gamma, self.ftemp);
        Ok(())
    }

    fn lsetup(&mut self, jac_bad: bool) -> Result<bool, crate::error::LinearSolveError> {
        *self.nsetups += 1;
        let current = self
            .lsolver
            .setup(self.tn, self.y, self.ftemp, self.gamma, !jac_bad)?;
        *self.jcur = current;
        *self.nstlp = self.nst;
        *self.gammap = self.gamma;
        Ok(current)
    }

    fn lsolve(&mut self, b: &mut M::State) -> Result<(), crate::error::LinearSolveError> {
        self.lsolver
            .solve(b, self.ewt, self.y, self.ftemp)
    }
}

impl<M, L> BdfSolver<M, L>
where
    M: OdeModel,
    L: NewtonLinear<M::State>,
{
    /// Creates an uninitialized stepper. Problem-sized allocation happens in
    /// [`Self::init`].
    pub fn new(model: M, lsolver: L) -> Self {
        Self {
            model,
            lsolver,
            nls: NewtonSolver::new(),
            controller: GustafssonControl::new(),
            tols: Tolerances::default(),
            rootfinder: None,
            initialized: false,
            first_call_done: false,
            zn: Vec::new(),
            ewt: M::State::default(),
            acor: M::State::default(),
            y: M::State::default(),
            ftemp: M::State::default(),
            tempv: M::State::default(),
            tn: 0.0,
            tretlast: 0.0,
            h: 0.0,
            hprime: 0.0,
            hscale: 0.0,
            eta: 1.0,
            etamax: ETAMX1,
            hu: 0.0,
            h0u: 0.0,
            hin: None,
            hmin: 0.0,
            hmax_inv: 0.0,
            q: 1,
            qprime: 1,
            qu: 0,
            qwait: 2,
            maxord: Q_MAX,
            l: [0.0; Q_MAX + 1],
            tau: [0.0; Q_MAX + 2],
            tq: [0.0; 6],
            rl1: 1.0,
            gamma: 0.0,
            gammap: 0.0,
            gamrat: 1.0,
            jcur: false,
            nstlp: 0,
            acnrm: 0.0,
            etaq: 1.0,
            etaqm1: 0.0,
            etaqp1: 0.0,
            saved_tq5: 0.0,
            indx_acor: Q_MAX,
            tolsf: 1.0,
            tstop: None,
            max_steps: MXSTEP_DEFAULT,
            max_err_test_fails: MXNEF_DEFAULT,
            max_conv_fails: MXNCF_DEFAULT,
            nhnil: 0,
            nst: 0,
            nfe: 0,
            nsetups: 0,
            netf: 0,
            ncfn: 0,
        }
    }

    /// Replaces the step-size controller (keeping its configured gains).
    pub fn with_controller(mut self, controller: GustafssonControl) -> Self {
        self.controller = controller;
        self
    }

    /// Installs a root-finder that is consulted after every accepted step.
    pub fn with_rootfinder(mut self, rootfinder: RootFinder<M::State>) -> Self {
        self.rootfinder = Some(rootfinder);
        self
    }

    /// Caps the BDF order at `maxord` (clamped to `1..=5`).
    pub fn with_max_order(mut self, maxord: usize) -> Self {
        self.maxord = maxord.clamp(1, Q_MAX);
        self
    }

    pub fn set_initial_step(&mut self, h0: f64) {
        self.hin = if h0 != 0.0 { Some(h0) } else { None };
    }

    pub fn set_min_step(&mut self, hmin: f64) -> Result<(), SolverError> {
        if hmin < 0.0 {
            return Err(SolverError::IllInput("hmin must be non-negative".into()));
        }
        self.hmin = hmin;
        Ok(())
    }

    pub fn set_max_step(&mut self, hmax: f64) -> Result<(), SolverError> {
        if hmax <= 0.0 {
            return Err(SolverError::IllInput("hmax must be positive".into()));
        }
        self.hmax_inv = 1.0 / hmax;
        Ok(())
    }

    /// Internal steps will not pass `tstop`; `step` halts exactly there.
    pub fn set_stop_time(&mut self, tstop: f64) {
        self.tstop = Some(tstop);
    }

    pub fn clear_stop_time(&mut self) {
        self.tstop = None;
    }

    /// Maximum internal steps per `step` call before `TooMuchWork`.
    pub fn set_max_steps(&mut self, max_steps: usize) {
        self.max_steps = if max_steps == 0 { MXSTEP_DEFAULT } else { max_steps };
    }

    pub fn set_max_err_test_fails(&mut self, n: usize) {
        self.max_err_test_fails = if n == 0 { MXNEF_DEFAULT } else { n };
    }

    pub fn set_max_conv_fails(&mut self, n: usize) {
        self.max_conv_fails = if n == 0 { MXNCF_DEFAULT } else { n };
    }

    pub fn controller_mut(&mut self) -> &mut GustafssonControl {
        &mut self.controller
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Solution vector at the current internal time.
    pub fn current_state(&self) -> &M::State {
        &self.zn[0]
    }

    pub fn current_time(&self) -> f64 {
        self.tn
    }

    /// Time handed back by the most recent `step` return.
    pub fn last_return_time(&self) -> f64 {
        self.tretlast
    }

    /// Error weights for the current state.
    pub fn error_weights(&self) -> &M::State {
        &self.ewt
    }

    /// Estimated local errors from the last step, scaled by the error-test
    /// coefficient.
    pub fn estimated_local_errors(&self) -> &M::State {
        &self.acor
    }

    /// Which root-function components crossed at the last `RootFound`
    /// return: `+1` rising, `-1` falling, `0` no crossing.
    pub fn root_info(&self) -> &[i8] {
        self.rootfinder
            .as_ref()
            .map(|rf| rf.root_info())
            .unwrap_or(&[])
    }

    pub fn stats(&self) -> SolverStats {
        SolverStats {
            num_steps: self.nst,
            num_rhs_evals: self.nfe,
            num_lin_setups: self.nsetups,
            num_nonlin_iters: self.nls.num_iters(),
            num_nonlin_conv_fails: self.ncfn,
            num_err_test_fails: self.netf,
            num_root_evals: self
                .rootfinder
                .as_ref()
                .map(|rf| rf.num_evals())
                .unwrap_or(0),
            last_order: self.qu,
            current_order: self.q,
            initial_step: self.h0u,
            last_step: self.hu,
            current_step: if self.first_call_done { self.hprime } else { 0.0 },
            current_time: self.tn,
        }
    }

    /// Initializes the integration at `(t0, y0)`.
    ///
    /// Validates tolerances, sizes every internal vector, computes the
    /// initial error weights, evaluates the derivative at `t0`, and resets
    /// the history to order 1. On any error the stepper stays uninitialized.
    pub fn init(
        &mut self,
        t0: f64,
        y0: &M::State,
        tols: Tolerances<M::State>,
    ) -> Result<(), SolverError> {
        self.initialized = false;
        tols.validate_scalars()?;
        if let AbsTol::Vector(atol) = &tols.abs_tol {
            if atol.len() != y0.len() {
                return Err(SolverError::IllInput(
                    "vector absolute tolerance length does not match the state".into(),
                ));
            }
            if atol.min_component() <= 0.0 {
                return Err(SolverError::IllInput(
                    "vector absolute tolerance has a non-positive component".into(),
                ));
            }
        }
        self.tols = tols;

        let mut zero = y0.clone();
        zero.fill(0.0);
        self.zn = (0..=Q_MAX).map(|_| zero.clone()).collect();
        self.zn[0] = y0.clone();
        self.ewt = zero.clone();
        self.acor = zero.clone();
        self.y = zero.clone();
        self.ftemp = zero.clone();
        self.tempv = zero;
        self.nls.resize(y0);

        self.tn = t0;
        self.tretlast = t0;
        if self.load_ewt().is_err() {
            return Err(SolverError::IllInput(
                "initial error weights are not all positive".into(),
            ));
        }

        // Seed zn[1] with ydot(t0); it is rescaled by h once the first step
        // size is known.
        self.nfe = 1;
        let (zn0, zn1) = {
            let (lo, hi) = self.zn.split_at_mut(1);
            (&lo[0], &mut hi[0])
        };
        match self.model.f(t0, zn0, zn1) {
            Ok(()) => {}
            Err(RhsError::Recoverable) => return Err(SolverError::FirstRhsFailure),
            Err(RhsError::Fatal(msg)) => {
                return Err(SolverError::RhsFailure { t: t0, msg });
            }
        }

        self.q = 1;
        self.qprime = 1;
        self.qu = 0;
        self.qwait = 2;
        self.l = [0.0; Q_MAX + 1];
        self.tau = [0.0; Q_MAX + 2];
        self.tq = [0.0; 6];
        self.h = 0.0;
        self.hprime = 0.0;
        self.hscale = 0.0;
        self.hu = 0.0;
        self.h0u = 0.0;
        self.eta = 1.0;
        self.etamax = ETAMX1;
        self.rl1 = 1.0;
        self.gamma = 0.0;
        self.gammap = 0.0;
        self.gamrat = 1.0;
        self.jcur = false;
        self.nstlp = 0;
        self.saved_tq5 = 0.0;
        self.indx_acor = self.maxord;
        self.tolsf = 1.0;
        self.nhnil = 0;

        self.nst = 0;
        self.nsetups = 0;
        self.netf = 0;
        self.ncfn = 0;
        self.nls.reset_counters();
        if let Some(rf) = self.rootfinder.as_mut() {
            rf.reset();
        }

        self.controller.reset();
        // The local error of an order-q BDF step behaves like h^(q+1).
        let _ = self.controller.set_method_order(self.q + 1);

        self.first_call_done = false;
        self.initialized = true;
        Ok(())
    }

    /// Restarts the integration from a new `(t0, y0)` with the tolerances
    /// and configuration already in place. No reallocation takes place.
    pub fn reinit(&mut self, t0: f64, y0: &M::State) -> Result<(), SolverError> {
        if !self.initialized {
            return Err(SolverError::NotInitialized);
        }
        let tols = self.tols.clone();
        self.init(t0, y0, tols)
    }

    /// Advances the integration toward `tout`.
    ///
    /// In `Normal` mode internal steps repeat until `tout` is passed, then
    /// `yout = y(tout)` is produced by interpolation; in `OneStep` mode a
    /// single accepted internal step is taken. Either mode halts exactly at
    /// a configured stop time, and returns early if a root is located.
    pub fn step(
        &mut self,
        tout: f64,
        mode: StepMode,
        yout: &mut M::State,
    ) -> Result<StepOutcome, SolverError> {
        if !self.initialized {
            return Err(SolverError::NotInitialized);
        }

        if !self.first_call_done {
            self.begin_first_step(tout)?;
        } else {
            if let Some(tstop) = self.tstop {
                if (tstop - self.tn) * self.h < 0.0 {
                    return Err(SolverError::IllInput(
                        "tstop is behind the current internal time".into(),
                    ));
                }
            }
            // Unsearched remainder of the last step's interval (a previous
            // return stopped short of tn, e.g. at a root).
            if let Some(troot) = self.check_roots()? {
                self.get_dky(troot, 0, yout)?;
                self.tretlast = troot;
                return Ok(StepOutcome::RootFound(troot));
            }
            if mode == StepMode::Normal && (self.tn - tout) * self.h >= 0.0 {
                self.get_dky(tout, 0, yout)?;
                self.tretlast = tout;
                return Ok(StepOutcome::Success(tout));
            }
        }

        let mut nstloc = 0usize;
        loop {
            if self.nst > 0 {
                // Refresh weights from the newly accepted state.
                if self.load_ewt().is_err() {
                    yout.clone_from(&self.zn[0]);
                    self.tretlast = self.tn;
                    return Err(SolverError::BadErrorWeight { t: self.tn });
                }
                // Accuracy floor: if machine precision dominates the
                // requested tolerances, report a suggested rescaling.
                let nrm = self.zn[0].wrms_norm(&self.ewt);
                self.tolsf = UROUND * nrm;
                if self.tolsf > 1.0 {
                    self.tolsf *= 2.0;
                    yout.clone_from(&self.zn[0]);
                    self.tretlast = self.tn;
                    return Err(SolverError::TooMuchAccuracy {
                        t: self.tn,
                        tolsf: self.tolsf,
                    });
                }
                self.tolsf = 1.0;
                // Step size underflowed to roundoff.
                if self.tn + self.hprime == self.tn {
                    self.nhnil += 1;
                    if self.nhnil <= MXHNIL_DEFAULT {
                        eprintln!(
                            "multistep: internal t = {} and step size h = {} are such that t + h = t",
                            self.tn, self.hprime
                        );
                    }
                }
            }

            if nstloc >= self.max_steps {
                yout.clone_from(&self.zn[0]);
                self.tretlast = self.tn;
                return Err(SolverError::TooMuchWork { t: self.tn });
            }

            if let Err(e) = self.take_step() {
                yout.clone_from(&self.zn[0]);
                self.tretlast = self.tn;
                return Err(e);
            }
            nstloc += 1;

            if let Some(troot) = self.check_roots()? {
                self.get_dky(troot, 0, yout)?;
                self.tretlast = troot;
                return Ok(StepOutcome::RootFound(troot));
            }

            if mode == StepMode::Normal && (self.tn - tout) * self.h >= 0.0 {
                self.get_dky(tout, 0, yout)?;
                self.tretlast = tout;
                return Ok(StepOutcome::Success(tout));
            }

            if let Some(tstop) = self.tstop {
                let troundoff = FUZZ_FACTOR * UROUND * (self.tn.abs() + self.h.abs());
                if (self.tn - tstop).abs() <= troundoff {
                    self.get_dky(tstop, 0, yout)?;
                    self.tretlast = tstop;
                    self.tstop = None;
                    return Ok(StepOutcome::TstopReached(tstop));
                }
                if (self.tn + self.hprime - tstop) * self.h > 0.0 {
                    self.hprime = (tstop - self.tn) * (1.0 - 4.0 * UROUND);
                    self.eta = self.hprime / self.h;
                }
            }

            if mode == StepMode::OneStep {
                yout.clone_from(&self.zn[0]);
                self.tretlast = self.tn;
                return Ok(StepOutcome::Success(self.tn));
            }
        }
    }

    /// Computes the `k`th derivative of the interpolating polynomial at `t`.
    ///
    /// Valid for `t` within the span of the last accepted step (with a small
    /// roundoff fuzz) and `k` up to the current order. Never mutates the
    /// stepper.
    pub fn get_dky(&self, t: f64, k: usize, dky: &mut M::State) -> Result<(), SolverError> {
        if !self.initialized {
            return Err(SolverError::NotInitialized);
        }
        if k > self.q {
            return Err(SolverError::BadK { k, qmax: self.q });
        }

        let mut tfuzz = FUZZ_FACTOR * UROUND * (self.tn.abs() + self.hu.abs());
        if self.hu < 0.0 {
            tfuzz = -tfuzz;
        }
        let tp = self.tn - self.hu - tfuzz;
        let tn1 = self.tn + tfuzz;
        if (t - tp) * (t - tn1) > 0.0 {
            let (tmin, tmax) = if self.hu >= 0.0 {
                (self.tn - self.hu, self.tn)
            } else {
                (self.tn, self.tn - self.hu)
            };
            return Err(SolverError::BadT { t, tmin, tmax });
        }

        // Horner evaluation of the differentiated Nordsieck polynomial in
        // s = (t - tn)/h.
        let s = (t - self.tn) / self.h;
        for j in (k..=self.q).rev() {
            let mut c = 1.0;
            for i in (j - k + 1)..=j {
                c *= i as f64;
            }
            if j == self.q {
                dky.clone_from(&self.zn[self.q]);
                dky.scale(c);
            } else {
                dky.scale(s);
                dky.axpy(c, &self.zn[j]);
            }
        }
        if k > 0 {
            dky.scale(self.h.powi(-(k as i32)));
        }
        Ok(())
    }

    /// Dense-output convenience: `y(t)` within the last step's span.
    pub fn interpolate(&self, t: f64, y: &mut M::State) -> Result<(), SolverError> {
        self.get_dky(t, 0, y)
    }

    // ----------------------------------------------------------------
    // first-call setup
    // ----------------------------------------------------------------

    fn begin_first_step(&mut self, tout: f64) -> Result<(), SolverError> {
        let tdist = (tout - self.tn).abs();
        let tround = UROUND * self.tn.abs().max(tout.abs());
        if tdist < 2.0 * tround {
            return Err(SolverError::IllInput(
                "tout too close to t0 to start integration".into(),
            ));
        }

        let mut h0 = match self.hin {
            Some(h0) => {
                if (tout - self.tn) * h0 < 0.0 {
                    return Err(SolverError::IllInput(
                        "initial step direction disagrees with the integration direction".into(),
                    ));
                }
                h0
            }
            None => self.estimate_initial_step(tout)?,
        };

        // Respect hmax and an upcoming stop time.
        h0 /= 1.0f64.max(h0.abs() * self.hmax_inv);
        if let Some(tstop) = self.tstop {
            if (tstop - self.tn) * h0 < 0.0 {
                return Err(SolverError::IllInput(
                    "tstop is behind the initial time".into(),
                ));
            }
            if (self.tn + h0 - tstop) * h0 > 0.0 {
                h0 = (tstop - self.tn) * (1.0 - 4.0 * UROUND);
            }
        }

        self.h = h0;
        self.hprime = h0;
        self.hscale = h0;
        self.h0u = h0;
        self.zn[1].scale(h0);

        if let Some(rf) = self.rootfinder.as_mut() {
            rf.initialize(self.tn, &self.zn[0])?;
        }

        self.first_call_done = true;
        Ok(())
    }

    /// Geometric search for an initial step size: bounds from the problem
    /// scale, refined against a finite-difference estimate of `||y''||`.
    fn estimate_initial_step(&mut self, tout: f64) -> Result<f64, SolverError> {
        let tdiff = tout - self.tn;
        let sign = if tdiff >= 0.0 { 1.0 } else { -1.0 };
        let tdist = tdiff.abs();
        let tround = UROUND * self.tn.abs().max(tout.abs());

        let hlb = HLB_FACTOR * tround;
        let hub = self.upper_bound_h0(tdist);
        let mut hg = (hlb * hub).sqrt();
        if hub < hlb {
            return Ok(sign * hg);
        }

        let mut count = 0usize;
        let mut rhs_fails = 0usize;
        let hnew = loop {
            let hgs = hg * sign;
            let ydd = match self.ydd_norm(hgs) {
                Ok(v) => v,
                Err(RhsError::Recoverable) => {
                    rhs_fails += 1;
                    if rhs_fails > MAX_H0_ITERS {
                        return Err(SolverError::FirstRhsFailure);
                    }
                    hg *= 0.2;
                    continue;
                }
                Err(RhsError::Fatal(msg)) => {
                    return Err(SolverError::RhsFailure { t: self.tn, msg });
                }
            };
            let hcand = if ydd * hub * hub > 2.0 {
                (2.0 / ydd).sqrt()
            } else {
                (hg * hub).sqrt()
            };
            count += 1;
            if count >= MAX_H0_ITERS {
                break hcand;
            }
            let hrat = hcand / hg;
            if hrat > 0.5 && hrat < 2.0 {
                break hcand;
            }
            if count >= 2 && hrat > 2.0 {
                break hg;
            }
            hg = hcand;
        };

        let h0 = (H_BIAS * hnew).clamp(hlb, hub);
        Ok(sign * h0)
    }

    fn upper_bound_h0(&mut self, tdist: f64) -> f64 {
        // hub_inv = max_i |ydot_i| / (0.1*|y_i| + atol_i)
        self.tempv.abs_of(&self.zn[0]);
        self.tempv.scale(HUB_FACTOR);
        match &self.tols.abs_tol {
            AbsTol::Scalar(a) => self.tempv.add_scalar(*a),
            AbsTol::Vector(av) => self.tempv.axpy(1.0, av),
        }
        self.y.inv_of(&self.tempv);
        self.acor.abs_of(&self.zn[1]);
        self.ftemp.prod_of(&self.acor, &self.y);
        let hub_inv = self.ftemp.max_norm();

        let mut hub = HUB_FACTOR * tdist;
        if hub * hub_inv > 1.0 {
            hub = 1.0 / hub_inv;
        }
        hub
    }

    fn ydd_norm(&mut self, hg: f64) -> Result<f64, RhsError> {
        self.y
            .linear_sum(1.0, &self.zn[0], hg, &self.zn[1]);
        self.nfe += 1;
        self.model
            .f(self.tn + hg, &self.y, &mut self.tempv)?;
        self.ftemp
            .linear_sum(1.0 / hg, &self.tempv, -1.0 / hg, &self.zn[1]);
        Ok(self.ftemp.wrms_norm(&self.ewt))
    }

    // ----------------------------------------------------------------
    // one internal step
    // ----------------------------------------------------------------

    /// Takes one internal step, retrying on recoverable convergence and
    /// error-test failures within their configured limits.
    fn take_step(&mut self) -> Result<(), SolverError> {
        let saved_t = self.tn;
        let mut ncf = 0usize;
        let mut nef = 0usize;
        let mut force_setup = false;

        if self.nst > 0 && self.hprime != self.h {
            self.adjust_params();
        }

        let dsm = loop {
            self.predict();
            self.set_bdf();
            self.rl1 = 1.0 / self.l[1];
            self.gamma = self.h * self.rl1;
            if self.nst == 0 {
                self.gammap = self.gamma;
            }
            self.gamrat = if self.nst > 0 { self.gamma / self.gammap } else { 1.0 };

            let call_lsetup = force_setup
                || self.nst == 0
                || self.nst >= self.nstlp + MSBP
                || (self.gamrat - 1.0).abs() > DGMAX;
            let tol = self.tq[4];

            let nls_result = {
                let (zn0, zn1) = {
                    let (lo, hi) = self.zn.split_at(1);
                    (&lo[0], &hi[0])
                };
                let mut sys = CorrectorSystem {
                    model: &mut self.model,
                    lsolver: &mut self.lsolver,
                    tn: self.tn,
                    gamma: self.gamma,
                    rl1: self.rl1,
                    zn0,
                    zn1,
                    ewt: &self.ewt,
                    y: &mut self.y,
                    ftemp: &mut self.ftemp,
                    nfe: &mut self.nfe,
                    nsetups: &mut self.nsetups,
                    nstlp: &mut self.nstlp,
                    nst: self.nst,
                    gammap: &mut self.gammap,
                    jcur: &mut self.jcur,
                };
                self.nls
                    .solve(&mut sys, &mut self.acor, &self.ewt, tol, call_lsetup)
            };

            match nls_result {
                Ok(()) => {}
                Err(NewtonError::Recoverable) => {
                    self.ncfn += 1;
                    self.restore(saved_t);
                    self.etamax = 1.0;
                    ncf += 1;
                    if self.h.abs() <= self.hmin * ONEPSM || ncf == self.max_conv_fails {
                        return Err(SolverError::ConvFailure { t: self.tn });
                    }
                    self.eta = ETACF.max(self.hmin / self.h.abs());
                    self.rescale();
                    force_setup = true;
                    continue;
                }
                Err(NewtonError::RhsFatal(msg)) => {
                    self.restore(saved_t);
                    return Err(SolverError::RhsFailure { t: self.tn, msg });
                }
                Err(NewtonError::SetupFatal(msg)) => {
                    self.restore(saved_t);
                    return Err(SolverError::SetupFailure { t: self.tn, msg });
                }
                Err(NewtonError::SolveFatal(msg)) => {
                    self.restore(saved_t);
                    return Err(SolverError::SolveFailure { t: self.tn, msg });
                }
            }

            // Local error test on the accepted correction.
            self.acnrm = self.acor.wrms_norm(&self.ewt);
            let dsm = self.acnrm * self.tq[2];
            if dsm <= 1.0 {
                break dsm;
            }

            // Error test failed. The rejection invalidates the controller's
            // step/error history, so it restarts from the single-term law.
            self.netf += 1;
            nef += 1;
            self.etamax = 1.0;
            self.restore(saved_t);
            self.controller.reset();
            if self.h.abs() <= self.hmin * ONEPSM || nef == self.max_err_test_fails {
                return Err(SolverError::ErrFailure { t: self.tn });
            }

            if nef <= MXNEF1 {
                // The controller proposes the retry step size; clamp it so a
                // failed step always shrinks.
                let _ = self.controller.set_method_order(self.q + 1);
                let mut eta = self.controller.estimate_step(self.h, dsm) / self.h;
                eta = eta.min(ETA_SHRINK_MAX);
                eta = eta.max(ETAMIN).max(self.hmin / self.h.abs());
                if nef >= SMALL_NEF {
                    eta = eta.min(ETAMXF);
                }
                self.eta = eta;
                self.rescale();
                continue;
            }

            // Repeated failures: force the order down to 1, then restart the
            // derivative history from the RHS directly.
            if self.q > 1 {
                self.eta = ETAMIN.max(self.hmin / self.h.abs());
                self.decrease_bdf();
                self.q -= 1;
                self.qwait = self.q + 1;
                let _ = self.controller.set_method_order(self.q + 1);
                self.rescale();
                continue;
            }

            self.eta = ETAMIN.max(self.hmin / self.h.abs());
            self.h *= self.eta;
            self.hprime = self.h;
            self.hscale = self.h;
            self.qwait = LONG_WAIT;
            self.nfe += 1;
            let (zn0, zn1) = {
                let (lo, hi) = self.zn.split_at_mut(1);
                (&lo[0], &mut hi[0])
            };
            match self.model.f(self.tn, zn0, zn1) {
                Ok(()) => {}
                Err(RhsError::Recoverable) => {
                    self.ncfn += 1;
                    return Err(SolverError::ConvFailure { t: self.tn });
                }
                Err(RhsError::Fatal(msg)) => {
                    return Err(SolverError::RhsFailure { t: self.tn, msg });
                }
            }
            self.zn[1].scale(self.h);
        };

        self.complete_step();
        self.prepare_next_step(dsm);
        self.controller.update(self.h, dsm);
        self.etamax = ETAMX;

        // Keep the scaled local error estimate for diagnostics and the
        // order-increase heuristic.
        self.acor.scale(self.tq[2]);
        Ok(())
    }

    /// Nordsieck prediction: repeated shift-adds advance the history
    /// polynomial to `tn + h`.
    fn predict(&mut self) {
        self.tn += self.h;
        if let Some(tstop) = self.tstop {
            if (self.tn - tstop) * self.h > 0.0 {
                self.tn = tstop;
            }
        }
        for k in 1..=self.q {
            for j in (k..=self.q).rev() {
                let (lo, hi) = self.zn.split_at_mut(j);
                lo[j - 1].axpy(1.0, &hi[0]);
            }
        }
    }

    /// Undoes `predict` after a failed attempt.
    fn restore(&mut self, saved_t: f64) {
        self.tn = saved_t;
        for k in 1..=self.q {
            for j in (k..=self.q).rev() {
                let (lo, hi) = self.zn.split_at_mut(j);
                lo[j - 1].axpy(-1.0, &hi[0]);
            }
        }
    }

    /// Builds the BDF corrector coefficients `l` and test quantities `tq`
    /// for the current order and step-size history.
    fn set_bdf(&mut self) {
        self.l[0] = 1.0;
        self.l[1] = 1.0;
        for z in 2..=self.q {
            self.l[z] = 0.0;
        }
        let mut xi_inv = 1.0;
        let mut xistar_inv = 1.0;
        let mut alpha0 = -1.0;
        let mut alpha0_hat = -1.0;
        let mut hsum = self.h;
        if self.q > 1 {
            for j in 2..self.q {
                hsum += self.tau[j - 1];
                xi_inv = self.h / hsum;
                alpha0 -= 1.0 / j as f64;
                for z in (1..=j).rev() {
                    self.l[z] += self.l[z - 1] * xi_inv;
                }
                // l[z] are coefficients of prod(1 + x/xi_i)
            }
            alpha0 -= 1.0 / self.q as f64;
            xistar_inv = -self.l[1] - alpha0;
            hsum += self.tau[self.q - 1];
            xi_inv = self.h / hsum;
            alpha0_hat = -self.l[1] - xi_inv;
            for z in (1..=self.q).rev() {
                self.l[z] += self.l[z - 1] * xistar_inv;
            }
        }
        self.set_tq_bdf(hsum, alpha0, alpha0_hat, xi_inv, xistar_inv);
    }

    /// Error-test and convergence-test coefficients for the current order
    /// (and its neighbors, when an order change is up for consideration).
    fn set_tq_bdf(
        &mut self,
        mut hsum: f64,
        alpha0: f64,
        alpha0_hat: f64,
        mut xi_inv: f64,
        xistar_inv: f64,
    ) {
        let q = self.q as f64;
        let a1 = 1.0 - alpha0_hat + alpha0;
        let a2 = 1.0 + q * a1;
        self.tq[2] = (a1 / (alpha0 * a2)).abs();
        self.tq[5] = (a2 * xistar_inv / (self.l[self.q] * xi_inv)).abs();
        if self.qwait == 1 {
            if self.q > 1 {
                let c = xistar_inv / self.l[self.q];
                let a3 = alpha0 + 1.0 / q;
                let a4 = alpha0_hat + xi_inv;
                let cpinv = (1.0 - a4 + a3) / a3;
                self.tq[1] = (c * cpinv).abs();
            }
            hsum += self.tau[self.q];
            xi_inv = self.h / hsum;
            let a5 = alpha0 - 1.0 / (q + 1.0);
            let a6 = alpha0_hat - xi_inv;
            let cppinv = (1.0 - a6 + a5) / a2;
            self.tq[3] = (cppinv / (xi_inv * (q + 2.0) * a5)).abs();
        }
        self.tq[4] = NLS_COEF / self.tq[2];
    }

    /// Applies a pending order and/or step-size change at the start of a
    /// step.
    fn adjust_params(&mut self) {
        if self.qprime != self.q {
            if self.qprime > self.q {
                self.increase_bdf();
            } else {
                self.decrease_bdf();
            }
            self.q = self.qprime;
            self.qwait = self.q + 1;
            let _ = self.controller.set_method_order(self.q + 1);
        }
        self.eta = self.hprime / self.h;
        self.rescale();
    }

    /// Extends the history by one column for an order increase, built from
    /// the saved correction of an earlier step.
    fn increase_bdf(&mut self) {
        for z in 0..=Q_MAX {
            self.l[z] = 0.0;
        }
        self.l[2] = 1.0;
        let mut alpha0 = -1.0;
        let mut alpha1 = 1.0;
        let mut prod = 1.0;
        let mut xiold = 1.0;
        let mut hsum = self.hscale;
        if self.q > 1 {
            for j in 1..self.q {
                hsum += self.tau[j + 1];
                let xi = hsum / self.hscale;
                prod *= xi;
                alpha0 -= 1.0 / (j + 1) as f64;
                alpha1 += 1.0 / xi;
                for z in (2..=j + 2).rev() {
                    self.l[z] = self.l[z] * xiold + self.l[z - 1];
                }
                xiold = xi;
            }
        }
        let a1 = (-alpha0 - alpha1) / prod;
        let lidx = self.q + 1;
        if lidx == self.indx_acor {
            self.zn[lidx].scale(a1);
        } else {
            let (lo, hi) = self.zn.split_at_mut(self.indx_acor);
            lo[lidx].clone_from(&hi[0]);
            lo[lidx].scale(a1);
        }
        for j in 2..=self.q {
            let (lo, hi) = self.zn.split_at_mut(lidx);
            lo[j].axpy(self.l[j], &hi[0]);
        }
    }

    /// Drops the highest-order history column for an order decrease.
    fn decrease_bdf(&mut self) {
        for z in 0..=Q_MAX {
            self.l[z] = 0.0;
        }
        self.l[2] = 1.0;
        let mut hsum = 0.0;
        for j in 1..=self.q.saturating_sub(2) {
            hsum += self.tau[j];
            let xi = hsum / self.hscale;
            for z in (2..=j + 2).rev() {
                self.l[z] = self.l[z] * xi + self.l[z - 1];
            }
        }
        for j in 2..self.q {
            let (lo, hi) = self.zn.split_at_mut(self.q);
            lo[j].axpy(-self.l[j], &hi[0]);
        }
    }

    /// Rescales the history for a step-size ratio `eta`.
    fn rescale(&mut self) {
        let mut factor = self.eta;
        for j in 1..=self.q {
            self.zn[j].scale(factor);
            factor *= self.eta;
        }
        self.h = self.hscale * self.eta;
        self.hprime = self.h;
        self.hscale = self.h;
    }

    /// Bookkeeping after an accepted step: advance counters, shift the
    /// step-size history, and apply the correction to every history column.
    fn complete_step(&mut self) {
        self.nst += 1;
        self.hu = self.h;
        self.qu = self.q;

        for i in (2..=self.q).rev() {
            self.tau[i] = self.tau[i - 1];
        }
        if self.q == 1 && self.nst > 1 {
            self.tau[2] = self.tau[1];
        }
        self.tau[1] = self.h;

        for j in 0..=self.q {
            self.zn[j].axpy(self.l[j], &self.acor);
        }

        self.qwait = self.qwait.saturating_sub(1);
        if self.qwait == 1 && self.q != self.maxord {
            // Save the correction for the order-increase error estimate at
            // the next step.
            self.zn[self.maxord].clone_from(&self.acor);
            self.saved_tq5 = self.tq[5];
            self.indx_acor = self.maxord;
        }
    }

    /// Chooses the next step size, and possibly a new order, for the step
    /// just accepted with normalized error `dsm`.
    fn prepare_next_step(&mut self, dsm: f64) {
        // A failure earlier in this step forces the current h and q.
        if self.etamax == 1.0 {
            self.qwait = self.qwait.max(2);
            self.qprime = self.q;
            self.hprime = self.h;
            self.eta = 1.0;
            return;
        }

        let _ = self.controller.set_method_order(self.q + 1);
        // The controller's proposal is capped by the biased error bound for
        // the current order; at high order the local error grows like
        // eta^(q+1), and an uncapped growth ratio walks straight into the
        // next error-test failure.
        let proposed = self.controller.estimate_step(self.h, dsm) / self.h;
        let bound = 1.0 / ((BIAS2 * dsm).powf(1.0 / (self.q + 1) as f64) + ADDON);
        self.etaq = proposed.min(bound);

        if self.qwait != 0 {
            self.eta = self.etaq;
            self.qprime = self.q;
            self.set_eta();
            return;
        }

        // The order is up for review: compare the same-order proposal with
        // estimates for orders q-1 and q+1.
        self.qwait = 2;
        self.etaqm1 = self.compute_etaqm1();
        self.etaqp1 = self.compute_etaqp1();
        self.choose_eta();
        self.set_eta();
    }

    fn compute_etaqm1(&mut self) -> f64 {
        if self.q == 1 {
            return 0.0;
        }
        let ddn = self.zn[self.q].wrms_norm(&self.ewt) * self.tq[1];
        1.0 / ((BIAS1 * ddn).powf(1.0 / self.q as f64) + ADDON)
    }

    fn compute_etaqp1(&mut self) -> f64 {
        if self.q == self.maxord {
            return 0.0;
        }
        if self.saved_tq5 == 0.0 {
            return 0.0;
        }
        let l = (self.q + 1) as f64;
        let cquot = (self.tq[5] / self.saved_tq5) * (self.h / self.tau[2]).powf(l);
        self.tempv
            .linear_sum(-cquot, &self.zn[self.maxord], 1.0, &self.acor);
        let dup = self.tempv.wrms_norm(&self.ewt) * self.tq[3];
        1.0 / ((BIAS3 * dup).powf(1.0 / (l + 1.0)) + ADDON)
    }

    fn choose_eta(&mut self) {
        let etam = self.etaq.max(self.etaqm1).max(self.etaqp1);
        if etam < THRESH {
            self.eta = 1.0;
            self.qprime = self.q;
            return;
        }
        if etam == self.etaq {
            self.eta = self.etaq;
            self.qprime = self.q;
        } else if etam == self.etaqm1 {
            self.eta = self.etaqm1;
            self.qprime = self.q - 1;
        } else {
            self.eta = self.etaqp1;
            self.qprime = self.q + 1;
            // The order increase at the next step builds its new history
            // column from this step's correction.
            self.zn[self.maxord].clone_from(&self.acor);
            self.indx_acor = self.maxord;
        }
    }

    fn set_eta(&mut self) {
        if self.eta < THRESH {
            self.eta = 1.0;
            self.hprime = self.h;
        } else {
            self.eta = self.eta.min(self.etamax);
            self.eta /= 1.0f64.max(self.h.abs() * self.hmax_inv * self.eta);
            self.hprime = self.h * self.eta;
        }
    }

    // ----------------------------------------------------------------
    // error weights and roots
    // ----------------------------------------------------------------

    /// `ewt[i] = 1 / (rtol*|y[i]| + atol[i])`, recomputed from `zn[0]`.
    fn load_ewt(&mut self) -> Result<(), ()> {
        self.tempv.abs_of(&self.zn[0]);
        self.tempv.scale(self.tols.rel_tol);
        match &self.tols.abs_tol {
            AbsTol::Scalar(a) => self.tempv.add_scalar(*a),
            AbsTol::Vector(av) => self.tempv.axpy(1.0, av),
        }
        if self.tempv.min_component() <= 0.0 {
            return Err(());
        }
        self.ewt.inv_of(&self.tempv);
        Ok(())
    }

    /// Runs the root-finder over the interval ending at the current time.
    fn check_roots(&mut self) -> Result<Option<f64>, SolverError> {
        let Some(mut rf) = self.rootfinder.take() else {
            return Ok(None);
        };
        let result = rf.check_interval(self, self.tn, self.hu);
        self.rootfinder = Some(rf);
        result
    }
}

impl<M, L> crate::rootfind::DenseOutput<M::State> for BdfSolver<M, L>
where
    M: OdeModel,
    L: NewtonLinear<M::State>,
{
    fn interpolate(&self, t: f64, y: &mut M::State) -> Result<(), SolverError> {
        self.get_dky(t, 0, y)
    }
}
