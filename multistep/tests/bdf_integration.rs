//! End-to-end tests of the BDF stepper and the problem driver on small
//! systems with known solutions, backed by a dense direct linear solver.

use approx::{assert_abs_diff_eq, assert_relative_eq};
use multistep::{
    AbsTol, BdfSolver, NewtonLinear, OdeModel, OdeProblem, RhsError, SaveMethod, SolverError,
    StateVector, StepMode, StepOutcome, Tolerances,
};
use multistep::error::LinearSolveError;

// ----------------------------------------------------------------------
// dense direct solver for the Newton matrix M = I - gamma*J
// ----------------------------------------------------------------------

type JacFn = Box<dyn Fn(f64, &StateVector) -> Vec<f64>>;

/// Dense linear solver with a user-supplied Jacobian and LU factorization
/// with partial pivoting.
struct DenseJac {
    n: usize,
    jac_fn: JacFn,
    saved_j: Vec<f64>,
    have_j: bool,
    lu: Vec<f64>,
    piv: Vec<usize>,
    refreshes: usize,
}

impl DenseJac {
    fn new(n: usize, jac_fn: JacFn) -> Self {
        Self {
            n,
            jac_fn,
            saved_j: vec![0.0; n * n],
            have_j: false,
            lu: vec![0.0; n * n],
            piv: vec![0; n],
            refreshes: 0,
        }
    }
}

impl NewtonLinear<StateVector> for DenseJac {
    fn setup(
        &mut self,
        t: f64,
        y: &StateVector,
        _fy: &StateVector,
        gamma: f64,
        jac_ok: bool,
    ) -> Result<bool, LinearSolveError> {
        let current = if jac_ok && self.have_j {
            false
        } else {
            self.saved_j = (self.jac_fn)(t, y);
            self.have_j = true;
            self.refreshes += 1;
            true
        };
        let n = self.n;
        for i in 0..n {
            for j in 0..n {
                let delta = if i == j { 1.0 } else { 0.0 };
                self.lu[i * n + j] = delta - gamma * self.saved_j[i * n + j];
            }
        }
        lu_factor(&mut self.lu, &mut self.piv, n).map_err(|_| LinearSolveError::Recoverable)?;
        Ok(current)
    }

    fn solve(
        &mut self,
        b: &mut StateVector,
        _weight: &StateVector,
        _ycur: &StateVector,
        _fcur: &StateVector,
    ) -> Result<(), LinearSolveError> {
        lu_solve(&self.lu, &self.piv, self.n, b);
        Ok(())
    }
}

fn lu_factor(a: &mut [f64], piv: &mut [usize], n: usize) -> Result<(), ()> {
    for k in 0..n {
        let mut p = k;
        for i in k + 1..n {
            if a[i * n + k].abs() > a[p * n + k].abs() {
                p = i;
            }
        }
        if a[p * n + k] == 0.0 {
            return Err(());
        }
        piv[k] = p;
        if p != k {
            for j in 0..n {
                a.swap(k * n + j, p * n + j);
            }
        }
        let pivot = a[k * n + k];
        for i in k + 1..n {
            let m = a[i * n + k] / pivot;
            a[i * n + k] = m;
            for j in k + 1..n {
                a[i * n + j] -= m * a[k * n + j];
            }
        }
    }
    Ok(())
}

fn lu_solve(a: &[f64], piv: &[usize], n: usize, b: &mut [f64]) {
    for k in 0..n {
        let p = piv[k];
        if p != k {
            b.swap(k, p);
        }
        for i in k + 1..n {
            b[i] -= a[i * n + k] * b[k];
        }
    }
    for k in (0..n).rev() {
        b[k] /= a[k * n + k];
        for i in 0..k {
            b[i] -= a[i * n + k] * b[k];
        }
    }
}

// ----------------------------------------------------------------------
// models
// ----------------------------------------------------------------------

/// y' = lambda * y, solution y0 * exp(lambda * t).
#[derive(Debug)]
struct Decay {
    lambda: f64,
}

impl OdeModel for Decay {
    type State = StateVector;

    fn f(&mut self, _t: f64, y: &StateVector, dy: &mut StateVector) -> Result<(), RhsError> {
        dy[0] = self.lambda * y[0];
        Ok(())
    }
}

fn decay_jac(lambda: f64) -> JacFn {
    Box::new(move |_t, _y| vec![lambda])
}

/// Harmonic oscillator y'' = -y as a first-order system.
#[derive(Debug)]
struct Oscillator;

impl OdeModel for Oscillator {
    type State = StateVector;

    fn f(&mut self, _t: f64, y: &StateVector, dy: &mut StateVector) -> Result<(), RhsError> {
        dy[0] = y[1];
        dy[1] = -y[0];
        Ok(())
    }
}

fn oscillator_jac() -> JacFn {
    Box::new(|_t, _y| vec![0.0, 1.0, -1.0, 0.0])
}

/// Decay model whose RHS fails recoverably for a configurable number of
/// calls after the first (the first call seeds the derivative history).
#[derive(Debug)]
struct FlakyDecay {
    lambda: f64,
    calls: usize,
    fail_until: usize,
}

impl OdeModel for FlakyDecay {
    type State = StateVector;

    fn f(&mut self, _t: f64, y: &StateVector, dy: &mut StateVector) -> Result<(), RhsError> {
        self.calls += 1;
        if self.calls > 1 && self.calls <= self.fail_until {
            return Err(RhsError::Recoverable);
        }
        dy[0] = self.lambda * y[0];
        Ok(())
    }
}

fn decay_solver(lambda: f64) -> BdfSolver<Decay, DenseJac> {
    BdfSolver::new(Decay { lambda }, DenseJac::new(1, decay_jac(lambda)))
}

// ----------------------------------------------------------------------
// accuracy
// ----------------------------------------------------------------------

#[test]
fn decay_matches_exponential() {
    let mut solver = decay_solver(-1.0);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-6, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    let outcome = solver.step(5.0, StepMode::Normal, &mut yout).unwrap();
    assert_eq!(outcome, StepOutcome::Success(5.0));
    assert_abs_diff_eq!(yout[0], (-5.0f64).exp(), epsilon = 1e-5);

    let stats = solver.stats();
    assert!(stats.num_steps > 0);
    assert!(stats.num_rhs_evals > stats.num_steps);
}

/// Integrates y' = -y to t = 1 with the order capped at 1 and the step size
/// pinned to `h`, returning the global error at the endpoint.
fn fixed_step_error(h: f64) -> f64 {
    let mut solver = decay_solver(-1.0).with_max_order(1);
    solver.set_initial_step(h);
    solver.set_min_step(h).unwrap();
    solver.set_max_step(h).unwrap();
    let y0 = StateVector::new(vec![1.0]);
    // Loose tolerances so the pinned step always passes the error test.
    solver.init(0.0, &y0, Tolerances::new(1e-3, 1e-8)).unwrap();
    let mut yout = StateVector::zeros(1);
    solver.step(1.0, StepMode::Normal, &mut yout).unwrap();
    (yout[0] - (-1.0f64).exp()).abs()
}

#[test]
fn first_order_error_halves_with_the_step() {
    let e1 = fixed_step_error(0.01);
    let e2 = fixed_step_error(0.005);
    let ratio = e1 / e2;
    // Order 1: halving h should halve the global error.
    assert!(
        (1.6..2.6).contains(&ratio),
        "expected ~2x error reduction, got {ratio} (e1 = {e1}, e2 = {e2})"
    );
}

#[test]
fn stiff_decay_is_stable_at_large_steps() {
    let mut solver = decay_solver(-1.0e4);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-6, 1e-12))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    solver.step(1.0, StepMode::Normal, &mut yout).unwrap();
    assert!(yout[0].abs() < 1e-6);
    // An explicit method would need ~lambda steps; the implicit stepper
    // should take far fewer.
    let stats = solver.stats();
    assert!(stats.num_steps < 500);
    // Step-size growth must not cycle with the error test (grow, fail,
    // shrink, repeat); rejections should stay rare.
    assert!(stats.num_err_test_fails < 20);
}

#[test]
fn oscillator_tracks_cosine_and_raises_order() {
    let mut solver = BdfSolver::new(Oscillator, DenseJac::new(2, oscillator_jac()));
    let y0 = StateVector::new(vec![1.0, 0.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-8, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(2);
    solver.step(10.0, StepMode::Normal, &mut yout).unwrap();
    assert_abs_diff_eq!(yout[0], 10.0f64.cos(), epsilon = 1e-4);
    assert_abs_diff_eq!(yout[1], -(10.0f64.sin()), epsilon = 1e-4);

    let stats = solver.stats();
    assert!(stats.current_order > 1);
    assert!(stats.current_order <= 5);
    // Rejections should be the exception, not part of a growth cycle.
    assert!(stats.num_err_test_fails < stats.num_steps / 4);
}

#[test]
fn max_order_is_respected() {
    let mut solver = BdfSolver::new(Oscillator, DenseJac::new(2, oscillator_jac()))
        .with_max_order(2);
    // At order 2 these tolerances need far more internal steps than the
    // default per-call budget allows.
    solver.set_max_steps(20_000);
    let y0 = StateVector::new(vec![1.0, 0.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-8, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(2);
    solver.step(10.0, StepMode::Normal, &mut yout).unwrap();
    assert!(solver.stats().current_order <= 2);
    assert_abs_diff_eq!(yout[0], 10.0f64.cos(), epsilon = 1e-4);
}

// ----------------------------------------------------------------------
// stepping modes and dense output
// ----------------------------------------------------------------------

#[test]
fn one_step_mode_makes_monotonic_progress() {
    let mut solver = decay_solver(-1.0);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-6, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    let mut tprev = 0.0;
    for _ in 0..20 {
        match solver.step(100.0, StepMode::OneStep, &mut yout).unwrap() {
            StepOutcome::Success(t) => {
                assert!(t > tprev);
                tprev = t;
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

#[test]
fn dense_output_is_idempotent_and_mutation_free() {
    let mut solver = decay_solver(-1.0);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-6, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    solver.step(2.0, StepMode::Normal, &mut yout).unwrap();

    let stats_before = solver.stats();
    let tquery = solver.current_time() - 0.5 * solver.stats().last_step;
    let mut a = StateVector::zeros(1);
    let mut b = StateVector::zeros(1);
    solver.get_dky(tquery, 0, &mut a).unwrap();
    solver.get_dky(tquery, 0, &mut b).unwrap();
    assert_eq!(a[0].to_bits(), b[0].to_bits());
    // First derivative agrees with the model: y' = -y.
    let mut dy = StateVector::zeros(1);
    solver.get_dky(tquery, 1, &mut dy).unwrap();
    assert_abs_diff_eq!(dy[0], -a[0], epsilon = 1e-4);

    let stats_after = solver.stats();
    assert_eq!(stats_before.num_rhs_evals, stats_after.num_rhs_evals);
    assert_eq!(stats_before.num_steps, stats_after.num_steps);
}

#[test]
fn dense_output_rejects_out_of_range_queries() {
    let mut solver = decay_solver(-1.0);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-6, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    solver.step(2.0, StepMode::Normal, &mut yout).unwrap();

    let mut dky = StateVector::zeros(1);
    let tn = solver.current_time();
    let hu = solver.stats().last_step;
    assert!(matches!(
        solver.get_dky(tn - 10.0 * hu, 0, &mut dky),
        Err(SolverError::BadT { .. })
    ));
    assert!(matches!(
        solver.get_dky(tn, 6, &mut dky),
        Err(SolverError::BadK { .. })
    ));
}

#[test]
fn tstop_halts_exactly() {
    let mut solver = decay_solver(-1.0);
    solver.set_stop_time(2.5);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-6, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    let outcome = solver.step(10.0, StepMode::Normal, &mut yout).unwrap();
    assert_eq!(outcome, StepOutcome::TstopReached(2.5));
    assert!(solver.current_time() <= 2.5 * (1.0 + 1e-12));
    assert_abs_diff_eq!(yout[0], (-2.5f64).exp(), epsilon = 1e-5);
}

// ----------------------------------------------------------------------
// failure handling
// ----------------------------------------------------------------------

#[test]
fn invalid_tolerances_leave_solver_uninitialized() {
    let mut solver = decay_solver(-1.0);
    let y0 = StateVector::new(vec![1.0]);
    let err = solver
        .init(0.0, &y0, Tolerances::new(-1.0, 1e-10))
        .unwrap_err();
    assert!(matches!(err, SolverError::Tolerance(_)));
    let mut yout = StateVector::zeros(1);
    assert!(matches!(
        solver.step(1.0, StepMode::Normal, &mut yout),
        Err(SolverError::NotInitialized)
    ));
}

#[test]
fn vector_abs_tolerance_must_be_positive() {
    let mut solver = decay_solver(-1.0);
    let y0 = StateVector::new(vec![1.0]);
    let tols = Tolerances {
        rel_tol: 1e-6,
        abs_tol: AbsTol::Vector(StateVector::new(vec![0.0])),
    };
    assert!(matches!(
        solver.init(0.0, &y0, tols),
        Err(SolverError::IllInput(_))
    ));
}

#[test]
fn persistent_rhs_failure_exhausts_retry_budget() {
    let model = FlakyDecay { lambda: -1.0, calls: 0, fail_until: usize::MAX };
    let mut solver = BdfSolver::new(model, DenseJac::new(1, decay_jac(-1.0)));
    solver.set_initial_step(0.01);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-6, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    let err = solver.step(1.0, StepMode::Normal, &mut yout).unwrap_err();
    assert!(matches!(err, SolverError::ConvFailure { .. }));
    // One convergence failure per attempt, up to the limit, no more.
    assert_eq!(solver.stats().num_nonlin_conv_fails, 10);
    // The pre-step state is still queryable.
    assert_eq!(solver.stats().num_steps, 0);
    assert_abs_diff_eq!(solver.current_time(), 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(solver.current_state()[0], 1.0, epsilon = 1e-12);
}

#[test]
fn transient_rhs_failures_are_retried_and_absorbed() {
    let model = FlakyDecay { lambda: -1.0, calls: 0, fail_until: 4 };
    let mut solver = BdfSolver::new(model, DenseJac::new(1, decay_jac(-1.0)));
    solver.set_initial_step(0.01);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-6, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    solver.step(1.0, StepMode::Normal, &mut yout).unwrap();
    assert_abs_diff_eq!(yout[0], (-1.0f64).exp(), epsilon = 1e-4);
    let fails = solver.stats().num_nonlin_conv_fails;
    assert!(fails >= 1 && fails < 10);
}

#[test]
fn sub_epsilon_tolerances_report_too_much_accuracy() {
    // rtol far below machine precision: after the first accepted step the
    // weighted solution norm shows roundoff dominating the request.
    let mut solver = decay_solver(-1.0);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-18, 1e-20))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    let err = solver.step(1.0, StepMode::Normal, &mut yout).unwrap_err();
    match err {
        SolverError::TooMuchAccuracy { tolsf, .. } => {
            // tolsf is the suggested tolerance scaling; it must report a
            // real deficit.
            assert!(tolsf > 1.0);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn reinit_restarts_with_fresh_history_and_counters() {
    let mut solver = decay_solver(-1.0);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-6, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    solver.step(2.0, StepMode::Normal, &mut yout).unwrap();
    assert!(solver.stats().num_steps > 0);

    solver.reinit(0.0, &y0).unwrap();
    let stats = solver.stats();
    assert_eq!(stats.num_steps, 0);
    assert_eq!(stats.num_err_test_fails, 0);
    assert_eq!(stats.num_nonlin_conv_fails, 0);
    assert_eq!(stats.current_order, 1);
    assert_eq!(stats.num_rhs_evals, 1); // the history reseed at t0
    assert_abs_diff_eq!(solver.current_time(), 0.0);
    assert_abs_diff_eq!(solver.current_state()[0], 1.0);

    // A second run from the restarted state reproduces the first.
    let outcome = solver.step(2.0, StepMode::Normal, &mut yout).unwrap();
    assert_eq!(outcome, StepOutcome::Success(2.0));
    assert_abs_diff_eq!(yout[0], (-2.0f64).exp(), epsilon = 1e-5);
}

#[test]
fn max_steps_reports_too_much_work() {
    let mut solver = decay_solver(-1.0);
    solver.set_max_steps(3);
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-10, 1e-12))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    let err = solver
        .step(1.0e6, StepMode::Normal, &mut yout)
        .unwrap_err();
    match err {
        SolverError::TooMuchWork { t } => assert!(t < 1.0e6),
        other => panic!("unexpected error {other:?}"),
    }
    // The last accepted state came back in yout.
    assert!(yout[0] > 0.0 && yout[0] <= 1.0);
}

// ----------------------------------------------------------------------
// event location
// ----------------------------------------------------------------------

#[test]
fn root_is_located_then_integration_continues() {
    let mut solver = decay_solver(-1.0).with_rootfinder(multistep::RootFinder::new(
        1,
        Box::new(|t, _y: &StateVector, g: &mut [f64]| {
            g[0] = t - 5.0;
            Ok(())
        }),
    ));
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-6, 1e-10))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    match solver.step(10.0, StepMode::Normal, &mut yout).unwrap() {
        StepOutcome::RootFound(t) => {
            assert_relative_eq!(t, 5.0, epsilon = 1e-6);
            assert_eq!(solver.root_info(), &[1]);
            assert_abs_diff_eq!(yout[0], (-5.0f64).exp(), epsilon = 1e-5);
        }
        other => panic!("expected a root, got {other:?}"),
    }
    // Resume past the root.
    let outcome = solver.step(10.0, StepMode::Normal, &mut yout).unwrap();
    assert_eq!(outcome, StepOutcome::Success(10.0));
    assert!(solver.stats().num_root_evals > 0);
}

#[test]
fn state_dependent_root() {
    // y = exp(-t) crosses 0.5 at t = ln 2.
    let mut solver = decay_solver(-1.0).with_rootfinder(multistep::RootFinder::new(
        1,
        Box::new(|_t, y: &StateVector, g: &mut [f64]| {
            g[0] = y[0] - 0.5;
            Ok(())
        }),
    ));
    let y0 = StateVector::new(vec![1.0]);
    solver
        .init(0.0, &y0, Tolerances::new(1e-8, 1e-12))
        .unwrap();
    let mut yout = StateVector::zeros(1);
    match solver.step(5.0, StepMode::Normal, &mut yout).unwrap() {
        StepOutcome::RootFound(t) => {
            assert_relative_eq!(t, 2.0f64.ln(), epsilon = 1e-5);
            assert_eq!(solver.root_info(), &[-1]); // falling crossing
        }
        other => panic!("expected a root, got {other:?}"),
    }
}

// ----------------------------------------------------------------------
// driver
// ----------------------------------------------------------------------

#[test]
fn driver_records_every_step_and_endpoint() {
    let mut problem = OdeProblem::new(Decay { lambda: -1.0 }, DenseJac::new(1, decay_jac(-1.0)))
        .with_tolerances(Tolerances::new(1e-6, 1e-10));
    let y0 = StateVector::new(vec![1.0]);
    let result = problem.solve(&y0, (0.0, 3.0), SaveMethod::Memory).unwrap();
    let multistep::ResultStorage::Memory(result) = result else {
        panic!("expected in-memory results");
    };
    assert!(result.len() >= 2);
    assert_eq!(result.t[0], 0.0);
    assert_relative_eq!(*result.t.last().unwrap(), 3.0);
    let yf = result.y.last().unwrap();
    assert_abs_diff_eq!(yf[0], (-3.0f64).exp(), epsilon = 1e-5);
    // Times are strictly increasing.
    for w in result.t.windows(2) {
        assert!(w[1] > w[0]);
    }
}

#[test]
fn driver_streams_rows_to_a_csv_file() {
    let path = std::env::temp_dir().join("multistep_decay_trajectory.csv");
    let mut problem = OdeProblem::new(Decay { lambda: -1.0 }, DenseJac::new(1, decay_jac(-1.0)))
        .with_tolerances(Tolerances::new(1e-6, 1e-10));
    let y0 = StateVector::new(vec![1.0]);
    let result = problem
        .solve(&y0, (0.0, 3.0), SaveMethod::File(path.clone()))
        .unwrap();
    assert!(matches!(result, multistep::ResultStorage::File(_)));
    drop(result);

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(&headers[0], "t");
    assert_eq!(&headers[1], "x0");
    let rows: Vec<csv::StringRecord> = reader
        .records()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(rows.len() >= 2);
    let t0: f64 = rows[0][0].parse().unwrap();
    assert_eq!(t0, 0.0);
    let last = rows.last().unwrap();
    let tf: f64 = last[0].parse().unwrap();
    let yf: f64 = last[1].parse().unwrap();
    assert_relative_eq!(tf, 3.0);
    assert_abs_diff_eq!(yf, (-3.0f64).exp(), epsilon = 1e-5);
    std::fs::remove_file(&path).ok();
}

#[test]
fn driver_collects_roots() {
    let mut problem = OdeProblem::new(Decay { lambda: -1.0 }, DenseJac::new(1, decay_jac(-1.0)))
        .with_tolerances(Tolerances::new(1e-6, 1e-10))
        .with_root_fn(
            1,
            Box::new(|t, _y: &StateVector, g: &mut [f64]| {
                g[0] = (t - 2.0) * (t - 4.0);
                Ok(())
            }),
        );
    // Keep steps short enough that the two crossings cannot land in the
    // same step interval and cancel.
    problem.solver_mut().set_max_step(0.5).unwrap();
    let y0 = StateVector::new(vec![1.0]);
    problem.solve(&y0, (0.0, 6.0), SaveMethod::Memory).unwrap();
    let roots = problem.roots();
    assert_eq!(roots.len(), 2);
    assert_relative_eq!(roots[0].0, 2.0, epsilon = 1e-5);
    assert_relative_eq!(roots[1].0, 4.0, epsilon = 1e-5);
}
