//! Event location for the integrator.
//!
//! After every accepted step the root-finder scans the user's event function
//! `g(t, y)` over the step interval for sign changes, then pins each crossing
//! down to a tolerance proportional to roundoff with a modified false-position
//! search over the stepper's dense output. Components that are exactly zero
//! when the search starts are held inactive until they move away from zero,
//! so a root is never re-reported from its own landing point.

use std::fmt;

use crate::error::{RhsError, SolverError};
use crate::state::OdeVector;

const UROUND: f64 = f64::EPSILON;
const TTOL_FACTOR: f64 = 100.0;

/// Event function signature: fills `gout` with the `nrtfn` component values
/// of `g(t, y)`.
pub type RootFn<V> = Box<dyn FnMut(f64, &V, &mut [f64]) -> Result<(), RhsError> + Send>;

/// Dense-output access the root-finder needs from the stepper: the solution
/// anywhere inside the last accepted step.
pub trait DenseOutput<V: OdeVector> {
    fn interpolate(&self, t: f64, y: &mut V) -> Result<(), SolverError>;
}

/// Which zero-crossings of a component are reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RootDirection {
    #[default]
    Either,
    Rising,
    Falling,
}

impl RootDirection {
    /// Whether a crossing that starts from `glo` matches this filter.
    fn admits(self, glo: f64) -> bool {
        match self {
            RootDirection::Either => true,
            RootDirection::Rising => glo <= 0.0,
            RootDirection::Falling => glo >= 0.0,
        }
    }
}

/// Locates zeros of a user event function along the solution.
pub struct RootFinder<V: OdeVector> {
    gfun: RootFn<V>,
    nrtfn: usize,
    glo: Vec<f64>,
    ghi: Vec<f64>,
    grout: Vec<f64>,
    iroot: Vec<i8>,
    rootdir: Vec<RootDirection>,
    /// Deferred activation: components that were zero at the search start
    /// stay inactive until they move off zero.
    gactive: Vec<bool>,
    zero_at_init: Vec<bool>,
    /// Set after a reported root: the next search must first step off the
    /// root before scanning.
    need_restart: bool,
    tlo: f64,
    trout: f64,
    nge: u64,
    warned_zero: bool,
    suppress_zero_warning: bool,
    yscratch: V,
}

impl<V: OdeVector> fmt::Debug for RootFinder<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootFinder")
            .field("nrtfn", &self.nrtfn)
            .field("tlo", &self.tlo)
            .field("trout", &self.trout)
            .field("nge", &self.nge)
            .field("iroot", &self.iroot)
            .finish_non_exhaustive()
    }
}

impl<V: OdeVector> RootFinder<V> {
    pub fn new(nrtfn: usize, gfun: RootFn<V>) -> Self {
        Self {
            gfun,
            nrtfn,
            glo: vec![0.0; nrtfn],
            ghi: vec![0.0; nrtfn],
            grout: vec![0.0; nrtfn],
            iroot: vec![0; nrtfn],
            rootdir: vec![RootDirection::Either; nrtfn],
            gactive: vec![true; nrtfn],
            zero_at_init: vec![false; nrtfn],
            need_restart: false,
            tlo: 0.0,
            trout: 0.0,
            nge: 0,
            warned_zero: false,
            suppress_zero_warning: false,
            yscratch: V::default(),
        }
    }

    /// Restricts which crossings are reported, per component.
    pub fn set_directions(&mut self, dirs: &[RootDirection]) -> Result<(), SolverError> {
        if dirs.len() != self.nrtfn {
            return Err(SolverError::IllInput(
                "root direction filter length does not match the root function".into(),
            ));
        }
        self.rootdir.copy_from_slice(dirs);
        Ok(())
    }

    /// Disables the one-time warning for components that look identically
    /// zero at the start of the integration.
    pub fn suppress_zero_warning(&mut self) {
        self.suppress_zero_warning = true;
    }

    /// Cumulative event-function evaluations.
    pub fn num_evals(&self) -> u64 {
        self.nge
    }

    /// Crossing directions found by the last located root: `+1` rising,
    /// `-1` falling, `0` no crossing in that component.
    pub fn root_info(&self) -> &[i8] {
        &self.iroot
    }

    /// Clears search state for a fresh integration; keeps configuration.
    pub fn reset(&mut self) {
        self.glo.iter_mut().for_each(|g| *g = 0.0);
        self.ghi.iter_mut().for_each(|g| *g = 0.0);
        self.grout.iter_mut().for_each(|g| *g = 0.0);
        self.iroot.iter_mut().for_each(|r| *r = 0);
        self.gactive.iter_mut().for_each(|a| *a = true);
        self.zero_at_init.iter_mut().for_each(|z| *z = false);
        self.need_restart = false;
        self.tlo = 0.0;
        self.trout = 0.0;
        self.nge = 0;
        self.warned_zero = false;
    }

    /// Evaluates `g` at the initial point. Components already at zero are
    /// marked inactive so the initial condition is not reported as a root.
    pub fn initialize(&mut self, t: f64, y: &V) -> Result<(), SolverError> {
        self.yscratch = y.clone();
        self.tlo = t;
        self.nge += 1;
        (self.gfun)(t, y, &mut self.glo)
            .map_err(|e| SolverError::RootFailure { t, msg: e.to_string() })?;
        for i in 0..self.nrtfn {
            let zero = self.glo[i] == 0.0;
            self.gactive[i] = !zero;
            self.zero_at_init[i] = zero;
        }
        Ok(())
    }

    /// Scans `(tlo, tn]` for sign changes and, if one exists, locates the
    /// earliest root and returns its time. On a hit the search interval is
    /// advanced to the root so the remainder is scanned on the next call.
    pub fn check_interval(
        &mut self,
        dense: &impl DenseOutput<V>,
        tn: f64,
        hu: f64,
    ) -> Result<Option<f64>, SolverError> {
        if self.nrtfn == 0 {
            return Ok(None);
        }
        let ttol = (tn.abs() + hu.abs()) * UROUND * TTOL_FACTOR;
        if (tn - self.tlo).abs() <= ttol {
            return Ok(None);
        }

        // A previous call stopped at a root: step just past it and restart
        // the search there, so the same crossing is not re-reported but a
        // later one in the same step interval still is.
        if self.need_restart {
            if (tn - self.tlo).abs() <= 2.0 * ttol {
                return Ok(None);
            }
            let dir = if tn >= self.tlo { 1.0 } else { -1.0 };
            let tstart = self.tlo + dir * ttol;
            dense.interpolate(tstart, &mut self.yscratch)?;
            self.nge += 1;
            (self.gfun)(tstart, &self.yscratch, &mut self.grout)
                .map_err(|e| SolverError::RootFailure { t: tstart, msg: e.to_string() })?;
            self.tlo = tstart;
            for i in 0..self.nrtfn {
                if !self.gactive[i] && self.grout[i] != 0.0 {
                    self.gactive[i] = true;
                }
                self.glo[i] = self.grout[i];
            }
            self.need_restart = false;
        }

        dense.interpolate(tn, &mut self.yscratch)?;
        self.nge += 1;
        (self.gfun)(tn, &self.yscratch, &mut self.ghi)
            .map_err(|e| SolverError::RootFailure { t: tn, msg: e.to_string() })?;

        self.warn_if_identically_zero(tn);

        let found = self.locate(dense, tn, ttol)?;
        if found {
            // Restart the search at the root; components landing exactly on
            // zero go inactive until they move away again.
            self.tlo = self.trout;
            for i in 0..self.nrtfn {
                self.glo[i] = self.grout[i];
                if self.grout[i] == 0.0 {
                    self.gactive[i] = false;
                }
            }
            self.need_restart = true;
            return Ok(Some(self.trout));
        }

        // No root: slide the interval forward, waking any component that has
        // moved off zero.
        self.tlo = tn;
        for i in 0..self.nrtfn {
            if !self.gactive[i] && self.ghi[i] != 0.0 {
                self.gactive[i] = true;
            }
            self.glo[i] = self.ghi[i];
        }
        Ok(None)
    }

    fn warn_if_identically_zero(&mut self, tn: f64) {
        if self.warned_zero || self.suppress_zero_warning {
            return;
        }
        for i in 0..self.nrtfn {
            if self.zero_at_init[i] && self.ghi[i] == 0.0 {
                eprintln!(
                    "multistep: root function component {i} is zero at both ends of the \
                     first step interval ending at t = {tn}; it appears identically zero \
                     and will be ignored until it becomes nonzero"
                );
                self.warned_zero = true;
                return;
            }
        }
        // Only the first interval is checked.
        self.warned_zero = true;
    }

    /// False-position refinement between `tlo` and `thi = tn`. Returns
    /// whether a root was located; on success `trout`, `grout`, and `iroot`
    /// describe it.
    fn locate(
        &mut self,
        dense: &impl DenseOutput<V>,
        tn: f64,
        ttol: f64,
    ) -> Result<bool, SolverError> {
        let mut thi = tn;

        let (sgnchg, zroot, mut imax) = self.scan(&self.ghi);
        if !sgnchg {
            self.trout = thi;
            self.grout.copy_from_slice(&self.ghi);
            if !zroot {
                return Ok(false);
            }
            // Zero exactly at the step end.
            self.fill_iroot();
            return Ok(true);
        }

        // A sign change exists in (tlo, thi); home in on the leftmost one.
        // `alph` biases the secant point toward whichever side has stalled.
        let mut alph = 1.0;
        let mut side = 0u8;
        let mut sideprev = u8::MAX;
        loop {
            if (thi - self.tlo).abs() <= ttol {
                break;
            }

            if sideprev == side {
                alph = if side == 2 { alph * 2.0 } else { alph / 2.0 };
            } else {
                alph = 1.0;
            }

            let mut tmid = thi
                - (thi - self.tlo) * self.ghi[imax]
                    / (self.ghi[imax] - alph * self.glo[imax]);
            if (tmid - self.tlo).abs() < 0.5 * ttol {
                let fracint = (thi - self.tlo).abs() / ttol;
                let fracsub = if fracint > 5.0 { 0.1 } else { 0.5 / fracint };
                tmid = self.tlo + fracsub * (thi - self.tlo);
            }
            if (thi - tmid).abs() < 0.5 * ttol {
                let fracint = (thi - self.tlo).abs() / ttol;
                let fracsub = if fracint > 5.0 { 0.1 } else { 0.5 / fracint };
                tmid = thi - fracsub * (thi - self.tlo);
            }

            dense.interpolate(tmid, &mut self.yscratch)?;
            self.nge += 1;
            (self.gfun)(tmid, &self.yscratch, &mut self.grout).map_err(|e| {
                SolverError::RootFailure { t: tmid, msg: e.to_string() }
            })?;

            sideprev = side;
            let (mid_sgnchg, mid_zroot, mid_imax) = self.scan(&self.grout);
            if mid_sgnchg {
                // Sign change in (tlo, tmid).
                thi = tmid;
                imax = mid_imax;
                self.ghi.copy_from_slice(&self.grout);
                side = 1;
                continue;
            }
            if mid_zroot {
                // Exact zero at tmid.
                thi = tmid;
                self.ghi.copy_from_slice(&self.grout);
                break;
            }
            // Root lies in (tmid, thi).
            self.tlo = tmid;
            self.glo.copy_from_slice(&self.grout);
            side = 2;
        }

        self.trout = thi;
        self.grout.copy_from_slice(&self.ghi);
        self.fill_iroot();
        Ok(true)
    }

    /// Scans active components of `g` at the trial point against `glo`:
    /// returns (sign change found, exact zero found, index of the steepest
    /// admissible sign change).
    fn scan(&self, gtrial: &[f64]) -> (bool, bool, usize) {
        let mut sgnchg = false;
        let mut zroot = false;
        let mut maxfrac = 0.0;
        let mut imax = 0usize;
        for i in 0..self.nrtfn {
            if !self.gactive[i] || !self.rootdir[i].admits(self.glo[i]) {
                continue;
            }
            if gtrial[i].abs() == 0.0 {
                zroot = true;
            } else if self.glo[i] * gtrial[i] < 0.0 {
                let gfrac = (gtrial[i] / (gtrial[i] - self.glo[i])).abs();
                if gfrac > maxfrac {
                    sgnchg = true;
                    maxfrac = gfrac;
                    imax = i;
                }
            }
        }
        (sgnchg, zroot, imax)
    }

    /// Records, per component, the direction of the crossing at `trout`.
    fn fill_iroot(&mut self) {
        for i in 0..self.nrtfn {
            self.iroot[i] = 0;
            if !self.gactive[i] || !self.rootdir[i].admits(self.glo[i]) {
                continue;
            }
            let crossed = self.grout[i] == 0.0 || self.glo[i] * self.grout[i] < 0.0;
            if crossed {
                self.iroot[i] = if self.glo[i] > 0.0 { -1 } else { 1 };
            }
        }
    }
}
