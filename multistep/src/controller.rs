//! Step-size control for the adaptive stepper.
//!
//! The controller maps the bias-scaled, tolerance-normalized local error of
//! an attempted step (`dsm`, where `dsm <= 1` means the step passed the error
//! test) to a proposed next step size. A smoothed two-term law keeps
//! successive step sizes from oscillating.

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

const DEFAULT_K1: f64 = 0.98;
const DEFAULT_K2: f64 = 0.95;
const DEFAULT_BIAS: f64 = 1.5;
const DEFAULT_SAFETY: f64 = 0.96;

/// Floor applied to normalized errors before exponentiation, so an error
/// estimate that underflows to zero cannot blow up the proposed step.
const TINY: f64 = 1e-10;

/// Gustafsson-style predictive step-size controller.
///
/// On the first step after a reset only the current normalized error is
/// available and a single-term power law is used; afterwards the law combines
/// the current and previous errors with the ratio of the last two step sizes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GustafssonControl {
    /// Gain exponent on the current normalized error.
    k1: f64,
    /// Gain exponent on the error ratio.
    k2: f64,
    /// Error bias: errors are multiplied by this before use.
    bias: f64,
    /// Safety factor applied to every proposal.
    safety: f64,
    /// Controlled order, `hnew ~ e^(-1/p)`.
    p: usize,
    /// Normalized error recorded at the last accepted step.
    ep: f64,
    /// Step size of the last accepted step.
    hp: f64,
    /// Whether the next estimate is the first since a reset.
    first_step: bool,
    /// When set, out-of-range parameters are rejected instead of silently
    /// replaced by defaults.
    strict: bool,
}

impl Default for GustafssonControl {
    fn default() -> Self {
        Self {
            k1: DEFAULT_K1,
            k2: DEFAULT_K2,
            bias: DEFAULT_BIAS,
            safety: DEFAULT_SAFETY,
            p: 1,
            ep: 1.0,
            hp: 0.0,
            first_step: true,
            strict: false,
        }
    }
}

impl GustafssonControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the gain exponents. Negative gains are ignored and the
    /// previous values kept.
    pub fn with_gains(mut self, k1: f64, k2: f64) -> Self {
        if k1 >= 0.0 {
            self.k1 = k1;
        }
        if k2 >= 0.0 {
            self.k2 = k2;
        }
        self
    }

    /// Enables strict parameter validation: setters reject out-of-range
    /// values instead of falling back to defaults.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Proposes a step size from the current step `h` and normalized local
    /// error `dsm`. Does not mutate the controller; call [`Self::update`]
    /// once the step is accepted.
    pub fn estimate_step(&self, h: f64, dsm: f64) -> f64 {
        let p = self.p as f64;
        if self.first_step {
            let k = -1.0 / p;
            let e = (self.bias * dsm).max(TINY);
            self.safety * h * e.powf(k)
        } else {
            let k1 = -self.k1 / p;
            let k2 = -self.k2 / p;
            let e1 = (self.bias * dsm).max(TINY);
            let e2 = e1 / self.ep.max(TINY);
            let hrat = h / self.hp;
            self.safety * h * hrat * e1.powf(k1) * e2.powf(k2)
        }
    }

    /// Records an accepted step. Must be called exactly once per accepted
    /// step, after [`Self::estimate_step`].
    pub fn update(&mut self, h: f64, dsm: f64) {
        self.ep = self.bias * dsm;
        self.hp = h;
        self.first_step = false;
    }

    /// Restores first-step behavior; used on (re)initialization.
    pub fn reset(&mut self) {
        self.ep = 1.0;
        self.first_step = true;
    }

    /// Sets the safety factor. Values `>= 1` are illegal; non-positive values
    /// fall back to the default (or are rejected in strict mode).
    pub fn set_safety_factor(&mut self, safety: f64) -> Result<(), ControlError> {
        if safety >= 1.0 {
            return Err(ControlError::IllInput("safety factor must be < 1"));
        }
        if safety <= 0.0 {
            if self.strict {
                return Err(ControlError::IllInput("safety factor must be positive"));
            }
            self.safety = DEFAULT_SAFETY;
        } else {
            self.safety = safety;
        }
        Ok(())
    }

    /// Sets the error bias. Non-positive values fall back to the default (or
    /// are rejected in strict mode).
    pub fn set_error_bias(&mut self, bias: f64) -> Result<(), ControlError> {
        if bias <= 0.0 {
            if self.strict {
                return Err(ControlError::IllInput("error bias must be positive"));
            }
            self.bias = DEFAULT_BIAS;
        } else {
            self.bias = bias;
        }
        Ok(())
    }

    /// Sets the controlled order.
    pub fn set_method_order(&mut self, p: usize) -> Result<(), ControlError> {
        if p == 0 {
            return Err(ControlError::IllInput("method order must be positive"));
        }
        self.p = p;
        Ok(())
    }

    pub fn error_bias(&self) -> f64 {
        self.bias
    }

    pub fn safety_factor(&self) -> f64 {
        self.safety
    }

    pub fn method_order(&self) -> usize {
        self.p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn first_step_power_law() {
        let mut c = GustafssonControl::new();
        c.set_method_order(2).unwrap();
        let h = 0.1;
        let dsm = 0.5;
        let expect = DEFAULT_SAFETY * h * (DEFAULT_BIAS * dsm).powf(-0.5);
        assert_relative_eq!(c.estimate_step(h, dsm), expect);
    }

    #[test]
    fn two_term_law_after_update() {
        let mut c = GustafssonControl::new();
        c.set_method_order(1).unwrap();
        c.update(0.1, 0.5); // ep = 0.75, hp = 0.1
        let h = 0.2;
        let dsm = 0.25;
        let e1: f64 = DEFAULT_BIAS * dsm;
        let e2 = e1 / 0.75;
        let expect =
            DEFAULT_SAFETY * h * (h / 0.1) * e1.powf(-DEFAULT_K1) * e2.powf(-DEFAULT_K2);
        assert_relative_eq!(c.estimate_step(h, dsm), expect);
    }

    #[test]
    fn tiny_floor_guards_zero_error() {
        let c = GustafssonControl::new();
        let hnew = c.estimate_step(1.0, 0.0);
        assert!(hnew.is_finite());
        assert_relative_eq!(hnew, DEFAULT_SAFETY * 1e10);
    }

    #[test]
    fn reset_restores_first_step_law() {
        let mut c = GustafssonControl::new();
        let first = c.estimate_step(0.1, 0.5);
        c.update(0.1, 0.5);
        assert!((c.estimate_step(0.1, 0.5) - first).abs() > 0.0);
        c.reset();
        assert_relative_eq!(c.estimate_step(0.1, 0.5), first);
    }

    #[test]
    fn permissive_fallback() {
        let mut c = GustafssonControl::new();
        // non-positive values silently fall back to defaults
        c.set_safety_factor(-1.0).unwrap();
        assert_relative_eq!(c.safety_factor(), DEFAULT_SAFETY);
        c.set_error_bias(0.0).unwrap();
        assert_relative_eq!(c.error_bias(), DEFAULT_BIAS);
        // safety >= 1 is illegal either way, and leaves state untouched
        c.set_safety_factor(0.5).unwrap();
        assert_eq!(
            c.set_safety_factor(1.5),
            Err(ControlError::IllInput("safety factor must be < 1"))
        );
        assert_relative_eq!(c.safety_factor(), 0.5);
    }

    #[test]
    fn strict_mode_rejects_fallback_values() {
        let mut c = GustafssonControl::new().strict();
        assert!(c.set_safety_factor(-1.0).is_err());
        assert!(c.set_error_bias(0.0).is_err());
        assert!(c.set_method_order(0).is_err());
    }
}
