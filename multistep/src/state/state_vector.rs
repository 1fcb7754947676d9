use std::ops::{AddAssign, Deref, DerefMut, MulAssign};

use serde::{Deserialize, Serialize};

use super::OdeVector;

/// A dynamic-sized serial state vector backed by a `Vec<f64>`.
///
/// This is the reference backend for the integrator; distributed or device
/// containers implement [`OdeVector`] the same way.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateVector {
    /// Internal storage for the vector values.
    value: Vec<f64>,
    /// Cached length of the vector to avoid repeated calls to `.len()`.
    n: usize,
}

impl StateVector {
    /// Constructs a new `StateVector` from a `Vec<f64>`.
    pub fn new(value: Vec<f64>) -> Self {
        let n = value.len();
        Self { value, n }
    }

    /// Constructs a zero-filled `StateVector` of length `n`.
    pub fn zeros(n: usize) -> Self {
        Self { value: vec![0.0; n], n }
    }

    fn check_len(&self, other: &Self) {
        if self.n != other.n {
            panic!("state vectors do not have same length")
        }
    }
}

impl From<Vec<f64>> for StateVector {
    fn from(value: Vec<f64>) -> Self {
        Self::new(value)
    }
}

impl AddAssign<&Self> for StateVector {
    /// Element-wise addition.
    ///
    /// # Panics
    ///
    /// Panics if the vectors have different lengths.
    fn add_assign(&mut self, rhs: &Self) {
        self.check_len(rhs);
        for i in 0..self.n {
            self.value[i] += rhs.value[i];
        }
    }
}

impl MulAssign<f64> for StateVector {
    /// Multiplies each element in the vector by a scalar value.
    fn mul_assign(&mut self, rhs: f64) {
        for i in 0..self.n {
            self.value[i] *= rhs;
        }
    }
}

impl Deref for StateVector {
    type Target = Vec<f64>;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl DerefMut for StateVector {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl OdeVector for StateVector {
    fn len(&self) -> usize {
        self.n
    }

    fn fill(&mut self, c: f64) {
        for v in self.value.iter_mut() {
            *v = c;
        }
    }

    fn scale(&mut self, c: f64) {
        for v in self.value.iter_mut() {
            *v *= c;
        }
    }

    fn add_scalar(&mut self, c: f64) {
        for v in self.value.iter_mut() {
            *v += c;
        }
    }

    fn linear_sum(&mut self, a: f64, x: &Self, b: f64, y: &Self) {
        self.check_len(x);
        self.check_len(y);
        for i in 0..self.n {
            self.value[i] = a * x.value[i] + b * y.value[i];
        }
    }

    fn axpy(&mut self, a: f64, x: &Self) {
        self.check_len(x);
        for i in 0..self.n {
            self.value[i] += a * x.value[i];
        }
    }

    fn prod_of(&mut self, x: &Self, y: &Self) {
        self.check_len(x);
        self.check_len(y);
        for i in 0..self.n {
            self.value[i] = x.value[i] * y.value[i];
        }
    }

    fn abs_of(&mut self, x: &Self) {
        self.check_len(x);
        for i in 0..self.n {
            self.value[i] = x.value[i].abs();
        }
    }

    fn inv_of(&mut self, x: &Self) {
        self.check_len(x);
        for i in 0..self.n {
            self.value[i] = 1.0 / x.value[i];
        }
    }

    fn wrms_norm(&self, w: &Self) -> f64 {
        self.check_len(w);
        if self.n == 0 {
            return 0.0;
        }
        let mut sum = 0.0;
        for i in 0..self.n {
            let e = self.value[i] * w.value[i];
            sum += e * e;
        }
        (sum / self.n as f64).sqrt()
    }

    fn max_norm(&self) -> f64 {
        self.value
            .iter()
            .fold(0.0, |m, v| m.max(v.abs()))
    }

    fn min_component(&self) -> f64 {
        self.value
            .iter()
            .fold(f64::INFINITY, |m, v| m.min(*v))
    }
}
