use crate::scalar::Scalar;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Activation applied in place to the outputs of a cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    /// Identity.
    #[default]
    Linear,
    /// `max(x, leak * x)`.
    Rectifier {
        /// Slope for negative inputs.
        leak: f64,
    },
    /// `tanh(x)`.
    Tanh,
    /// `1 / (1 + exp(-x))`.
    Logistic,
}

impl Activation {
    /// A rectifier without leak.
    pub fn relu() -> Self {
        Self::Rectifier { leak: 0. }
    }
    /// Whether the activation is differentiable everywhere.
    pub fn is_differentiable(&self) -> bool {
        !matches!(self, Self::Rectifier { .. })
    }
    fn forward<T: Scalar>(&self, x: T) -> T {
        match *self {
            Self::Linear => x,
            Self::Rectifier { leak } => {
                if x > T::zero() {
                    x
                } else {
                    T::from_f64(leak) * x
                }
            }
            Self::Tanh => x.tanh(),
            Self::Logistic => T::one() / (T::one() + (-x).exp()),
        }
    }
    /// The derivative, in terms of the output `y`.
    fn derivative<T: Scalar>(&self, y: T) -> T {
        match *self {
            Self::Linear => T::one(),
            Self::Rectifier { leak } => {
                if y > T::zero() {
                    T::one()
                } else {
                    T::from_f64(leak)
                }
            }
            Self::Tanh => T::one() - y * y,
            Self::Logistic => y * (T::one() - y),
        }
    }
    /// Applies the activation to `outputs`.
    pub fn propagate<T: Scalar>(&self, outputs: &mut [T], parallel: bool) {
        if *self == Self::Linear {
            return;
        }
        if parallel {
            outputs.par_iter_mut().for_each(|y| *y = self.forward(*y));
        } else {
            outputs.iter_mut().for_each(|y| *y = self.forward(*y));
        }
    }
    /// Multiplies `diff` by the derivative of the activation at `outputs`.
    pub fn back_propagate<T: Scalar>(&self, outputs: &[T], diff: &mut [T]) {
        if *self == Self::Linear {
            return;
        }
        for (dy, y) in diff.iter_mut().zip(outputs) {
            *dy = *dy * self.derivative(*y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rectifier() {
        let mut y = [-2f32, 0., 3.];
        Activation::Rectifier { leak: 0.5 }.propagate(&mut y, false);
        assert_eq!(y, [-1., 0., 3.]);
        let mut dy = [1f32; 3];
        Activation::Rectifier { leak: 0.5 }.back_propagate(&y, &mut dy);
        assert_eq!(dy, [0.5, 0.5, 1.]);
        assert!(!Activation::relu().is_differentiable());
    }

    #[test]
    fn logistic_and_tanh() {
        let mut y = [0f64];
        Activation::Logistic.propagate(&mut y, true);
        assert_relative_eq!(y[0], 0.5);
        let mut dy = [1f64];
        Activation::Logistic.back_propagate(&y, &mut dy);
        assert_relative_eq!(dy[0], 0.25);
        let mut y = [0.5f64];
        Activation::Tanh.propagate(&mut y, false);
        assert_relative_eq!(y[0], 0.5f64.tanh());
        let mut dy = [2f64];
        Activation::Tanh.back_propagate(&y, &mut dy);
        assert_relative_eq!(dy[0], 2. * (1. - 0.5f64.tanh().powi(2)));
    }
}
