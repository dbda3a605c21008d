/*!
Solvers and trainable parameters.

A [`Parameter`] pairs a value with its gradient and a [`Solver`]. Cells hold parameters through
a [`SharedParameter`], so several cells can share one storage. The cell that created the
parameter is its owner of record: [`Parameter::update`] only applies the solver when called by
the owner, and only when a gradient is pending, so each storage is updated exactly once per
iteration regardless of how many cells alias it.
*/
use crate::{
    error::{Error, Result},
    scalar::Scalar,
    tensor::{mirrored::MirroredTensor, Tensor},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc};

/// Solver builders.
pub mod builders {
    use super::*;
    use std::marker::PhantomData;

    /// Builder for creating an [`Sgd`].
    #[derive(Debug)]
    pub struct SgdBuilder<T: Scalar> {
        learning_rate: f64,
        momentum: Option<f64>,
        decay: f64,
        _m: PhantomData<fn() -> T>,
    }

    impl<T: Scalar> SgdBuilder<T> {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 0.01,
                momentum: None,
                decay: 0.,
                _m: PhantomData,
            }
        }
        /// Learning rate. Default is 0.01.
        pub fn learning_rate(self, learning_rate: f64) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// Momentum. Default is 0.
        ///
        /// If `momentum` is greater than 0, a "velocity" is created on the first update.
        pub fn momentum(self, momentum: f64) -> Self {
            Self {
                momentum: (momentum > 0.).then_some(momentum),
                ..self
            }
        }
        /// Weight decay. Default is 0.
        pub fn decay(self, decay: f64) -> Self {
            Self { decay, ..self }
        }
        /// Builds the solver.
        ///
        /// **Errors**
        /// - The learning rate is negative or not finite.
        /// - The momentum is not less than 1.
        pub fn build(self) -> Result<Sgd<T>> {
            let Self {
                learning_rate,
                momentum,
                decay,
                ..
            } = self;
            if !(learning_rate.is_finite() && learning_rate >= 0.) {
                return Err(Error::InvalidParameter {
                    name: "LearningRate".into(),
                    reason: format!("expected a non negative rate, found {learning_rate}"),
                });
            }
            if momentum.map_or(false, |m| m >= 1.) {
                return Err(Error::InvalidParameter {
                    name: "Momentum".into(),
                    reason: format!("expected momentum in [0, 1), found {momentum:?}"),
                });
            }
            Ok(Sgd {
                learning_rate,
                momentum,
                decay,
                velocity: None,
            })
        }
    }
}
use builders::SgdBuilder;

/// Optimizer of a single parameter tensor.
///
/// Solvers are stateful. State sized to the parameter is created lazily on the first update.
pub trait Solver<T: Scalar>: Send + Debug {
    /// Updates `value` with `gradient`, the gradient summed over `batch_size` samples.
    ///
    /// **Errors**
    /// - `batch_size` is 0.
    /// - The lengths of `value` and `gradient` differ.
    fn update(&mut self, value: &mut [T], gradient: &[T], batch_size: usize) -> Result<()>;
}

/// Configuration of a solver, attached to every new parameter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    /// The learning rate.
    pub learning_rate: f64,
    /// The momentum.
    pub momentum: f64,
    /// The weight decay.
    pub decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.,
            decay: 0.,
        }
    }
}

impl SgdConfig {
    /// Builds a solver.
    ///
    /// See [`SgdBuilder::build()`].
    pub fn build<T: Scalar>(&self) -> Result<Sgd<T>> {
        Sgd::<T>::builder()
            .learning_rate(self.learning_rate)
            .momentum(self.momentum)
            .decay(self.decay)
            .build()
    }
}

/// Stochastic Gradient Descent.
///
/// With momentum `m`, learning rate `lr` and decay `d`:
/// ```text
/// g = gradient / batch_size + d * value
/// velocity = m * velocity + g
/// value -= lr * velocity
/// ```
#[derive(Debug)]
pub struct Sgd<T: Scalar> {
    learning_rate: f64,
    momentum: Option<f64>,
    decay: f64,
    velocity: Option<Vec<T>>,
}

impl<T: Scalar> Sgd<T> {
    /// An Sgd builder.
    pub fn builder() -> SgdBuilder<T> {
        SgdBuilder::new()
    }
    /// The velocity, if created.
    pub fn velocity(&self) -> Option<&[T]> {
        self.velocity.as_deref()
    }
}

impl<T: Scalar> Solver<T> for Sgd<T> {
    fn update(&mut self, value: &mut [T], gradient: &[T], batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(Error::InvalidParameter {
                name: "batch_size".into(),
                reason: "expected at least 1".into(),
            });
        }
        if value.len() != gradient.len() {
            return Err(Error::InvalidParameter {
                name: "gradient".into(),
                reason: format!(
                    "expected {} elements, found {}",
                    value.len(),
                    gradient.len()
                ),
            });
        }
        let scale = 1. / batch_size as f64;
        if let Some(momentum) = self.momentum {
            let velocity = self
                .velocity
                .get_or_insert_with(|| vec![T::zero(); value.len()]);
            for ((w, dw), v) in value.iter_mut().zip(gradient).zip(velocity.iter_mut()) {
                let mut w_f64 = w.as_f64();
                let mut v_f64 = v.as_f64();
                let dw_f64 = dw.as_f64() * scale + self.decay * w_f64;
                kernels::sgd_update_with_momentum(
                    &mut w_f64,
                    dw_f64,
                    self.learning_rate,
                    momentum,
                    &mut v_f64,
                );
                *v = T::from_f64(v_f64);
                *w = T::from_f64(w_f64);
            }
        } else {
            for (w, dw) in value.iter_mut().zip(gradient) {
                let w_f64 = w.as_f64();
                let dw_f64 = dw.as_f64() * scale + self.decay * w_f64;
                *w = T::from_f64(w_f64 - self.learning_rate * dw_f64);
            }
        }
        Ok(())
    }
}

mod kernels {
    pub fn sgd_update_with_momentum(
        value: &mut f64,
        grad: f64,
        learning_rate: f64,
        momentum: f64,
        velocity: &mut f64,
    ) {
        *velocity = momentum * *velocity + grad;
        *value -= learning_rate * *velocity;
    }
}

/// A trainable tensor with its gradient and solver.
///
/// The gradient's validity flag records whether a gradient is pending: backward passes
/// overwrite the gradient when none is pending and accumulate otherwise.
#[derive(Debug)]
pub struct Parameter<T: Scalar> {
    value: MirroredTensor<T>,
    grad: MirroredTensor<T>,
    solver: Option<Box<dyn Solver<T>>>,
    owner: String,
}

/// A [`Parameter`] shared between cells.
pub type SharedParameter<T> = Arc<Mutex<Parameter<T>>>;

impl<T: Scalar> Parameter<T> {
    /// Creates a parameter owned by the cell `owner`, with a zero gradient.
    pub fn new(
        owner: impl Into<String>,
        value: Tensor<T>,
        solver: Option<Box<dyn Solver<T>>>,
    ) -> Self {
        let grad = MirroredTensor::zeros(value.dims().to_vec());
        Self {
            value: MirroredTensor::new(value),
            grad,
            solver,
            owner: owner.into(),
        }
    }
    /// Wraps the parameter in a [`SharedParameter`].
    pub fn into_shared(self) -> SharedParameter<T> {
        Arc::new(Mutex::new(self))
    }
    /// The cell responsible for updating the parameter.
    pub fn owner(&self) -> &str {
        &self.owner
    }
    /// The dims.
    pub fn dims(&self) -> &[usize] {
        self.value.dims()
    }
    /// The value.
    pub fn value(&self) -> &MirroredTensor<T> {
        &self.value
    }
    /// The value, mutably.
    pub fn value_mut(&mut self) -> &mut MirroredTensor<T> {
        &mut self.value
    }
    /// The gradient.
    pub fn grad(&self) -> &MirroredTensor<T> {
        &self.grad
    }
    /// The gradient, mutably.
    pub fn grad_mut(&mut self) -> &mut MirroredTensor<T> {
        &mut self.grad
    }
    /// The value and the gradient, mutably.
    pub fn value_grad_mut(&mut self) -> (&mut MirroredTensor<T>, &mut MirroredTensor<T>) {
        (&mut self.value, &mut self.grad)
    }
    /// Whether a gradient is pending.
    pub fn is_pending(&self) -> bool {
        self.grad.is_valid()
    }
    /// Discards a pending gradient.
    pub fn clear_pending(&mut self) {
        self.grad.clear_valid();
    }
    /// Replaces the solver.
    pub fn set_solver(&mut self, solver: Option<Box<dyn Solver<T>>>) {
        self.solver = solver;
    }
    /// Applies the solver with the pending gradient, on the host.
    ///
    /// Does nothing if `cell` is not the owner or no gradient is pending. Returns whether the
    /// parameter was updated. See [`.update_with()`](Self::update_with) for other memories.
    ///
    /// **Errors**
    /// - See [`Solver::update()`].
    pub fn update(&mut self, cell: &str, batch_size: usize) -> Result<bool> {
        self.update_with(cell, batch_size, |value, grad| {
            Ok((value.host_mut().as_mut_slice(), grad.host().as_slice()))
        })
    }
    /// Applies the solver with the pending gradient, with slices selected by `select`.
    ///
    /// The backends select the memory their kernels write the gradient to.
    pub(crate) fn update_with<F>(&mut self, cell: &str, batch_size: usize, select: F) -> Result<bool>
    where
        F: for<'a> FnOnce(
            &'a mut MirroredTensor<T>,
            &'a mut MirroredTensor<T>,
        ) -> Result<(&'a mut [T], &'a [T])>,
    {
        if cell != self.owner || !self.grad.is_valid() {
            return Ok(false);
        }
        if let Some(solver) = self.solver.as_mut() {
            let (value, grad) = select(&mut self.value, &mut self.grad)?;
            solver.update(value, grad, batch_size)?;
        }
        self.grad.clear_valid();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sgd() -> Result<()> {
        let mut sgd = Sgd::<f32>::builder().learning_rate(0.1).build()?;
        let mut w = [1f32, 2.];
        sgd.update(&mut w, &[2., 4.], 2)?;
        assert_relative_eq!(w[0], 0.9);
        assert_relative_eq!(w[1], 1.8);
        assert!(sgd.velocity().is_none());
        Ok(())
    }

    #[test]
    fn sgd_momentum_velocity_is_lazy() -> Result<()> {
        let mut sgd = Sgd::<f64>::builder()
            .learning_rate(0.5)
            .momentum(0.9)
            .build()?;
        assert!(sgd.velocity().is_none());
        let mut w = [0f64];
        sgd.update(&mut w, &[1.], 1)?;
        assert_relative_eq!(w[0], -0.5);
        sgd.update(&mut w, &[1.], 1)?;
        // velocity = 0.9 * 1 + 1
        assert_relative_eq!(sgd.velocity().map_or(0., |v| v[0]), 1.9);
        assert_relative_eq!(w[0], -0.5 - 0.95);
        Ok(())
    }

    #[test]
    fn sgd_invalid() {
        assert!(Sgd::<f32>::builder().momentum(1.).build().is_err());
        assert!(Sgd::<f32>::builder().learning_rate(-1.).build().is_err());
        let mut sgd = Sgd::<f32>::builder().build().unwrap();
        assert!(sgd.update(&mut [0.], &[0.], 0).is_err());
        assert!(sgd.update(&mut [0.], &[0., 1.], 1).is_err());
    }

    #[test]
    fn parameter_updates_once_from_owner() -> Result<()> {
        let solver = SgdConfig {
            learning_rate: 1.,
            ..SgdConfig::default()
        }
        .build::<f32>()?;
        let mut parameter = Parameter::new("a", Tensor::from_elem([2], 1f32), Some(Box::new(solver)));
        assert!(!parameter.update("a", 1)?);
        parameter.grad_mut().host_mut().fill(0.5);
        parameter.grad_mut().set_valid();
        assert!(!parameter.update("b", 1)?);
        assert!(parameter.update("a", 1)?);
        assert!(!parameter.update("a", 1)?);
        assert_eq!(parameter.value_mut().host().as_slice(), &[0.5, 0.5]);
        Ok(())
    }
}
