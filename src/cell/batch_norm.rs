use super::{
    activation::Activation, ensure_parameter, group_view4, group_view4_mut, Cell, CellBase,
    CellKind, CellState,
};
use crate::{
    backend::Target,
    config::{self, CellParameters, Filler},
    error::{Error, Result},
    scalar::Scalar,
    solver::{Parameter, SgdConfig, SharedParameter, Solver},
    tensor::{array_view4, array_view4_mut, mirrored::MirroredTensor, Tensor},
};
use ndarray::{ArrayView4, ArrayViewMut4};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc};

/// Statistics written by a training forward pass.
#[derive(Debug)]
pub struct BatchNormStats<'a, T> {
    /// Moving average of the mean.
    pub running_mean: &'a mut [T],
    /// Moving average of the variance.
    pub running_variance: &'a mut [T],
    /// The mean of the batch.
    pub saved_mean: &'a mut [T],
    /// The biased variance of the batch.
    pub saved_variance: &'a mut [T],
}

/// Gradients written by a backward pass, with the beta convention.
#[derive(Debug)]
pub struct BatchNormGradients<'a, T> {
    /// Beta of the parameter gradients.
    pub beta: T,
    /// Gradient of the scale.
    pub scale: &'a mut [T],
    /// Gradient of the bias.
    pub bias: &'a mut [T],
    /// Beta and gradient of the inputs, if the producer accepts gradients.
    pub data: Option<(T, ArrayViewMut4<'a, T>)>,
}

/// Batch normalization kernel.
///
/// Feature maps are `(batch, channels, y, x)`, statistics are per channel over the batch and
/// spatial dims.
pub trait BatchNormKernel<T: Scalar>: Send + Sync + Debug {
    /// Normalizes with the moving averages.
    #[allow(clippy::too_many_arguments)]
    fn forward_inference(
        &self,
        inputs: ArrayView4<T>,
        scale: &[T],
        bias: &[T],
        mean: &[T],
        variance: &[T],
        epsilon: f64,
        outputs: ArrayViewMut4<T>,
    );
    /// Normalizes with the batch statistics, caching them and updating the moving averages
    /// with `running = momentum * running + (1 - momentum) * batch`.
    #[allow(clippy::too_many_arguments)]
    fn forward_training(
        &self,
        inputs: ArrayView4<T>,
        scale: &[T],
        bias: &[T],
        epsilon: f64,
        momentum: f64,
        stats: BatchNormStats<T>,
        outputs: ArrayViewMut4<T>,
    );
    /// Computes the gradients with the cached batch statistics.
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        inputs: ArrayView4<T>,
        diff_inputs: ArrayView4<T>,
        scale: &[T],
        saved_mean: &[T],
        saved_variance: &[T],
        epsilon: f64,
        gradients: BatchNormGradients<T>,
    );
}

/// Description of a batch normalization cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNormDesc {
    /// The number of channels.
    pub nb_outputs: usize,
    /// Added to the variance.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Momentum of the moving averages, in (0, 1).
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// Activation.
    #[serde(default)]
    pub activation: Activation,
}

fn default_epsilon() -> f64 {
    1e-5
}

fn default_momentum() -> f64 {
    0.9
}

impl BatchNormDesc {
    /// A description for `nb_outputs` channels.
    pub fn new(nb_outputs: usize) -> Self {
        Self {
            nb_outputs,
            epsilon: default_epsilon(),
            momentum: default_momentum(),
            activation: Activation::default(),
        }
    }
    /// Sets epsilon.
    pub fn with_epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }
    /// Sets the momentum of the moving averages.
    pub fn with_momentum(self, momentum: f64) -> Self {
        Self { momentum, ..self }
    }
    /// Sets the activation.
    pub fn with_activation(self, activation: Activation) -> Self {
        Self { activation, ..self }
    }
    /// Applies the options `Epsilon` and `MovingAverageMomentum`.
    ///
    /// **Errors**
    /// - An option is unknown or has the wrong type.
    pub fn with_parameters(mut self, parameters: &CellParameters) -> Result<Self> {
        for (name, value) in parameters.iter() {
            match name {
                "Epsilon" => self.epsilon = config::as_f64(name, value)?,
                "MovingAverageMomentum" => self.momentum = config::as_f64(name, value)?,
                _ => return Err(config::unknown("BatchNorm", name)),
            }
        }
        Ok(self)
    }
}

/// Batch normalization cell.
///
/// Scale and bias are trained, the moving averages are persisted with them but have no
/// solver. A single input group is supported.
#[derive(Debug)]
pub struct BatchNormCell<T: Scalar> {
    base: CellBase<T>,
    desc: BatchNormDesc,
    kernel: Arc<dyn BatchNormKernel<T>>,
    solver: SgdConfig,
    scale: Option<SharedParameter<T>>,
    bias: Option<SharedParameter<T>>,
    mean: Option<SharedParameter<T>>,
    variance: Option<SharedParameter<T>>,
    saved_mean: MirroredTensor<T>,
    saved_variance: MirroredTensor<T>,
    cache_ready: bool,
    nb_propagate: usize,
}

impl<T: Scalar> BatchNormCell<T> {
    /// Creates a cell running `kernel` on `target`.
    pub fn new(
        name: impl Into<String>,
        desc: BatchNormDesc,
        target: Target,
        kernel: Arc<dyn BatchNormKernel<T>>,
    ) -> Self {
        let mut base = CellBase::new(name, CellKind::BatchNorm, desc.nb_outputs, target);
        base.set_activation(desc.activation);
        Self {
            base,
            desc,
            kernel,
            solver: SgdConfig::default(),
            scale: None,
            bias: None,
            mean: None,
            variance: None,
            saved_mean: MirroredTensor::zeros([0]),
            saved_variance: MirroredTensor::zeros([0]),
            cache_ready: false,
            nb_propagate: 0,
        }
    }
    /// Sets the solver attached to new parameters.
    pub fn with_solver(self, solver: SgdConfig) -> Self {
        Self { solver, ..self }
    }
    /// The description.
    pub fn desc(&self) -> &BatchNormDesc {
        &self.desc
    }
    /// The scale.
    pub fn scale(&self) -> Option<&SharedParameter<T>> {
        self.scale.as_ref()
    }
    /// The bias.
    pub fn bias(&self) -> Option<&SharedParameter<T>> {
        self.bias.as_ref()
    }
    /// The moving average of the mean.
    pub fn running_mean(&self) -> Option<&SharedParameter<T>> {
        self.mean.as_ref()
    }
    /// The moving average of the variance.
    pub fn running_variance(&self) -> Option<&SharedParameter<T>> {
        self.variance.as_ref()
    }
    /// The number of training forward passes.
    pub fn nb_propagate(&self) -> usize {
        self.nb_propagate
    }
    fn parameter(&self, parameter: &Option<SharedParameter<T>>) -> Result<SharedParameter<T>> {
        parameter
            .clone()
            .ok_or_else(|| self.base.invalid_state("access parameters"))
    }
}

impl<T: Scalar> Cell<T> for BatchNormCell<T> {
    fn base(&self) -> &CellBase<T> {
        &self.base
    }
    fn base_mut(&mut self) -> &mut CellBase<T> {
        &mut self.base
    }
    fn compute_output_dims(&self) -> Result<Vec<usize>> {
        let [x, y] = self.base.input_xy()?;
        Ok(vec![x, y, self.desc.nb_outputs, self.base.batch_size()])
    }
    fn initialize(&mut self) -> Result<()> {
        self.base.begin_initialize()?;
        if self.base.inputs().len() > 1 {
            return Err(Error::unsupported_configuration(
                self.base.name(),
                "batch normalization of concatenated inputs is not supported",
            ));
        }
        let channels = self.base.inputs().dim_z();
        if channels != self.desc.nb_outputs {
            return Err(Error::dimension_mismatch(
                self.base.name(),
                format!(
                    "input has {channels} channels, expected {}",
                    self.desc.nb_outputs
                ),
            ));
        }
        let BatchNormDesc {
            epsilon, momentum, ..
        } = self.desc;
        if !(epsilon > 0.) {
            return Err(Error::invalid_configuration(
                self.base.name(),
                format!("epsilon must be positive, found {epsilon}"),
            ));
        }
        if !(momentum > 0. && momentum < 1.) {
            return Err(Error::invalid_configuration(
                self.base.name(),
                format!("moving average momentum must be in (0, 1), found {momentum}"),
            ));
        }
        let dims = self.compute_output_dims()?;
        self.base.resize_outputs(dims)?;
        let channels = self.desc.nb_outputs;
        let shape = [1, 1, channels, 1];
        let name = self.base.name();
        let target = self.base.target();
        let solver = self.solver;
        let slots = [
            (&mut self.scale, "scale", 1., true),
            (&mut self.bias, "bias", 0., true),
            (&mut self.mean, "mean", 0., false),
            (&mut self.variance, "variance", 1., false),
        ];
        for (slot, what, init, trainable) in slots {
            ensure_parameter(name, what, slot, &shape, target, || {
                let mut value = Tensor::zeros(shape);
                Filler::Constant(init).fill(&mut value, 1);
                let solver: Option<Box<dyn Solver<T>>> = if trainable {
                    Some(Box::new(solver.build::<T>()?))
                } else {
                    None
                };
                Ok(Parameter::new(name, value, solver).into_shared())
            })?;
        }
        for saved in [&mut self.saved_mean, &mut self.saved_variance] {
            saved.resize(shape)?;
            target.attach(saved)?;
        }
        self.cache_ready = false;
        self.base.finish_initialize();
        Ok(())
    }
    fn propagate(&mut self, inference: bool) -> Result<()> {
        self.base.begin_propagate()?;
        let target = self.base.target().clone();
        let scale = self.parameter(&self.scale)?;
        let bias = self.parameter(&self.bias)?;
        let mean = self.parameter(&self.mean)?;
        let variance = self.parameter(&self.variance)?;
        let BatchNormDesc {
            epsilon, momentum, ..
        } = self.desc;
        {
            let entry = self
                .base
                .inputs()
                .get(0)
                .ok_or_else(|| self.base.invalid_state("propagate"))?;
            let full_dims = entry.tensor().read().dims4();
            let mut input = entry.tensor().write();
            let inputs = group_view4(full_dims, entry.channels(), target.read(&mut input)?)?;
            let mut outputs = self.base.outputs().write();
            let output_dims = outputs.dims().to_vec();
            let outputs = array_view4_mut(&output_dims, target.discard(&mut outputs)?)?;
            let mut scale = scale.lock();
            let mut bias = bias.lock();
            let mut mean = mean.lock();
            let mut variance = variance.lock();
            let scale = target.read(scale.value_mut())?;
            let bias = target.read(bias.value_mut())?;
            if inference {
                self.kernel.forward_inference(
                    inputs,
                    scale,
                    bias,
                    target.read(mean.value_mut())?,
                    target.read(variance.value_mut())?,
                    epsilon,
                    outputs,
                );
                self.cache_ready = false;
            } else {
                let saved_mean = target.discard(&mut self.saved_mean)?;
                saved_mean.fill(T::zero());
                let saved_variance = target.discard(&mut self.saved_variance)?;
                saved_variance.fill(T::zero());
                let stats = BatchNormStats {
                    running_mean: target.write(mean.value_mut())?,
                    running_variance: target.write(variance.value_mut())?,
                    saved_mean,
                    saved_variance,
                };
                self.kernel.forward_training(
                    inputs, scale, bias, epsilon, momentum, stats, outputs,
                );
                self.cache_ready = true;
                self.nb_propagate += 1;
            }
        }
        self.base.finish_propagate()
    }
    fn back_propagate(&mut self) -> Result<()> {
        if !self.base.begin_back_propagate()? {
            return Ok(());
        }
        if !self.cache_ready {
            return Err(Error::PrecedingForwardRequired {
                cell: self.base.name().to_string(),
            });
        }
        let target = self.base.target().clone();
        let scale = self.parameter(&self.scale)?;
        let bias = self.parameter(&self.bias)?;
        let beta = CellBase::parameter_beta(&scale);
        let data_beta = self.base.prepare_diff_output(0)?;
        let entry = self
            .base
            .inputs()
            .get(0)
            .ok_or_else(|| self.base.invalid_state("back propagate"))?;
        let full_dims = entry.tensor().read().dims4();
        {
            let mut diff_inputs = self.base.diff_inputs().write();
            let diff_dims = diff_inputs.dims().to_vec();
            let dy = array_view4(&diff_dims, target.read(&mut diff_inputs)?)?;
            let mut input = entry.tensor().write();
            let inputs = group_view4(full_dims, entry.channels(), target.read(&mut input)?)?;
            let mut scale = scale.lock();
            let mut bias = bias.lock();
            let (scale_value, scale_grad) = scale.value_grad_mut();
            let scale_value = target.read(scale_value)?;
            let (dscale, dbias) = if beta == T::zero() {
                (target.discard(scale_grad)?, target.discard(bias.grad_mut())?)
            } else {
                (target.write(scale_grad)?, target.write(bias.grad_mut())?)
            };
            let mut slot = match (data_beta, self.base.diff_outputs()[0].as_ref()) {
                (Some(beta), Some(slot)) => Some((beta, slot.tensor().write())),
                _ => None,
            };
            let data = match slot.as_mut() {
                Some((beta, slot)) => {
                    let dx = if *beta == T::zero() {
                        target.discard(slot)?
                    } else {
                        target.write(slot)?
                    };
                    Some((*beta, group_view4_mut(full_dims, entry.channels(), dx)?))
                }
                None => None,
            };
            let gradients = BatchNormGradients {
                beta,
                scale: dscale,
                bias: dbias,
                data,
            };
            self.kernel.backward(
                inputs,
                dy,
                scale_value,
                target.read(&mut self.saved_mean)?,
                target.read(&mut self.saved_variance)?,
                self.desc.epsilon,
                gradients,
            );
        }
        scale.lock().grad_mut().set_valid();
        bias.lock().grad_mut().set_valid();
        if data_beta.is_some() {
            self.base.finish_diff_output(0);
        }
        Ok(())
    }
    fn update(&mut self) -> Result<()> {
        self.base
            .check_state("update", &[CellState::Initialized, CellState::Ready])?;
        for parameter in self.scale.iter().chain(self.bias.as_ref()) {
            self.base.update_parameter(parameter)?;
        }
        Ok(())
    }
    fn parameters(&self) -> Vec<(String, SharedParameter<T>)> {
        [("scale", &self.scale), ("bias", &self.bias)]
            .into_iter()
            .filter_map(|(name, p)| Some((name.to_string(), p.clone()?)))
            .collect()
    }
    fn free_parameters(&self) -> Vec<SharedParameter<T>> {
        [&self.scale, &self.bias, &self.mean, &self.variance]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::HostKernels, cell::source::Source};
    use approx::assert_relative_eq;

    fn batch_norm(desc: BatchNormDesc) -> BatchNormCell<f64> {
        BatchNormCell::new("bn", desc, Target::Host, Arc::new(HostKernels))
    }

    #[test]
    fn batch_norm_invalid_momentum() -> Result<()> {
        let input = Source::<f64>::new("in", [1, 1, 2, 4]);
        for momentum in [0., 1., 1.5] {
            let mut cell = batch_norm(BatchNormDesc::new(2).with_momentum(momentum));
            cell.add_input(&input, None)?;
            assert!(matches!(
                cell.initialize(),
                Err(Error::InvalidConfiguration { .. })
            ));
        }
        Ok(())
    }

    #[test]
    fn batch_norm_rejects_concatenation() -> Result<()> {
        let a = Source::<f64>::new("a", [1, 1, 1, 4]);
        let b = Source::<f64>::new("b", [1, 1, 1, 4]);
        let mut cell = batch_norm(BatchNormDesc::new(2));
        cell.add_input(&a, None)?;
        cell.add_input(&b, None)?;
        assert!(matches!(
            cell.initialize(),
            Err(Error::UnsupportedConfiguration { .. })
        ));
        let mut cell = batch_norm(BatchNormDesc::new(3));
        cell.add_input(&a, None)?;
        assert!(matches!(
            cell.initialize(),
            Err(Error::DimensionMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn batch_norm_training_normalizes() -> Result<()> {
        let input = Source::<f64>::new("in", [1, 1, 1, 4]);
        input.set(&Tensor::from_vec([1, 1, 1, 4], vec![1., 2., 3., 4.])?)?;
        let mut cell = batch_norm(BatchNormDesc::new(1).with_epsilon(1e-12));
        cell.add_input(&input, None)?;
        cell.initialize()?;
        cell.propagate(false)?;
        let outputs = cell.outputs().write().host().clone();
        let sum: f64 = outputs.as_slice().iter().sum();
        let sum_sq: f64 = outputs.as_slice().iter().map(|x| x * x).sum();
        assert_relative_eq!(sum, 0., epsilon = 1e-9);
        assert_relative_eq!(sum_sq / 4., 1., epsilon = 1e-9);
        assert_eq!(cell.nb_propagate(), 1);
        Ok(())
    }

    #[test]
    fn batch_norm_backward_requires_training_forward() -> Result<()> {
        let input = Source::<f64>::new("in", [1, 1, 1, 2]);
        let mut cell = batch_norm(BatchNormDesc::new(1));
        cell.add_input(&input, None)?;
        cell.initialize()?;
        cell.propagate(true)?;
        cell.diff_inputs().write().set_valid();
        assert!(matches!(
            cell.back_propagate(),
            Err(Error::PrecedingForwardRequired { .. })
        ));
        Ok(())
    }

    #[test]
    fn batch_norm_free_parameters_order() -> Result<()> {
        let input = Source::<f64>::new("in", [1, 1, 2, 2]);
        let mut cell = batch_norm(BatchNormDesc::new(2));
        cell.add_input(&input, None)?;
        cell.initialize()?;
        let values: Vec<Vec<f64>> = cell
            .free_parameters()
            .iter()
            .map(|p| p.lock().value_mut().host().as_slice().to_vec())
            .collect();
        assert_eq!(values, [[1., 1.], [0., 0.], [0., 0.], [1., 1.]]);
        assert_eq!(cell.parameters().len(), 2);
        Ok(())
    }
}
