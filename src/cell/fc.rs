use super::{
    activation::Activation, ensure_parameter, mapping::Mapping, group_rows, group_rows_mut, out_of_bounds,
    BiasKernel, Cell, CellBase, CellKind, CellState,
};
use crate::{
    backend::Target,
    config::{self, CellParameters, Filler},
    error::{Error, Result},
    scalar::Scalar,
    solver::{Parameter, SgdConfig, SharedParameter},
    tensor::{array_view2, array_view2_mut, array_view4, array_view4_mut, Tensor},
};
use ndarray::{ArrayView2, ArrayViewMut2};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc};

/// Fully connected kernel.
///
/// Inputs are `(batch, n)` rows, weights are `(outputs, n)`.
pub trait FcKernel<T: Scalar>: BiasKernel<T> {
    /// `outputs = inputs . weights^T + beta * outputs`.
    fn forward(
        &self,
        inputs: ArrayView2<T>,
        weights: ArrayView2<T>,
        beta: T,
        outputs: ArrayViewMut2<T>,
    );
    /// `diff_weights = diff_inputs^T . inputs + beta * diff_weights`.
    fn backward_weights(
        &self,
        inputs: ArrayView2<T>,
        diff_inputs: ArrayView2<T>,
        beta: T,
        diff_weights: ArrayViewMut2<T>,
    );
    /// `diff_outputs = diff_inputs . weights + beta * diff_outputs`.
    fn backward_data(
        &self,
        weights: ArrayView2<T>,
        diff_inputs: ArrayView2<T>,
        beta: T,
        diff_outputs: ArrayViewMut2<T>,
    );
}

/// Description of a fully connected cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FcDesc {
    /// The number of outputs.
    pub nb_outputs: usize,
    /// Disables the bias.
    #[serde(default)]
    pub no_bias: bool,
    /// Initial weights.
    #[serde(default = "default_weights_filler")]
    pub weights_filler: Filler,
    /// Initial bias.
    #[serde(default = "default_bias_filler")]
    pub bias_filler: Filler,
    /// Activation.
    #[serde(default)]
    pub activation: Activation,
}

pub(crate) fn default_weights_filler() -> Filler {
    Filler::Xavier
}

pub(crate) fn default_bias_filler() -> Filler {
    Filler::Constant(0.)
}

impl FcDesc {
    /// A description with `nb_outputs` outputs and a bias.
    pub fn new(nb_outputs: usize) -> Self {
        Self {
            nb_outputs,
            no_bias: false,
            weights_filler: default_weights_filler(),
            bias_filler: default_bias_filler(),
            activation: Activation::default(),
        }
    }
    /// Disables the bias.
    pub fn with_no_bias(self, no_bias: bool) -> Self {
        Self { no_bias, ..self }
    }
    /// Sets the weights filler.
    pub fn with_weights_filler(self, weights_filler: Filler) -> Self {
        Self {
            weights_filler,
            ..self
        }
    }
    /// Sets the activation.
    pub fn with_activation(self, activation: Activation) -> Self {
        Self { activation, ..self }
    }
    /// Applies the options `NoBias`.
    ///
    /// **Errors**
    /// - An option is unknown or has the wrong type.
    pub fn with_parameters(mut self, parameters: &CellParameters) -> Result<Self> {
        for (name, value) in parameters.iter() {
            match name {
                "NoBias" => self.no_bias = config::as_bool(name, value)?,
                _ => return Err(config::unknown("Fc", name)),
            }
        }
        Ok(self)
    }
}

/// Fully connected cell.
///
/// Each input group `k` with `n_k = x * y * z` elements per sample has its own weights
/// `[1, 1, n_k, nb_outputs]`. The outputs are `[1, 1, nb_outputs, batch]`.
#[derive(Debug)]
pub struct FcCell<T: Scalar> {
    base: CellBase<T>,
    desc: FcDesc,
    kernel: Arc<dyn FcKernel<T>>,
    solver: SgdConfig,
    weights: Vec<Option<SharedParameter<T>>>,
    bias: Option<SharedParameter<T>>,
}

impl<T: Scalar> FcCell<T> {
    /// Creates a cell running `kernel` on `target`.
    pub fn new(
        name: impl Into<String>,
        desc: FcDesc,
        target: Target,
        kernel: Arc<dyn FcKernel<T>>,
    ) -> Self {
        let mut base = CellBase::new(name, CellKind::Fc, desc.nb_outputs, target);
        base.set_activation(desc.activation);
        Self {
            base,
            desc,
            kernel,
            solver: SgdConfig::default(),
            weights: Vec::new(),
            bias: None,
        }
    }
    /// Sets the solver attached to new parameters.
    pub fn with_solver(self, solver: SgdConfig) -> Self {
        Self { solver, ..self }
    }
    /// The description.
    pub fn desc(&self) -> &FcDesc {
        &self.desc
    }
    /// The weights of input group `k`.
    pub fn weights(&self, k: usize) -> Option<&SharedParameter<T>> {
        self.weights.get(k).and_then(Option::as_ref)
    }
    /// The bias, unless `NoBias`.
    pub fn bias(&self) -> Option<&SharedParameter<T>> {
        self.bias.as_ref()
    }
    fn weight_group(&self, k: usize) -> Result<&SharedParameter<T>> {
        self.weights(k)
            .ok_or_else(|| self.base.invalid_state("access weights"))
    }
    fn group_size(&self, k: usize) -> usize {
        self.base.inputs().get(k).map_or(0, |entry| {
            let [x, y, z, _] = entry.dims4();
            x * y * z
        })
    }
    /// Resolves a flattened input index to the group and the index within the group.
    fn locate(&self, channel: usize) -> Result<(usize, usize)> {
        let mut offset = 0;
        for k in 0..self.base.inputs().len() {
            let n = self.group_size(k);
            if channel < offset + n {
                return Ok((k, channel - offset));
            }
            offset += n;
        }
        Err(out_of_bounds("channel", channel, offset))
    }
}

impl<T: Scalar> Cell<T> for FcCell<T> {
    fn base(&self) -> &CellBase<T> {
        &self.base
    }
    fn base_mut(&mut self) -> &mut CellBase<T> {
        &mut self.base
    }
    fn compute_output_dims(&self) -> Result<Vec<usize>> {
        if self.desc.nb_outputs == 0 {
            return Err(Error::invalid_configuration(
                self.base.name(),
                "the number of outputs must be positive",
            ));
        }
        Ok(vec![1, 1, self.desc.nb_outputs, self.base.batch_size()])
    }
    fn initialize(&mut self) -> Result<()> {
        self.base.begin_initialize()?;
        let dims = self.compute_output_dims()?;
        self.base.resize_outputs(dims)?;
        let nb_inputs = self.base.inputs().len();
        if self.weights.len() > nb_inputs {
            return Err(Error::invalid_configuration(
                self.base.name(),
                format!(
                    "weights are shared for group {} but the cell has {nb_inputs} inputs",
                    self.weights.len() - 1
                ),
            ));
        }
        self.weights.resize_with(nb_inputs, || None);
        let nb_outputs = self.desc.nb_outputs;
        for k in 0..nb_inputs {
            let n = self.group_size(k);
            let name = self.base.name();
            let solver = self.solver;
            let filler = self.desc.weights_filler;
            ensure_parameter(
                name,
                &format!("weights[{k}]"),
                &mut self.weights[k],
                &[1, 1, n, nb_outputs],
                self.base.target(),
                || {
                    let mut value = Tensor::zeros([1, 1, n, nb_outputs]);
                    filler.fill(&mut value, n);
                    let solver = Box::new(solver.build::<T>()?);
                    Ok(Parameter::new(name, value, Some(solver)).into_shared())
                },
            )?;
        }
        if self.desc.no_bias {
            self.bias = None;
        } else {
            let name = self.base.name();
            let solver = self.solver;
            let filler = self.desc.bias_filler;
            ensure_parameter(
                name,
                "bias",
                &mut self.bias,
                &[1, 1, nb_outputs, 1],
                self.base.target(),
                || {
                    let mut value = Tensor::zeros([1, 1, nb_outputs, 1]);
                    filler.fill(&mut value, 1);
                    let solver = Box::new(solver.build::<T>()?);
                    Ok(Parameter::new(name, value, Some(solver)).into_shared())
                },
            )?;
        }
        self.base.finish_initialize();
        Ok(())
    }
    fn propagate(&mut self, _inference: bool) -> Result<()> {
        self.base.begin_propagate()?;
        let target = self.base.target().clone();
        let nb_outputs = self.desc.nb_outputs;
        {
            let mut outputs = self.base.outputs().write();
            let output_dims = outputs.dims().to_vec();
            let batch = outputs.dims4()[3];
            for (k, entry) in self.base.inputs().iter().enumerate() {
                let dims = entry.dims4();
                let full_dims = entry.tensor().read().dims4();
                let n = dims[0] * dims[1] * dims[2];
                let mut input = entry.tensor().write();
                let inputs = group_rows(full_dims, entry.channels(), target.read(&mut input)?)?;
                let mut weights = self.weight_group(k)?.lock();
                let weights = array_view2(nb_outputs, n, target.read(weights.value_mut())?)?;
                let (beta, y) = if k == 0 {
                    (T::zero(), target.discard(&mut outputs)?)
                } else {
                    (T::one(), target.write(&mut outputs)?)
                };
                let y = array_view2_mut(batch, nb_outputs, y)?;
                self.kernel.forward(inputs, weights, beta, y);
            }
            if let Some(bias) = self.bias.as_ref() {
                let mut bias = bias.lock();
                let bias = target.read(bias.value_mut())?;
                let y = array_view4_mut(&output_dims, target.write(&mut outputs)?)?;
                self.kernel.add_bias(bias, y);
            }
        }
        self.base.finish_propagate()
    }
    fn back_propagate(&mut self) -> Result<()> {
        if !self.base.begin_back_propagate()? {
            return Ok(());
        }
        let target = self.base.target().clone();
        let nb_outputs = self.desc.nb_outputs;
        let mut diff_inputs = self.base.diff_inputs().write();
        let diff_dims = diff_inputs.dims().to_vec();
        let batch = diff_inputs.dims4()[3];
        let diff_inputs = target.read(&mut diff_inputs)?;
        let dy = array_view2(batch, nb_outputs, diff_inputs)?;
        for (k, entry) in self.base.inputs().iter().enumerate() {
            let dims = entry.dims4();
            let full_dims = entry.tensor().read().dims4();
            let n = dims[0] * dims[1] * dims[2];
            let parameter = self.weight_group(k)?;
            {
                let beta = CellBase::parameter_beta(parameter);
                let mut input = entry.tensor().write();
                let inputs = group_rows(full_dims, entry.channels(), target.read(&mut input)?)?;
                let mut parameter = parameter.lock();
                let grad = parameter.grad_mut();
                let dw = if beta == T::zero() {
                    target.discard(grad)?
                } else {
                    target.write(grad)?
                };
                self.kernel
                    .backward_weights(inputs, dy, beta, array_view2_mut(nb_outputs, n, dw)?);
                grad.set_valid();
            }
            if let Some(beta) = self.base.prepare_diff_output(k)? {
                if let Some(slot) = self.base.diff_outputs()[k].as_ref() {
                    let mut slot = slot.tensor().write();
                    let dx = if beta == T::zero() {
                        target.discard(&mut slot)?
                    } else {
                        target.write(&mut slot)?
                    };
                    let dx = group_rows_mut(full_dims, entry.channels(), dx)?;
                    let mut parameter = parameter.lock();
                    let weights = array_view2(nb_outputs, n, target.read(parameter.value_mut())?)?;
                    self.kernel.backward_data(weights, dy, beta, dx);
                }
                self.base.finish_diff_output(k);
            }
        }
        if let Some(bias) = self.bias.as_ref() {
            let beta = CellBase::parameter_beta(bias);
            let mut bias = bias.lock();
            let grad = bias.grad_mut();
            let db = if beta == T::zero() {
                target.discard(grad)?
            } else {
                target.write(grad)?
            };
            self.kernel
                .backward_bias(array_view4(&diff_dims, diff_inputs)?, beta, db);
            grad.set_valid();
        }
        Ok(())
    }
    fn update(&mut self) -> Result<()> {
        self.base
            .check_state("update", &[CellState::Initialized, CellState::Ready])?;
        for parameter in self.weights.iter().flatten().chain(self.bias.as_ref()) {
            self.base.update_parameter(parameter)?;
        }
        Ok(())
    }
    /// Fully connected cells connect every input to every output.
    fn set_mapping(&mut self, _mapping: Mapping) -> Result<()> {
        Err(Error::unsupported_configuration(
            self.base.name(),
            "fully connected cells have no connectivity mapping",
        ))
    }
    fn share_weights(&mut self, group: usize, parameter: SharedParameter<T>) -> Result<()> {
        self.base.check_state(
            "share weights",
            &[CellState::Constructed, CellState::Connected],
        )?;
        if self.weights.len() <= group {
            self.weights.resize_with(group + 1, || None);
        }
        self.weights[group] = Some(parameter);
        Ok(())
    }
    fn parameters(&self) -> Vec<(String, SharedParameter<T>)> {
        let weights = self
            .weights
            .iter()
            .enumerate()
            .filter_map(|(k, w)| Some((format!("weights[{k}]"), w.clone()?)));
        let bias = self.bias.iter().map(|b| ("bias".to_string(), b.clone()));
        weights.chain(bias).collect()
    }
    fn get_weight(&self, output: usize, channel: usize) -> Result<Tensor<T>> {
        if output >= self.desc.nb_outputs {
            return Err(out_of_bounds("output", output, self.desc.nb_outputs));
        }
        let (k, i) = self.locate(channel)?;
        let n = self.group_size(k);
        let mut weights = self.weight_group(k)?.lock();
        let value = weights.value_mut().host().as_slice()[output * n + i];
        Tensor::from_vec([1], vec![value])
    }
    fn set_weight(&mut self, output: usize, channel: usize, value: &Tensor<T>) -> Result<()> {
        if output >= self.desc.nb_outputs {
            return Err(out_of_bounds("output", output, self.desc.nb_outputs));
        }
        if value.size() != 1 {
            return Err(Error::shape_mismatch(
                self.base.name(),
                "weight",
                &[1],
                value.dims(),
            ));
        }
        let (k, i) = self.locate(channel)?;
        let n = self.group_size(k);
        let mut weights = self.weight_group(k)?.lock();
        weights.value_mut().host_mut().as_mut_slice()[output * n + i] = value.as_slice()[0];
        Ok(())
    }
    fn get_bias(&self, output: usize) -> Result<Tensor<T>> {
        let bias = self.bias.as_ref().ok_or_else(|| {
            Error::unsupported_configuration(self.base.name(), "cell has no bias")
        })?;
        if output >= self.desc.nb_outputs {
            return Err(out_of_bounds("output", output, self.desc.nb_outputs));
        }
        let value = bias.lock().value_mut().host().as_slice()[output];
        Tensor::from_vec([1], vec![value])
    }
    fn set_bias(&mut self, output: usize, value: &Tensor<T>) -> Result<()> {
        let bias = self.bias.as_ref().ok_or_else(|| {
            Error::unsupported_configuration(self.base.name(), "cell has no bias")
        })?;
        if output >= self.desc.nb_outputs {
            return Err(out_of_bounds("output", output, self.desc.nb_outputs));
        }
        if value.size() != 1 {
            return Err(Error::shape_mismatch(
                self.base.name(),
                "bias",
                &[1],
                value.dims(),
            ));
        }
        bias.lock().value_mut().host_mut().as_mut_slice()[output] = value.as_slice()[0];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::HostKernels, cell::source::Source};

    fn fc(desc: FcDesc) -> FcCell<f32> {
        FcCell::new("fc", desc, Target::Host, Arc::new(HostKernels))
    }

    #[test]
    fn fc_two_inputs_sum() -> Result<()> {
        let a = Source::<f32>::new("a", [1, 1, 1, 1]);
        let b = Source::<f32>::new("b", [1, 1, 1, 1]);
        a.set(&Tensor::from_elem([1, 1, 1, 1], 1.))?;
        b.set(&Tensor::from_elem([1, 1, 1, 1], 0.5))?;
        let mut cell = fc(FcDesc::new(1).with_no_bias(true));
        cell.add_input(&a, None)?;
        cell.add_input(&b, None)?;
        cell.initialize()?;
        cell.set_weight(0, 0, &Tensor::from_elem([1], 1.))?;
        cell.set_weight(0, 1, &Tensor::from_elem([1], 1.))?;
        cell.propagate(true)?;
        assert_eq!(cell.outputs().write().host().as_slice(), &[1.5]);
        assert!(cell.get_bias(0).is_err());
        Ok(())
    }

    #[test]
    fn fc_weight_accessors() -> Result<()> {
        let a = Source::<f32>::new("a", [2, 1, 1, 3]);
        let mut cell = fc(FcDesc::new(4));
        assert!(cell.get_weight(0, 0).is_err());
        cell.add_input(&a, None)?;
        assert_eq!(cell.base().output_dims(), [1, 1, 4, 3]);
        cell.initialize()?;
        cell.set_weight(3, 1, &Tensor::from_elem([1], 2.))?;
        assert_eq!(cell.get_weight(3, 1)?.as_slice(), &[2.]);
        assert!(cell.get_weight(4, 0).is_err());
        assert!(cell.get_weight(0, 2).is_err());
        cell.set_bias(1, &Tensor::from_elem([1], 0.5))?;
        assert_eq!(cell.get_bias(1)?.as_slice(), &[0.5]);
        assert!(cell.set_weight(0, 0, &Tensor::zeros([2])).is_err());
        Ok(())
    }

    #[test]
    fn fc_parameters_option() -> Result<()> {
        let parameters = CellParameters::new().with("NoBias", true);
        assert!(FcDesc::new(2).with_parameters(&parameters)?.no_bias);
        let parameters = CellParameters::new().with("Epsilon", 0.1);
        assert!(matches!(
            FcDesc::new(2).with_parameters(&parameters),
            Err(Error::UnknownParameter { .. })
        ));
        Ok(())
    }

    #[test]
    fn fc_lifecycle_errors() -> Result<()> {
        let a = Source::<f32>::new("a", [2, 1, 1, 1]);
        let mut cell = fc(FcDesc::new(1));
        assert!(matches!(cell.initialize(), Err(Error::InvalidConfiguration { .. })));
        assert!(matches!(cell.propagate(true), Err(Error::InvalidState { .. })));
        cell.add_input(&a, None)?;
        cell.initialize()?;
        assert!(matches!(
            cell.add_input(&a, None),
            Err(Error::InvalidState { .. })
        ));
        let empty = Source::<f32>::new("empty", [0, 1, 1, 1]);
        let mut other = fc(FcDesc::new(1));
        assert!(matches!(
            other.add_input(&empty, None),
            Err(Error::DimensionMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn fc_rejects_mapping() {
        let mut cell = fc(FcDesc::new(2));
        assert!(matches!(
            cell.set_mapping(Mapping::full(1, 2)),
            Err(Error::UnsupportedConfiguration { .. })
        ));
        assert!(cell.base().mapping().is_none());
    }

    #[test]
    fn fc_reinitialize_keeps_parameters() -> Result<()> {
        let a = Source::<f32>::new("a", [2, 1, 1, 1]);
        let mut cell = fc(FcDesc::new(1));
        cell.add_input(&a, None)?;
        cell.initialize()?;
        cell.set_weight(0, 1, &Tensor::from_elem([1], 3.))?;
        cell.initialize()?;
        assert_eq!(cell.get_weight(0, 1)?.as_slice(), &[3.]);
        Ok(())
    }

    #[test]
    fn fc_shared_weights_shape_mismatch() -> Result<()> {
        let a = Source::<f32>::new("a", [2, 1, 1, 1]);
        let mut cell = fc(FcDesc::new(1));
        cell.add_input(&a, None)?;
        let parameter = Parameter::new("other", Tensor::zeros([1, 1, 3, 1]), None).into_shared();
        cell.share_weights(0, parameter)?;
        assert!(matches!(
            cell.initialize(),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
