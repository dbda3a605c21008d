use super::{
    activation::Activation,
    ensure_parameter,
    fc::{default_bias_filler, default_weights_filler},
    group_view4, group_view4_mut, out_of_bounds, BiasKernel, Cell, CellBase, CellKind, CellState,
    Geometry,
};
use crate::{
    backend::Target,
    cell::mapping::Mapping,
    config::{self, CellParameters, Filler},
    error::{Error, Result},
    scalar::Scalar,
    solver::{Parameter, SgdConfig, SharedParameter},
    tensor::{array_view4, array_view4_mut, Tensor},
};
use ndarray::{ArrayView2, ArrayView4, ArrayViewMut4};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Convolution kernel.
///
/// Feature maps are `(batch, channels, y, x)`, weights are `(outputs, channels, ky, kx)` and
/// `mapping[(channel, output)]` selects the connected pairs.
pub trait ConvKernel<T: Scalar>: BiasKernel<T> {
    /// `outputs = conv(inputs, weights) + beta * outputs`.
    fn forward(
        &self,
        inputs: ArrayView4<T>,
        weights: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        geometry: &Geometry,
        beta: T,
        outputs: ArrayViewMut4<T>,
    );
    /// The gradient of the inputs, `diff_outputs = conv^T(diff_inputs, weights) + beta *
    /// diff_outputs`.
    fn backward_data(
        &self,
        weights: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        geometry: &Geometry,
        diff_inputs: ArrayView4<T>,
        beta: T,
        diff_outputs: ArrayViewMut4<T>,
    );
    /// The gradient of the weights, summed over the batch.
    ///
    /// Unconnected weights get a zero gradient.
    fn backward_filter(
        &self,
        inputs: ArrayView4<T>,
        diff_inputs: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        geometry: &Geometry,
        beta: T,
        diff_weights: ArrayViewMut4<T>,
    );
}

/// Description of a convolution cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvDesc {
    /// The number of output channels.
    pub nb_outputs: usize,
    /// The window size `[kx, ky]`.
    pub kernel: Vec<usize>,
    /// The stride per dimension.
    pub stride: Vec<usize>,
    /// The zero padding per dimension.
    pub padding: Vec<usize>,
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

impl ConvDesc {
    /// A convolution with unit stride and no padding.
    pub fn new(nb_outputs: usize, kernel: impl Into<Vec<usize>>) -> Self {
        let kernel = kernel.into();
        Self {
            nb_outputs,
            stride: vec![1; kernel.len()],
            padding: vec![0; kernel.len()],
            kernel,
            no_bias: false,
            weights_filler: default_weights_filler(),
            bias_filler: default_bias_filler(),
            activation: Activation::default(),
        }
    }
    /// Sets the stride.
    pub fn with_stride(self, stride: impl Into<Vec<usize>>) -> Self {
        Self {
            stride: stride.into(),
            ..self
        }
    }
    /// Sets the padding.
    pub fn with_padding(self, padding: impl Into<Vec<usize>>) -> Self {
        Self {
            padding: padding.into(),
            ..self
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
    /// Applies the options `NoBias`, `Stride` and `Padding`.
    ///
    /// `Stride` and `Padding` apply to every dimension.
    ///
    /// **Errors**
    /// - An option is unknown or has the wrong type.
    pub fn with_parameters(mut self, parameters: &CellParameters) -> Result<Self> {
        for (name, value) in parameters.iter() {
            match name {
                "NoBias" => self.no_bias = config::as_bool(name, value)?,
                "Stride" => self.stride = vec![config::as_usize(name, value)?; self.kernel.len()],
                "Padding" => {
                    self.padding = vec![config::as_usize(name, value)?; self.kernel.len()]
                }
                _ => return Err(config::unknown("Conv", name)),
            }
        }
        Ok(self)
    }
    /// The geometry.
    ///
    /// **Errors**
    /// - See [`Geometry::from_dims()`].
    pub fn geometry(&self, cell: &str) -> Result<Geometry> {
        Geometry::from_dims(cell, &self.kernel, &self.stride, &self.padding)
    }
}

/// Convolution cell.
///
/// Input group `k` with `C_k` channels has weights `[kx, ky, C_k, nb_outputs]`. Outputs are
/// `[ox, oy, nb_outputs, batch]` with `o = floor((i + 2 * padding - kernel) / stride) + 1`.
#[derive(Debug)]
pub struct ConvCell<T: Scalar> {
    base: CellBase<T>,
    desc: ConvDesc,
    kernel: Arc<dyn ConvKernel<T>>,
    solver: SgdConfig,
    geometry: Option<Geometry>,
    weights: Vec<Option<SharedParameter<T>>>,
    bias: Option<SharedParameter<T>>,
}

impl<T: Scalar> ConvCell<T> {
    /// Creates a cell running `kernel` on `target`.
    pub fn new(
        name: impl Into<String>,
        desc: ConvDesc,
        target: Target,
        kernel: Arc<dyn ConvKernel<T>>,
    ) -> Self {
        let mut base = CellBase::new(name, CellKind::Conv, desc.nb_outputs, target);
        base.set_activation(desc.activation);
        Self {
            base,
            desc,
            kernel,
            solver: SgdConfig::default(),
            geometry: None,
            weights: Vec::new(),
            bias: None,
        }
    }
    /// Sets the solver attached to new parameters.
    pub fn with_solver(self, solver: SgdConfig) -> Self {
        Self { solver, ..self }
    }
    /// The description.
    pub fn desc(&self) -> &ConvDesc {
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
    fn geometry_or_err(&self) -> Result<Geometry> {
        self.geometry
            .ok_or_else(|| self.base.invalid_state("read the geometry"))
    }
    fn weight_dims(&self, k: usize) -> Vec<usize> {
        let [kx, ky] = self.geometry.map_or([0; 2], |g| g.kernel);
        let channels = self.base.inputs().get(k).map_or(0, |e| e.dim_z());
        vec![kx, ky, channels, self.desc.nb_outputs]
    }
    /// The range of the `[kx, ky]` block connecting `channel` to `output` in the weights of
    /// its group.
    fn locate(&self, output: usize, channel: usize) -> Result<(usize, std::ops::Range<usize>)> {
        if output >= self.desc.nb_outputs {
            return Err(out_of_bounds("output", output, self.desc.nb_outputs));
        }
        let inputs = self.base.inputs();
        let (k, c) = inputs
            .entry_channel(channel)
            .ok_or_else(|| out_of_bounds("channel", channel, inputs.dim_z()))?;
        let [kx, ky, channels, _] = <[usize; 4]>::try_from(self.weight_dims(k))
            .map_err(|_| self.base.invalid_state("access weights"))?;
        let start = (output * channels + c) * kx * ky;
        Ok((k, start..start + kx * ky))
    }
}

impl<T: Scalar> Cell<T> for ConvCell<T> {
    fn base(&self) -> &CellBase<T> {
        &self.base
    }
    fn base_mut(&mut self) -> &mut CellBase<T> {
        &mut self.base
    }
    fn compute_output_dims(&self) -> Result<Vec<usize>> {
        let geometry = self.desc.geometry(self.base.name())?;
        if self.desc.nb_outputs == 0 {
            return Err(Error::invalid_configuration(
                self.base.name(),
                "the number of outputs must be positive",
            ));
        }
        let xy = self.base.input_xy()?;
        let [ox, oy] = geometry.output_dims(xy).ok_or_else(|| {
            Error::dimension_mismatch(
                self.base.name(),
                format!("inputs {xy:?} are smaller than the kernel {:?}", geometry.kernel),
            )
        })?;
        Ok(vec![ox, oy, self.desc.nb_outputs, self.base.batch_size()])
    }
    fn initialize(&mut self) -> Result<()> {
        self.base.begin_initialize()?;
        let dims = self.compute_output_dims()?;
        self.geometry = Some(self.desc.geometry(self.base.name())?);
        self.base.resize_outputs(dims)?;
        self.base.mapping_or(Mapping::full)?;
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
        for k in 0..nb_inputs {
            let dims = self.weight_dims(k);
            let fan_in = dims[0] * dims[1] * dims[2];
            let name = self.base.name();
            let solver = self.solver;
            let filler = self.desc.weights_filler;
            ensure_parameter(
                name,
                &format!("weights[{k}]"),
                &mut self.weights[k],
                &dims,
                self.base.target(),
                || {
                    let mut value = Tensor::zeros(dims.clone());
                    filler.fill(&mut value, fan_in);
                    let solver = Box::new(solver.build::<T>()?);
                    Ok(Parameter::new(name, value, Some(solver)).into_shared())
                },
            )?;
        }
        if self.desc.no_bias {
            self.bias = None;
        } else {
            let nb_outputs = self.desc.nb_outputs;
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
        let geometry = self.geometry_or_err()?;
        let mapping = self.base.current_mapping()?;
        {
            let mut outputs = self.base.outputs().write();
            let output_dims = outputs.dims().to_vec();
            for (k, entry) in self.base.inputs().iter().enumerate() {
                let full_dims = entry.tensor().read().dims4();
                let weight_dims = self.weight_dims(k);
                let mut input = entry.tensor().write();
                let inputs = group_view4(full_dims, entry.channels(), target.read(&mut input)?)?;
                let mut weights = self.weight_group(k)?.lock();
                let weights = array_view4(&weight_dims, target.read(weights.value_mut())?)?;
                let (beta, y) = if k == 0 {
                    (T::zero(), target.discard(&mut outputs)?)
                } else {
                    (T::one(), target.write(&mut outputs)?)
                };
                self.kernel.forward(
                    inputs,
                    weights,
                    mapping.rows(entry.offset(), entry.dim_z()),
                    &geometry,
                    beta,
                    array_view4_mut(&output_dims, y)?,
                );
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
        let geometry = self.geometry_or_err()?;
        let mapping = self.base.current_mapping()?;
        let mut diff_inputs = self.base.diff_inputs().write();
        let diff_dims = diff_inputs.dims().to_vec();
        let diff_inputs = target.read(&mut diff_inputs)?;
        let dy = array_view4(&diff_dims, diff_inputs)?;
        for (k, entry) in self.base.inputs().iter().enumerate() {
            let full_dims = entry.tensor().read().dims4();
            let weight_dims = self.weight_dims(k);
            let rows = mapping.rows(entry.offset(), entry.dim_z());
            let parameter = self.weight_group(k)?;
            {
                let beta = CellBase::parameter_beta(parameter);
                let mut input = entry.tensor().write();
                let inputs = group_view4(full_dims, entry.channels(), target.read(&mut input)?)?;
                let mut parameter = parameter.lock();
                let grad = parameter.grad_mut();
                let dw = if beta == T::zero() {
                    target.discard(grad)?
                } else {
                    target.write(grad)?
                };
                self.kernel.backward_filter(
                    inputs,
                    dy,
                    rows,
                    &geometry,
                    beta,
                    array_view4_mut(&weight_dims, dw)?,
                );
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
                    let dx = group_view4_mut(full_dims, entry.channels(), dx)?;
                    let mut parameter = parameter.lock();
                    let weights = array_view4(&weight_dims, target.read(parameter.value_mut())?)?;
                    self.kernel
                        .backward_data(weights, rows, &geometry, dy, beta, dx);
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
            self.kernel.backward_bias(dy, beta, db);
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
    /// The `[kx, ky]` kernel connecting `channel` to `output`.
    fn get_weight(&self, output: usize, channel: usize) -> Result<Tensor<T>> {
        let (k, range) = self.locate(output, channel)?;
        let geometry = self.geometry_or_err()?;
        let mut weights = self.weight_group(k)?.lock();
        let data = weights.value_mut().host().as_slice()[range].to_vec();
        Tensor::from_vec(geometry.kernel.to_vec(), data)
    }
    fn set_weight(&mut self, output: usize, channel: usize, value: &Tensor<T>) -> Result<()> {
        let (k, range) = self.locate(output, channel)?;
        let geometry = self.geometry_or_err()?;
        if value.dims() != geometry.kernel {
            return Err(Error::shape_mismatch(
                self.base.name(),
                "weight",
                &geometry.kernel,
                value.dims(),
            ));
        }
        let mut weights = self.weight_group(k)?.lock();
        weights.value_mut().host_mut().as_mut_slice()[range].copy_from_slice(value.as_slice());
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

    fn conv(desc: ConvDesc) -> ConvCell<f32> {
        ConvCell::new("conv", desc, Target::Host, Arc::new(HostKernels))
    }

    #[test]
    fn conv_output_dims() -> Result<()> {
        let input = Source::<f32>::new("in", [5, 6, 2, 3]);
        let mut cell = conv(ConvDesc::new(4, [3, 3]).with_stride([2, 2]).with_padding([1, 1]));
        cell.add_input(&input, None)?;
        assert_eq!(cell.base().output_dims(), [3, 3, 4, 3]);
        cell.initialize()?;
        let weights = cell.weights(0).map(|w| w.lock().dims().to_vec());
        assert_eq!(weights, Some(vec![3, 3, 2, 4]));
        Ok(())
    }

    #[test]
    fn conv_invalid_geometry() -> Result<()> {
        let input = Source::<f32>::new("in", [5, 5, 1, 1]);
        let mut cell = conv(ConvDesc::new(1, [3, 3]).with_stride([1]));
        cell.add_input(&input, None)?;
        assert!(matches!(
            cell.initialize(),
            Err(Error::InvalidConfiguration { .. })
        ));
        let mut cell = conv(ConvDesc::new(1, [3, 3, 3]));
        cell.add_input(&input, None)?;
        assert!(matches!(
            cell.initialize(),
            Err(Error::InvalidConfiguration { .. })
        ));
        let small = Source::<f32>::new("small", [2, 2, 1, 1]);
        let mut cell = conv(ConvDesc::new(1, [3, 3]));
        assert!(matches!(
            cell.add_input(&small, None),
            Err(Error::DimensionMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn conv_identity_kernel() -> Result<()> {
        let input = Source::<f32>::new("in", [3, 3, 1, 1]);
        input.set(&Tensor::from_vec([3, 3, 1, 1], (0..9).map(|x| x as f32).collect())?)?;
        let mut cell = conv(
            ConvDesc::new(1, [3, 3])
                .with_padding([1, 1])
                .with_weights_filler(Filler::Constant(0.)),
        );
        cell.add_input(&input, None)?;
        cell.initialize()?;
        let mut center = Tensor::zeros([3, 3]);
        center.set4(1, 1, 0, 0, 1.);
        cell.set_weight(0, 0, &center)?;
        cell.set_bias(0, &Tensor::from_elem([1], 1.))?;
        cell.propagate(true)?;
        let expected: Vec<f32> = (0..9).map(|x| x as f32 + 1.).collect();
        assert_eq!(cell.outputs().write().host().as_slice(), expected.as_slice());
        assert_eq!(cell.get_weight(0, 0)?, center);
        assert!(cell.set_weight(0, 0, &Tensor::zeros([2, 2])).is_err());
        assert!(cell.get_weight(0, 1).is_err());
        Ok(())
    }

    #[test]
    fn conv_parameters_options() -> Result<()> {
        let parameters = CellParameters::new()
            .with("Stride", 2)
            .with("Padding", 1)
            .with("NoBias", true);
        let desc = ConvDesc::new(1, [3, 3]).with_parameters(&parameters)?;
        assert_eq!(desc.stride, [2, 2]);
        assert_eq!(desc.padding, [1, 1]);
        assert!(desc.no_bias);
        Ok(())
    }
}
