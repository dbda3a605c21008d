use super::{
    conv::{ConvDesc, ConvKernel},
    ensure_parameter, group_view4, group_view4_mut, out_of_bounds, Cell, CellBase, CellKind,
    CellState, Geometry,
};
use crate::{
    backend::Target,
    cell::mapping::Mapping,
    error::{Error, Result},
    scalar::Scalar,
    solver::{Parameter, SgdConfig, SharedParameter},
    tensor::{array_view4, array_view4_mut, Tensor},
};
use std::{ops::Range, sync::Arc};

/// Description of a deconvolution cell, with the options of a convolution.
pub type DeconvDesc = ConvDesc;

/// Deconvolution (transposed convolution) cell.
///
/// Input group `k` with `C_k` channels has weights `[kx, ky, nb_outputs, C_k]`. Outputs are
/// `[ox, oy, nb_outputs, batch]` with `o = (i - 1) * stride - 2 * padding + kernel`.
///
/// The forward pass is the data gradient of a convolution from the outputs to the inputs, so
/// the cell runs on any [`ConvKernel`].
#[derive(Debug)]
pub struct DeconvCell<T: Scalar> {
    base: CellBase<T>,
    desc: DeconvDesc,
    kernel: Arc<dyn ConvKernel<T>>,
    solver: SgdConfig,
    geometry: Option<Geometry>,
    weights: Vec<Option<SharedParameter<T>>>,
    bias: Option<SharedParameter<T>>,
}

impl<T: Scalar> DeconvCell<T> {
    /// Creates a cell running `kernel` on `target`.
    pub fn new(
        name: impl Into<String>,
        desc: DeconvDesc,
        target: Target,
        kernel: Arc<dyn ConvKernel<T>>,
    ) -> Self {
        let mut base = CellBase::new(name, CellKind::Deconv, desc.nb_outputs, target);
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
    pub fn desc(&self) -> &DeconvDesc {
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
    fn weight_dims(&self, k: usize) -> [usize; 4] {
        let [kx, ky] = self.geometry.map_or([0; 2], |g| g.kernel);
        let channels = self.base.inputs().get(k).map_or(0, |e| e.dim_z());
        [kx, ky, self.desc.nb_outputs, channels]
    }
    fn locate(&self, output: usize, channel: usize) -> Result<(usize, Range<usize>)> {
        if output >= self.desc.nb_outputs {
            return Err(out_of_bounds("output", output, self.desc.nb_outputs));
        }
        let inputs = self.base.inputs();
        let (k, c) = inputs
            .entry_channel(channel)
            .ok_or_else(|| out_of_bounds("channel", channel, inputs.dim_z()))?;
        let [kx, ky, nb_outputs, _] = self.weight_dims(k);
        let start = (c * nb_outputs + output) * kx * ky;
        Ok((k, start..start + kx * ky))
    }
}

impl<T: Scalar> Cell<T> for DeconvCell<T> {
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
        let [ox, oy] = geometry.transposed_output_dims(xy).ok_or_else(|| {
            Error::dimension_mismatch(
                self.base.name(),
                format!("padding {:?} is too large for inputs {xy:?}", geometry.padding),
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
            let fan_in = dims[0] * dims[1] * dims[3];
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
                    let mut value = Tensor::zeros(dims);
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
                self.kernel.backward_data(
                    weights,
                    mapping.rows(entry.offset(), entry.dim_z()).t(),
                    &geometry,
                    inputs,
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
                    dy,
                    inputs,
                    rows.t(),
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
                        .forward(dy, weights, rows.t(), &geometry, beta, dx);
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
