/*!
Cells, the nodes of a [`DeepNet`](crate::graph::DeepNet).

A cell owns its outputs and the gradient slot its consumers write to (its "diff inputs").
Its inputs are the outputs of its producers, concatenated along channels in an
[`Interface`]. The gradients it computes for its producers are written into their slots (its
"diff outputs").

# Lifecycle
```text
Constructed --add_input--> Connected --initialize--> Initialized --propagate--> Ready
```
- [`add_input`](Cell::add_input) is only allowed before [`initialize`](Cell::initialize).
- [`propagate`](Cell::propagate) writes the outputs, accumulating input groups with the beta
  convention (the first group overwrites, the others add) and clears the validity of the
  cell's own gradient slot.
- [`back_propagate`](Cell::back_propagate) does nothing if no consumer wrote the gradient slot.
  Otherwise it computes the parameter gradients and writes each producer's slot, overwriting
  a slot that is not valid yet and accumulating into a valid one, then marks it valid.
- [`update`](Cell::update) applies the solvers of the parameters the cell owns.
*/
use crate::{
    backend::Target,
    error::{Error, Result},
    gradient_check::{GradientCheck, GradientReport},
    persistence,
    registry::Backend,
    scalar::Scalar,
    solver::SharedParameter,
    tensor::{
        array_view2, array_view2_mut, array_view4, array_view4_mut,
        interface::{Interface, InterfaceEntry},
        mirrored::{MirroredTensor, SharedTensor},
        Tensor,
    },
};
use ndarray::{s, ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug, Display},
    io::{Read, Write},
    ops::Range,
    path::Path,
    str::FromStr,
};

/// Activation functions.
pub mod activation;
/// Batch normalization.
pub mod batch_norm;
/// Convolution.
pub mod conv;
/// Deconvolution.
pub mod deconv;
/// Fully connected.
pub mod fc;
/// Connectivity between input channels and outputs.
pub mod mapping;
/// Pooling.
pub mod pool;
/// Region proposals.
pub mod proposal;
/// Input sources.
pub mod source;

use activation::Activation;
use mapping::Mapping;

/// The kind of a cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum CellKind {
    /// Fully connected.
    Fc,
    /// Convolution.
    Conv,
    /// Deconvolution.
    Deconv,
    /// Pooling.
    Pool,
    /// Batch normalization.
    BatchNorm,
    /// Region proposals.
    Proposal,
}

impl CellKind {
    /// All kinds.
    pub const ALL: [Self; 6] = [
        Self::Fc,
        Self::Conv,
        Self::Deconv,
        Self::Pool,
        Self::BatchNorm,
        Self::Proposal,
    ];
    /// The name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fc => "Fc",
            Self::Conv => "Conv",
            Self::Deconv => "Deconv",
            Self::Pool => "Pool",
            Self::BatchNorm => "BatchNorm",
            Self::Proposal => "Proposal",
        }
    }
}

impl Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CellKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidParameter {
                name: "Type".into(),
                reason: format!("unknown cell type {s:?}"),
            })
    }
}

/// Lifecycle state of a cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CellState {
    /// No inputs yet.
    Constructed,
    /// Inputs added.
    Connected,
    /// Parameters and working tensors allocated.
    Initialized,
    /// Propagated at least once.
    Ready,
}

/// Geometry of a 2d sliding window, per dimension `[x, y]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Window size.
    pub kernel: [usize; 2],
    /// Stride.
    pub stride: [usize; 2],
    /// Zero padding on each side.
    pub padding: [usize; 2],
}

impl Geometry {
    /// Builds a geometry from per dimension lists.
    ///
    /// **Errors**
    /// - The window is not 2d.
    /// - The stride or padding dimensionality does not match the window.
    /// - A window size or stride is 0.
    pub fn from_dims(cell: &str, kernel: &[usize], stride: &[usize], padding: &[usize]) -> Result<Self> {
        if kernel.len() != 2 {
            return Err(Error::invalid_configuration(
                cell,
                format!("only 2d windows are supported, found {} dims", kernel.len()),
            ));
        }
        if stride.len() != kernel.len() {
            return Err(Error::invalid_configuration(
                cell,
                "the number of dimensions of stride must match the number of dimensions of the kernel",
            ));
        }
        if padding.len() != kernel.len() {
            return Err(Error::invalid_configuration(
                cell,
                "the number of dimensions of padding must match the number of dimensions of the kernel",
            ));
        }
        if kernel.contains(&0) || stride.contains(&0) {
            return Err(Error::invalid_configuration(
                cell,
                "kernel and stride dimensions must be positive",
            ));
        }
        Ok(Self {
            kernel: [kernel[0], kernel[1]],
            stride: [stride[0], stride[1]],
            padding: [padding[0], padding[1]],
        })
    }
    /// The output size `floor((input + 2 * padding - kernel) / stride) + 1` of a window over
    /// `[width, height]`.
    pub fn output_dims(&self, input: [usize; 2]) -> Option<[usize; 2]> {
        let mut output = [0; 2];
        for i in 0..2 {
            let padded = input[i] + 2 * self.padding[i];
            if padded < self.kernel[i] {
                return None;
            }
            output[i] = (padded - self.kernel[i]) / self.stride[i] + 1;
        }
        Some(output)
    }
    /// The in-bounds input ranges `[x, y]` of the window of output position `output`, with
    /// the padding excluded.
    pub fn window(&self, output: [usize; 2], input: [usize; 2]) -> [Range<usize>; 2] {
        let range = |i: usize| {
            let start = (output[i] * self.stride[i]) as isize - self.padding[i] as isize;
            let end = (start + self.kernel[i] as isize).clamp(0, input[i] as isize) as usize;
            let start = start.clamp(0, input[i] as isize) as usize;
            start..end.max(start)
        };
        [range(0), range(1)]
    }
    /// The output size `(input - 1) * stride - 2 * padding + kernel` of a transposed window.
    pub fn transposed_output_dims(&self, input: [usize; 2]) -> Option<[usize; 2]> {
        let mut output = [0; 2];
        for i in 0..2 {
            let full = input[i].checked_sub(1)? * self.stride[i] + self.kernel[i];
            output[i] = full.checked_sub(2 * self.padding[i]).filter(|x| *x > 0)?;
        }
        Some(output)
    }
}

/// Bias primitives of the trainable cells.
pub trait BiasKernel<T: Scalar>: Send + Sync + Debug {
    /// Adds `bias[o]` to output channel `o` of `outputs` `(b, o, y, x)`.
    fn add_bias(&self, bias: &[T], outputs: ArrayViewMut4<T>);
    /// `diff_bias[o] = sum(diff_inputs[.., o, .., ..]) + beta * diff_bias[o]`.
    fn backward_bias(&self, diff_inputs: ArrayView4<T>, beta: T, diff_bias: &mut [T]);
}

/// Source of input tensors for a cell.
pub trait Producer<T: Scalar> {
    /// The name.
    fn name(&self) -> &str;
    /// The outputs.
    fn outputs(&self) -> &SharedTensor<T>;
    /// The slot consumers write the gradient of the outputs to, if any.
    fn diff_inputs(&self) -> Option<&SharedTensor<T>>;
}

/// State shared by every cell.
///
/// Handles the graph edges and the lifecycle. Cell kinds compose it with their parameters and
/// an injected kernel.
#[derive(Debug)]
pub struct CellBase<T: Scalar> {
    name: String,
    kind: CellKind,
    target: Target,
    nb_outputs: usize,
    inputs: Interface<T>,
    diff_outputs: Vec<Option<InterfaceEntry<T>>>,
    outputs: SharedTensor<T>,
    diff_inputs: SharedTensor<T>,
    mapping: Option<Mapping>,
    activation: Activation,
    state: CellState,
}

impl<T: Scalar> CellBase<T> {
    /// Creates a cell base.
    pub fn new(name: impl Into<String>, kind: CellKind, nb_outputs: usize, target: Target) -> Self {
        Self {
            name: name.into(),
            kind,
            target,
            nb_outputs,
            inputs: Interface::new(),
            diff_outputs: Vec::new(),
            outputs: MirroredTensor::zeros([0]).into_shared(),
            diff_inputs: MirroredTensor::zeros([0]).into_shared(),
            mapping: None,
            activation: Activation::default(),
            state: CellState::Constructed,
        }
    }
    /// The name.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The kind.
    pub fn kind(&self) -> CellKind {
        self.kind
    }
    /// The target.
    pub fn target(&self) -> &Target {
        &self.target
    }
    /// The number of output channels.
    pub fn nb_outputs(&self) -> usize {
        self.nb_outputs
    }
    /// The inputs.
    pub fn inputs(&self) -> &Interface<T> {
        &self.inputs
    }
    /// The gradient slots of the producers, one per input group.
    ///
    /// `None` for producers that do not accept gradients.
    pub fn diff_outputs(&self) -> &[Option<InterfaceEntry<T>>] {
        &self.diff_outputs
    }
    /// Whether any producer accepts gradients.
    pub fn has_diff_outputs(&self) -> bool {
        self.diff_outputs.iter().any(Option::is_some)
    }
    /// The outputs.
    pub fn outputs(&self) -> &SharedTensor<T> {
        &self.outputs
    }
    /// The gradient of the outputs.
    pub fn diff_inputs(&self) -> &SharedTensor<T> {
        &self.diff_inputs
    }
    /// The dims of the outputs.
    pub fn output_dims(&self) -> Vec<usize> {
        self.outputs.read().dims().to_vec()
    }
    /// The connectivity mapping, if set.
    pub fn mapping(&self) -> Option<&Mapping> {
        self.mapping.as_ref()
    }
    /// The activation.
    pub fn activation(&self) -> Activation {
        self.activation
    }
    /// Sets the activation.
    pub fn set_activation(&mut self, activation: Activation) {
        self.activation = activation;
    }
    /// The state.
    pub fn state(&self) -> CellState {
        self.state
    }
    /// The batch size.
    pub fn batch_size(&self) -> usize {
        self.inputs.dim_b()
    }
    pub(crate) fn check_state(&self, operation: &'static str, allowed: &[CellState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }
    pub(crate) fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            cell: self.name.clone(),
            operation,
            state: format!("{:?}", self.state),
        }
    }
    /// The mapping resolved by [`.mapping_or()`](Self::mapping_or) during initialize.
    pub(crate) fn current_mapping(&self) -> Result<&Mapping> {
        self.mapping
            .as_ref()
            .ok_or_else(|| self.invalid_state("read the mapping"))
    }
    /// The spatial dims `[x, y]` shared by every input group.
    pub(crate) fn input_xy(&self) -> Result<[usize; 2]> {
        let mut xy = None;
        for entry in self.inputs.iter() {
            let [x, y, _, _] = entry.dims4();
            match xy {
                None => xy = Some([x, y]),
                Some(xy) if xy != [x, y] => {
                    return Err(Error::dimension_mismatch(
                        &self.name,
                        format!("inputs have spatial dims {xy:?} and {:?}", [x, y]),
                    ))
                }
                Some(_) => (),
            }
        }
        xy.ok_or_else(|| Error::invalid_configuration(&self.name, "cell has no inputs"))
    }
    fn add_input(
        &mut self,
        producer: &dyn Producer<T>,
        channels: Option<Range<usize>>,
    ) -> Result<()> {
        self.check_state("add an input", &[CellState::Constructed, CellState::Connected])?;
        let dims = producer.outputs().read().dims4();
        if dims.iter().product::<usize>() == 0 {
            return Err(Error::dimension_mismatch(
                &self.name,
                format!("producer {:?} has no outputs", producer.name()),
            ));
        }
        if !self.inputs.is_empty() && dims[3] != self.inputs.dim_b() {
            return Err(Error::dimension_mismatch(
                &self.name,
                format!(
                    "producer {:?} has batch size {}, expected {}",
                    producer.name(),
                    dims[3],
                    self.inputs.dim_b()
                ),
            ));
        }
        self.inputs.push(producer.outputs().clone(), channels)?;
        let entry = self.inputs.get(self.inputs.len() - 1).cloned();
        let channels = self.inputs.dim_z();
        if let Some(limit) = self.mapping.as_ref().map(Mapping::nb_channels) {
            if channels > limit {
                self.pop_input();
                return Err(Error::dimension_mismatch(
                    &self.name,
                    format!("mapping has {limit} channels, inputs have {channels}"),
                ));
            }
        }
        let diff_output = match (producer.diff_inputs(), entry) {
            (Some(slot), Some(entry)) => Some(InterfaceEntry::new(
                slot.clone(),
                entry.channels(),
                entry.offset(),
            )),
            _ => None,
        };
        self.diff_outputs.push(diff_output);
        self.state = CellState::Connected;
        Ok(())
    }
    fn pop_input(&mut self) {
        self.inputs.pop();
        self.diff_outputs.truncate(self.inputs.len());
        if self.inputs.is_empty() {
            self.state = CellState::Constructed;
        }
    }
    pub(crate) fn set_mapping(&mut self, mapping: Mapping) -> Result<()> {
        self.check_state("set the mapping", &[CellState::Constructed, CellState::Connected])?;
        if mapping.nb_outputs() != self.nb_outputs {
            return Err(Error::dimension_mismatch(
                &self.name,
                format!(
                    "mapping has {} outputs, expected {}",
                    mapping.nb_outputs(),
                    self.nb_outputs
                ),
            ));
        }
        self.mapping = Some(mapping);
        Ok(())
    }
    /// The mapping, or `default` if not set, checked against the inputs.
    pub(crate) fn mapping_or(&mut self, default: impl FnOnce(usize, usize) -> Mapping) -> Result<Mapping> {
        let channels = self.inputs.dim_z();
        let mapping = self
            .mapping
            .get_or_insert_with(|| default(channels, self.nb_outputs));
        if mapping.nb_channels() != channels || mapping.nb_outputs() != self.nb_outputs {
            return Err(Error::dimension_mismatch(
                &self.name,
                format!(
                    "mapping is {}x{}, inputs have {} channels and the cell {} outputs",
                    mapping.nb_channels(),
                    mapping.nb_outputs(),
                    channels,
                    self.nb_outputs
                ),
            ));
        }
        Ok(mapping.clone())
    }
    /// Resizes the outputs and the gradient slot.
    pub(crate) fn resize_outputs(&mut self, dims: Vec<usize>) -> Result<()> {
        let mut outputs = self.outputs.write();
        outputs.resize(dims.clone())?;
        self.target.attach(&mut outputs)?;
        let mut diff_inputs = self.diff_inputs.write();
        diff_inputs.resize(dims)?;
        self.target.attach(&mut diff_inputs)?;
        Ok(())
    }
    pub(crate) fn begin_initialize(&self) -> Result<()> {
        if self.state == CellState::Constructed {
            return Err(Error::invalid_configuration(&self.name, "cell has no inputs"));
        }
        self.check_state(
            "initialize",
            &[CellState::Connected, CellState::Initialized, CellState::Ready],
        )
    }
    pub(crate) fn finish_initialize(&mut self) {
        if self.state == CellState::Connected {
            self.state = CellState::Initialized;
        }
        tracing::debug!(
            cell = %self.name,
            kind = %self.kind,
            backend = %self.target.backend(),
            outputs = ?self.outputs.read().dims(),
            "initialized"
        );
    }
    pub(crate) fn begin_propagate(&self) -> Result<()> {
        self.check_state("propagate", &[CellState::Initialized, CellState::Ready])
    }
    /// Applies the activation in place and invalidates the gradient slot.
    pub(crate) fn finish_propagate(&mut self) -> Result<()> {
        {
            let mut outputs = self.outputs.write();
            let outputs = self.target.write(&mut outputs)?;
            self.activation.propagate(outputs, self.target.is_parallel());
        }
        self.diff_inputs.write().clear_valid();
        self.state = CellState::Ready;
        Ok(())
    }
    /// Returns whether there is a gradient to propagate, applying the derivative of the
    /// activation to it.
    pub(crate) fn begin_back_propagate(&mut self) -> Result<bool> {
        self.check_state("back propagate", &[CellState::Ready])?;
        let mut diff_inputs = self.diff_inputs.write();
        if !diff_inputs.is_valid() {
            tracing::trace!(cell = %self.name, "no gradient to propagate");
            return Ok(false);
        }
        if self.activation != Activation::Linear {
            let mut outputs = self.outputs.write();
            let outputs = self.target.read(&mut outputs)?;
            let diff_inputs = self.target.write(&mut diff_inputs)?;
            self.activation.back_propagate(outputs, diff_inputs);
        }
        Ok(true)
    }
    /// Prepares the gradient slot of input group `k` for writing.
    ///
    /// Returns `None` if the producer does not accept gradients, otherwise the beta to write
    /// with. A slot only partially covered by the group is zero filled by its first writer.
    pub(crate) fn prepare_diff_output(&self, k: usize) -> Result<Option<T>> {
        let Some(entry) = self.diff_outputs.get(k).and_then(Option::as_ref) else {
            return Ok(None);
        };
        let full = entry.is_full();
        let mut slot = entry.tensor().write();
        if slot.is_valid() {
            return Ok(Some(T::one()));
        }
        if full {
            return Ok(Some(T::zero()));
        }
        self.target.discard(&mut slot)?.fill(T::zero());
        slot.set_valid();
        Ok(Some(T::one()))
    }
    /// Marks the gradient slot of input group `k` valid.
    pub(crate) fn finish_diff_output(&self, k: usize) {
        if let Some(entry) = self.diff_outputs.get(k).and_then(Option::as_ref) {
            entry.tensor().write().set_valid();
        }
    }
    /// Applies the solver of `parameter` if owned by this cell.
    pub(crate) fn update_parameter(&self, parameter: &SharedParameter<T>) -> Result<bool> {
        let target = &self.target;
        parameter
            .lock()
            .update_with(&self.name, self.batch_size().max(1), |value, grad| {
                Ok((target.write(value)?, target.read(grad)?))
            })
    }
    /// The beta for writing the gradient of `parameter`.
    pub(crate) fn parameter_beta(parameter: &SharedParameter<T>) -> T {
        if parameter.lock().is_pending() {
            T::one()
        } else {
            T::zero()
        }
    }
}

impl<T: Scalar> Producer<T> for CellBase<T> {
    fn name(&self) -> &str {
        &self.name
    }
    fn outputs(&self) -> &SharedTensor<T> {
        &self.outputs
    }
    fn diff_inputs(&self) -> Option<&SharedTensor<T>> {
        Some(&self.diff_inputs)
    }
}

/// A cell.
///
/// Cells are composed of a [`CellBase`], their parameters and a kernel implementing their
/// numerics on a backend, see [`backend`](crate::backend).
pub trait Cell<T: Scalar>: Send + Debug {
    /// The base.
    fn base(&self) -> &CellBase<T>;
    /// The base, mutably.
    fn base_mut(&mut self) -> &mut CellBase<T>;
    /// The dims of the outputs, computed from the inputs.
    ///
    /// **Errors**
    /// - [`Error::InvalidConfiguration`] if the cell description is invalid.
    /// - [`Error::DimensionMismatch`] if the inputs are incompatible.
    fn compute_output_dims(&self) -> Result<Vec<usize>>;
    /// Validates the configuration and allocates parameters and working tensors.
    ///
    /// Calling `initialize` again keeps existing parameters whose shape still matches.
    ///
    /// **Errors**
    /// - [`Error::InvalidConfiguration`] or [`Error::UnsupportedConfiguration`] for invalid
    ///   descriptions and inputs.
    /// - [`Error::ShapeMismatch`] if a present (shared or loaded) parameter has the wrong shape.
    fn initialize(&mut self) -> Result<()>;
    /// Computes the outputs from the inputs.
    ///
    /// In inference mode, statistics are frozen.
    fn propagate(&mut self, inference: bool) -> Result<()>;
    /// Computes the parameter gradients and the gradients of the producers.
    fn back_propagate(&mut self) -> Result<()>;
    /// Applies the solvers to the parameters owned by the cell.
    fn update(&mut self) -> Result<()>;

    /// The name.
    fn name(&self) -> &str {
        self.base().name()
    }
    /// The kind.
    fn kind(&self) -> CellKind {
        self.base().kind()
    }
    /// The backend.
    fn backend(&self) -> Backend {
        self.base().target().backend()
    }
    /// The state.
    fn state(&self) -> CellState {
        self.base().state()
    }
    /// The number of output channels.
    fn nb_outputs(&self) -> usize {
        self.base().nb_outputs()
    }
    /// The outputs.
    fn outputs(&self) -> &SharedTensor<T> {
        self.base().outputs()
    }
    /// The gradient of the outputs, written by the consumers.
    fn diff_inputs(&self) -> &SharedTensor<T> {
        self.base().diff_inputs()
    }
    /// The cell as a producer for other cells.
    fn producer(&self) -> &dyn Producer<T> {
        self.base()
    }
    /// Adds a producer, restricted to `channels` of its outputs if provided.
    ///
    /// **Errors**
    /// - [`Error::InvalidState`] if the cell is initialized.
    /// - [`Error::DimensionMismatch`] if the producer has no outputs or is incompatible with
    ///   the inputs or the mapping.
    fn add_input(
        &mut self,
        producer: &dyn Producer<T>,
        channels: Option<Range<usize>>,
    ) -> Result<()> {
        self.base_mut().add_input(producer, channels)?;
        match self.compute_output_dims() {
            Ok(dims) => self.base_mut().resize_outputs(dims),
            // Reported by initialize.
            Err(Error::InvalidConfiguration { .. }) => Ok(()),
            Err(e) => {
                self.base_mut().pop_input();
                Err(e)
            }
        }
    }
    /// Sets the connectivity mapping from input channels to outputs.
    ///
    /// **Errors**
    /// - [`Error::InvalidState`] if the cell is initialized.
    /// - [`Error::DimensionMismatch`] if the number of outputs does not match.
    /// - [`Error::UnsupportedConfiguration`] if the cell type has no mapping.
    fn set_mapping(&mut self, mapping: Mapping) -> Result<()> {
        self.base_mut().set_mapping(mapping)
    }
    /// Sets the activation.
    fn set_activation(&mut self, activation: Activation) {
        self.base_mut().set_activation(activation);
    }
    /// Installs `parameter` as the weights of input group `group`, shared with another cell.
    ///
    /// **Errors**
    /// - [`Error::UnsupportedConfiguration`] if the cell has no weights.
    fn share_weights(&mut self, group: usize, parameter: SharedParameter<T>) -> Result<()> {
        let _ = (group, parameter);
        Err(Error::unsupported_configuration(
            self.name(),
            format!("{} cells have no weights", self.kind()),
        ))
    }
    /// The trainable parameters, with names.
    fn parameters(&self) -> Vec<(String, SharedParameter<T>)> {
        Vec::new()
    }
    /// The persisted parameters, in stream order.
    fn free_parameters(&self) -> Vec<SharedParameter<T>> {
        self.parameters().into_iter().map(|(_, p)| p).collect()
    }
    /// Whether the outputs are differentiable everywhere.
    ///
    /// The gradient check skips elements at a discontinuity when not.
    fn is_differentiable(&self) -> bool {
        self.base().activation().is_differentiable()
    }
    /// Writes the free parameters to `writer`.
    ///
    /// **Errors**
    /// - The writer fails.
    fn save_free_parameters_to(&self, writer: &mut dyn Write) -> Result<()> {
        persistence::write_parameters(writer, &self.free_parameters())
            .map_err(|e| Error::io(self.name(), e))
    }
    /// Reads the free parameters from `reader`.
    ///
    /// Nothing is modified unless the whole stream matches the parameters.
    ///
    /// **Errors**
    /// - [`Error::InvalidState`] if the cell is not initialized.
    /// - [`Error::ParameterFileCorrupt`] if the stream is shorter or longer than expected.
    fn load_free_parameters_from(&mut self, reader: &mut dyn Read, source: &Path) -> Result<()> {
        self.base().check_state(
            "load parameters",
            &[CellState::Initialized, CellState::Ready],
        )?;
        persistence::read_parameters(reader, source, &self.free_parameters())
    }
    /// Saves the free parameters to `path`.
    ///
    /// **Errors**
    /// - See [`.save_free_parameters_to()`](Cell::save_free_parameters_to).
    fn save_free_parameters(&self, path: &Path) -> Result<()> {
        persistence::save_file(path, |w| self.save_free_parameters_to(w))?;
        tracing::info!(cell = %self.name(), path = %path.display(), "saved parameters");
        Ok(())
    }
    /// Loads the free parameters from `path`.
    ///
    /// If `ignore_not_exists` and `path` does not exist, does nothing.
    ///
    /// **Errors**
    /// - See [`.load_free_parameters_from()`](Cell::load_free_parameters_from).
    fn load_free_parameters(&mut self, path: &Path, ignore_not_exists: bool) -> Result<()> {
        let Some(mut file) = persistence::open_file(path, ignore_not_exists)? else {
            tracing::warn!(
                cell = %self.name(),
                path = %path.display(),
                "parameter file does not exist, keeping current parameters"
            );
            return Ok(());
        };
        self.load_free_parameters_from(&mut file, path)?;
        tracing::info!(cell = %self.name(), path = %path.display(), "loaded parameters");
        Ok(())
    }
    /// The weights connecting input `channel` to `output`.
    ///
    /// **Errors**
    /// - [`Error::UnsupportedConfiguration`] if the cell has no weights.
    /// - [`Error::InvalidParameter`] if out of bounds.
    fn get_weight(&self, output: usize, channel: usize) -> Result<Tensor<T>> {
        let _ = (output, channel);
        Err(Error::unsupported_configuration(
            self.name(),
            format!("{} cells have no weights", self.kind()),
        ))
    }
    /// Sets the weights connecting input `channel` to `output`.
    ///
    /// **Errors**
    /// - See [`.get_weight()`](Cell::get_weight).
    fn set_weight(&mut self, output: usize, channel: usize, value: &Tensor<T>) -> Result<()> {
        let _ = (output, channel, value);
        Err(Error::unsupported_configuration(
            self.name(),
            format!("{} cells have no weights", self.kind()),
        ))
    }
    /// The bias of `output`.
    ///
    /// **Errors**
    /// - [`Error::UnsupportedConfiguration`] if the cell has no bias.
    /// - [`Error::InvalidParameter`] if out of bounds.
    fn get_bias(&self, output: usize) -> Result<Tensor<T>> {
        let _ = output;
        Err(Error::unsupported_configuration(self.name(), "cell has no bias"))
    }
    /// Sets the bias of `output`.
    ///
    /// **Errors**
    /// - See [`.get_bias()`](Cell::get_bias).
    fn set_bias(&mut self, output: usize, value: &Tensor<T>) -> Result<()> {
        let _ = (output, value);
        Err(Error::unsupported_configuration(self.name(), "cell has no bias"))
    }
    /// Compares the gradients of [`.back_propagate()`](Cell::back_propagate) with finite
    /// differences of width `epsilon`.
    ///
    /// Mismatches are logged and reported, not returned as errors.
    ///
    /// **Errors**
    /// - Propagation fails.
    fn check_gradient(&mut self, epsilon: f64, max_error: f64) -> Result<GradientReport> {
        GradientCheck::new(epsilon, max_error).check(self)
    }
}

/// The rows `(b, channels * y * x)` of `channels` of a tensor with `dims`.
pub(crate) fn group_rows<T>(
    dims: [usize; 4],
    channels: Range<usize>,
    data: &[T],
) -> Result<ArrayView2<T>> {
    let [x, y, z, b] = dims;
    let xy = x * y;
    Ok(array_view2(b, z * xy, data)?.slice_move(s![.., channels.start * xy..channels.end * xy]))
}

/// Mutable [`group_rows`].
pub(crate) fn group_rows_mut<T>(
    dims: [usize; 4],
    channels: Range<usize>,
    data: &mut [T],
) -> Result<ArrayViewMut2<T>> {
    let [x, y, z, b] = dims;
    let xy = x * y;
    Ok(array_view2_mut(b, z * xy, data)?
        .slice_move(s![.., channels.start * xy..channels.end * xy]))
}

/// The view `(b, channels, y, x)` of a tensor with `dims`.
pub(crate) fn group_view4<T>(
    dims: [usize; 4],
    channels: Range<usize>,
    data: &[T],
) -> Result<ArrayView4<T>> {
    Ok(array_view4(&dims, data)?.slice_move(s![.., channels, .., ..]))
}

/// Mutable [`group_view4`].
pub(crate) fn group_view4_mut<T>(
    dims: [usize; 4],
    channels: Range<usize>,
    data: &mut [T],
) -> Result<ArrayViewMut4<T>> {
    Ok(array_view4_mut(&dims, data)?.slice_move(s![.., channels, .., ..]))
}

pub(crate) fn out_of_bounds(name: &str, index: usize, len: usize) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        reason: format!("index {index} is out of bounds for {len}"),
    }
}

/// Checks the shape of a present parameter, or creates it with `create`.
pub(crate) fn ensure_parameter<T: Scalar>(
    cell: &str,
    what: &str,
    slot: &mut Option<SharedParameter<T>>,
    dims: &[usize],
    target: &Target,
    create: impl FnOnce() -> Result<SharedParameter<T>>,
) -> Result<SharedParameter<T>> {
    let parameter = match slot.as_ref() {
        Some(parameter) => {
            let actual = parameter.lock().dims().to_vec();
            if actual != dims {
                return Err(Error::shape_mismatch(cell, what, dims, &actual));
            }
            parameter.clone()
        }
        None => create()?,
    };
    {
        let mut guard = parameter.lock();
        let (value, grad) = guard.value_grad_mut();
        target.attach(value)?;
        target.attach(grad)?;
    }
    *slot = Some(parameter.clone());
    Ok(parameter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry() -> Result<()> {
        let geometry = Geometry::from_dims("c", &[3, 3], &[2, 2], &[1, 1])?;
        assert_eq!(geometry.output_dims([5, 6]), Some([3, 3]));
        assert_eq!(geometry.transposed_output_dims([3, 3]), Some([5, 5]));
        assert_eq!(geometry.window([0, 2], [5, 6]), [0..2, 3..6]);
        assert_eq!(geometry.window([2, 1], [5, 6]), [3..5, 1..4]);
        assert_eq!(
            Geometry::from_dims("c", &[2, 2], &[1, 1], &[0, 0])?.output_dims([1, 4]),
            None
        );
        assert!(matches!(
            Geometry::from_dims("c", &[2, 2, 2], &[1, 1, 1], &[0, 0, 0]),
            Err(Error::InvalidConfiguration { .. })
        ));
        assert!(Geometry::from_dims("c", &[2, 2], &[1], &[0, 0]).is_err());
        assert!(Geometry::from_dims("c", &[2, 2], &[1, 1], &[0]).is_err());
        Ok(())
    }

    #[test]
    fn cell_kind_names() -> Result<()> {
        for kind in CellKind::ALL {
            assert_eq!(kind.name().parse::<CellKind>()?, kind);
        }
        assert_eq!("batchnorm".parse::<CellKind>()?, CellKind::BatchNorm);
        assert!("Lstm".parse::<CellKind>().is_err());
        Ok(())
    }
}
