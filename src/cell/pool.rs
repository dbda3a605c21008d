use super::{
    activation::Activation, group_view4, group_view4_mut, Cell, CellBase, CellKind, Geometry,
};
use crate::{
    backend::Target,
    cell::mapping::Mapping,
    config::{self, CellParameters},
    error::{Error, Result},
    scalar::Scalar,
    tensor::{array_view4, array_view4_mut},
};
use ndarray::{Array4, ArrayView2, ArrayView4, ArrayViewMut4};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, str::FromStr, sync::Arc};

/// Pooling operation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Pooling {
    /// Maximum of the window.
    #[default]
    Max,
    /// Average of the in-bounds elements of the window.
    Average,
}

impl FromStr for Pooling {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("max") {
            Ok(Self::Max)
        } else if s.eq_ignore_ascii_case("average") {
            Ok(Self::Average)
        } else {
            Err(Error::InvalidParameter {
                name: "Pooling".into(),
                reason: format!("expected Max or Average, found {s:?}"),
            })
        }
    }
}

/// The input element selected by max pooling for an output element.
///
/// `channel`, `iy` and `ix` are relative to input group `group`. Invalid if the window had
/// no connected element.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ArgMax {
    /// The input group.
    pub group: usize,
    /// The channel within the group.
    pub channel: usize,
    /// The row.
    pub iy: usize,
    /// The column.
    pub ix: usize,
    /// Whether an element was selected.
    pub valid: bool,
}

/// Pooling kernel.
///
/// Feature maps are `(batch, channels, y, x)` and `mapping[(channel, output)]` selects the
/// channels pooled into each output. Windows exclude the padding.
pub trait PoolKernel<T: Scalar>: Send + Sync + Debug {
    /// Averages the windows of the connected channels of one input group.
    ///
    /// `counts[o]` is the number of channels connected to output `o` over every group, so
    /// that the groups accumulate to the average over all of them.
    fn forward_average(
        &self,
        inputs: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        counts: &[usize],
        geometry: &Geometry,
        beta: T,
        outputs: ArrayViewMut4<T>,
    );
    /// Distributes each output gradient equally over its window.
    fn backward_average(
        &self,
        diff_inputs: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        counts: &[usize],
        geometry: &Geometry,
        beta: T,
        diff_outputs: ArrayViewMut4<T>,
    );
    /// The maximum over the windows of the connected channels of input group `group`.
    ///
    /// With `beta == 0` the outputs and `argmax` are overwritten. Otherwise an output is
    /// replaced only if the group has a strictly greater element, so ties resolve to the first
    /// maximum.
    #[allow(clippy::too_many_arguments)]
    fn forward_max(
        &self,
        group: usize,
        inputs: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        geometry: &Geometry,
        beta: T,
        outputs: ArrayViewMut4<T>,
        argmax: ArrayViewMut4<ArgMax>,
    );
    /// Routes each output gradient to the element recorded in `argmax`, if it belongs to
    /// `group`.
    fn backward_max(
        &self,
        group: usize,
        diff_inputs: ArrayView4<T>,
        argmax: ArrayView4<ArgMax>,
        beta: T,
        diff_outputs: ArrayViewMut4<T>,
    );
}

/// Description of a pooling cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolDesc {
    /// The number of output channels.
    pub nb_outputs: usize,
    /// The operation.
    #[serde(default)]
    pub pooling: Pooling,
    /// The window size `[kx, ky]`.
    pub kernel: Vec<usize>,
    /// The stride per dimension.
    pub stride: Vec<usize>,
    /// The padding per dimension.
    pub padding: Vec<usize>,
    /// Activation.
    #[serde(default)]
    pub activation: Activation,
}

impl PoolDesc {
    /// A pooling with unit stride and no padding.
    pub fn new(nb_outputs: usize, pooling: Pooling, kernel: impl Into<Vec<usize>>) -> Self {
        let kernel = kernel.into();
        Self {
            nb_outputs,
            pooling,
            stride: vec![1; kernel.len()],
            padding: vec![0; kernel.len()],
            kernel,
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
    /// Sets the activation.
    pub fn with_activation(self, activation: Activation) -> Self {
        Self { activation, ..self }
    }
    /// Applies the options `Pooling`, `Stride` and `Padding`.
    ///
    /// **Errors**
    /// - An option is unknown or has the wrong type.
    pub fn with_parameters(mut self, parameters: &CellParameters) -> Result<Self> {
        for (name, value) in parameters.iter() {
            match name {
                "Pooling" => self.pooling = config::as_str(name, value)?.parse()?,
                "Stride" => self.stride = vec![config::as_usize(name, value)?; self.kernel.len()],
                "Padding" => {
                    self.padding = vec![config::as_usize(name, value)?; self.kernel.len()]
                }
                _ => return Err(config::unknown("Pool", name)),
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

/// Pooling cell.
///
/// The default mapping is one to one if the number of outputs equals the number of input
/// channels, otherwise every channel is pooled into every output.
#[derive(Debug)]
pub struct PoolCell<T: Scalar> {
    base: CellBase<T>,
    desc: PoolDesc,
    kernel: Arc<dyn PoolKernel<T>>,
    geometry: Option<Geometry>,
    counts: Vec<usize>,
    argmax: Array4<ArgMax>,
}

impl<T: Scalar> PoolCell<T> {
    /// Creates a cell running `kernel` on `target`.
    pub fn new(
        name: impl Into<String>,
        desc: PoolDesc,
        target: Target,
        kernel: Arc<dyn PoolKernel<T>>,
    ) -> Self {
        let mut base = CellBase::new(name, CellKind::Pool, desc.nb_outputs, target);
        base.set_activation(desc.activation);
        Self {
            base,
            desc,
            kernel,
            geometry: None,
            counts: Vec::new(),
            argmax: Array4::default((0, 0, 0, 0)),
        }
    }
    /// The description.
    pub fn desc(&self) -> &PoolDesc {
        &self.desc
    }
    /// The elements selected by the last max pooling forward pass, `(batch, output, y, x)`.
    pub fn argmax(&self) -> ArrayView4<ArgMax> {
        self.argmax.view()
    }
    fn geometry_or_err(&self) -> Result<Geometry> {
        self.geometry
            .ok_or_else(|| self.base.invalid_state("read the geometry"))
    }
}

fn default_mapping(nb_channels: usize, nb_outputs: usize) -> Mapping {
    if nb_channels == nb_outputs {
        Mapping::one_to_one(nb_channels)
    } else {
        Mapping::full(nb_channels, nb_outputs)
    }
}

impl<T: Scalar> Cell<T> for PoolCell<T> {
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
                format!("inputs {xy:?} are smaller than the window {:?}", geometry.kernel),
            )
        })?;
        Ok(vec![ox, oy, self.desc.nb_outputs, self.base.batch_size()])
    }
    fn initialize(&mut self) -> Result<()> {
        self.base.begin_initialize()?;
        let dims = self.compute_output_dims()?;
        self.geometry = Some(self.desc.geometry(self.base.name())?);
        let mapping = self.base.mapping_or(default_mapping)?;
        self.counts = (0..mapping.nb_outputs())
            .map(|o| mapping.view().column(o).iter().filter(|x| **x).count())
            .collect();
        let [ox, oy, o, b] = [dims[0], dims[1], dims[2], dims[3]];
        self.argmax = Array4::default((b, o, oy, ox));
        self.base.resize_outputs(dims)?;
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
                let rows = mapping.rows(entry.offset(), entry.dim_z());
                let mut input = entry.tensor().write();
                let inputs = group_view4(full_dims, entry.channels(), target.read(&mut input)?)?;
                let (beta, y) = if k == 0 {
                    (T::zero(), target.discard(&mut outputs)?)
                } else {
                    (T::one(), target.write(&mut outputs)?)
                };
                let y = array_view4_mut(&output_dims, y)?;
                match self.desc.pooling {
                    Pooling::Average => self
                        .kernel
                        .forward_average(inputs, rows, &self.counts, &geometry, beta, y),
                    Pooling::Max => self.kernel.forward_max(
                        k,
                        inputs,
                        rows,
                        &geometry,
                        beta,
                        y,
                        self.argmax.view_mut(),
                    ),
                }
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
        let dy = array_view4(&diff_dims, target.read(&mut diff_inputs)?)?;
        for (k, entry) in self.base.inputs().iter().enumerate() {
            let Some(beta) = self.base.prepare_diff_output(k)? else {
                continue;
            };
            if let Some(slot) = self.base.diff_outputs()[k].as_ref() {
                let full_dims = slot.tensor().read().dims4();
                let mut slot = slot.tensor().write();
                let dx = if beta == T::zero() {
                    target.discard(&mut slot)?
                } else {
                    target.write(&mut slot)?
                };
                let dx = group_view4_mut(full_dims, entry.channels(), dx)?;
                match self.desc.pooling {
                    Pooling::Average => self.kernel.backward_average(
                        dy,
                        mapping.rows(entry.offset(), entry.dim_z()),
                        &self.counts,
                        &geometry,
                        beta,
                        dx,
                    ),
                    Pooling::Max => self
                        .kernel
                        .backward_max(k, dy, self.argmax.view(), beta, dx),
                }
            }
            self.base.finish_diff_output(k);
        }
        Ok(())
    }
    fn update(&mut self) -> Result<()> {
        Ok(())
    }
    fn is_differentiable(&self) -> bool {
        self.desc.pooling == Pooling::Average && self.base.activation().is_differentiable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::HostKernels, cell::source::Source, tensor::Tensor};

    fn pool(desc: PoolDesc) -> PoolCell<f32> {
        PoolCell::new("pool", desc, Target::Host, Arc::new(HostKernels))
    }

    #[test]
    fn pool_options() -> Result<()> {
        let parameters = CellParameters::new()
            .with("Pooling", "Average")
            .with("Stride", 2);
        let desc = PoolDesc::new(1, Pooling::Max, [2, 2]).with_parameters(&parameters)?;
        assert_eq!(desc.pooling, Pooling::Average);
        assert_eq!(desc.stride, [2, 2]);
        assert!("Min".parse::<Pooling>().is_err());
        Ok(())
    }

    #[test]
    fn pool_requires_2d() -> Result<()> {
        let input = Source::<f32>::new("in", [4, 4, 1, 1]);
        let mut cell = pool(PoolDesc::new(1, Pooling::Max, [2, 2, 1]));
        cell.add_input(&input, None)?;
        assert!(matches!(
            cell.initialize(),
            Err(Error::InvalidConfiguration { .. })
        ));
        let mut cell = pool(PoolDesc::new(1, Pooling::Max, [2, 2]).with_padding([1]));
        cell.add_input(&input, None)?;
        assert!(matches!(
            cell.initialize(),
            Err(Error::InvalidConfiguration { .. })
        ));
        Ok(())
    }

    #[test]
    fn max_pool_forward() -> Result<()> {
        let input = Source::<f32>::new("in", [4, 2, 1, 1]);
        input.set(&Tensor::from_vec(
            [4, 2, 1, 1],
            vec![1., 5., 2., 2., 3., 0., 7., 7.],
        )?)?;
        let mut cell = pool(PoolDesc::new(1, Pooling::Max, [2, 2]).with_stride([2, 2]));
        cell.add_input(&input, None)?;
        cell.initialize()?;
        cell.propagate(true)?;
        assert_eq!(cell.outputs().write().host().as_slice(), &[5., 7.]);
        let argmax = cell.argmax();
        assert_eq!((argmax[(0, 0, 0, 0)].iy, argmax[(0, 0, 0, 0)].ix), (0, 1));
        // Ties resolve to the first maximum.
        assert_eq!((argmax[(0, 0, 0, 1)].iy, argmax[(0, 0, 0, 1)].ix), (1, 2));
        assert!(!cell.is_differentiable());
        Ok(())
    }

    #[test]
    fn average_pool_excludes_padding() -> Result<()> {
        let input = Source::<f32>::new("in", [2, 2, 1, 1]);
        input.set(&Tensor::from_vec([2, 2, 1, 1], vec![1., 2., 3., 4.])?)?;
        let mut cell = pool(
            PoolDesc::new(1, Pooling::Average, [2, 2])
                .with_stride([2, 2])
                .with_padding([1, 1]),
        );
        cell.add_input(&input, None)?;
        assert_eq!(cell.base().output_dims(), [2, 2, 1, 1]);
        cell.initialize()?;
        cell.propagate(true)?;
        assert_eq!(cell.outputs().write().host().as_slice(), &[1., 2., 3., 4.]);
        Ok(())
    }
}
