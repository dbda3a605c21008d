use super::Producer;
use crate::{
    error::{Error, Result},
    scalar::Scalar,
    tensor::{
        mirrored::{MirroredTensor, SharedTensor},
        Tensor,
    },
};

/// External input tensors, ie a batch of stimuli.
///
/// Consumers read the outputs like those of a cell. A source only accepts gradients if created
/// [`.with_gradient()`](Source::with_gradient), which makes the gradient with respect to the
/// stimuli available, and lets consumers check their input gradients.
#[derive(Debug)]
pub struct Source<T: Scalar> {
    name: String,
    outputs: SharedTensor<T>,
    diff_inputs: Option<SharedTensor<T>>,
}

impl<T: Scalar> Source<T> {
    /// A source of zeros with `dims` `[x, y, z, b]`.
    pub fn new(name: impl Into<String>, dims: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            outputs: MirroredTensor::zeros(dims).into_shared(),
            diff_inputs: None,
        }
    }
    /// Adds a gradient slot.
    pub fn with_gradient(self) -> Self {
        let dims = self.outputs.read().dims().to_vec();
        Self {
            diff_inputs: Some(MirroredTensor::zeros(dims).into_shared()),
            ..self
        }
    }
    /// The dims.
    pub fn dims(&self) -> Vec<usize> {
        self.outputs.read().dims().to_vec()
    }
    /// Copies `tensor` into the outputs.
    ///
    /// **Errors**
    /// - The dims of `tensor` do not match.
    pub fn set(&self, tensor: &Tensor<T>) -> Result<()> {
        let mut outputs = self.outputs.write();
        if outputs.dims() != tensor.dims() {
            return Err(Error::shape_mismatch(
                &self.name,
                "source data",
                outputs.dims(),
                tensor.dims(),
            ));
        }
        outputs
            .host_discard()
            .as_mut_slice()
            .copy_from_slice(tensor.as_slice());
        Ok(())
    }
    /// The gradient with respect to the outputs, if valid.
    pub fn gradient(&self) -> Option<Tensor<T>> {
        let mut diff = self.diff_inputs.as_ref()?.write();
        diff.is_valid().then(|| diff.host().clone())
    }
    /// Invalidates the gradient slot, ie before a new backward pass.
    pub fn clear_gradient(&self) {
        if let Some(diff) = self.diff_inputs.as_ref() {
            diff.write().clear_valid();
        }
    }
}

impl<T: Scalar> Producer<T> for Source<T> {
    fn name(&self) -> &str {
        &self.name
    }
    fn outputs(&self) -> &SharedTensor<T> {
        &self.outputs
    }
    fn diff_inputs(&self) -> Option<&SharedTensor<T>> {
        self.diff_inputs.as_ref()
    }
}
