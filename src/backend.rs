/*!
Execution targets and kernel implementations.

Every cell type is implemented by two kernel structs behind the same kernel trait:

- [`HostKernels`]: reference kernels with straightforward nested loops over host memory.
- [`DeviceKernels`]: kernels built from primitives over device memory, ie im2col + GEMM
  convolutions, GEMM based average pooling and broadcast batch normalization.

Cells never select memory themselves. They ask their [`Target`] for the slices of a
[`MirroredTensor`], which synchronizes the side the kernels run on.
*/
use crate::{
    device::Device,
    error::Result,
    registry::Backend,
    scalar::Scalar,
    tensor::mirrored::MirroredTensor,
};
use ndarray::{ArrayBase, DataMut, Dimension};

/// Device kernels.
pub mod device;
/// Host kernels.
pub mod host;

pub use device::DeviceKernels;
pub use host::HostKernels;

/// Where the kernels of a cell run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Target {
    /// Host memory.
    #[default]
    Host,
    /// Device memory.
    Device(Device),
}

impl Target {
    /// The backend.
    pub fn backend(&self) -> Backend {
        match self {
            Self::Host => Backend::Host,
            Self::Device(_) => Backend::Device,
        }
    }
    /// The device, if any.
    pub fn device(&self) -> Option<&Device> {
        match self {
            Self::Host => None,
            Self::Device(device) => Some(device),
        }
    }
    /// Mirrors `tensor` on the device of the target.
    ///
    /// **Errors**
    /// - See [`MirroredTensor::attach()`].
    pub fn attach<T: Scalar>(&self, tensor: &mut MirroredTensor<T>) -> Result<()> {
        match self {
            Self::Host => Ok(()),
            Self::Device(device) => tensor.attach(device),
        }
    }
    /// The elements of `tensor` on the target, synchronized first if stale.
    ///
    /// **Errors**
    /// - See [`MirroredTensor::attach()`].
    pub fn read<'a, T: Scalar>(&self, tensor: &'a mut MirroredTensor<T>) -> Result<&'a [T]> {
        match self {
            Self::Host => Ok(tensor.host().as_slice()),
            Self::Device(device) => {
                tensor.attach(device)?;
                Ok(tensor.device()?.as_slice())
            }
        }
    }
    /// The elements of `tensor` on the target for updating.
    ///
    /// The other side becomes stale.
    ///
    /// **Errors**
    /// - See [`MirroredTensor::attach()`].
    pub fn write<'a, T: Scalar>(&self, tensor: &'a mut MirroredTensor<T>) -> Result<&'a mut [T]> {
        match self {
            Self::Host => Ok(tensor.host_mut().as_mut_slice()),
            Self::Device(device) => {
                tensor.attach(device)?;
                Ok(tensor.device_mut()?.as_slice_mut())
            }
        }
    }
    /// The elements of `tensor` on the target for overwriting, without synchronizing.
    ///
    /// **Errors**
    /// - See [`MirroredTensor::attach()`].
    pub fn discard<'a, T: Scalar>(
        &self,
        tensor: &'a mut MirroredTensor<T>,
    ) -> Result<&'a mut [T]> {
        match self {
            Self::Host => Ok(tensor.host_discard().as_mut_slice()),
            Self::Device(device) => {
                tensor.attach(device)?;
                Ok(tensor.device_discard()?.as_slice_mut())
            }
        }
    }
    /// Whether kernels may split work across threads.
    pub(crate) fn is_parallel(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

/// The weighted update `y = x + beta * y`, where `beta` is 0 or 1.
///
/// With `beta == 0` the previous value is ignored, so uninitialized gradients never leak.
#[inline]
pub(crate) fn blend<T: Scalar>(y: &mut T, x: T, beta: T) {
    *y = if beta == T::zero() { x } else { x + beta * *y };
}

/// Scales `y` by `beta` ahead of an accumulation.
pub(crate) fn scale_by_beta<T: Scalar>(y: &mut [T], beta: T) {
    if beta == T::zero() {
        y.iter_mut().for_each(|y| *y = T::zero());
    } else if beta != T::one() {
        y.iter_mut().for_each(|y| *y = beta * *y);
    }
}

/// [`scale_by_beta`] for strided arrays.
pub(crate) fn scale_array_by_beta<T: Scalar, S: DataMut<Elem = T>, D: Dimension>(
    y: &mut ArrayBase<S, D>,
    beta: T,
) {
    if beta == T::zero() {
        y.fill(T::zero());
    } else if beta != T::one() {
        y.mapv_inplace(|y| beta * y);
    }
}

/// The input index read by window element `k` of output `out`, or `None` in the padding.
#[inline]
pub(crate) fn source_index(
    out: usize,
    k: usize,
    stride: usize,
    padding: usize,
    len: usize,
) -> Option<usize> {
    (out * stride + k)
        .checked_sub(padding)
        .filter(|i| *i < len)
}
