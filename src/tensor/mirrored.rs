use super::Tensor;
use crate::{
    device::{Device, DeviceBuffer},
    error::{Error, Result},
    registry::Backend,
    scalar::Scalar,
};
use parking_lot::RwLock;
use std::sync::Arc;

/// Which side of a [`MirroredTensor`] holds the current data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Validity {
    /// The host is current, the device (if any) is stale.
    HostValid,
    /// The device is current, the host is stale.
    DeviceValid,
    /// Both sides hold the same data.
    BothValid,
}

/// A tensor mirrored on the host and optionally on a device.
///
/// Kernels never touch the validity state directly. Reading a side with [`.host()`](Self::host)
/// or [`.device()`](Self::device) synchronizes it first if it is stale, mutating a side with
/// [`.host_mut()`](Self::host_mut) or [`.device_mut()`](Self::device_mut) makes it the only
/// current side. At most one side is stale at a time.
///
/// Gradient tensors also carry a validity flag, see [`.is_valid()`](Self::is_valid). It is
/// independent of the host / device state: it records whether the tensor holds a meaningful
/// accumulated gradient.
#[derive(Debug)]
pub struct MirroredTensor<T: Scalar> {
    host: Tensor<T>,
    device: Option<DeviceBuffer<T>>,
    state: Validity,
    valid: bool,
}

/// A [`MirroredTensor`] shared between cells.
///
/// A producer's outputs are read by its consumers, and its gradient slot is written by them.
pub type SharedTensor<T> = Arc<RwLock<MirroredTensor<T>>>;

impl<T: Scalar> MirroredTensor<T> {
    /// Wraps a host tensor.
    pub fn new(tensor: Tensor<T>) -> Self {
        Self {
            host: tensor,
            device: None,
            state: Validity::HostValid,
            valid: false,
        }
    }
    /// A host tensor of zeros.
    pub fn zeros(dims: impl Into<Vec<usize>>) -> Self {
        Self::new(Tensor::zeros(dims))
    }
    /// Wraps the tensor in a [`SharedTensor`].
    pub fn into_shared(self) -> SharedTensor<T> {
        Arc::new(RwLock::new(self))
    }
    /// The dims.
    pub fn dims(&self) -> &[usize] {
        self.host.dims()
    }
    /// The dims as `[x, y, z, b]`.
    pub fn dims4(&self) -> [usize; 4] {
        self.host.dims4()
    }
    /// The number of elements.
    pub fn size(&self) -> usize {
        self.host.size()
    }
    /// The synchronization state.
    pub fn state(&self) -> Validity {
        self.state
    }
    /// The device the tensor is mirrored on.
    pub fn device_handle(&self) -> Option<&Device> {
        self.device.as_ref().map(DeviceBuffer::device)
    }
    /// Mirrors the tensor on `device`, uploading the host data.
    ///
    /// Does nothing if already mirrored on `device`.
    ///
    /// **Errors**
    /// - The tensor is mirrored on another device.
    /// - The device is out of memory.
    pub fn attach(&mut self, device: &Device) -> Result<()> {
        if let Some(buffer) = self.device.as_ref() {
            if buffer.device() == device {
                return Ok(());
            }
            return Err(Error::BackendUnavailable {
                backend: Backend::Device,
                reason: format!(
                    "tensor is mirrored on {:?}, not {device:?}",
                    buffer.device()
                ),
            });
        }
        self.synchronize_d_based_to_host();
        self.device = Some(DeviceBuffer::from_host(device, self.host.as_slice())?);
        self.state = Validity::BothValid;
        Ok(())
    }
    /// Resizes the tensor to `dims`, zero filled.
    ///
    /// A device mirror is reallocated. Both sides are valid afterwards.
    ///
    /// **Errors**
    /// - The device is out of memory.
    pub fn resize(&mut self, dims: impl Into<Vec<usize>>) -> Result<()> {
        let dims = dims.into();
        if self.host.dims() == dims.as_slice() {
            return Ok(());
        }
        self.host.resize(dims, T::zero());
        if let Some(buffer) = self.device.take() {
            let device = buffer.device().clone();
            drop(buffer);
            self.device = Some(DeviceBuffer::zeros(&device, self.host.size())?);
        }
        self.state = Validity::BothValid;
        Ok(())
    }
    /// The host tensor, downloading it first if stale.
    pub fn host(&mut self) -> &Tensor<T> {
        self.synchronize_d_based_to_host();
        &self.host
    }
    /// The host tensor for writing.
    ///
    /// The device becomes stale.
    pub fn host_mut(&mut self) -> &mut Tensor<T> {
        self.synchronize_d_based_to_host();
        if self.device.is_some() {
            self.state = Validity::HostValid;
        }
        &mut self.host
    }
    /// The host tensor for overwriting, without downloading.
    ///
    /// The previous contents are unspecified. The device becomes stale.
    pub fn host_discard(&mut self) -> &mut Tensor<T> {
        if self.device.is_some() {
            self.state = Validity::HostValid;
        }
        &mut self.host
    }
    /// The host tensor if current, without synchronizing.
    pub fn host_if_current(&self) -> Option<&Tensor<T>> {
        (self.state != Validity::DeviceValid).then_some(&self.host)
    }
    /// The device buffer, uploading it first if stale.
    ///
    /// **Errors**
    /// - The tensor is not mirrored on a device.
    pub fn device(&mut self) -> Result<&DeviceBuffer<T>> {
        self.synchronize_h_based_to_device();
        self.device.as_ref().ok_or_else(not_mirrored)
    }
    /// The device buffer for writing.
    ///
    /// The host becomes stale.
    ///
    /// **Errors**
    /// - The tensor is not mirrored on a device.
    pub fn device_mut(&mut self) -> Result<&mut DeviceBuffer<T>> {
        self.synchronize_h_based_to_device();
        let buffer = self.device.as_mut().ok_or_else(not_mirrored)?;
        self.state = Validity::DeviceValid;
        Ok(buffer)
    }
    /// The device buffer for overwriting, without uploading.
    ///
    /// **Errors**
    /// - The tensor is not mirrored on a device.
    pub fn device_discard(&mut self) -> Result<&mut DeviceBuffer<T>> {
        let buffer = self.device.as_mut().ok_or_else(not_mirrored)?;
        self.state = Validity::DeviceValid;
        Ok(buffer)
    }
    /// Copies the host to the device, regardless of the state.
    ///
    /// Does nothing if not mirrored.
    pub fn synchronize_host_to_device(&mut self) {
        if let Some(buffer) = self.device.as_mut() {
            buffer.copy_from_host(self.host.as_slice());
            self.state = Validity::BothValid;
        }
    }
    /// Copies the device to the host, regardless of the state.
    ///
    /// Does nothing if not mirrored.
    pub fn synchronize_device_to_host(&mut self) {
        if let Some(buffer) = self.device.as_ref() {
            buffer.copy_to_host(self.host.as_mut_slice());
            self.state = Validity::BothValid;
        }
    }
    /// Copies the host to the device if only the host is current.
    pub fn synchronize_h_based_to_device(&mut self) {
        if self.state == Validity::HostValid {
            self.synchronize_host_to_device();
        }
    }
    /// Copies the device to the host if only the device is current.
    pub fn synchronize_d_based_to_host(&mut self) {
        if self.state == Validity::DeviceValid {
            self.synchronize_device_to_host();
        }
    }
    /// Whether the tensor holds a valid gradient.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
    /// Marks the gradient as valid.
    pub fn set_valid(&mut self) {
        self.valid = true;
    }
    /// Marks the gradient as invalid.
    ///
    /// The next writer overwrites instead of accumulating.
    pub fn clear_valid(&mut self) {
        self.valid = false;
    }
}

fn not_mirrored() -> Error {
    Error::BackendUnavailable {
        backend: Backend::Device,
        reason: "tensor is not mirrored on a device".into(),
    }
}

impl<T: Scalar> From<Tensor<T>> for MirroredTensor<T> {
    fn from(tensor: Tensor<T>) -> Self {
        Self::new(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirrored(device: &Device) -> Result<MirroredTensor<f32>> {
        let mut x = MirroredTensor::new(Tensor::from_vec([4], vec![1., 2., 3., 4.])?);
        x.attach(device)?;
        Ok(x)
    }

    #[test]
    fn host_only() -> Result<()> {
        let mut x = MirroredTensor::<f32>::zeros([2, 2]);
        x.host_mut().fill(1.);
        assert_eq!(x.state(), Validity::HostValid);
        assert!(x.device().is_err());
        assert_eq!(x.host().as_slice(), &[1.; 4]);
        Ok(())
    }

    #[test]
    fn attach_uploads_once() -> Result<()> {
        let device = Device::new();
        let mut x = mirrored(&device)?;
        assert_eq!(x.state(), Validity::BothValid);
        x.device()?;
        x.host();
        let info = device.info();
        assert_eq!(info.uploads, 1);
        assert_eq!(info.downloads, 0);
        Ok(())
    }

    #[test]
    fn device_write_then_host_read() -> Result<()> {
        let device = Device::new();
        let mut x = mirrored(&device)?;
        x.device_mut()?.fill(5.);
        assert_eq!(x.state(), Validity::DeviceValid);
        assert_eq!(x.host_if_current(), None);
        assert_eq!(x.host().as_slice(), &[5.; 4]);
        assert_eq!(x.state(), Validity::BothValid);
        x.host();
        assert_eq!(device.info().downloads, 1);
        Ok(())
    }

    #[test]
    fn host_write_then_device_read() -> Result<()> {
        let device = Device::new();
        let mut x = mirrored(&device)?;
        x.host_mut().as_mut_slice()[0] = 9.;
        assert_eq!(x.state(), Validity::HostValid);
        // Pushes only when the host is authoritative.
        x.synchronize_d_based_to_host();
        assert_eq!(device.info().downloads, 0);
        assert_eq!(x.device()?.as_slice()[0], 9.);
        assert_eq!(device.info().uploads, 2);
        x.synchronize_h_based_to_device();
        assert_eq!(device.info().uploads, 2);
        Ok(())
    }

    #[test]
    fn discard_skips_transfer() -> Result<()> {
        let device = Device::new();
        let mut x = mirrored(&device)?;
        x.host_mut().fill(0.);
        x.device_discard()?.fill(2.);
        assert_eq!(device.info().uploads, 1);
        assert_eq!(x.host().as_slice(), &[2.; 4]);
        Ok(())
    }

    #[test]
    fn resize_releases_device_memory() -> Result<()> {
        let device = Device::new();
        let mut x = mirrored(&device)?;
        x.resize([8])?;
        assert_eq!(device.info().allocated, 8 * 4);
        assert_eq!(device.info().buffers, 1);
        drop(x);
        assert_eq!(device.info().allocated, 0);
        Ok(())
    }

    #[test]
    fn gradient_validity() {
        let mut x = MirroredTensor::<f64>::zeros([3]);
        assert!(!x.is_valid());
        x.set_valid();
        assert!(x.is_valid());
        x.clear_valid();
        assert!(!x.is_valid());
    }

    #[test]
    fn attach_to_other_device_fails() -> Result<()> {
        let mut x = mirrored(&Device::new())?;
        assert!(matches!(
            x.attach(&Device::new()),
            Err(Error::BackendUnavailable { .. })
        ));
        Ok(())
    }
}
