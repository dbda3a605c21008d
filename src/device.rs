/*!
Device memory domain.

A [`Device`] owns memory that is separate from the host. [`DeviceBuffer`]s are allocated from
it and released when dropped, so an error part way through allocating the buffers of a cell
never leaks device memory. Transfers between host and device are explicit and blocking, and
are counted so that redundant synchronization can be observed.

Storage is a [`krnl`] buffer of 64 bit words on the krnl host device, viewed as `T` with
[`bytemuck`]. The word size covers the alignment of every [`Scalar`].

Device kernels (see [`backend::device`](crate::backend::device)) only operate on device
buffers. The host never reads device memory except through [`DeviceBuffer::copy_to_host`].
*/
use crate::{
    error::{Error, Result},
    scalar::Scalar,
};
use krnl::buffer::Buffer;
use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    mem::size_of,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Device builders.
pub mod builders {
    use super::*;

    /// A builder for creating a [`Device`].
    ///
    /// See [`Device::builder()`].
    #[derive(Debug, Default)]
    pub struct DeviceBuilder {
        index: usize,
        memory_limit: Option<usize>,
    }

    impl DeviceBuilder {
        pub(super) fn new() -> Self {
            Self::default()
        }
        /// Index of the device. Default is 0.
        pub fn index(self, index: usize) -> Self {
            Self { index, ..self }
        }
        /// Maximum number of bytes that can be allocated at once. Default is unlimited.
        pub fn memory_limit(self, bytes: usize) -> Self {
            Self {
                memory_limit: Some(bytes),
                ..self
            }
        }
        /// Builds the device.
        pub fn build(self) -> Device {
            let Self {
                index,
                memory_limit,
            } = self;
            Device {
                inner: Arc::new(DeviceInner {
                    index,
                    memory_limit,
                    allocated: AtomicUsize::default(),
                    buffers: AtomicUsize::default(),
                    uploads: AtomicUsize::default(),
                    downloads: AtomicUsize::default(),
                }),
            }
        }
    }
}
use builders::DeviceBuilder;

struct DeviceInner {
    index: usize,
    memory_limit: Option<usize>,
    allocated: AtomicUsize,
    buffers: AtomicUsize,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
}

/// A compute device.
///
/// Cheap to clone, clones refer to the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Creates device 0 without a memory limit.
    pub fn new() -> Self {
        Self::builder().build()
    }
    /// A builder for creating a device.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::new()
    }
    /// The device index.
    pub fn index(&self) -> usize {
        self.inner.index
    }
    /// Memory and transfer statistics.
    pub fn info(&self) -> DeviceInfo {
        let inner = &self.inner;
        DeviceInfo {
            index: inner.index,
            allocated: inner.allocated.load(Ordering::SeqCst),
            buffers: inner.buffers.load(Ordering::SeqCst),
            uploads: inner.uploads.load(Ordering::SeqCst),
            downloads: inner.downloads.load(Ordering::SeqCst),
        }
    }
    fn alloc(&self, bytes: usize) -> Result<()> {
        let inner = &self.inner;
        let mut allocated = inner.allocated.load(Ordering::SeqCst);
        loop {
            if let Some(limit) = inner.memory_limit {
                if allocated + bytes > limit {
                    return Err(Error::DeviceOutOfMemory {
                        index: inner.index,
                        requested: bytes,
                        available: limit.saturating_sub(allocated),
                    });
                }
            }
            match inner.allocated.compare_exchange(
                allocated,
                allocated + bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => allocated = current,
            }
        }
        inner.buffers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn dealloc(&self, bytes: usize) {
        self.inner.allocated.fetch_sub(bytes, Ordering::SeqCst);
        self.inner.buffers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Device({})", self.inner.index)
    }
}

/// Device statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The device index.
    pub index: usize,
    /// Bytes currently allocated.
    pub allocated: usize,
    /// Number of live buffers.
    pub buffers: usize,
    /// Number of host to device copies.
    pub uploads: usize,
    /// Number of device to host copies.
    pub downloads: usize,
}

/// A buffer in device memory.
pub struct DeviceBuffer<T: Scalar> {
    device: Device,
    storage: Buffer<u64>,
    len: usize,
    _m: PhantomData<T>,
}

impl<T: Scalar> DeviceBuffer<T> {
    /// Allocates a zeroed buffer with `len` elements.
    ///
    /// **Errors**
    /// - The device is out of memory.
    pub fn zeros(device: &Device, len: usize) -> Result<Self> {
        let bytes = len * size_of::<T>();
        device.alloc(bytes)?;
        let words = (bytes + size_of::<u64>() - 1) / size_of::<u64>();
        let storage = Buffer::from(vec![0u64; words]);
        Ok(Self {
            device: device.clone(),
            storage,
            len,
            _m: PhantomData,
        })
    }
    /// Allocates a buffer and copies `slice` into it.
    ///
    /// **Errors**
    /// - The device is out of memory.
    pub fn from_host(device: &Device, slice: &[T]) -> Result<Self> {
        let mut buffer = Self::zeros(device, slice.len())?;
        buffer.copy_from_host(slice);
        Ok(buffer)
    }
    /// The device.
    pub fn device(&self) -> &Device {
        &self.device
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.len
    }
    /// Whether the buffer has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// Copies `slice` from the host.
    ///
    /// Blocks until the copy is finished.
    ///
    /// # Panics
    /// Panics if the lengths are not equal.
    pub fn copy_from_host(&mut self, slice: &[T]) {
        self.as_slice_mut().copy_from_slice(slice);
        self.device.inner.uploads.fetch_add(1, Ordering::SeqCst);
    }
    /// Copies the buffer to `slice` on the host.
    ///
    /// Blocks until the copy is finished.
    ///
    /// # Panics
    /// Panics if the lengths are not equal.
    pub fn copy_to_host(&self, slice: &mut [T]) {
        slice.copy_from_slice(self.as_slice());
        self.device.inner.downloads.fetch_add(1, Ordering::SeqCst);
    }
    /// Fills the buffer with `elem` on the device.
    pub fn fill(&mut self, elem: T) {
        self.as_slice_mut().iter_mut().for_each(|x| *x = elem);
    }
    pub(crate) fn as_slice(&self) -> &[T] {
        let words = self.storage.as_host_slice().unwrap_or_default();
        &bytemuck::cast_slice(words)[..self.len]
    }
    pub(crate) fn as_slice_mut(&mut self) -> &mut [T] {
        let len = self.len;
        let words = self.storage.as_host_slice_mut().unwrap_or_default();
        &mut bytemuck::cast_slice_mut(words)[..len]
    }
}

impl<T: Scalar> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.device.dealloc(self.len * size_of::<T>());
    }
}

impl<T: Scalar> Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device)
            .field("len", &self.len())
            .finish()
    }
}
