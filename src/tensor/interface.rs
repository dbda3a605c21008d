use super::mirrored::SharedTensor;
use crate::{
    error::{Error, Result},
    scalar::Scalar,
};
use std::{fmt, ops::Range, sync::Arc};

/// A tensor of an [`Interface`].
pub struct InterfaceEntry<T: Scalar> {
    tensor: SharedTensor<T>,
    channels: Range<usize>,
    offset: usize,
}

impl<T: Scalar> InterfaceEntry<T> {
    pub(crate) fn new(tensor: SharedTensor<T>, channels: Range<usize>, offset: usize) -> Self {
        Self {
            tensor,
            channels,
            offset,
        }
    }
    /// The shared tensor.
    pub fn tensor(&self) -> &SharedTensor<T> {
        &self.tensor
    }
    /// The channels of the tensor that belong to the interface.
    pub fn channels(&self) -> Range<usize> {
        self.channels.clone()
    }
    /// The number of channels.
    pub fn dim_z(&self) -> usize {
        self.channels.len()
    }
    /// Whether the entry covers every channel of the tensor.
    pub fn is_full(&self) -> bool {
        self.channels.start == 0 && self.channels.end == self.tensor.read().dims4()[2]
    }
    /// The offset of the first channel in the interface.
    pub fn offset(&self) -> usize {
        self.offset
    }
    /// The dims of the entry, ie the tensor dims restricted to the channels.
    pub fn dims4(&self) -> [usize; 4] {
        let [x, y, _, b] = self.tensor.read().dims4();
        [x, y, self.channels.len(), b]
    }
}

impl<T: Scalar> Clone for InterfaceEntry<T> {
    fn clone(&self) -> Self {
        Self {
            tensor: self.tensor.clone(),
            channels: self.channels.clone(),
            offset: self.offset,
        }
    }
}

impl<T: Scalar> fmt::Debug for InterfaceEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InterfaceEntry")
            .field("dims", &self.tensor.read().dims())
            .field("channels", &self.channels)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Tensors concatenated along the channel dimension.
///
/// Entries alias their tensors, restricting them to a range of channels without copying. Each
/// entry is assigned the next offset in the logical concatenated channel dimension, so offsets
/// are increasing and the ranges never overlap.
pub struct Interface<T: Scalar> {
    entries: Vec<InterfaceEntry<T>>,
}

impl<T: Scalar> Interface<T> {
    /// An empty interface.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
    /// Appends `tensor`, restricted to `channels` if provided.
    ///
    /// **Errors**
    /// - `channels` is empty or out of bounds.
    pub fn push(&mut self, tensor: SharedTensor<T>, channels: Option<Range<usize>>) -> Result<()> {
        let dims = tensor.read().dims4();
        let channels = channels.unwrap_or(0..dims[2]);
        if channels.is_empty() || channels.end > dims[2] {
            return Err(Error::InvalidParameter {
                name: "channels".into(),
                reason: format!("range {channels:?} is invalid for a tensor with dims {dims:?}"),
            });
        }
        let offset = self.dim_z();
        self.entries.push(InterfaceEntry {
            tensor,
            channels,
            offset,
        });
        Ok(())
    }
    pub(crate) fn pop(&mut self) -> Option<InterfaceEntry<T>> {
        self.entries.pop()
    }
    /// The number of tensors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Whether there are no tensors.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// The entry at `index`.
    pub fn get(&self, index: usize) -> Option<&InterfaceEntry<T>> {
        self.entries.get(index)
    }
    /// Iterates over the entries.
    pub fn iter(&self) -> std::slice::Iter<InterfaceEntry<T>> {
        self.entries.iter()
    }
    /// The total number of channels.
    pub fn dim_z(&self) -> usize {
        self.entries.last().map_or(0, |e| e.offset + e.dim_z())
    }
    /// The batch size, from the first entry.
    pub fn dim_b(&self) -> usize {
        self.entries.first().map_or(0, |e| e.dims4()[3])
    }
    /// The total number of elements per batch item.
    pub fn data_size(&self) -> usize {
        self.entries
            .iter()
            .map(|e| {
                let [x, y, z, _] = e.dims4();
                x * y * z
            })
            .sum()
    }
    /// Resolves the entry owning the global `channel`.
    ///
    /// Returns the index of the entry and the channel within the entry, counted from the start
    /// of its channel range.
    pub fn entry_channel(&self, channel: usize) -> Option<(usize, usize)> {
        let index = self
            .entries
            .partition_point(|e| e.offset + e.dim_z() <= channel);
        let entry = self.entries.get(index)?;
        (channel >= entry.offset).then(|| (index, channel - entry.offset))
    }
    /// Resolves the tensor owning the global `channel`.
    ///
    /// Returns the index of the entry and the channel within its tensor.
    pub fn get_tensor(&self, channel: usize) -> Option<(usize, usize)> {
        let (index, local) = self.entry_channel(channel)?;
        Some((index, self.entries[index].channels.start + local))
    }
    /// Whether `tensor` is already part of the interface.
    pub fn contains(&self, tensor: &SharedTensor<T>) -> bool {
        self.entries.iter().any(|e| Arc::ptr_eq(&e.tensor, tensor))
    }
}

impl<T: Scalar> Default for Interface<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar> Clone for Interface<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T: Scalar> fmt::Debug for Interface<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

impl<'a, T: Scalar> IntoIterator for &'a Interface<T> {
    type Item = &'a InterfaceEntry<T>;
    type IntoIter = std::slice::Iter<'a, InterfaceEntry<T>>;
    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::mirrored::MirroredTensor;

    #[test]
    fn interface_offsets() -> Result<()> {
        let mut interface = Interface::<f32>::new();
        interface.push(MirroredTensor::zeros([2, 2, 3, 1]).into_shared(), None)?;
        interface.push(MirroredTensor::zeros([2, 2, 5, 1]).into_shared(), Some(1..3))?;
        interface.push(MirroredTensor::zeros([2, 2, 1, 1]).into_shared(), None)?;
        assert_eq!(interface.dim_z(), 6);
        assert_eq!(interface.data_size(), 24);
        let offsets: Vec<_> = interface.iter().map(|e| e.offset()).collect();
        assert_eq!(offsets, [0, 3, 5]);
        assert_eq!(interface.get_tensor(0), Some((0, 0)));
        assert_eq!(interface.get_tensor(2), Some((0, 2)));
        assert_eq!(interface.get_tensor(3), Some((1, 1)));
        assert_eq!(interface.get_tensor(4), Some((1, 2)));
        assert_eq!(interface.entry_channel(3), Some((1, 0)));
        assert_eq!(interface.entry_channel(4), Some((1, 1)));
        assert_eq!(interface.entry_channel(6), None);
        assert_eq!(interface.get_tensor(5), Some((2, 0)));
        assert_eq!(interface.get_tensor(6), None);
        assert!(!interface.get(1).map_or(true, |e| e.is_full()));
        Ok(())
    }

    #[test]
    fn interface_rejects_bad_range() {
        let mut interface = Interface::<f32>::new();
        let tensor = MirroredTensor::zeros([1, 1, 2, 1]).into_shared();
        assert!(interface.push(tensor.clone(), Some(1..3)).is_err());
        assert!(interface.push(tensor, Some(1..1)).is_err());
        assert!(interface.is_empty());
    }

    #[test]
    fn interface_aliases_tensors() -> Result<()> {
        let tensor = MirroredTensor::<f32>::zeros([1, 1, 2, 1]).into_shared();
        let mut interface = Interface::new();
        interface.push(tensor.clone(), None)?;
        tensor.write().host_mut().fill(3.);
        let entry = interface.get(0).map(|e| e.tensor().clone());
        assert_eq!(
            entry.map(|t| t.write().host().as_slice().to_vec()),
            Some(vec![3., 3.])
        );
        assert!(interface.contains(&tensor));
        Ok(())
    }
}
