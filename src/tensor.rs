use crate::{
    error::{Error, Result},
    scalar::Scalar,
};
use ndarray::{ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4, Ix4};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Interface of several tensors concatenated along channels.
pub mod interface;
/// Tensors mirrored on the host and a device.
pub mod mirrored;

/// Pads or folds `dims` into `[x, y, z, b]`.
///
/// Missing dims are 1, trailing dims beyond the 4th are folded into the batch.
pub fn dims4(dims: &[usize]) -> [usize; 4] {
    let mut dims4 = [1; 4];
    for (i, d) in dims.iter().copied().enumerate() {
        if i < 4 {
            dims4[i] = d;
        } else {
            dims4[3] *= d;
        }
    }
    dims4
}

/// Multi-dimensional array on the host.
///
/// Dims are ordered from the fastest varying, ie `[width, height, channels, batch]` for
/// feature maps. Elements are stored contiguously, so the element at `(x, y, z, b)` is at
/// `((b * channels + z) * height + y) * width + x`.
///
/// The invariant `size == product(dims)` is maintained by every constructor and
/// [`.reshape()`](Tensor::reshape).
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T> {
    dims: Vec<usize>,
    data: Vec<T>,
}

impl<T: Scalar> Tensor<T> {
    /// Creates a tensor filled with `elem`.
    pub fn from_elem(dims: impl Into<Vec<usize>>, elem: T) -> Self {
        let dims = dims.into();
        let len = dims.iter().product();
        Self {
            dims,
            data: vec![elem; len],
        }
    }
    /// Creates a tensor filled with zeros.
    pub fn zeros(dims: impl Into<Vec<usize>>) -> Self {
        Self::from_elem(dims, T::zero())
    }
    /// Creates a tensor from `data`.
    ///
    /// **Errors**
    /// - The length of `data` is not the product of `dims`.
    pub fn from_vec(dims: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        let dims = dims.into();
        if dims.iter().product::<usize>() != data.len() {
            return Err(Error::InvalidShape {
                dims,
                len: data.len(),
            });
        }
        Ok(Self { dims, data })
    }
    /// Creates a tensor by converting each element of `data` from f64.
    ///
    /// **Errors**
    /// - The length of `data` is not the product of `dims`.
    pub fn from_f64s(dims: impl Into<Vec<usize>>, data: &[f64]) -> Result<Self> {
        Self::from_vec(dims, data.iter().map(|x| T::from_f64(*x)).collect())
    }
    /// The dims.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }
    /// The dims as `[x, y, z, b]`.
    pub fn dims4(&self) -> [usize; 4] {
        dims4(&self.dims)
    }
    /// The width.
    pub fn dim_x(&self) -> usize {
        self.dims4()[0]
    }
    /// The height.
    pub fn dim_y(&self) -> usize {
        self.dims4()[1]
    }
    /// The number of channels.
    pub fn dim_z(&self) -> usize {
        self.dims4()[2]
    }
    /// The batch size.
    pub fn dim_b(&self) -> usize {
        self.dims4()[3]
    }
    /// The number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }
    /// Whether the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    /// The elements.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
    /// The elements, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
    /// Moves the elements into a vec.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
    /// The elements as f64.
    pub fn to_f64s(&self) -> Vec<f64> {
        self.data.iter().map(|x| x.as_f64()).collect()
    }
    /// Changes the dims without moving elements.
    ///
    /// **Errors**
    /// - The product of `dims` is not the size of the tensor.
    pub fn reshape(&mut self, dims: impl Into<Vec<usize>>) -> Result<()> {
        let dims = dims.into();
        if dims.iter().product::<usize>() != self.data.len() {
            return Err(Error::InvalidShape {
                dims,
                len: self.data.len(),
            });
        }
        self.dims = dims;
        Ok(())
    }
    /// Resizes the tensor, filling with `elem`.
    ///
    /// Previous elements are discarded.
    pub fn resize(&mut self, dims: impl Into<Vec<usize>>, elem: T) {
        *self = Self::from_elem(dims, elem);
    }
    /// Fills the tensor with `elem`.
    pub fn fill(&mut self, elem: T) {
        self.data.iter_mut().for_each(|x| *x = elem);
    }
    /// Offset of the element `(x, y, z, b)`.
    pub fn offset4(&self, x: usize, y: usize, z: usize, b: usize) -> usize {
        let [dx, dy, dz, _] = self.dims4();
        ((b * dz + z) * dy + y) * dx + x
    }
    /// The element `(x, y, z, b)`.
    ///
    /// # Panics
    /// Panics if out of bounds.
    pub fn get4(&self, x: usize, y: usize, z: usize, b: usize) -> T {
        self.data[self.offset4(x, y, z, b)]
    }
    /// Sets the element `(x, y, z, b)`.
    ///
    /// # Panics
    /// Panics if out of bounds.
    pub fn set4(&mut self, x: usize, y: usize, z: usize, b: usize, elem: T) {
        let offset = self.offset4(x, y, z, b);
        self.data[offset] = elem;
    }
    /// A view with shape `(b, z, y, x)`.
    pub fn view4(&self) -> ArrayView4<T> {
        // The length is checked by every constructor.
        ArrayView4::from_shape(shape4(&self.dims), &self.data)
            .unwrap_or_else(|_| unreachable!("dims {:?} do not match the data", self.dims))
    }
    /// A mutable view with shape `(b, z, y, x)`.
    pub fn view4_mut(&mut self) -> ArrayViewMut4<T> {
        ArrayViewMut4::from_shape(shape4(&self.dims), &mut self.data)
            .unwrap_or_else(|_| unreachable!("dims {:?} do not match the data", self.dims))
    }
}

pub(crate) fn shape4(dims: &[usize]) -> Ix4 {
    let [x, y, z, b] = dims4(dims);
    ndarray::Dim([b, z, y, x])
}

fn invalid_shape(dims: &[usize], len: usize) -> Error {
    Error::InvalidShape {
        dims: dims.to_vec(),
        len,
    }
}

/// A view of `data` with shape `(b, z, y, x)`.
pub(crate) fn array_view4<'a, T>(dims: &[usize], data: &'a [T]) -> Result<ArrayView4<'a, T>> {
    ArrayView4::from_shape(shape4(dims), data).map_err(|_| invalid_shape(dims, data.len()))
}

/// A mutable view of `data` with shape `(b, z, y, x)`.
pub(crate) fn array_view4_mut<'a, T>(
    dims: &[usize],
    data: &'a mut [T],
) -> Result<ArrayViewMut4<'a, T>> {
    let len = data.len();
    ArrayViewMut4::from_shape(shape4(dims), data).map_err(|_| invalid_shape(dims, len))
}

/// A view of `data` with shape `(rows, cols)`.
pub(crate) fn array_view2<T>(rows: usize, cols: usize, data: &[T]) -> Result<ArrayView2<T>> {
    ArrayView2::from_shape((rows, cols), data).map_err(|_| invalid_shape(&[cols, rows], data.len()))
}

/// A mutable view of `data` with shape `(rows, cols)`.
pub(crate) fn array_view2_mut<T>(
    rows: usize,
    cols: usize,
    data: &mut [T],
) -> Result<ArrayViewMut2<T>> {
    let len = data.len();
    ArrayViewMut2::from_shape((rows, cols), data).map_err(|_| invalid_shape(&[cols, rows], len))
}

impl<T: Scalar> Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dims", &self.dims)
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_from_vec() -> Result<()> {
        let x = Tensor::<f32>::from_vec([2, 3], (0..6).map(|x| x as f32).collect())?;
        assert_eq!(x.dims(), &[2, 3]);
        assert_eq!(x.dims4(), [2, 3, 1, 1]);
        assert_eq!(x.size(), 6);
        assert!(matches!(
            Tensor::<f32>::from_vec([2, 3], vec![0.; 5]),
            Err(Error::InvalidShape { len: 5, .. })
        ));
        Ok(())
    }

    #[test]
    fn tensor_reshape_preserves_size() -> Result<()> {
        let mut x = Tensor::<f64>::zeros([4, 3, 2, 1]);
        x.reshape([1, 1, 24, 1])?;
        assert_eq!(x.dim_z(), 24);
        assert!(x.reshape([5, 5]).is_err());
        assert_eq!(x.dims(), &[1, 1, 24, 1]);
        Ok(())
    }

    #[test]
    fn tensor_view4_layout() -> Result<()> {
        let mut x = Tensor::<f32>::zeros([3, 2, 2, 2]);
        x.set4(2, 1, 1, 1, 7.);
        assert_eq!(x.as_slice()[x.size() - 1], 7.);
        assert_eq!(x.view4()[(1, 1, 1, 2)], 7.);
        x.view4_mut()[(0, 1, 0, 1)] = 3.;
        assert_eq!(x.get4(1, 0, 1, 0), 3.);
        Ok(())
    }

    #[test]
    fn dims4_folds_trailing_dims() {
        assert_eq!(dims4(&[]), [1, 1, 1, 1]);
        assert_eq!(dims4(&[5]), [5, 1, 1, 1]);
        assert_eq!(dims4(&[1, 2, 3, 4, 5]), [1, 2, 3, 20]);
    }
}
