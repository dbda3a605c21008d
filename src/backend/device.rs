use super::{blend, scale_array_by_beta, source_index};
use crate::{
    cell::{
        batch_norm::{BatchNormGradients, BatchNormKernel, BatchNormStats},
        conv::ConvKernel,
        fc::FcKernel,
        pool::{ArgMax, PoolKernel},
        proposal::{propose, ProposalDesc, ProposalKernel},
        BiasKernel, Geometry,
    },
    scalar::Scalar,
};
use ndarray::{
    linalg::general_mat_mul, s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3,
    ArrayView4, ArrayViewMut1, ArrayViewMut2, ArrayViewMut3, ArrayViewMut4, Axis, Zip,
};
use rayon::prelude::*;

/// Kernels over device memory.
///
/// Convolutions lower to im2col + GEMM, fully connected layers to GEMM, and the remaining
/// kernels split the batch or the channels across threads. Results match [`HostKernels`]
/// up to the order of floating point additions.
///
/// [`HostKernels`]: super::HostKernels
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceKernels;

/// `c = a . b + beta * c`.
fn gemm<T: Scalar>(a: ArrayView2<T>, b: ArrayView2<T>, beta: T, mut c: ArrayViewMut2<T>) {
    if beta == T::zero() {
        c.fill(T::zero());
    }
    general_mat_mul(T::one(), &a, &b, beta, &mut c);
}

/// Unfolds the windows of a `(channels, y, x)` feature map into columns
/// `(channels * ky * kx, out_y * out_x)`, with zeros in the padding.
fn im2col<T: Scalar>(
    inputs: ArrayView3<T>,
    geometry: &Geometry,
    [out_y, out_x]: [usize; 2],
) -> Array2<T> {
    let (nb_channels, in_y, in_x) = inputs.dim();
    let [kx, ky] = geometry.kernel;
    let [sx, sy] = geometry.stride;
    let [px, py] = geometry.padding;
    Array2::from_shape_fn((nb_channels * ky * kx, out_y * out_x), |(r, p)| {
        let (c, j, i) = (r / (ky * kx), r / kx % ky, r % kx);
        let (oy, ox) = (p / out_x, p % out_x);
        match (
            source_index(oy, j, sy, py, in_y),
            source_index(ox, i, sx, px, in_x),
        ) {
            (Some(iy), Some(ix)) => inputs[(c, iy, ix)],
            _ => T::zero(),
        }
    })
}

/// Adds the columns of [`im2col`] back into the feature map.
fn col2im<T: Scalar>(
    cols: ArrayView2<T>,
    geometry: &Geometry,
    out_x: usize,
    mut outputs: ArrayViewMut3<T>,
) {
    let (_, in_y, in_x) = outputs.dim();
    let [kx, ky] = geometry.kernel;
    let [sx, sy] = geometry.stride;
    let [px, py] = geometry.padding;
    for ((r, p), x) in cols.indexed_iter() {
        let (c, j, i) = (r / (ky * kx), r / kx % ky, r % kx);
        let (oy, ox) = (p / out_x, p % out_x);
        if let (Some(iy), Some(ix)) = (
            source_index(oy, j, sy, py, in_y),
            source_index(ox, i, sx, px, in_x),
        ) {
            let y = &mut outputs[(c, iy, ix)];
            *y = *y + *x;
        }
    }
}

/// The filters `(outputs, channels * ky * kx)`, zero where not connected.
fn masked_filters<T: Scalar>(weights: ArrayView4<T>, mapping: ArrayView2<bool>) -> Array2<T> {
    let (nb_outputs, nb_channels, ky, kx) = weights.dim();
    Array2::from_shape_fn((nb_outputs, nb_channels * ky * kx), |(o, r)| {
        let (c, j, i) = (r / (ky * kx), r / kx % ky, r % kx);
        if mapping[(c, o)] {
            weights[(o, c, j, i)]
        } else {
            T::zero()
        }
    })
}

/// A `(channels, y, x)` feature map as rows `(channels, y * x)`.
fn feature_rows<T: Scalar>(x: ArrayView3<T>) -> Array2<T> {
    let (nb_channels, y, w) = x.dim();
    Array2::from_shape_fn((nb_channels, y * w), |(c, p)| x[(c, p / w, p % w)])
}

impl<T: Scalar> BiasKernel<T> for DeviceKernels {
    fn add_bias(&self, bias: &[T], mut outputs: ArrayViewMut4<T>) {
        Zip::indexed(&mut outputs).par_for_each(|(_, o, _, _), y| *y = *y + bias[o]);
    }
    fn backward_bias(&self, diff_inputs: ArrayView4<T>, beta: T, diff_bias: &mut [T]) {
        let sums: Vec<T> = diff_inputs
            .axis_iter(Axis(1))
            .into_par_iter()
            .map(|dy| dy.iter().fold(T::zero(), |acc, dy| acc + *dy))
            .collect();
        for (db, sum) in diff_bias.iter_mut().zip(sums) {
            blend(db, sum, beta);
        }
    }
}

impl<T: Scalar> FcKernel<T> for DeviceKernels {
    fn forward(
        &self,
        inputs: ArrayView2<T>,
        weights: ArrayView2<T>,
        beta: T,
        outputs: ArrayViewMut2<T>,
    ) {
        gemm(inputs, weights.t(), beta, outputs);
    }
    fn backward_weights(
        &self,
        inputs: ArrayView2<T>,
        diff_inputs: ArrayView2<T>,
        beta: T,
        diff_weights: ArrayViewMut2<T>,
    ) {
        gemm(diff_inputs.t(), inputs, beta, diff_weights);
    }
    fn backward_data(
        &self,
        weights: ArrayView2<T>,
        diff_inputs: ArrayView2<T>,
        beta: T,
        diff_outputs: ArrayViewMut2<T>,
    ) {
        gemm(diff_inputs, weights, beta, diff_outputs);
    }
}

impl<T: Scalar> ConvKernel<T> for DeviceKernels {
    fn forward(
        &self,
        inputs: ArrayView4<T>,
        weights: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        geometry: &Geometry,
        beta: T,
        mut outputs: ArrayViewMut4<T>,
    ) {
        let (_, _, out_y, out_x) = outputs.dim();
        let filters = masked_filters(weights, mapping);
        outputs
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(inputs.axis_iter(Axis(0)))
            .for_each(|(mut y, x)| {
                let cols = im2col(x, geometry, [out_y, out_x]);
                let product = filters.dot(&cols);
                Zip::indexed(&mut y).for_each(|(o, oy, ox), y| {
                    blend(y, product[(o, oy * out_x + ox)], beta);
                });
            });
    }
    fn backward_data(
        &self,
        weights: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        geometry: &Geometry,
        diff_inputs: ArrayView4<T>,
        beta: T,
        mut diff_outputs: ArrayViewMut4<T>,
    ) {
        let (_, _, _, out_x) = diff_inputs.dim();
        let filters = masked_filters(weights, mapping);
        diff_outputs
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(diff_inputs.axis_iter(Axis(0)))
            .for_each(|(mut dx, dy)| {
                let cols = filters.t().dot(&feature_rows(dy));
                scale_array_by_beta(&mut dx, beta);
                col2im(cols.view(), geometry, out_x, dx);
            });
    }
    fn backward_filter(
        &self,
        inputs: ArrayView4<T>,
        diff_inputs: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        geometry: &Geometry,
        beta: T,
        mut diff_weights: ArrayViewMut4<T>,
    ) {
        let (nb, _, _, _) = inputs.dim();
        let (_, _, out_y, out_x) = diff_inputs.dim();
        let (nb_outputs, nb_channels, ky, kx) = diff_weights.dim();
        let grad = (0..nb)
            .into_par_iter()
            .map(|b| {
                let cols = im2col(inputs.index_axis(Axis(0), b), geometry, [out_y, out_x]);
                feature_rows(diff_inputs.index_axis(Axis(0), b)).dot(&cols.t())
            })
            .reduce(
                || Array2::zeros((nb_outputs, nb_channels * ky * kx)),
                |a, b| a + b,
            );
        Zip::indexed(&mut diff_weights).for_each(|(o, c, j, i), dw| {
            let x = if mapping[(c, o)] {
                grad[(o, (c * ky + j) * kx + i)]
            } else {
                T::zero()
            };
            blend(dw, x, beta);
        });
    }
}

/// Sums of each pooling window of each channel, `(batch, channels, out_y * out_x)`, and the
/// number of in-bounds elements of each window.
fn window_sums<T: Scalar>(
    inputs: ArrayView4<T>,
    geometry: &Geometry,
    [out_y, out_x]: [usize; 2],
) -> (Array3<T>, Vec<usize>) {
    let (batch_size, nb_channels, in_y, in_x) = inputs.dim();
    let windows: Vec<_> = (0..out_y * out_x)
        .map(|p| geometry.window([p % out_x, p / out_x], [in_x, in_y]))
        .collect();
    let mut sums = Array3::zeros((batch_size, nb_channels, out_y * out_x));
    Zip::indexed(&mut sums).par_for_each(|(b, c, p), y| {
        let [wx, wy] = windows[p].clone();
        *y = inputs.slice(s![b, c, wy, wx]).sum();
    });
    let sizes = windows.iter().map(|[wx, wy]| wx.len() * wy.len()).collect();
    (sums, sizes)
}

/// The mapping as a `(channels, outputs)` matrix of ones and zeros.
fn mapping_matrix<T: Scalar>(mapping: ArrayView2<bool>) -> Array2<T> {
    mapping.map(|connected| if *connected { T::one() } else { T::zero() })
}

/// The maximum of each pooling window of each channel, with its position. The first
/// maximum in (y, x) order wins.
fn window_maxima<T: Scalar>(
    inputs: ArrayView4<T>,
    geometry: &Geometry,
    [out_y, out_x]: [usize; 2],
) -> Array4<Option<(T, usize, usize)>> {
    let (batch_size, nb_channels, in_y, in_x) = inputs.dim();
    let mut maxima = Array4::from_elem((batch_size, nb_channels, out_y, out_x), None);
    Zip::indexed(&mut maxima).par_for_each(|(b, c, oy, ox), max| {
        let [wx, wy] = geometry.window([ox, oy], [in_x, in_y]);
        let window = inputs.slice(s![b, c, wy.clone(), wx.clone()]);
        *max = window
            .indexed_iter()
            .fold(None, |best: Option<(T, usize, usize)>, ((j, i), x)| {
                match best {
                    Some((m, _, _)) if *x <= m => best,
                    _ => Some((*x, wy.start + j, wx.start + i)),
                }
            });
    });
    maxima
}

impl<T: Scalar> PoolKernel<T> for DeviceKernels {
    fn forward_average(
        &self,
        inputs: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        counts: &[usize],
        geometry: &Geometry,
        beta: T,
        outputs: ArrayViewMut4<T>,
    ) {
        let (batch_size, nb_outputs, out_y, out_x) = outputs.dim();
        let (sums, sizes) = window_sums(inputs, geometry, [out_y, out_x]);
        let connections = mapping_matrix::<T>(mapping);
        let mut totals = Array3::zeros((batch_size, nb_outputs, out_y * out_x));
        for (sums, totals) in sums.outer_iter().zip(totals.outer_iter_mut()) {
            gemm(connections.t(), sums, T::zero(), totals);
        }
        Zip::indexed(outputs).par_for_each(|(b, o, oy, ox), y| {
            let p = oy * out_x + ox;
            let n = sizes[p] * counts[o];
            let x = if n == 0 {
                T::zero()
            } else {
                totals[(b, o, p)] / T::from_usize(n)
            };
            blend(y, x, beta);
        });
    }
    fn backward_average(
        &self,
        diff_inputs: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        counts: &[usize],
        geometry: &Geometry,
        beta: T,
        mut diff_outputs: ArrayViewMut4<T>,
    ) {
        let (batch_size, nb_outputs, out_y, out_x) = diff_inputs.dim();
        let (_, nb_channels, in_y, in_x) = diff_outputs.dim();
        let windows: Vec<_> = (0..out_y * out_x)
            .map(|p| geometry.window([p % out_x, p / out_x], [in_x, in_y]))
            .collect();
        let mut scaled = Array3::zeros((batch_size, nb_outputs, out_y * out_x));
        Zip::indexed(&mut scaled).par_for_each(|(b, o, p), g| {
            let [wx, wy] = &windows[p];
            let n = wx.len() * wy.len() * counts[o];
            if n > 0 {
                *g = diff_inputs[(b, o, p / out_x, p % out_x)] / T::from_usize(n);
            }
        });
        let connections = mapping_matrix::<T>(mapping);
        let mut grads = Array3::zeros((batch_size, nb_channels, out_y * out_x));
        for (scaled, grads) in scaled.outer_iter().zip(grads.outer_iter_mut()) {
            gemm(connections.view(), scaled, T::zero(), grads);
        }
        scale_array_by_beta(&mut diff_outputs, beta);
        diff_outputs
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(grads.axis_iter(Axis(0)))
            .for_each(|(mut dx, grads)| {
                for ((c, p), g) in grads.indexed_iter() {
                    let [wx, wy] = windows[p].clone();
                    dx.slice_mut(s![c, wy, wx])
                        .map_inplace(|dx| *dx = *dx + *g);
                }
            });
    }
    fn forward_max(
        &self,
        group: usize,
        inputs: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        geometry: &Geometry,
        beta: T,
        outputs: ArrayViewMut4<T>,
        argmax: ArrayViewMut4<ArgMax>,
    ) {
        let (_, _, out_y, out_x) = outputs.dim();
        let maxima = window_maxima(inputs, geometry, [out_y, out_x]);
        let nb_channels = maxima.dim().1;
        Zip::indexed(outputs)
            .and(argmax)
            .par_for_each(|(b, o, oy, ox), y, index| {
                let mut best: Option<(T, ArgMax)> = None;
                for channel in (0..nb_channels).filter(|c| mapping[(*c, o)]) {
                    if let Some((x, iy, ix)) = maxima[(b, channel, oy, ox)] {
                        if best.map_or(true, |(max, _)| x > max) {
                            let arg = ArgMax {
                                group,
                                channel,
                                iy,
                                ix,
                                valid: true,
                            };
                            best = Some((x, arg));
                        }
                    }
                }
                if beta == T::zero() {
                    let (x, arg) = best.unwrap_or_default();
                    *y = x;
                    *index = arg;
                } else if let Some((x, arg)) = best {
                    if !index.valid || x > *y {
                        *y = x;
                        *index = arg;
                    }
                }
            });
    }
    fn backward_max(
        &self,
        group: usize,
        diff_inputs: ArrayView4<T>,
        argmax: ArrayView4<ArgMax>,
        beta: T,
        mut diff_outputs: ArrayViewMut4<T>,
    ) {
        scale_array_by_beta(&mut diff_outputs, beta);
        diff_outputs
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(diff_inputs.axis_iter(Axis(0)))
            .zip(argmax.axis_iter(Axis(0)))
            .for_each(|((mut dx, dy), argmax)| {
                for (channel, mut dx) in dx.outer_iter_mut().enumerate() {
                    let routes = dy.iter().zip(argmax.iter()).filter(|(_, index)| {
                        index.valid && index.group == group && index.channel == channel
                    });
                    for (dy, index) in routes {
                        let dx = &mut dx[(index.iy, index.ix)];
                        *dx = *dx + *dy;
                    }
                }
            });
    }
}

/// Sum over the batch and spatial axes of a `(batch, channels, y, x)` array.
fn channel_sums(x: &Array4<f64>) -> Array1<f64> {
    x.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0))
}

/// A per channel vector broadcastable against `(batch, channels, y, x)`.
fn per_channel(x: &Array1<f64>) -> ArrayView4<f64> {
    x.view()
        .insert_axis(Axis(0))
        .insert_axis(Axis(2))
        .insert_axis(Axis(3))
}

fn to_f64<T: Scalar>(x: &[T]) -> Array1<f64> {
    x.iter().map(|x| x.as_f64()).collect()
}

/// `scale * (x - mean) / sqrt(variance + epsilon) + bias` over the whole tensor.
fn normalize<T: Scalar>(
    x: &Array4<f64>,
    [scale, bias, mean, variance]: [&Array1<f64>; 4],
    epsilon: f64,
    outputs: ArrayViewMut4<T>,
) {
    let inv_std = variance.mapv(|v| 1. / (v + epsilon).sqrt());
    let y = (x - &per_channel(mean)) * &per_channel(&(scale * &inv_std)) + &per_channel(bias);
    Zip::from(outputs)
        .and(&y)
        .par_for_each(|y, x| *y = T::from_f64(*x));
}

impl<T: Scalar> BatchNormKernel<T> for DeviceKernels {
    fn forward_inference(
        &self,
        inputs: ArrayView4<T>,
        scale: &[T],
        bias: &[T],
        mean: &[T],
        variance: &[T],
        epsilon: f64,
        outputs: ArrayViewMut4<T>,
    ) {
        let x = inputs.mapv(|x| x.as_f64());
        let moments = [scale, bias, mean, variance].map(to_f64);
        normalize(&x, [&moments[0], &moments[1], &moments[2], &moments[3]], epsilon, outputs);
    }
    fn forward_training(
        &self,
        inputs: ArrayView4<T>,
        scale: &[T],
        bias: &[T],
        epsilon: f64,
        momentum: f64,
        stats: BatchNormStats<T>,
        outputs: ArrayViewMut4<T>,
    ) {
        let x = inputs.mapv(|x| x.as_f64());
        let n = (x.len() / scale.len().max(1)).max(1) as f64;
        let mean = channel_sums(&x) / n;
        let centered = &x - &per_channel(&mean);
        let variance = channel_sums(&centered.mapv(|x| x * x)) / n;
        normalize(&x, [&to_f64(scale), &to_f64(bias), &mean, &variance], epsilon, outputs);
        let BatchNormStats {
            running_mean,
            running_variance,
            saved_mean,
            saved_variance,
        } = stats;
        for (running, batch) in [(running_mean, &mean), (running_variance, &variance)] {
            Zip::from(ArrayViewMut1::from(running))
                .and(batch)
                .for_each(|r, x| *r = T::from_f64(momentum * r.as_f64() + (1. - momentum) * *x));
        }
        for (saved, batch) in [(saved_mean, &mean), (saved_variance, &variance)] {
            Zip::from(ArrayViewMut1::from(saved))
                .and(batch)
                .for_each(|s, x| *s = T::from_f64(*x));
        }
    }
    fn backward(
        &self,
        inputs: ArrayView4<T>,
        diff_inputs: ArrayView4<T>,
        scale: &[T],
        saved_mean: &[T],
        saved_variance: &[T],
        epsilon: f64,
        gradients: BatchNormGradients<T>,
    ) {
        let BatchNormGradients {
            beta,
            scale: diff_scale,
            bias: diff_bias,
            data,
        } = gradients;
        let x = inputs.mapv(|x| x.as_f64());
        let dy = diff_inputs.mapv(|x| x.as_f64());
        let n = (x.len() / scale.len().max(1)).max(1) as f64;
        let inv_std = to_f64(saved_variance).mapv(|v| 1. / (v + epsilon).sqrt());
        let xhat = (&x - &per_channel(&to_f64(saved_mean))) * &per_channel(&inv_std);
        let dbias = channel_sums(&dy);
        let dscale = channel_sums(&(&dy * &xhat));
        for (diff, grad) in [(diff_scale, &dscale), (diff_bias, &dbias)] {
            Zip::from(ArrayViewMut1::from(diff))
                .and(grad)
                .for_each(|d, g| blend(d, T::from_f64(*g), beta));
        }
        if let Some((data_beta, diff_outputs)) = data {
            let factor = to_f64(scale) * &inv_std / n;
            let dx = (&dy * n - &per_channel(&dbias) - &xhat * &per_channel(&dscale))
                * &per_channel(&factor);
            Zip::from(diff_outputs)
                .and(&dx)
                .par_for_each(|y, x| blend(y, T::from_f64(*x), data_beta));
        }
    }
}

impl<T: Scalar> ProposalKernel<T> for DeviceKernels {
    fn forward(
        &self,
        desc: &ProposalDesc,
        rois: ArrayView4<T>,
        scores: ArrayView4<T>,
        deltas: ArrayView4<T>,
        mut outputs: ArrayViewMut4<T>,
    ) {
        outputs
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, y)| {
                propose(
                    desc,
                    rois.index_axis(Axis(0), b),
                    scores.index_axis(Axis(0), b),
                    deltas.index_axis(Axis(0), b),
                    y,
                );
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostKernels;
    use approx::assert_relative_eq;
    use ndarray::{Array, Array4, Dimension, ShapeBuilder};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random<D: Dimension>(rng: &mut StdRng, shape: impl ShapeBuilder<Dim = D>) -> Array<f64, D> {
        Array::from_shape_simple_fn(shape, || rng.gen_range(-1. ..1.))
    }

    fn assert_arrays_eq<D: Dimension>(a: &Array<f64, D>, b: &Array<f64, D>) {
        assert_eq!(a.shape(), b.shape());
        for (a, b) in a.iter().zip(b) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    fn partial_mapping() -> Array2<bool> {
        Array2::from_shape_fn((3, 4), |(c, o)| (c + o) % 3 != 0)
    }

    #[test]
    fn conv_device_matches_host() {
        let mut rng = StdRng::seed_from_u64(0);
        let geometry = Geometry {
            kernel: [3, 2],
            stride: [2, 1],
            padding: [1, 1],
        };
        let mapping = partial_mapping();
        let x = random(&mut rng, (2, 3, 5, 6));
        let w = random(&mut rng, (4, 3, 2, 3));
        let dy = random(&mut rng, (2, 4, 6, 3));
        let start = random(&mut rng, (2, 4, 6, 3));
        for beta in [0., 1.] {
            let mut host = start.clone();
            let mut device = start.clone();
            ConvKernel::forward(&HostKernels, x.view(), w.view(), mapping.view(), &geometry, beta, host.view_mut());
            ConvKernel::forward(&DeviceKernels, x.view(), w.view(), mapping.view(), &geometry, beta, device.view_mut());
            assert_arrays_eq(&host, &device);
        }
        let mut host = Array4::from_elem(x.dim(), f64::NAN);
        let mut device = host.clone();
        ConvKernel::backward_data(&HostKernels, w.view(), mapping.view(), &geometry, dy.view(), 0., host.view_mut());
        ConvKernel::backward_data(&DeviceKernels, w.view(), mapping.view(), &geometry, dy.view(), 0., device.view_mut());
        assert_arrays_eq(&host, &device);
        let mut host = Array4::from_elem(w.dim(), f64::NAN);
        let mut device = host.clone();
        HostKernels.backward_filter(x.view(), dy.view(), mapping.view(), &geometry, 0., host.view_mut());
        DeviceKernels.backward_filter(x.view(), dy.view(), mapping.view(), &geometry, 0., device.view_mut());
        assert_arrays_eq(&host, &device);
        assert_eq!(device[(0, 0, 0, 0)], 0.);
    }

    #[test]
    fn fc_device_matches_host() {
        let mut rng = StdRng::seed_from_u64(1);
        let x = random(&mut rng, (3, 5));
        let w = random(&mut rng, (2, 5));
        let dy = random(&mut rng, (3, 2));
        let mut host = Array2::from_elem((3, 2), f64::NAN);
        let mut device = host.clone();
        FcKernel::forward(&HostKernels, x.view(), w.view(), 0., host.view_mut());
        FcKernel::forward(&DeviceKernels, x.view(), w.view(), 0., device.view_mut());
        assert_arrays_eq(&host, &device);
        let mut host = random(&mut rng, (2, 5));
        let mut device = host.clone();
        HostKernels.backward_weights(x.view(), dy.view(), 1., host.view_mut());
        DeviceKernels.backward_weights(x.view(), dy.view(), 1., device.view_mut());
        assert_arrays_eq(&host, &device);
        let mut host = Array2::zeros((3, 5));
        let mut device = host.clone();
        FcKernel::backward_data(&HostKernels, w.view(), dy.view(), 0., host.view_mut());
        FcKernel::backward_data(&DeviceKernels, w.view(), dy.view(), 0., device.view_mut());
        assert_arrays_eq(&host, &device);
    }

    #[test]
    fn batch_norm_device_matches_host() {
        let mut rng = StdRng::seed_from_u64(2);
        let x = random(&mut rng, (4, 3, 2, 2));
        let dy = random(&mut rng, (4, 3, 2, 2));
        let scale = [1., 0.5, 2.];
        let bias = [0., 1., -1.];
        let train = |kernel: &dyn BatchNormKernel<f64>| {
            let mut y = Array4::zeros(x.dim());
            let mut running = ([0.; 3], [1.; 3]);
            let mut saved = ([0.; 3], [0.; 3]);
            let stats = BatchNormStats {
                running_mean: &mut running.0,
                running_variance: &mut running.1,
                saved_mean: &mut saved.0,
                saved_variance: &mut saved.1,
            };
            kernel.forward_training(x.view(), &scale, &bias, 1e-5, 0.9, stats, y.view_mut());
            let mut grads = ([0.; 3], [0.; 3]);
            let mut dx = Array4::zeros(x.dim());
            let gradients = BatchNormGradients {
                beta: 0.,
                scale: &mut grads.0,
                bias: &mut grads.1,
                data: Some((0., dx.view_mut())),
            };
            kernel.backward(x.view(), dy.view(), &scale, &saved.0, &saved.1, 1e-5, gradients);
            (y, running, grads, dx)
        };
        let host = train(&HostKernels);
        let device = train(&DeviceKernels);
        assert_arrays_eq(&host.0, &device.0);
        assert_eq!(host.1, device.1);
        let (host_grads, device_grads) = (host.2, device.2);
        for (a, b) in host_grads.0.iter().zip(&device_grads.0) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        for (a, b) in host_grads.1.iter().zip(&device_grads.1) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        assert_arrays_eq(&host.3, &device.3);
    }

    #[test]
    fn pool_device_matches_host() {
        let mut rng = StdRng::seed_from_u64(3);
        let geometry = Geometry {
            kernel: [2, 2],
            stride: [2, 2],
            padding: [1, 0],
        };
        let mapping = partial_mapping();
        let counts: Vec<usize> = (0..4)
            .map(|o| (0..3).filter(|c| mapping[(*c, o)]).count())
            .collect();
        let x = random(&mut rng, (2, 3, 4, 5));
        let dy = random(&mut rng, (2, 4, 2, 3));
        let mut host = Array4::zeros((2, 4, 2, 3));
        let mut device = host.clone();
        HostKernels.forward_average(x.view(), mapping.view(), &counts, &geometry, 0., host.view_mut());
        DeviceKernels.forward_average(x.view(), mapping.view(), &counts, &geometry, 0., device.view_mut());
        assert_arrays_eq(&host, &device);
        let mut host_argmax = Array4::default((2, 4, 2, 3));
        let mut device_argmax = host_argmax.clone();
        HostKernels.forward_max(0, x.view(), mapping.view(), &geometry, 0., host.view_mut(), host_argmax.view_mut());
        DeviceKernels.forward_max(0, x.view(), mapping.view(), &geometry, 0., device.view_mut(), device_argmax.view_mut());
        assert_arrays_eq(&host, &device);
        assert_eq!(host_argmax, device_argmax);
        let mut host = Array4::zeros(x.dim());
        let mut device = host.clone();
        HostKernels.backward_max(0, dy.view(), host_argmax.view(), 0., host.view_mut());
        DeviceKernels.backward_max(0, dy.view(), device_argmax.view(), 0., device.view_mut());
        assert_arrays_eq(&host, &device);
        let start = random(&mut rng, x.dim());
        let mut host = start.clone();
        let mut device = start;
        HostKernels.backward_average(dy.view(), mapping.view(), &counts, &geometry, 1., host.view_mut());
        DeviceKernels.backward_average(dy.view(), mapping.view(), &counts, &geometry, 1., device.view_mut());
        assert_arrays_eq(&host, &device);
    }

    #[test]
    fn max_pool_device_accumulates_groups() {
        let mut rng = StdRng::seed_from_u64(4);
        let geometry = Geometry {
            kernel: [3, 3],
            stride: [1, 1],
            padding: [1, 1],
        };
        let mapping = Array2::from_elem((2, 2), true);
        let first = random(&mut rng, (1, 2, 3, 3));
        let second = random(&mut rng, (1, 2, 3, 3));
        let dy = random(&mut rng, (1, 2, 3, 3));
        let run = |kernel: &dyn PoolKernel<f64>| {
            let mut y = Array4::zeros((1, 2, 3, 3));
            let mut argmax = Array4::default((1, 2, 3, 3));
            kernel.forward_max(0, first.view(), mapping.view(), &geometry, 0., y.view_mut(), argmax.view_mut());
            kernel.forward_max(1, second.view(), mapping.view(), &geometry, 1., y.view_mut(), argmax.view_mut());
            let mut dx = Array4::from_elem((1, 2, 3, 3), 1.);
            kernel.backward_max(1, dy.view(), argmax.view(), 1., dx.view_mut());
            (y, argmax, dx)
        };
        let (host_y, host_argmax, host_dx) = run(&HostKernels);
        let (device_y, device_argmax, device_dx) = run(&DeviceKernels);
        assert_arrays_eq(&host_y, &device_y);
        assert_eq!(host_argmax, device_argmax);
        assert_arrays_eq(&host_dx, &device_dx);
    }
}
