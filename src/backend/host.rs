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
    ArrayView2, ArrayView3, ArrayView4, ArrayViewMut2, ArrayViewMut3, ArrayViewMut4, Axis,
};

/// Reference kernels over host memory.
///
/// Every output element is computed by a plain loop over its inputs, in a fixed order.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostKernels;

impl<T: Scalar> BiasKernel<T> for HostKernels {
    fn add_bias(&self, bias: &[T], mut outputs: ArrayViewMut4<T>) {
        for ((_, o, _, _), y) in outputs.indexed_iter_mut() {
            *y = *y + bias[o];
        }
    }
    fn backward_bias(&self, diff_inputs: ArrayView4<T>, beta: T, diff_bias: &mut [T]) {
        for (o, db) in diff_bias.iter_mut().enumerate() {
            let sum = diff_inputs
                .index_axis(Axis(1), o)
                .iter()
                .fold(T::zero(), |acc, dy| acc + *dy);
            blend(db, sum, beta);
        }
    }
}

impl<T: Scalar> FcKernel<T> for HostKernels {
    fn forward(
        &self,
        inputs: ArrayView2<T>,
        weights: ArrayView2<T>,
        beta: T,
        mut outputs: ArrayViewMut2<T>,
    ) {
        for ((b, o), y) in outputs.indexed_iter_mut() {
            let mut acc = T::zero();
            for (x, w) in inputs.row(b).iter().zip(weights.row(o)) {
                acc = acc + *x * *w;
            }
            blend(y, acc, beta);
        }
    }
    fn backward_weights(
        &self,
        inputs: ArrayView2<T>,
        diff_inputs: ArrayView2<T>,
        beta: T,
        mut diff_weights: ArrayViewMut2<T>,
    ) {
        for ((o, i), dw) in diff_weights.indexed_iter_mut() {
            let mut acc = T::zero();
            for (x, dy) in inputs.column(i).iter().zip(diff_inputs.column(o)) {
                acc = acc + *x * *dy;
            }
            blend(dw, acc, beta);
        }
    }
    fn backward_data(
        &self,
        weights: ArrayView2<T>,
        diff_inputs: ArrayView2<T>,
        beta: T,
        mut diff_outputs: ArrayViewMut2<T>,
    ) {
        for ((b, i), dx) in diff_outputs.indexed_iter_mut() {
            let mut acc = T::zero();
            for (dy, w) in diff_inputs.row(b).iter().zip(weights.column(i)) {
                acc = acc + *dy * *w;
            }
            blend(dx, acc, beta);
        }
    }
}

impl<T: Scalar> ConvKernel<T> for HostKernels {
    fn forward(
        &self,
        inputs: ArrayView4<T>,
        weights: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        geometry: &Geometry,
        beta: T,
        mut outputs: ArrayViewMut4<T>,
    ) {
        let (_, nb_channels, in_y, in_x) = inputs.dim();
        let [kx, ky] = geometry.kernel;
        let [sx, sy] = geometry.stride;
        let [px, py] = geometry.padding;
        for ((b, o, oy, ox), y) in outputs.indexed_iter_mut() {
            let mut acc = T::zero();
            for c in (0..nb_channels).filter(|c| mapping[(*c, o)]) {
                for j in 0..ky {
                    let Some(iy) = source_index(oy, j, sy, py, in_y) else {
                        continue;
                    };
                    for i in 0..kx {
                        if let Some(ix) = source_index(ox, i, sx, px, in_x) {
                            acc = acc + weights[(o, c, j, i)] * inputs[(b, c, iy, ix)];
                        }
                    }
                }
            }
            blend(y, acc, beta);
        }
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
        let (_, nb_channels, in_y, in_x) = diff_outputs.dim();
        let [kx, ky] = geometry.kernel;
        let [sx, sy] = geometry.stride;
        let [px, py] = geometry.padding;
        scale_array_by_beta(&mut diff_outputs, beta);
        for ((b, o, oy, ox), dy) in diff_inputs.indexed_iter() {
            for c in (0..nb_channels).filter(|c| mapping[(*c, o)]) {
                for j in 0..ky {
                    let Some(iy) = source_index(oy, j, sy, py, in_y) else {
                        continue;
                    };
                    for i in 0..kx {
                        if let Some(ix) = source_index(ox, i, sx, px, in_x) {
                            let dx = &mut diff_outputs[(b, c, iy, ix)];
                            *dx = *dx + weights[(o, c, j, i)] * *dy;
                        }
                    }
                }
            }
        }
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
        let (nb, _, in_y, in_x) = inputs.dim();
        let (_, _, out_y, out_x) = diff_inputs.dim();
        let [sx, sy] = geometry.stride;
        let [px, py] = geometry.padding;
        for ((o, c, j, i), dw) in diff_weights.indexed_iter_mut() {
            let mut acc = T::zero();
            if mapping[(c, o)] {
                for b in 0..nb {
                    for oy in 0..out_y {
                        let Some(iy) = source_index(oy, j, sy, py, in_y) else {
                            continue;
                        };
                        for ox in 0..out_x {
                            if let Some(ix) = source_index(ox, i, sx, px, in_x) {
                                acc = acc + diff_inputs[(b, o, oy, ox)] * inputs[(b, c, iy, ix)];
                            }
                        }
                    }
                }
            }
            blend(dw, acc, beta);
        }
    }
}

/// Average pooling of one batch item.
fn average_sample<T: Scalar>(
    inputs: ArrayView3<T>,
    mapping: ArrayView2<bool>,
    counts: &[usize],
    geometry: &Geometry,
    beta: T,
    mut outputs: ArrayViewMut3<T>,
) {
    let (nb_channels, in_y, in_x) = inputs.dim();
    for ((o, oy, ox), y) in outputs.indexed_iter_mut() {
        let [wx, wy] = geometry.window([ox, oy], [in_x, in_y]);
        let n = wx.len() * wy.len() * counts[o];
        if n == 0 {
            blend(y, T::zero(), beta);
            continue;
        }
        let mut acc = T::zero();
        for c in (0..nb_channels).filter(|c| mapping[(*c, o)]) {
            for iy in wy.clone() {
                for ix in wx.clone() {
                    acc = acc + inputs[(c, iy, ix)];
                }
            }
        }
        blend(y, acc / T::from_usize(n), beta);
    }
}

/// Gradient of [`average_sample`].
fn average_backward_sample<T: Scalar>(
    diff_inputs: ArrayView3<T>,
    mapping: ArrayView2<bool>,
    counts: &[usize],
    geometry: &Geometry,
    beta: T,
    mut diff_outputs: ArrayViewMut3<T>,
) {
    let (nb_channels, in_y, in_x) = diff_outputs.dim();
    scale_array_by_beta(&mut diff_outputs, beta);
    for ((o, oy, ox), dy) in diff_inputs.indexed_iter() {
        let [wx, wy] = geometry.window([ox, oy], [in_x, in_y]);
        let n = wx.len() * wy.len() * counts[o];
        if n == 0 {
            continue;
        }
        let g = *dy / T::from_usize(n);
        for c in (0..nb_channels).filter(|c| mapping[(*c, o)]) {
            for iy in wy.clone() {
                for ix in wx.clone() {
                    let dx = &mut diff_outputs[(c, iy, ix)];
                    *dx = *dx + g;
                }
            }
        }
    }
}

/// Max pooling of one batch item.
#[allow(clippy::too_many_arguments)]
fn max_sample<T: Scalar>(
    group: usize,
    inputs: ArrayView3<T>,
    mapping: ArrayView2<bool>,
    geometry: &Geometry,
    beta: T,
    mut outputs: ArrayViewMut3<T>,
    mut argmax: ArrayViewMut3<ArgMax>,
) {
    let (nb_channels, in_y, in_x) = inputs.dim();
    for ((o, oy, ox), y) in outputs.indexed_iter_mut() {
        let [wx, wy] = geometry.window([ox, oy], [in_x, in_y]);
        let mut best: Option<(T, ArgMax)> = None;
        for channel in (0..nb_channels).filter(|c| mapping[(*c, o)]) {
            for iy in wy.clone() {
                for ix in wx.clone() {
                    let x = inputs[(channel, iy, ix)];
                    if best.map_or(true, |(max, _)| x > max) {
                        let index = ArgMax {
                            group,
                            channel,
                            iy,
                            ix,
                            valid: true,
                        };
                        best = Some((x, index));
                    }
                }
            }
        }
        let index = &mut argmax[(o, oy, ox)];
        if beta == T::zero() {
            let (x, best) = best.unwrap_or_default();
            *y = x;
            *index = best;
        } else if let Some((x, best)) = best {
            if !index.valid || x > *y {
                *y = x;
                *index = best;
            }
        }
    }
}

/// Gradient of [`max_sample`].
fn max_backward_sample<T: Scalar>(
    group: usize,
    diff_inputs: ArrayView3<T>,
    argmax: ArrayView3<ArgMax>,
    beta: T,
    mut diff_outputs: ArrayViewMut3<T>,
) {
    scale_array_by_beta(&mut diff_outputs, beta);
    for (dy, index) in diff_inputs.iter().zip(argmax.iter()) {
        if index.valid && index.group == group {
            let dx = &mut diff_outputs[(index.channel, index.iy, index.ix)];
            *dx = *dx + *dy;
        }
    }
}

impl<T: Scalar> PoolKernel<T> for HostKernels {
    fn forward_average(
        &self,
        inputs: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        counts: &[usize],
        geometry: &Geometry,
        beta: T,
        mut outputs: ArrayViewMut4<T>,
    ) {
        for (x, y) in inputs.outer_iter().zip(outputs.outer_iter_mut()) {
            average_sample(x, mapping, counts, geometry, beta, y);
        }
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
        for (dy, dx) in diff_inputs.outer_iter().zip(diff_outputs.outer_iter_mut()) {
            average_backward_sample(dy, mapping, counts, geometry, beta, dx);
        }
    }
    fn forward_max(
        &self,
        group: usize,
        inputs: ArrayView4<T>,
        mapping: ArrayView2<bool>,
        geometry: &Geometry,
        beta: T,
        mut outputs: ArrayViewMut4<T>,
        mut argmax: ArrayViewMut4<ArgMax>,
    ) {
        for ((x, y), index) in inputs
            .outer_iter()
            .zip(outputs.outer_iter_mut())
            .zip(argmax.outer_iter_mut())
        {
            max_sample(group, x, mapping, geometry, beta, y, index);
        }
    }
    fn backward_max(
        &self,
        group: usize,
        diff_inputs: ArrayView4<T>,
        argmax: ArrayView4<ArgMax>,
        beta: T,
        mut diff_outputs: ArrayViewMut4<T>,
    ) {
        for ((dy, index), dx) in diff_inputs
            .outer_iter()
            .zip(argmax.outer_iter())
            .zip(diff_outputs.outer_iter_mut())
        {
            max_backward_sample(group, dy, index, beta, dx);
        }
    }
}

/// Mean and biased variance of each channel, in f64.
fn channel_moments<T: Scalar>(inputs: ArrayView3<T>) -> (f64, f64) {
    let n = inputs.len().max(1) as f64;
    let mean = inputs.iter().map(|x| x.as_f64()).sum::<f64>() / n;
    let variance = inputs
        .iter()
        .map(|x| (x.as_f64() - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean, variance)
}

/// Applies `y = scale * (x - mean) / sqrt(variance + epsilon) + bias` to one channel.
fn normalize_channel<T: Scalar>(
    inputs: ArrayView3<T>,
    [scale, bias, mean, variance]: [f64; 4],
    epsilon: f64,
    mut outputs: ArrayViewMut3<T>,
) {
    let inv_std = 1. / (variance + epsilon).sqrt();
    for (x, y) in inputs.iter().zip(outputs.iter_mut()) {
        *y = T::from_f64(scale * (x.as_f64() - mean) * inv_std + bias);
    }
}

/// Caches the batch statistics of channel `c` and updates its moving averages.
fn write_stats<T: Scalar>(
    stats: &mut BatchNormStats<T>,
    c: usize,
    mean: f64,
    variance: f64,
    momentum: f64,
) {
    let running = |r: T, x: f64| T::from_f64(momentum * r.as_f64() + (1. - momentum) * x);
    stats.running_mean[c] = running(stats.running_mean[c], mean);
    stats.running_variance[c] = running(stats.running_variance[c], variance);
    stats.saved_mean[c] = T::from_f64(mean);
    stats.saved_variance[c] = T::from_f64(variance);
}

/// Channel gradients `(dscale, dbias)` of one channel.
fn channel_gradients<T: Scalar>(
    inputs: ArrayView3<T>,
    diff_inputs: ArrayView3<T>,
    mean: f64,
    inv_std: f64,
) -> (f64, f64) {
    inputs
        .iter()
        .zip(diff_inputs.iter())
        .fold((0., 0.), |(dscale, dbias), (x, dy)| {
            let dy = dy.as_f64();
            (dscale + dy * (x.as_f64() - mean) * inv_std, dbias + dy)
        })
}

/// Gradient of the inputs of one channel.
#[allow(clippy::too_many_arguments)]
fn channel_backward_data<T: Scalar>(
    inputs: ArrayView3<T>,
    diff_inputs: ArrayView3<T>,
    scale: f64,
    mean: f64,
    inv_std: f64,
    (dscale, dbias): (f64, f64),
    beta: T,
    mut diff_outputs: ArrayViewMut3<T>,
) {
    let n = inputs.len().max(1) as f64;
    let factor = scale * inv_std / n;
    for ((x, dy), dx) in inputs
        .iter()
        .zip(diff_inputs.iter())
        .zip(diff_outputs.iter_mut())
    {
        let xhat = (x.as_f64() - mean) * inv_std;
        let value = factor * (n * dy.as_f64() - dbias - xhat * dscale);
        blend(dx, T::from_f64(value), beta);
    }
}

impl<T: Scalar> BatchNormKernel<T> for HostKernels {
    fn forward_inference(
        &self,
        inputs: ArrayView4<T>,
        scale: &[T],
        bias: &[T],
        mean: &[T],
        variance: &[T],
        epsilon: f64,
        mut outputs: ArrayViewMut4<T>,
    ) {
        for c in 0..scale.len() {
            let moments = [scale[c], bias[c], mean[c], variance[c]].map(|x| x.as_f64());
            normalize_channel(
                inputs.index_axis(Axis(1), c),
                moments,
                epsilon,
                outputs.index_axis_mut(Axis(1), c),
            );
        }
    }
    fn forward_training(
        &self,
        inputs: ArrayView4<T>,
        scale: &[T],
        bias: &[T],
        epsilon: f64,
        momentum: f64,
        mut stats: BatchNormStats<T>,
        mut outputs: ArrayViewMut4<T>,
    ) {
        for c in 0..scale.len() {
            let x = inputs.index_axis(Axis(1), c);
            let (mean, variance) = channel_moments(x);
            normalize_channel(
                x,
                [scale[c].as_f64(), bias[c].as_f64(), mean, variance],
                epsilon,
                outputs.index_axis_mut(Axis(1), c),
            );
            write_stats(&mut stats, c, mean, variance, momentum);
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
            mut data,
        } = gradients;
        for c in 0..scale.len() {
            let x = inputs.index_axis(Axis(1), c);
            let dy = diff_inputs.index_axis(Axis(1), c);
            let mean = saved_mean[c].as_f64();
            let inv_std = 1. / (saved_variance[c].as_f64() + epsilon).sqrt();
            let (dscale, dbias) = channel_gradients(x, dy, mean, inv_std);
            blend(&mut diff_scale[c], T::from_f64(dscale), beta);
            blend(&mut diff_bias[c], T::from_f64(dbias), beta);
            if let Some((data_beta, diff_outputs)) = data.as_mut() {
                channel_backward_data(
                    x,
                    dy,
                    scale[c].as_f64(),
                    mean,
                    inv_std,
                    (dscale, dbias),
                    *data_beta,
                    diff_outputs.index_axis_mut(Axis(1), c),
                );
            }
        }
    }
}

impl<T: Scalar> ProposalKernel<T> for HostKernels {
    fn forward(
        &self,
        desc: &ProposalDesc,
        rois: ArrayView4<T>,
        scores: ArrayView4<T>,
        deltas: ArrayView4<T>,
        mut outputs: ArrayViewMut4<T>,
    ) {
        for (b, y) in outputs.outer_iter_mut().enumerate() {
            propose(
                desc,
                rois.index_axis(Axis(0), b),
                scores.index_axis(Axis(0), b),
                deltas.index_axis(Axis(0), b),
                y,
            );
        }
    }
}
