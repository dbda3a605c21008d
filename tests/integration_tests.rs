use anyhow::Result;
use approx::assert_relative_eq;
use cellframe::{
    cell::{
        batch_norm::BatchNormDesc,
        conv::ConvDesc,
        fc::FcDesc,
        mapping::Mapping,
        pool::{PoolDesc, Pooling},
        proposal::ProposalDesc,
        source::Source,
        Cell,
    },
    device::Device,
    graph::DeepNet,
    registry::{Backend, CellContext, CellDesc, CellRegistry},
    scalar::Scalar,
    tensor::Tensor,
    Error,
};
use libtest_mimic::{Arguments, Trial};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{io::Write, ops::Range, path::Path, sync::Arc};
use tracing_subscriber::EnvFilter;

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let args = Arguments::from_args();
    let registry = Arc::new(CellRegistry::with_defaults());
    let device = Device::new();
    let contexts = [
        Context {
            backend: Backend::Host,
            cell_context: CellContext::default(),
            registry: registry.clone(),
        },
        Context {
            backend: Backend::Device,
            cell_context: CellContext::default().with_device(device.clone()),
            registry: registry.clone(),
        },
    ];
    let tests = contexts
        .iter()
        .flat_map(backend_tests)
        .chain(consistency_tests(&registry, &device))
        .chain([Trial::test("unsupported_backend", || {
            unsupported_backend().map_err(|e| format!("{e:?}").into())
        })])
        .collect();
    libtest_mimic::run(&args, tests).exit()
}

#[derive(Clone)]
struct Context {
    backend: Backend,
    cell_context: CellContext,
    registry: Arc<CellRegistry>,
}

impl Context {
    fn cell<T: Scalar>(&self, name: &str, desc: CellDesc) -> Result<Box<dyn Cell<T>>> {
        Ok(self
            .registry
            .create_cell::<T>(self.backend, name, &desc, &self.cell_context)?)
    }
}

fn backend_test(context: &Context, name: &str, f: fn(&Context) -> Result<()>) -> Trial {
    let name = format!("{name}_{}", context.backend);
    let context = context.clone();
    Trial::test(name, move || f(&context).map_err(|e| format!("{e:?}").into()))
}

fn backend_tests(context: &Context) -> Vec<Trial> {
    let mut tests = vec![
        backend_test(context, "zero_parameters_output_shape", zero_parameters_output_shape),
        backend_test(context, "fc_two_inputs_accumulate", fc_two_inputs_accumulate),
        backend_test(context, "fc_gradient_check", fc_gradient_check),
        backend_test(context, "average_pool_gradient_check", average_pool_gradient_check),
        backend_test(context, "batch_norm_gradient_check", batch_norm_gradient_check),
        backend_test(context, "max_pool_routes_to_argmax", max_pool_routes_to_argmax),
        backend_test(context, "batch_norm_moving_average", batch_norm_moving_average),
        backend_test(context, "conv_mapping_excludes_channel", conv_mapping_excludes_channel),
        backend_test(context, "pool_mapping_excludes_channel", pool_mapping_excludes_channel),
        backend_test(context, "shared_weights_update_once", shared_weights_update_once),
        backend_test(context, "fan_out_gradients_sum", fan_out_gradients_sum),
        backend_test(context, "parameters_round_trip", parameters_round_trip),
        backend_test(context, "corrupt_parameter_file", corrupt_parameter_file),
        backend_test(context, "proposal_boxes", proposal_boxes),
    ];
    if context.backend == Backend::Device {
        tests.push(backend_test(context, "device_transfers", device_transfers));
    }
    tests
}

fn random_tensor<T: Scalar>(dims: [usize; 4], seed: u64) -> Result<Tensor<T>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f64> = (0..dims.iter().product())
        .map(|_| rng.gen_range(-1. ..1.))
        .collect();
    Ok(Tensor::from_f64s(dims, &data)?)
}

fn random_source<T: Scalar>(name: &str, dims: [usize; 4], seed: u64) -> Result<Source<T>> {
    let source = Source::new(name, dims).with_gradient();
    source.set(&random_tensor(dims, seed)?)?;
    Ok(source)
}

fn outputs<T: Scalar>(cell: &dyn Cell<T>) -> Vec<f64> {
    cell.outputs().write().host().to_f64s()
}

fn seed_gradient<T: Scalar>(cell: &dyn Cell<T>, value: f64) {
    let mut diff = cell.diff_inputs().write();
    diff.host_discard().fill(T::from_f64(value));
    diff.set_valid();
}

fn parameter_values<T: Scalar>(cell: &dyn Cell<T>) -> Vec<Vec<f64>> {
    cell.free_parameters()
        .iter()
        .map(|p| p.lock().value_mut().host().to_f64s())
        .collect()
}

fn zero_parameters_output_shape(context: &Context) -> Result<()> {
    let cases = [
        (CellDesc::Fc(FcDesc::new(5)), [1, 1, 5, 2]),
        (
            CellDesc::Conv(ConvDesc::new(4, [3, 3]).with_padding([1, 1])),
            [6, 5, 4, 2],
        ),
        (
            CellDesc::Deconv(ConvDesc::new(4, [2, 2]).with_stride([2, 2])),
            [12, 10, 4, 2],
        ),
        (
            CellDesc::Pool(PoolDesc::new(3, Pooling::Max, [2, 2]).with_stride([2, 2])),
            [3, 2, 3, 2],
        ),
        (CellDesc::BatchNorm(BatchNormDesc::new(3)), [6, 5, 3, 2]),
    ];
    for (desc, dims) in cases {
        let source = random_source::<f32>("input", [6, 5, 3, 2], 0)?;
        let has_parameters = desc.kind() != cellframe::cell::CellKind::Pool;
        let mut cell = context.cell::<f32>("cell", desc)?;
        cell.add_input(&source, None)?;
        cell.initialize()?;
        for parameter in cell.free_parameters() {
            parameter.lock().value_mut().host_mut().fill(0.);
        }
        cell.propagate(true)?;
        assert_eq!(cell.outputs().read().dims(), &dims, "{}", cell.kind());
        if has_parameters {
            assert!(outputs(cell.as_ref()).iter().all(|x| *x == 0.), "{}", cell.kind());
        }
    }
    Ok(())
}

fn fc_two_inputs_accumulate(context: &Context) -> Result<()> {
    let a = Source::<f32>::new("a", [1, 1, 1, 1]);
    let b = Source::<f32>::new("b", [1, 1, 1, 1]);
    a.set(&Tensor::from_elem([1, 1, 1, 1], 1.))?;
    b.set(&Tensor::from_elem([1, 1, 1, 1], 0.5))?;
    let mut fc = context.cell::<f32>("fc", CellDesc::Fc(FcDesc::new(1).with_no_bias(true)))?;
    fc.add_input(&a, None)?;
    fc.add_input(&b, None)?;
    fc.initialize()?;
    fc.set_weight(0, 0, &Tensor::from_elem([1], 1.))?;
    fc.set_weight(0, 1, &Tensor::from_elem([1], 1.))?;
    fc.propagate(true)?;
    assert_eq!(outputs(fc.as_ref()), [1.5]);
    Ok(())
}

fn check_gradient(context: &Context, desc: CellDesc, inputs: &[[usize; 4]]) -> Result<()> {
    let sources = inputs
        .iter()
        .enumerate()
        .map(|(i, dims)| random_source::<f64>(&format!("input{i}"), *dims, i as u64))
        .collect::<Result<Vec<_>>>()?;
    let mut cell = context.cell::<f64>("cell", desc)?;
    for source in sources.iter() {
        cell.add_input(source, None)?;
    }
    cell.initialize()?;
    let report = cell.check_gradient(1e-6, 1e-4)?;
    assert!(report.passed(), "{report}");
    assert!(report.checked() > 0);
    assert_eq!(
        report.entries.len(),
        cell.parameters().len() + inputs.len(),
        "{report}"
    );
    Ok(())
}

fn fc_gradient_check(context: &Context) -> Result<()> {
    check_gradient(
        context,
        CellDesc::Fc(FcDesc::new(4)),
        &[[2, 2, 3, 3], [1, 1, 2, 3]],
    )
}

fn average_pool_gradient_check(context: &Context) -> Result<()> {
    let desc = PoolDesc::new(3, Pooling::Average, [3, 3])
        .with_stride([2, 2])
        .with_padding([1, 1]);
    check_gradient(context, CellDesc::Pool(desc), &[[5, 4, 3, 2]])
}

fn batch_norm_gradient_check(context: &Context) -> Result<()> {
    check_gradient(
        context,
        CellDesc::BatchNorm(BatchNormDesc::new(2)),
        &[[3, 3, 2, 4]],
    )
}

fn max_pool_routes_to_argmax(context: &Context) -> Result<()> {
    // A permutation of 0..16, so every window has a unique maximum.
    let mut values: Vec<f64> = (0..16).map(|i| ((i * 5) % 16) as f64).collect();
    let source = Source::<f32>::new("input", [4, 4, 1, 1]).with_gradient();
    source.set(&Tensor::from_f64s([4, 4, 1, 1], &values)?)?;
    let desc = PoolDesc::new(1, Pooling::Max, [2, 2]).with_stride([2, 2]);
    let mut pool = context.cell::<f32>("pool", CellDesc::Pool(desc))?;
    pool.add_input(&source, None)?;
    pool.initialize()?;
    pool.propagate(false)?;
    let forward = outputs(pool.as_ref());
    seed_gradient(pool.as_ref(), 1.);
    pool.back_propagate()?;
    let gradient = source.gradient().map(|g| g.to_f64s());
    let mut expected = vec![0.; 16];
    let mut others = Vec::new();
    for oy in 0..2 {
        for ox in 0..2 {
            let window: Vec<usize> = [(0, 0), (1, 0), (0, 1), (1, 1)]
                .into_iter()
                .map(|(dx, dy)| (2 * oy + dy) * 4 + 2 * ox + dx)
                .collect();
            let best = window
                .iter()
                .copied()
                .fold(window[0], |a, b| if values[b] > values[a] { b } else { a });
            expected[best] = 1.;
            assert_eq!(forward[oy * 2 + ox], values[best]);
            others.extend(window.into_iter().filter(|i| *i != best));
        }
    }
    assert_eq!(gradient.as_deref(), Some(expected.as_slice()));
    for i in others {
        values[i] -= 100.;
    }
    source.set(&Tensor::from_f64s([4, 4, 1, 1], &values)?)?;
    source.clear_gradient();
    pool.propagate(false)?;
    assert_eq!(outputs(pool.as_ref()), forward);
    seed_gradient(pool.as_ref(), 1.);
    pool.back_propagate()?;
    assert_eq!(
        source.gradient().map(|g| g.to_f64s()).as_deref(),
        Some(expected.as_slice())
    );
    Ok(())
}

fn batch_norm_moving_average(context: &Context) -> Result<()> {
    let source = Source::<f64>::new("input", [1, 1, 1, 4]);
    let desc = BatchNormDesc::new(1).with_momentum(0.9);
    let mut bn = context.cell::<f64>("bn", CellDesc::BatchNorm(desc))?;
    bn.add_input(&source, None)?;
    bn.initialize()?;
    let running = |bn: &dyn Cell<f64>| {
        let values = parameter_values(bn);
        (values[2][0], values[3][0])
    };
    source.set(&Tensor::from_vec([1, 1, 1, 4], vec![-1., 1., -1., 1.])?)?;
    bn.propagate(false)?;
    let (mean, variance) = running(bn.as_ref());
    assert_relative_eq!(mean, 0., epsilon = 1e-12);
    assert_relative_eq!(variance, 1., epsilon = 1e-12);
    source.set(&Tensor::from_vec([1, 1, 1, 4], vec![1., 3., 1., 3.])?)?;
    bn.propagate(false)?;
    let (mean, variance) = running(bn.as_ref());
    assert_relative_eq!(mean, 0.2, epsilon = 1e-12);
    assert_relative_eq!(variance, 1., epsilon = 1e-12);
    bn.propagate(true)?;
    assert_eq!(running(bn.as_ref()), (mean, variance));
    Ok(())
}

fn mapping_excludes_channel(context: &Context, desc: CellDesc, mapping: Mapping) -> Result<()> {
    let dims = [5, 5, 3, 2];
    let source = random_source::<f32>("input", dims, 1)?;
    let mut cell = context.cell::<f32>("cell", desc)?;
    cell.set_mapping(mapping)?;
    cell.add_input(&source, None)?;
    cell.initialize()?;
    cell.propagate(true)?;
    let before = outputs(cell.as_ref());
    let mut input = random_tensor::<f32>(dims, 1)?;
    let noise = random_tensor::<f32>(dims, 2)?;
    for b in 0..dims[3] {
        for y in 0..dims[1] {
            for x in 0..dims[0] {
                input.set4(x, y, 1, b, 10. * noise.get4(x, y, 1, b));
            }
        }
    }
    source.set(&input)?;
    cell.propagate(true)?;
    assert_eq!(outputs(cell.as_ref()), before);
    Ok(())
}

fn conv_mapping_excludes_channel(context: &Context) -> Result<()> {
    let desc = ConvDesc::new(2, [3, 3]).with_padding([1, 1]);
    let mapping = Mapping::from_fn(3, 2, |c, _| c != 1);
    mapping_excludes_channel(context, CellDesc::Conv(desc), mapping)
}

fn pool_mapping_excludes_channel(context: &Context) -> Result<()> {
    let desc = PoolDesc::new(2, Pooling::Average, [2, 2]);
    let mapping = Mapping::from_fn(3, 2, |c, o| c == 2 * o);
    mapping_excludes_channel(context, CellDesc::Pool(desc), mapping)
}

fn shared_weights_update_once(context: &Context) -> Result<()> {
    let a = Source::<f32>::new("a", [3, 1, 1, 2]);
    let b = Source::<f32>::new("b", [3, 1, 1, 2]);
    a.set(&Tensor::from_elem([3, 1, 1, 2], 1.))?;
    b.set(&Tensor::from_elem([3, 1, 1, 2], 1.))?;
    let desc = CellDesc::Fc(FcDesc::new(2).with_no_bias(true));
    let mut fc1 = context.cell::<f32>("fc1", desc.clone())?;
    fc1.add_input(&a, None)?;
    fc1.initialize()?;
    let (_, weights) = fc1.parameters().remove(0);
    let mut fc2 = context.cell::<f32>("fc2", desc)?;
    fc2.add_input(&b, None)?;
    fc2.share_weights(0, weights.clone())?;
    fc2.initialize()?;
    let before = weights.lock().value_mut().host().to_f64s();
    for fc in [&mut fc1, &mut fc2] {
        fc.propagate(false)?;
        seed_gradient(fc.as_ref(), 1.);
        fc.back_propagate()?;
    }
    fc2.update()?;
    fc1.update()?;
    fc2.update()?;
    let after = weights.lock().value_mut().host().to_f64s();
    // Each cell contributes a gradient of 2 per weight, averaged over a batch of 2.
    for (before, after) in before.iter().zip(after) {
        assert_relative_eq!(after, before - 0.02, epsilon = 1e-6);
    }
    Ok(())
}

/// Two fully connected cells with weights 3 and 5 read channels of one two channel source.
fn fan_out_net(
    context: &Context,
    channels: [Option<Range<usize>>; 2],
) -> Result<DeepNet<f32>> {
    let mut net = DeepNet::new();
    net.add_source(Source::new("input", [1, 1, 2, 1]).with_gradient())?;
    let desc = CellDesc::Fc(FcDesc::new(1).with_no_bias(true));
    for ((name, weight), channels) in [("fc3", 3.), ("fc5", 5.)].into_iter().zip(channels) {
        net.create_cell(&context.registry, context.backend, name, &desc, &context.cell_context)?;
        let nb_inputs = channels.as_ref().map_or(2, |r| r.len());
        net.connect("input", name, channels)?;
        let cell = net.cell_mut(name)?;
        cell.initialize()?;
        for channel in 0..nb_inputs {
            cell.set_weight(0, channel, &Tensor::from_elem([1], weight))?;
        }
    }
    net.source("input")?.set(&Tensor::from_elem([1, 1, 2, 1], 1.))?;
    Ok(net)
}

fn fan_out_gradients_sum(context: &Context) -> Result<()> {
    let cases = [
        ([None, None], [8., 8.]),
        ([None, Some(1..2)], [3., 8.]),
        ([Some(0..1), Some(1..2)], [3., 5.]),
    ];
    for (channels, expected) in cases {
        let mut net = fan_out_net(context, channels.clone())?;
        for _ in 0..2 {
            net.propagate(false)?;
            for name in ["fc3", "fc5"] {
                net.set_output_gradient(name, &Tensor::from_elem([1, 1, 1, 1], 1.))?;
            }
            net.back_propagate()?;
            let gradient = net
                .source("input")?
                .gradient()
                .map(|g| g.to_f64s())
                .unwrap_or_default();
            assert_eq!(gradient, expected, "{channels:?}");
        }
    }
    Ok(())
}

fn conv_cell(context: &Context, source: &Source<f32>) -> Result<Box<dyn Cell<f32>>> {
    let desc = ConvDesc::new(4, [3, 3]).with_stride([2, 2]);
    let mut conv = context.cell::<f32>("conv", CellDesc::Conv(desc))?;
    conv.add_input(source, None)?;
    conv.initialize()?;
    Ok(conv)
}

fn parameters_round_trip(context: &Context) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conv.syn");
    let source = Source::<f32>::new("input", [7, 7, 2, 1]);
    let mut conv = conv_cell(context, &source)?;
    conv.set_bias(2, &Tensor::from_elem([1], 0.5))?;
    conv.save_free_parameters(&path)?;
    let saved = parameter_values(conv.as_ref());
    let mut loaded = conv_cell(context, &source)?;
    for parameter in loaded.free_parameters() {
        parameter.lock().value_mut().host_mut().fill(0.);
    }
    loaded.load_free_parameters(&path, false)?;
    assert_eq!(parameter_values(loaded.as_ref()), saved);
    Ok(())
}

fn corrupt_parameter_file(context: &Context) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = Source::<f32>::new("input", [7, 7, 2, 1]);
    let mut conv = conv_cell(context, &source)?;
    let mut bytes = Vec::new();
    conv.save_free_parameters_to(&mut bytes)?;
    let before = parameter_values(conv.as_ref());
    let short = dir.path().join("short.syn");
    std::fs::File::create(&short)?.write_all(&bytes[..bytes.len() - 1])?;
    assert!(matches!(
        conv.load_free_parameters(&short, false),
        Err(Error::ParameterFileCorrupt { .. })
    ));
    let long = dir.path().join("long.syn");
    bytes.extend([0; 4]);
    std::fs::File::create(&long)?.write_all(&bytes)?;
    assert!(matches!(
        conv.load_free_parameters(&long, false),
        Err(Error::ParameterFileCorrupt { .. })
    ));
    let missing = dir.path().join("missing.syn");
    conv.load_free_parameters(&missing, true)?;
    assert!(matches!(
        conv.load_free_parameters(&missing, false),
        Err(Error::Io { .. })
    ));
    assert_eq!(parameter_values(conv.as_ref()), before);
    Ok(())
}

fn proposal_boxes(context: &Context) -> Result<()> {
    // Two ROIs of size 10, at x = 0 and x = 20.
    let rois = Source::<f32>::new("rois", [2, 1, 4, 1]);
    rois.set(&Tensor::from_vec(
        [2, 1, 4, 1],
        vec![0., 20., 0., 0., 10., 10., 10., 10.],
    )?)?;
    // Background, then one class.
    let scores = Source::<f32>::new("scores", [2, 1, 2, 1]);
    scores.set(&Tensor::from_vec([2, 1, 2, 1], vec![0.9, 0.9, 0.2, 0.7])?)?;
    let deltas = Source::<f32>::new("deltas", [2, 1, 8, 1]);
    let desc = ProposalDesc::new(3).with_keep_class(true);
    let mut proposal = context.cell::<f32>("proposal", CellDesc::Proposal(desc))?;
    for source in [&rois, &scores, &deltas] {
        proposal.add_input(source, None)?;
    }
    proposal.initialize()?;
    proposal.propagate(true)?;
    assert_eq!(proposal.outputs().read().dims(), &[3, 1, 5, 1]);
    let outputs = proposal.outputs().write().host().clone();
    let column = |p: usize| (0..5).map(|j| outputs.get4(p, 0, j, 0)).collect::<Vec<_>>();
    assert_eq!(column(0), [20., 0., 10., 10., 1.]);
    assert_eq!(column(1), [0., 0., 10., 10., 1.]);
    assert_eq!(column(2), [0.; 5]);
    let extra = Source::<f32>::new("extra", [2, 1, 4, 1]);
    assert!(matches!(
        proposal.add_input(&extra, None),
        Err(Error::InvalidState { .. })
    ));
    Ok(())
}

fn device_transfers(context: &Context) -> Result<()> {
    // Counts are per device, so other trials must not share it.
    let device = Device::new();
    let context = Context {
        cell_context: context.cell_context.clone().with_device(device.clone()),
        ..context.clone()
    };
    let source = random_source::<f32>("input", [4, 4, 3, 2], 3)?;
    let mut fc = context.cell::<f32>("fc", CellDesc::Fc(FcDesc::new(8)))?;
    fc.add_input(&source, None)?;
    fc.initialize()?;
    fc.propagate(true)?;
    let first = device.info();
    fc.propagate(true)?;
    let second = device.info();
    assert_eq!((second.uploads, second.downloads), (first.uploads, first.downloads));
    outputs(fc.as_ref());
    assert_eq!(device.info().downloads, second.downloads + 1);
    outputs(fc.as_ref());
    assert_eq!(device.info().downloads, second.downloads + 1);
    let allocated = device.info().allocated;
    drop(fc);
    assert!(device.info().allocated < allocated);
    Ok(())
}

fn unsupported_backend() -> Result<()> {
    let registry = CellRegistry::with_defaults();
    let context = CellContext::default();
    let desc = CellDesc::Fc(FcDesc::new(2));
    for (backend, scalar_type) in [("Frame_OpenCL", "float"), ("Frame", "int8")] {
        assert!(matches!(
            registry.create(backend, scalar_type, "fc", &desc, &context),
            Err(Error::UnsupportedBackend { .. })
        ));
    }
    assert!(matches!(
        CellRegistry::new().create("Frame", "float", "fc", &desc, &context),
        Err(Error::UnsupportedBackend { .. })
    ));
    Ok(())
}

fn consistency_tests(registry: &Arc<CellRegistry>, device: &Device) -> Vec<Trial> {
    let cases = [
        ("fc", CellDesc::Fc(FcDesc::new(5))),
        (
            "conv",
            CellDesc::Conv(
                ConvDesc::new(4, [3, 3])
                    .with_stride([2, 2])
                    .with_padding([1, 1]),
            ),
        ),
        (
            "deconv",
            CellDesc::Deconv(ConvDesc::new(4, [3, 3]).with_stride([2, 2])),
        ),
        (
            "max_pool",
            CellDesc::Pool(PoolDesc::new(3, Pooling::Max, [2, 2]).with_stride([2, 2])),
        ),
        (
            "average_pool",
            CellDesc::Pool(
                PoolDesc::new(3, Pooling::Average, [3, 3])
                    .with_stride([2, 2])
                    .with_padding([1, 1]),
            ),
        ),
        ("batch_norm", CellDesc::BatchNorm(BatchNormDesc::new(3))),
    ];
    cases
        .into_iter()
        .map(|(name, desc)| {
            let registry = registry.clone();
            let device = device.clone();
            Trial::test(format!("{name}_host_device_consistency"), move || {
                host_device_consistency(&registry, &device, &desc)
                    .map_err(|e| format!("{e:?}").into())
            })
        })
        .collect()
}

fn host_device_consistency(registry: &CellRegistry, device: &Device, desc: &CellDesc) -> Result<()> {
    let dims = [6, 5, 3, 2];
    let mut cells = Vec::new();
    let mut sources = Vec::new();
    let mut parameters = Vec::new();
    for backend in Backend::ALL {
        let context = CellContext::default().with_device(device.clone());
        let source = random_source::<f32>("input", dims, 4)?;
        let mut cell = registry.create_cell::<f32>(backend, "cell", desc, &context)?;
        cell.add_input(&source, None)?;
        cell.initialize()?;
        if parameters.is_empty() {
            cell.save_free_parameters_to(&mut parameters)?;
        } else {
            cell.load_free_parameters_from(&mut parameters.as_slice(), Path::new("host"))?;
        }
        cell.propagate(false)?;
        let mut rng = StdRng::seed_from_u64(5);
        {
            let mut diff = cell.diff_inputs().write();
            for x in diff.host_discard().as_mut_slice() {
                *x = rng.gen_range(-1. ..1.);
            }
            diff.set_valid();
        }
        cell.back_propagate()?;
        cells.push(cell);
        sources.push(source);
    }
    let [host_outputs, device_outputs] = [&cells[0], &cells[1]].map(|cell| outputs(cell.as_ref()));
    assert_eq!(host_outputs.len(), device_outputs.len());
    for (a, b) in host_outputs.iter().zip(device_outputs.iter()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-4, max_relative = 1e-3);
    }
    let [host_gradient, device_gradient] = [&sources[0], &sources[1]]
        .map(|source| source.gradient().map(|g| g.to_f64s()).unwrap_or_default());
    assert!(!host_gradient.is_empty());
    assert_eq!(host_gradient.len(), device_gradient.len());
    for (a, b) in host_gradient.iter().zip(device_gradient.iter()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-4, max_relative = 1e-3);
    }
    Ok(())
}
