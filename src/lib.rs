/*!
# cellframe
Layer cells for training and inference of neural networks, with host and device kernels.

A network is a graph of [cells](cell::Cell). Each cell reads the outputs of its producers
through an [`Interface`](tensor::interface::Interface), computes its outputs in
[`propagate`](cell::Cell::propagate), and in [`back_propagate`](cell::Cell::back_propagate)
computes the gradients of its parameters and writes the gradients of its inputs back into its
producers. [`update`](cell::Cell::update) applies the [solvers](solver) of the parameters.

# Cells
- [Fully connected](cell::fc)
- [Convolution](cell::conv) and [deconvolution](cell::deconv)
- [Pooling](cell::pool)
- [Batch normalization](cell::batch_norm)
- [Region proposals](cell::proposal)

# Backends
Cells are generic over the [`Scalar`](scalar::Scalar) type and over a kernel for their
numerics. [`HostKernels`](backend::HostKernels) are straightforward loops used as the
reference, [`DeviceKernels`](backend::DeviceKernels) operate on tensors mirrored to a
[`Device`](device::Device). The [`CellRegistry`](registry::CellRegistry) selects the
implementation from a backend and scalar type at run time.

```
# use cellframe::{
#     cell::{fc::FcDesc, source::Source, Cell},
#     registry::{Backend, CellContext, CellDesc, CellRegistry},
#     tensor::Tensor,
# };
# fn main() -> cellframe::Result<()> {
let registry = CellRegistry::with_defaults();
let input = Source::<f32>::new("input", [4, 4, 3, 2]);
input.set(&Tensor::from_elem([4, 4, 3, 2], 1.))?;
let mut fc = registry.create_cell::<f32>(
    Backend::Host,
    "fc",
    &CellDesc::Fc(FcDesc::new(10)),
    &CellContext::default(),
)?;
fc.add_input(&input, None)?;
fc.initialize()?;
fc.propagate(true)?;
assert_eq!(fc.outputs().read().dims(), &[1, 1, 10, 2]);
# Ok(())
# }
```

# Gradient checks
[`GradientCheck`](gradient_check::GradientCheck) compares the analytic gradients of a cell with
finite differences.

# Logging
Events are emitted with [`tracing`](https://docs.rs/tracing). Lifecycle events are `debug`,
parameter files are `info`, and gradient check mismatches are `warn`.
*/
#![warn(missing_docs)]

pub mod backend;
pub mod cell;
pub mod config;
pub mod device;
/// Errors.
pub mod error;
pub mod gradient_check;
pub mod graph;
mod persistence;
pub mod registry;
/// Scalars.
pub mod scalar;
pub mod solver;
/// Tensors.
pub mod tensor;

pub use error::{Error, Result};
