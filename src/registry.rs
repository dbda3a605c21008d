/*!
Cell construction by backend and scalar type.

Graph descriptions name a cell type, a backend ("Frame" or "Frame_CUDA") and an element type
("half", "float" or "double"). The [`CellRegistry`] maps each combination to a factory, so
the concrete kernels are selected at run time.

```
# use cellframe::{registry::{CellContext, CellDesc, CellRegistry}, cell::fc::FcDesc};
# fn main() -> cellframe::Result<()> {
let registry = CellRegistry::with_defaults();
let cell = registry.create(
    "Frame",
    "float",
    "fc1",
    &CellDesc::Fc(FcDesc::new(10)),
    &CellContext::default(),
)?;
let fc = cell.into_cell::<f32>()?;
assert_eq!(fc.name(), "fc1");
# Ok(())
# }
```
*/
use crate::{
    backend::{DeviceKernels, HostKernels, Target},
    cell::{
        batch_norm::{BatchNormCell, BatchNormDesc, BatchNormKernel},
        conv::{ConvCell, ConvDesc, ConvKernel},
        deconv::{DeconvCell, DeconvDesc},
        fc::{FcCell, FcDesc, FcKernel},
        pool::{PoolCell, PoolDesc, PoolKernel},
        proposal::{ProposalCell, ProposalDesc, ProposalKernel},
        Cell, CellKind,
    },
    config::CellParameters,
    device::Device,
    error::{Error, Result},
    scalar::{Scalar, ScalarType},
    solver::SgdConfig,
};
use dry::macro_for;
use half::f16;
use paste::paste;
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::HashMap,
    fmt::{self, Debug, Display},
    str::FromStr,
    sync::Arc,
};

/// Where cells run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Backend {
    /// Reference kernels on the host.
    Host,
    /// Kernels on a [`Device`].
    Device,
}

impl Backend {
    /// All backends.
    pub const ALL: [Self; 2] = [Self::Host, Self::Device];
    /// The name, "host" or "device".
    pub fn name(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Device => "device",
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "host" | "Host" | "Frame" => Ok(Self::Host),
            "device" | "Device" | "Frame_CUDA" => Ok(Self::Device),
            _ => Err(format!("unknown backend {s:?}")),
        }
    }
}

/// Description of a cell of any kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CellDesc {
    /// Fully connected.
    Fc(FcDesc),
    /// Convolution.
    Conv(ConvDesc),
    /// Deconvolution.
    Deconv(DeconvDesc),
    /// Pooling.
    Pool(PoolDesc),
    /// Batch normalization.
    BatchNorm(BatchNormDesc),
    /// Region proposals.
    Proposal(ProposalDesc),
}

impl CellDesc {
    /// The kind of cell described.
    pub fn kind(&self) -> CellKind {
        match self {
            Self::Fc(_) => CellKind::Fc,
            Self::Conv(_) => CellKind::Conv,
            Self::Deconv(_) => CellKind::Deconv,
            Self::Pool(_) => CellKind::Pool,
            Self::BatchNorm(_) => CellKind::BatchNorm,
            Self::Proposal(_) => CellKind::Proposal,
        }
    }
    /// Applies the options of the cell kind.
    ///
    /// **Errors**
    /// - An option is unknown or invalid.
    pub fn with_parameters(self, parameters: &CellParameters) -> Result<Self> {
        Ok(match self {
            Self::Fc(desc) => Self::Fc(desc.with_parameters(parameters)?),
            Self::Conv(desc) => Self::Conv(desc.with_parameters(parameters)?),
            Self::Deconv(desc) => Self::Deconv(desc.with_parameters(parameters)?),
            Self::Pool(desc) => Self::Pool(desc.with_parameters(parameters)?),
            Self::BatchNorm(desc) => Self::BatchNorm(desc.with_parameters(parameters)?),
            Self::Proposal(desc) => Self::Proposal(desc.with_parameters(parameters)?),
        })
    }
}

/// Shared state for constructing cells.
#[derive(Clone, Debug, Default)]
pub struct CellContext {
    /// The device of device cells.
    pub device: Option<Device>,
    /// The solver attached to the parameters of new cells.
    pub solver: SgdConfig,
}

impl CellContext {
    /// A context with `device`.
    pub fn with_device(self, device: Device) -> Self {
        Self {
            device: Some(device),
            ..self
        }
    }
    /// The solver attached to new parameters.
    pub fn with_solver(self, solver: SgdConfig) -> Self {
        Self { solver, ..self }
    }
    /// The target of `backend`.
    ///
    /// **Errors**
    /// - [`Error::BackendUnavailable`] for [`Backend::Device`] without a device.
    pub fn target(&self, backend: Backend) -> Result<Target> {
        match backend {
            Backend::Host => Ok(Target::Host),
            Backend::Device => self
                .device
                .clone()
                .map(Target::Device)
                .ok_or_else(|| Error::BackendUnavailable {
                    backend,
                    reason: "the context has no device".into(),
                }),
        }
    }
}

/// A cell of any scalar type.
#[derive(Debug)]
pub enum ScalarCell {
    /// Half precision.
    F16(Box<dyn Cell<f16>>),
    /// Single precision.
    F32(Box<dyn Cell<f32>>),
    /// Double precision.
    F64(Box<dyn Cell<f64>>),
}

macro_for!($T in [f16, f32, f64] {
    paste! {
        impl From<Box<dyn Cell<$T>>> for ScalarCell {
            fn from(cell: Box<dyn Cell<$T>>) -> Self {
                Self::[<$T:upper>](cell)
            }
        }
    }
});

impl ScalarCell {
    /// The scalar type.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::F16(_) => ScalarType::F16,
            Self::F32(_) => ScalarType::F32,
            Self::F64(_) => ScalarType::F64,
        }
    }
    /// The name of the cell.
    pub fn name(&self) -> &str {
        match self {
            Self::F16(cell) => cell.name(),
            Self::F32(cell) => cell.name(),
            Self::F64(cell) => cell.name(),
        }
    }
    /// The kind of the cell.
    pub fn kind(&self) -> CellKind {
        match self {
            Self::F16(cell) => cell.kind(),
            Self::F32(cell) => cell.kind(),
            Self::F64(cell) => cell.kind(),
        }
    }
    /// The cell with scalar type `T`.
    ///
    /// **Errors**
    /// - [`Error::ScalarTypeMismatch`] if the cell has another scalar type.
    pub fn into_cell<T: Scalar>(self) -> Result<Box<dyn Cell<T>>> {
        let actual = self.scalar_type();
        let cell: Box<dyn Any> = match self {
            Self::F16(cell) => Box::new(cell),
            Self::F32(cell) => Box::new(cell),
            Self::F64(cell) => Box::new(cell),
        };
        cell.downcast::<Box<dyn Cell<T>>>()
            .map(|cell| *cell)
            .map_err(|_| Error::ScalarTypeMismatch {
                expected: T::scalar_type(),
                actual,
            })
    }
}

/// Creates a cell from its name and description.
pub type CellFactory =
    Arc<dyn Fn(&str, &CellDesc, &CellContext) -> Result<ScalarCell> + Send + Sync>;

/// Builds the cell described by `desc` with `kernels`.
fn build_cell<T: Scalar, K>(
    kernels: K,
    target: Target,
    name: &str,
    desc: &CellDesc,
    solver: SgdConfig,
) -> Box<dyn Cell<T>>
where
    K: FcKernel<T> + ConvKernel<T> + PoolKernel<T> + BatchNormKernel<T> + ProposalKernel<T>,
    K: 'static,
{
    let kernels = Arc::new(kernels);
    match desc.clone() {
        CellDesc::Fc(desc) => Box::new(FcCell::new(name, desc, target, kernels).with_solver(solver)),
        CellDesc::Conv(desc) => {
            Box::new(ConvCell::new(name, desc, target, kernels).with_solver(solver))
        }
        CellDesc::Deconv(desc) => {
            Box::new(DeconvCell::new(name, desc, target, kernels).with_solver(solver))
        }
        CellDesc::Pool(desc) => Box::new(PoolCell::new(name, desc, target, kernels)),
        CellDesc::BatchNorm(desc) => {
            Box::new(BatchNormCell::new(name, desc, target, kernels).with_solver(solver))
        }
        CellDesc::Proposal(desc) => Box::new(ProposalCell::new(name, desc, target, kernels)),
    }
}

/// Cell factories keyed by backend, scalar type and cell kind.
#[derive(Clone, Default)]
pub struct CellRegistry {
    factories: HashMap<(Backend, ScalarType, CellKind), CellFactory>,
}

impl Debug for CellRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut keys: Vec<_> = self.factories.keys().collect();
        keys.sort_by_key(|(backend, scalar_type, kind)| (*backend as u8, *scalar_type as u8, *kind));
        f.debug_struct("CellRegistry").field("factories", &keys).finish()
    }
}

impl CellRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }
    /// A registry with every cell kind for every backend and scalar type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in CellKind::ALL {
            macro_for!($T in [f16, f32, f64] {
                registry.register(Backend::Host, $T::scalar_type(), kind, |name, desc, context| {
                    let target = context.target(Backend::Host)?;
                    Ok(build_cell::<$T, _>(HostKernels, target, name, desc, context.solver).into())
                });
                registry.register(Backend::Device, $T::scalar_type(), kind, |name, desc, context| {
                    let target = context.target(Backend::Device)?;
                    Ok(build_cell::<$T, _>(DeviceKernels, target, name, desc, context.solver).into())
                });
            });
        }
        registry
    }
    /// Registers `factory`, returning the previous one.
    pub fn register<F>(
        &mut self,
        backend: Backend,
        scalar_type: ScalarType,
        kind: CellKind,
        factory: F,
    ) -> Option<CellFactory>
    where
        F: Fn(&str, &CellDesc, &CellContext) -> Result<ScalarCell> + Send + Sync + 'static,
    {
        self.factories
            .insert((backend, scalar_type, kind), Arc::new(factory))
    }
    /// Whether a factory is registered.
    pub fn contains(&self, backend: Backend, scalar_type: ScalarType, kind: CellKind) -> bool {
        self.factories.contains_key(&(backend, scalar_type, kind))
    }
    /// Creates a cell from the names of the backend and the scalar type.
    ///
    /// **Errors**
    /// - [`Error::UnsupportedBackend`] if the names are unknown or no factory is registered.
    /// - The factory fails.
    pub fn create(
        &self,
        backend: &str,
        scalar_type: &str,
        name: &str,
        desc: &CellDesc,
        context: &CellContext,
    ) -> Result<ScalarCell> {
        let unsupported = |scalar_type| Error::UnsupportedBackend {
            kind: desc.kind().to_string(),
            backend: backend.to_string(),
            scalar_type,
        };
        let parsed_scalar_type = scalar_type.parse::<ScalarType>().ok();
        let (Ok(parsed_backend), Some(parsed_scalar_type)) =
            (backend.parse::<Backend>(), parsed_scalar_type)
        else {
            return Err(unsupported(parsed_scalar_type));
        };
        let factory = self
            .factories
            .get(&(parsed_backend, parsed_scalar_type, desc.kind()))
            .ok_or_else(|| unsupported(Some(parsed_scalar_type)))?;
        let cell = factory(name, desc, context)?;
        tracing::debug!(
            cell = %name,
            kind = %desc.kind(),
            backend = %parsed_backend,
            scalar_type = %parsed_scalar_type,
            "created cell"
        );
        Ok(cell)
    }
    /// Creates a cell with scalar type `T`.
    ///
    /// **Errors**
    /// - See [`.create()`](Self::create).
    pub fn create_cell<T: Scalar>(
        &self,
        backend: Backend,
        name: &str,
        desc: &CellDesc,
        context: &CellContext,
    ) -> Result<Box<dyn Cell<T>>> {
        self.create(
            backend.name(),
            T::scalar_type().name(),
            name,
            desc,
            context,
        )?
        .into_cell()
    }
}
