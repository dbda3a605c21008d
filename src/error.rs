use crate::{registry::Backend, scalar::ScalarType};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Errors.
///
/// Structural errors (configuration, shapes, persistence) are returned. Numerical gradient
/// check mismatches are not errors, they are reported through [`tracing`] and the
/// [`GradientReport`](crate::gradient_check::GradientReport).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A cell is configured in a way that can not be initialized.
    #[error("invalid configuration in cell {cell:?}: {reason}")]
    InvalidConfiguration {
        /// The cell name.
        cell: String,
        /// Description.
        reason: String,
    },
    /// A cell is asked to do something it does not implement, ie concatenated inputs for batch
    /// normalization.
    #[error("unsupported configuration in cell {cell:?}: {reason}")]
    UnsupportedConfiguration {
        /// The cell name.
        cell: String,
        /// Description.
        reason: String,
    },
    /// An input is incompatible with the cell.
    #[error("dimension mismatch in cell {cell:?}: {reason}")]
    DimensionMismatch {
        /// The cell name.
        cell: String,
        /// Description.
        reason: String,
    },
    /// A tensor does not have the expected shape.
    #[error("shape mismatch in cell {cell:?} for {what}: expected {expected:?}, found {actual:?}")]
    ShapeMismatch {
        /// The cell name.
        cell: String,
        /// The tensor.
        what: String,
        /// The expected dims.
        expected: Vec<usize>,
        /// The actual dims.
        actual: Vec<usize>,
    },
    /// The number of elements does not match the dims of a tensor.
    #[error("dims {dims:?} do not match {len} elements")]
    InvalidShape {
        /// The dims.
        dims: Vec<usize>,
        /// The number of elements.
        len: usize,
    },
    /// A parameter stream is shorter or longer than the parameters of the cell.
    #[error("corrupt parameter file {path:?}: {reason}")]
    ParameterFileCorrupt {
        /// The file.
        path: PathBuf,
        /// Description.
        reason: String,
    },
    /// An io error.
    #[error("io error for {path:?}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// The error.
        #[source]
        source: io::Error,
    },
    /// No cell implementation registered for the backend and scalar type.
    #[error("{kind} is not implemented for backend {backend:?} with scalar type {scalar_type:?}")]
    UnsupportedBackend {
        /// The kind of cell.
        kind: String,
        /// The backend name.
        backend: String,
        /// The scalar type.
        scalar_type: Option<ScalarType>,
    },
    /// Backward pass invoked without the matching training forward pass.
    #[error("cell {cell:?} requires a training propagate before backPropagate")]
    PrecedingForwardRequired {
        /// The cell name.
        cell: String,
    },
    /// A lifecycle operation was called in the wrong state.
    #[error("cell {cell:?} can not {operation} in state {state}")]
    InvalidState {
        /// The cell name.
        cell: String,
        /// The operation.
        operation: &'static str,
        /// The current state.
        state: String,
    },
    /// An option is not known by the cell.
    #[error("unknown parameter {name:?} for {kind}")]
    UnknownParameter {
        /// The kind of cell.
        kind: String,
        /// The option name.
        name: String,
    },
    /// An option has the wrong type or value.
    #[error("invalid value for parameter {name:?}: {reason}")]
    InvalidParameter {
        /// The option name.
        name: String,
        /// Description.
        reason: String,
    },
    /// A cell was created with a different scalar type than requested.
    #[error("expected scalar type {expected}, found {actual}")]
    ScalarTypeMismatch {
        /// The requested scalar type.
        expected: ScalarType,
        /// The scalar type of the cell.
        actual: ScalarType,
    },
    /// A cell is missing from a graph.
    #[error("no cell named {0:?}")]
    CellNotFound(String),
    /// The device does not have enough free memory for an allocation.
    #[error("device {index} out of memory: requested {requested} bytes with {available} bytes available")]
    DeviceOutOfMemory {
        /// The device index.
        index: usize,
        /// Bytes requested.
        requested: usize,
        /// Bytes available.
        available: usize,
    },
    /// A backend mismatch, ie a host buffer passed to a device primitive.
    #[error("backend {backend:?} unavailable: {reason}")]
    BackendUnavailable {
        /// The backend.
        backend: Backend,
        /// Description.
        reason: String,
    },
}

impl Error {
    pub(crate) fn invalid_configuration(cell: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            cell: cell.into(),
            reason: reason.into(),
        }
    }
    pub(crate) fn unsupported_configuration(
        cell: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnsupportedConfiguration {
            cell: cell.into(),
            reason: reason.into(),
        }
    }
    pub(crate) fn dimension_mismatch(cell: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DimensionMismatch {
            cell: cell.into(),
            reason: reason.into(),
        }
    }
    pub(crate) fn shape_mismatch(
        cell: impl Into<String>,
        what: impl Into<String>,
        expected: &[usize],
        actual: &[usize],
    ) -> Self {
        Self::ShapeMismatch {
            cell: cell.into(),
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ParameterFileCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result with [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
