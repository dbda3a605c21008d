use bytemuck::Pod;
use half::f16;
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

mod sealed {
    use half::f16;

    #[doc(hidden)]
    pub trait Sealed {}

    macro_rules! impl_sealed {
        ($($t:ty),+) => {
            $(
                impl Sealed for $t {}
            )+
        };
    }

    impl_sealed! {f16, f32, f64}
}
use sealed::Sealed;

/// Element types supported by cells.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    /// Half precision.
    F16,
    /// Single precision.
    F32,
    /// Double precision.
    F64,
}

impl ScalarType {
    /// All scalar types.
    pub const ALL: [Self; 3] = [Self::F16, Self::F32, Self::F64];
    /// The name, "half", "float" or "double".
    pub fn name(&self) -> &'static str {
        match self {
            Self::F16 => "half",
            Self::F32 => "float",
            Self::F64 => "double",
        }
    }
    /// The size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::F16 => 2,
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

impl Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScalarType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "half" | "f16" | "F16" => Ok(Self::F16),
            "float" | "f32" | "F32" => Ok(Self::F32),
            "double" | "f64" | "F64" => Ok(Self::F64),
            _ => Err(format!("unknown scalar type {s:?}")),
        }
    }
}

/// Base trait for the element types of cells.
///
/// Kernels are written once, generic over [`Scalar`]. Conversions go through f64 so that
/// constants like epsilon and momentum are specified independent of the precision.
pub trait Scalar: Float + Pod + Default + Debug + Display + Send + Sync + 'static + Sealed {
    /// The [`ScalarType`] of the scalar.
    fn scalar_type() -> ScalarType;
    /// Converts from f64, rounding if necessary.
    fn from_f64(x: f64) -> Self;
    /// Converts to f64.
    fn as_f64(self) -> f64;
    /// Converts from usize.
    fn from_usize(x: usize) -> Self {
        Self::from_f64(x as f64)
    }
}

impl Scalar for f16 {
    fn scalar_type() -> ScalarType {
        ScalarType::F16
    }
    fn from_f64(x: f64) -> Self {
        f16::from_f64(x)
    }
    fn as_f64(self) -> f64 {
        self.to_f64()
    }
}

impl Scalar for f32 {
    fn scalar_type() -> ScalarType {
        ScalarType::F32
    }
    fn from_f64(x: f64) -> Self {
        x as f32
    }
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    fn scalar_type() -> ScalarType {
        ScalarType::F64
    }
    fn from_f64(x: f64) -> Self {
        x
    }
    fn as_f64(self) -> f64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_type_names() {
        for scalar_type in ScalarType::ALL {
            assert_eq!(scalar_type.name().parse::<ScalarType>(), Ok(scalar_type));
        }
        assert_eq!("f32".parse::<ScalarType>(), Ok(ScalarType::F32));
        assert!("int".parse::<ScalarType>().is_err());
    }

    #[test]
    fn scalar_size() {
        assert_eq!(ScalarType::F16.size(), std::mem::size_of::<f16>());
        assert_eq!(ScalarType::F32.size(), std::mem::size_of::<f32>());
        assert_eq!(ScalarType::F64.size(), std::mem::size_of::<f64>());
    }

    #[test]
    fn f16_conversions() {
        assert_eq!(<f16 as Scalar>::from_f64(0.5).as_f64(), 0.5);
        assert_eq!(<f32 as Scalar>::from_usize(3), 3.);
    }
}
