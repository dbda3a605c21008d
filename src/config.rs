/*!
Cell options and parameter fillers.

Graph descriptions configure cells with a map of named, typed options, ie `NoBias = true` or
`MovingAverageMomentum = 0.9`. Each cell description consumes the options it knows and rejects
the others with [`Error::UnknownParameter`].

```
# use cellframe::{config::CellParameters, cell::fc::FcDesc};
# fn main() -> cellframe::Result<()> {
let parameters = CellParameters::from_json(r#"{ "NoBias": true }"#)?;
let desc = FcDesc::new(10).with_parameters(&parameters)?;
assert!(desc.no_bias);
# Ok(())
# }
```
*/
use crate::{
    error::{Error, Result},
    scalar::Scalar,
    tensor::Tensor,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An option value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string.
    Str(String),
}

impl From<bool> for ParameterValue {
    fn from(x: bool) -> Self {
        Self::Bool(x)
    }
}

impl From<i64> for ParameterValue {
    fn from(x: i64) -> Self {
        Self::Int(x)
    }
}

impl From<i32> for ParameterValue {
    fn from(x: i32) -> Self {
        Self::Int(x.into())
    }
}

impl From<usize> for ParameterValue {
    fn from(x: usize) -> Self {
        Self::Int(x as i64)
    }
}

impl From<f64> for ParameterValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for ParameterValue {
    fn from(x: &str) -> Self {
        Self::Str(x.to_string())
    }
}

/// Named options of a cell.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellParameters {
    values: BTreeMap<String, ParameterValue>,
}

impl CellParameters {
    /// No options.
    pub fn new() -> Self {
        Self::default()
    }
    /// Parses a JSON object of options.
    ///
    /// **Errors**
    /// - `json` is not an object of booleans, numbers and strings.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidParameter {
            name: "<json>".into(),
            reason: e.to_string(),
        })
    }
    /// Adds an option.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.insert(name, value);
        self
    }
    /// Inserts an option, returning the previous value.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Option<ParameterValue> {
        self.values.insert(name.into(), value.into())
    }
    /// The option `name`.
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }
    /// Iterates over the options.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
    /// Whether there are no options.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub(crate) fn as_bool(name: &str, value: &ParameterValue) -> Result<bool> {
    match value {
        ParameterValue::Bool(x) => Ok(*x),
        ParameterValue::Int(x) => Ok(*x != 0),
        ParameterValue::Str(s) => match s.as_str() {
            "1" | "true" | "True" | "yes" => Ok(true),
            "0" | "false" | "False" | "no" => Ok(false),
            _ => Err(invalid(name, format!("expected a boolean, found {s:?}"))),
        },
        ParameterValue::Float(x) => Err(invalid(name, format!("expected a boolean, found {x}"))),
    }
}

pub(crate) fn as_f64(name: &str, value: &ParameterValue) -> Result<f64> {
    match value {
        ParameterValue::Float(x) => Ok(*x),
        ParameterValue::Int(x) => Ok(*x as f64),
        ParameterValue::Str(s) => s
            .parse()
            .map_err(|_| invalid(name, format!("expected a number, found {s:?}"))),
        ParameterValue::Bool(x) => Err(invalid(name, format!("expected a number, found {x}"))),
    }
}

pub(crate) fn as_usize(name: &str, value: &ParameterValue) -> Result<usize> {
    match value {
        ParameterValue::Int(x) => {
            usize::try_from(*x).map_err(|_| invalid(name, format!("expected a count, found {x}")))
        }
        ParameterValue::Str(s) => s
            .parse()
            .map_err(|_| invalid(name, format!("expected a count, found {s:?}"))),
        value => Err(invalid(name, format!("expected a count, found {value:?}"))),
    }
}

pub(crate) fn as_str<'a>(name: &str, value: &'a ParameterValue) -> Result<&'a str> {
    match value {
        ParameterValue::Str(s) => Ok(s),
        value => Err(invalid(name, format!("expected a string, found {value:?}"))),
    }
}

fn invalid(name: &str, reason: String) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        reason,
    }
}

pub(crate) fn unknown(kind: &str, name: &str) -> Error {
    Error::UnknownParameter {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// Initial values of a parameter tensor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filler {
    /// Every element is the value.
    Constant(f64),
    /// Uniform in `[min, max)`.
    Uniform {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// Uniform in `[-sqrt(3 / fan_in), sqrt(3 / fan_in))`.
    Xavier,
}

impl Filler {
    /// Fills `tensor`, where `fan_in` is the number of inputs of each output.
    pub fn fill<T: Scalar>(&self, tensor: &mut Tensor<T>, fan_in: usize) {
        let mut rng = rand::thread_rng();
        match *self {
            Self::Constant(x) => tensor.fill(T::from_f64(x)),
            Self::Uniform { min, max } => {
                for x in tensor.as_mut_slice() {
                    *x = T::from_f64(if min < max { rng.gen_range(min..max) } else { min });
                }
            }
            Self::Xavier => {
                let scale = (3. / fan_in.max(1) as f64).sqrt();
                for x in tensor.as_mut_slice() {
                    *x = T::from_f64(rng.gen_range(-scale..scale));
                }
            }
        }
    }
}
