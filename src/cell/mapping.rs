use crate::error::{Error, Result};
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connectivity from input channels to output channels.
///
/// `mapping.get(channel, output)` is true if `channel` contributes to `output`. Rows are the
/// concatenated channels of every input group, in the order the groups were added.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    matrix: Array2<bool>,
}

impl Mapping {
    /// Every channel connects to every output.
    pub fn full(nb_channels: usize, nb_outputs: usize) -> Self {
        Self {
            matrix: Array2::from_elem((nb_channels, nb_outputs), true),
        }
    }
    /// Channel `i` only connects to output `i`.
    pub fn one_to_one(n: usize) -> Self {
        Self::from_fn(n, n, |c, o| c == o)
    }
    /// Creates a mapping with `f(channel, output)`.
    pub fn from_fn(
        nb_channels: usize,
        nb_outputs: usize,
        mut f: impl FnMut(usize, usize) -> bool,
    ) -> Self {
        Self {
            matrix: Array2::from_shape_fn((nb_channels, nb_outputs), |(c, o)| f(c, o)),
        }
    }
    /// Parses rows of 0 and 1, one row per channel.
    ///
    /// ```
    /// # use cellframe::cell::mapping::Mapping;
    /// # fn main() -> cellframe::Result<()> {
    /// let mapping: Mapping = "1 0\n1 1\n0 1".parse()?;
    /// assert!(mapping.get(1, 0) && !mapping.get(2, 0));
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_rows(rows: &str) -> Result<Self> {
        let rows: Vec<Vec<bool>> = rows
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.split_whitespace()
                    .map(|x| match x {
                        "0" => Ok(false),
                        "1" => Ok(true),
                        _ => Err(invalid(format!("expected 0 or 1, found {x:?}"))),
                    })
                    .collect()
            })
            .collect::<Result<_>>()?;
        let nb_outputs = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != nb_outputs) {
            return Err(invalid("rows have different lengths".into()));
        }
        let nb_channels = rows.len();
        let data = rows.into_iter().flatten().collect();
        let matrix = Array2::from_shape_vec((nb_channels, nb_outputs), data)
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self { matrix })
    }
    /// The number of input channels.
    pub fn nb_channels(&self) -> usize {
        self.matrix.nrows()
    }
    /// The number of outputs.
    pub fn nb_outputs(&self) -> usize {
        self.matrix.ncols()
    }
    /// Whether `channel` connects to `output`.
    ///
    /// # Panics
    /// Panics if out of bounds.
    pub fn get(&self, channel: usize, output: usize) -> bool {
        self.matrix[(channel, output)]
    }
    /// Connects or disconnects `channel` and `output`.
    ///
    /// # Panics
    /// Panics if out of bounds.
    pub fn set(&mut self, channel: usize, output: usize, connected: bool) {
        self.matrix[(channel, output)] = connected;
    }
    /// The matrix, `(channels, outputs)`.
    pub fn view(&self) -> ArrayView2<bool> {
        self.matrix.view()
    }
    /// The rows of the `len` channels starting at `offset`, ie those of one input group.
    pub fn rows(&self, offset: usize, len: usize) -> ArrayView2<bool> {
        self.matrix.slice(s![offset..offset + len, ..])
    }
}

impl std::str::FromStr for Mapping {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_rows(s)
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Mapping [")?;
        for row in self.matrix.rows() {
            let row: Vec<_> = row.iter().map(|x| u8::from(*x)).collect();
            writeln!(f, "    {row:?},")?;
        }
        write!(f, "]")
    }
}

fn invalid(reason: String) -> Error {
    Error::InvalidParameter {
        name: "Mapping".into(),
        reason,
    }
}
