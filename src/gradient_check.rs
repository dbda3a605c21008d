/*!
Finite difference checks of the gradients computed by cells.

The check defines the loss `L = sum(r * y)` over the outputs `y` of a cell, with a random
probe `r`. The analytic gradients are obtained by back propagating `r`, and compared with
the central differences `(L(x + e) - L(x - e)) / 2e` of every parameter and input element.

```
# use cellframe::{backend::{HostKernels, Target}, cell::{Cell, fc::{FcCell, FcDesc}, source::Source}};
# use std::sync::Arc;
# fn main() -> cellframe::Result<()> {
let source = Source::<f64>::new("x", [2, 2, 3, 4]).with_gradient();
let mut fc = FcCell::new("fc", FcDesc::new(5), Target::Host, Arc::new(HostKernels));
fc.add_input(&source, None)?;
fc.initialize()?;
let report = fc.check_gradient(1e-6, 1e-4)?;
assert!(report.passed(), "{report}");
# Ok(())
# }
```
*/
use crate::{
    cell::Cell,
    error::Result,
    scalar::Scalar,
    solver::SharedParameter,
    tensor::{mirrored::SharedTensor, Tensor},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fmt::{self, Display};

/// The relative error `|a - b| / max(|a|, |b|, 1)`, absolute for small magnitudes.
pub fn relative_error(a: f64, b: f64) -> f64 {
    (a - b).abs() / a.abs().max(b.abs()).max(1.)
}

/// The result for one parameter or input group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GradientEntry {
    /// `"weights[k]"`, `"bias"`, ..., or `"inputs[k]"`.
    pub name: String,
    /// The number of elements compared.
    pub checked: usize,
    /// The number of elements skipped at a discontinuity.
    pub skipped: usize,
    /// The number of elements with an error above the tolerance.
    pub mismatches: usize,
    /// The largest relative error.
    pub max_error: f64,
}

/// The result of a gradient check.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GradientReport {
    /// The cell name.
    pub cell: String,
    /// One entry per parameter, then per input group with a gradient slot.
    pub entries: Vec<GradientEntry>,
}

impl GradientReport {
    /// An empty report.
    pub fn new(cell: impl Into<String>) -> Self {
        Self {
            cell: cell.into(),
            entries: Vec::new(),
        }
    }
    /// Whether no element mismatched.
    pub fn passed(&self) -> bool {
        self.entries.iter().all(|e| e.mismatches == 0)
    }
    /// The entry `name`.
    pub fn entry(&self, name: &str) -> Option<&GradientEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
    /// The number of elements compared.
    pub fn checked(&self) -> usize {
        self.entries.iter().map(|e| e.checked).sum()
    }
}

impl Display for GradientReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "gradient check of {:?}:", self.cell)?;
        for e in self.entries.iter() {
            writeln!(
                f,
                "  {}: {} checked, {} skipped, {} mismatches, max relative error {:.3e}",
                e.name, e.checked, e.skipped, e.mismatches, e.max_error
            )?;
        }
        Ok(())
    }
}

/// Finite difference gradient check.
#[derive(Clone, Copy, Debug)]
pub struct GradientCheck {
    epsilon: f64,
    max_error: f64,
    seed: u64,
}

struct Probe {
    derivative: f64,
    smooth: bool,
}

impl GradientCheck {
    /// A check with perturbations of `epsilon` and a tolerance of `max_error`.
    pub fn new(epsilon: f64, max_error: f64) -> Self {
        Self {
            epsilon,
            max_error,
            seed: 0,
        }
    }
    /// Seeds the probe.
    pub fn with_seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }
    /// Checks the gradients of the parameters and the inputs of `cell`.
    ///
    /// The cell must be initialized. The parameters, including running statistics, are
    /// restored afterwards and no gradient is left pending. Mismatches are logged with
    /// [`tracing::warn!`] and counted in the report.
    ///
    /// **Errors**
    /// - Propagation fails.
    pub fn check<T: Scalar, C: Cell<T> + ?Sized>(&self, cell: &mut C) -> Result<GradientReport> {
        let mut report = GradientReport::new(cell.name());
        let snapshot: Vec<(SharedParameter<T>, Tensor<T>)> = cell
            .free_parameters()
            .into_iter()
            .map(|p| {
                let value = p.lock().value_mut().host().clone();
                (p, value)
            })
            .collect();
        cell.propagate(false)?;
        let size = cell.outputs().read().size();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let probe: Vec<f64> = (0..size).map(|_| rng.gen_range(-1. ..1.)).collect();
        let base = loss(cell, &probe)?;
        self.back_propagate_probe(cell, &probe)?;

        for (name, parameter) in cell.parameters() {
            let analytic = parameter.lock().grad_mut().host().to_f64s();
            let mut entry = GradientEntry {
                name,
                ..GradientEntry::default()
            };
            for (i, analytic) in analytic.iter().enumerate() {
                let x = parameter.lock().value_mut().host().as_slice()[i];
                let numeric = self.probe(cell, &probe, base, x, |x| {
                    parameter.lock().value_mut().host_mut().as_mut_slice()[i] = x;
                })?;
                self.compare(cell, &mut entry, i, *analytic, numeric);
            }
            report.entries.push(entry);
        }

        let groups: Vec<_> = cell
            .base()
            .inputs()
            .iter()
            .cloned()
            .zip(cell.base().diff_outputs().iter().cloned())
            .collect();
        if groups.iter().all(|(_, slot)| slot.is_none()) {
            tracing::warn!(cell = %cell.name(), "no gradient slots, inputs are not checked");
        }
        for (k, (input, slot)) in groups.into_iter().enumerate() {
            let Some(slot) = slot else {
                continue;
            };
            let analytic = slot.tensor().write().host().to_f64s();
            let mut entry = GradientEntry {
                name: format!("inputs[{k}]"),
                ..GradientEntry::default()
            };
            for i in group_indices(input.tensor(), input.channels()) {
                let x = input.tensor().write().host().as_slice()[i];
                let tensor = input.tensor().clone();
                let numeric = self.probe(cell, &probe, base, x, |x| {
                    tensor.write().host_mut().as_mut_slice()[i] = x;
                })?;
                self.compare(cell, &mut entry, i, analytic[i], numeric);
            }
            report.entries.push(entry);
        }

        cell.propagate(false)?;
        for (parameter, value) in snapshot {
            let mut parameter = parameter.lock();
            parameter
                .value_mut()
                .host_discard()
                .as_mut_slice()
                .copy_from_slice(value.as_slice());
            parameter.clear_pending();
        }
        for slot in cell.base().diff_outputs().iter().flatten() {
            slot.tensor().write().clear_valid();
        }
        if report.passed() {
            tracing::debug!(cell = %report.cell, checked = report.checked(), "gradient check passed");
        }
        Ok(report)
    }
    /// Back propagates `probe` as the gradient of the outputs, overwriting every gradient.
    fn back_propagate_probe<T: Scalar, C: Cell<T> + ?Sized>(
        &self,
        cell: &mut C,
        probe: &[f64],
    ) -> Result<()> {
        for (_, parameter) in cell.parameters() {
            parameter.lock().clear_pending();
        }
        for slot in cell.base().diff_outputs().iter().flatten() {
            slot.tensor().write().clear_valid();
        }
        {
            let mut diff_inputs = cell.diff_inputs().write();
            for (dy, r) in diff_inputs.host_discard().as_mut_slice().iter_mut().zip(probe) {
                *dy = T::from_f64(*r);
            }
            diff_inputs.set_valid();
        }
        cell.back_propagate()
    }
    fn probe<T: Scalar, C: Cell<T> + ?Sized>(
        &self,
        cell: &mut C,
        weights: &[f64],
        base: f64,
        x: T,
        mut set: impl FnMut(T),
    ) -> Result<Probe> {
        let epsilon = self.epsilon;
        set(T::from_f64(x.as_f64() + epsilon));
        let plus = loss(cell, weights);
        set(T::from_f64(x.as_f64() - epsilon));
        let minus = loss(cell, weights);
        set(x);
        let (plus, minus) = (plus?, minus?);
        let forward = (plus - base) / epsilon;
        let backward = (base - minus) / epsilon;
        Ok(Probe {
            derivative: (plus - minus) / (2. * epsilon),
            smooth: relative_error(forward, backward) <= self.max_error,
        })
    }
    fn compare<T: Scalar, C: Cell<T> + ?Sized>(
        &self,
        cell: &C,
        entry: &mut GradientEntry,
        index: usize,
        analytic: f64,
        probe: Probe,
    ) {
        if !probe.smooth && !cell.is_differentiable() {
            entry.skipped += 1;
            return;
        }
        let error = relative_error(analytic, probe.derivative);
        entry.checked += 1;
        entry.max_error = entry.max_error.max(error);
        if error > self.max_error {
            entry.mismatches += 1;
            tracing::warn!(
                cell = %cell.name(),
                gradient = %entry.name,
                index,
                analytic,
                numeric = probe.derivative,
                error,
                "gradient mismatch"
            );
        }
    }
}

/// The loss `sum(weights * outputs)` after a training propagate.
fn loss<T: Scalar, C: Cell<T> + ?Sized>(cell: &mut C, weights: &[f64]) -> Result<f64> {
    cell.propagate(false)?;
    let mut outputs = cell.outputs().write();
    Ok(outputs
        .host()
        .as_slice()
        .iter()
        .zip(weights)
        .map(|(y, r)| y.as_f64() * r)
        .sum())
}

/// The offsets of the elements of `channels` of `tensor`.
fn group_indices<T: Scalar>(
    tensor: &SharedTensor<T>,
    channels: std::ops::Range<usize>,
) -> Vec<usize> {
    let [x, y, z, b] = tensor.read().dims4();
    let xy = x * y;
    (0..b)
        .flat_map(|b| {
            let channels = channels.clone();
            channels.flat_map(move |c| {
                let start = (b * z + c) * xy;
                start..start + xy
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{HostKernels, Target},
        cell::{
            fc::{FcCell, FcDesc},
            source::Source,
        },
        error::Error,
        tensor::mirrored::MirroredTensor,
    };
    use std::sync::Arc;

    #[test]
    fn relative_errors() {
        assert_eq!(relative_error(1e-3, 2e-3), 1e-3);
        assert_eq!(relative_error(10., 11.), 1. / 11.);
    }

    #[test]
    fn group_offsets() {
        let tensor = MirroredTensor::<f32>::zeros([2, 1, 3, 2]).into_shared();
        assert_eq!(group_indices(&tensor, 1..2), [2, 3, 8, 9]);
    }

    #[test]
    fn check_fc_restores_parameters() -> Result<()> {
        let source = Source::<f64>::new("x", [3, 1, 2, 2]).with_gradient();
        let mut fc = FcCell::new("fc", FcDesc::new(2), Target::Host, Arc::new(HostKernels));
        fc.add_input(&source, Some(0..1))?;
        fc.initialize()?;
        let weights = fc.weights(0).cloned().ok_or(Error::CellNotFound("weights".into()))?;
        let before = weights.lock().value_mut().host().clone();
        let report = GradientCheck::new(1e-6, 1e-5).with_seed(3).check(&mut fc)?;
        assert!(report.passed(), "{report}");
        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.entry("weights[0]").map(|e| e.checked), Some(6));
        assert_eq!(report.entry("inputs[0]").map(|e| e.checked), Some(6));
        assert_eq!(weights.lock().value_mut().host(), &before);
        assert!(!weights.lock().is_pending());
        Ok(())
    }

    #[test]
    fn report_display() {
        let mut report = GradientReport::new("pool");
        report.entries.push(GradientEntry {
            name: "inputs[0]".into(),
            checked: 3,
            skipped: 1,
            mismatches: 1,
            max_error: 0.5,
        });
        assert!(!report.passed());
        assert!(report.to_string().contains("inputs[0]: 3 checked, 1 skipped, 1 mismatches"));
    }
}
