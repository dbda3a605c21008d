use super::{group_view4, Cell, CellBase, CellKind, CellState};
use crate::{
    backend::Target,
    config::{self, CellParameters},
    error::{Error, Result},
    gradient_check::GradientReport,
    scalar::Scalar,
    tensor::array_view4_mut,
};
use ndarray::{Array4, ArrayView3, ArrayView4, ArrayViewMut3, ArrayViewMut4};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt::Debug, sync::Arc};

/// Region proposal kernel.
///
/// ROIs are `(batch, 4, 1, R)` with `x, y, w, h` channels, scores `(batch, classes, 1, R)`,
/// deltas `(batch, 4 * classes, 1, R)` and outputs `(batch, 4 or 5, 1, proposals)`.
pub trait ProposalKernel<T: Scalar>: Send + Sync + Debug {
    /// Writes the proposals of every batch item.
    fn forward(
        &self,
        desc: &ProposalDesc,
        rois: ArrayView4<T>,
        scores: ArrayView4<T>,
        deltas: ArrayView4<T>,
        outputs: ArrayViewMut4<T>,
    );
}

/// Description of a proposal cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposalDesc {
    /// The number of proposals per batch item.
    pub nb_proposals: usize,
    /// Suppresses overlapping proposals.
    #[serde(default)]
    pub nms: bool,
    /// Proposals overlapping a better one by more than this are suppressed.
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f64,
    /// ROIs scoring below this are dropped.
    #[serde(default)]
    pub score_threshold: f64,
    /// Means the deltas were normalized with, `[x, y, w, h]`.
    #[serde(default)]
    pub means_factor: [f64; 4],
    /// Standard deviations the deltas were normalized with, `[x, y, w, h]`.
    #[serde(default = "default_std_factor")]
    pub std_factor: [f64; 4],
    /// Adds a 5th output channel with the class of each proposal.
    #[serde(default)]
    pub keep_class: bool,
}

fn default_iou_threshold() -> f64 {
    0.3
}

fn default_std_factor() -> [f64; 4] {
    [0.1, 0.1, 0.2, 0.2]
}

impl ProposalDesc {
    /// A description with `nb_proposals` proposals and no suppression.
    pub fn new(nb_proposals: usize) -> Self {
        Self {
            nb_proposals,
            nms: false,
            iou_threshold: default_iou_threshold(),
            score_threshold: 0.,
            means_factor: [0.; 4],
            std_factor: default_std_factor(),
            keep_class: false,
        }
    }
    /// Enables suppression at `iou_threshold`.
    pub fn with_nms(self, iou_threshold: f64) -> Self {
        Self {
            nms: true,
            iou_threshold,
            ..self
        }
    }
    /// Sets the score threshold.
    pub fn with_score_threshold(self, score_threshold: f64) -> Self {
        Self {
            score_threshold,
            ..self
        }
    }
    /// Sets the normalization of the deltas.
    pub fn with_factors(self, means_factor: [f64; 4], std_factor: [f64; 4]) -> Self {
        Self {
            means_factor,
            std_factor,
            ..self
        }
    }
    /// Adds the class channel.
    pub fn with_keep_class(self, keep_class: bool) -> Self {
        Self { keep_class, ..self }
    }
    /// The number of output channels, 4 or 5.
    pub fn nb_outputs(&self) -> usize {
        if self.keep_class {
            5
        } else {
            4
        }
    }
    /// Applies the options `NbProposals`, `NMS`, `IoUThreshold`, `ScoreThreshold` and
    /// `KeepClass`.
    ///
    /// **Errors**
    /// - An option is unknown or has the wrong type.
    pub fn with_parameters(mut self, parameters: &CellParameters) -> Result<Self> {
        for (name, value) in parameters.iter() {
            match name {
                "NbProposals" => self.nb_proposals = config::as_usize(name, value)?,
                "NMS" => self.nms = config::as_bool(name, value)?,
                "IoUThreshold" => self.iou_threshold = config::as_f64(name, value)?,
                "ScoreThreshold" => self.score_threshold = config::as_f64(name, value)?,
                "KeepClass" => self.keep_class = config::as_bool(name, value)?,
                _ => return Err(config::unknown("Proposal", name)),
            }
        }
        Ok(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Proposal {
    bbox: [f64; 4],
    score: f64,
    class: usize,
}

fn iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let w = (a[0] + a[2]).min(b[0] + b[2]) - a[0].max(b[0]);
    let h = (a[1] + a[3]).min(b[1] + b[3]) - a[1].max(b[1]);
    if w <= 0. || h <= 0. {
        return 0.;
    }
    let intersection = w * h;
    let union = a[2] * a[3] + b[2] * b[3] - intersection;
    if union > 0. {
        intersection / union
    } else {
        0.
    }
}

/// Computes the proposals of one batch item.
///
/// Class 0 is the background unless there is a single class.
pub(crate) fn propose<T: Scalar>(
    desc: &ProposalDesc,
    rois: ArrayView3<T>,
    scores: ArrayView3<T>,
    deltas: ArrayView3<T>,
    mut outputs: ArrayViewMut3<T>,
) {
    let nb_rois = rois.shape()[2];
    let nb_class = scores.shape()[0];
    let first_class = usize::from(nb_class > 1);
    let mut proposals = Vec::with_capacity(nb_rois);
    for r in 0..nb_rois {
        let best = (first_class..nb_class)
            .map(|c| (c, scores[(c, 0, r)].as_f64()))
            .fold(None, |best: Option<(usize, f64)>, (c, s)| match best {
                Some((_, b)) if b >= s => best,
                _ => Some((c, s)),
            });
        let Some((class, score)) = best else {
            continue;
        };
        if score < desc.score_threshold {
            continue;
        }
        let [x, y, w, h] = [0, 1, 2, 3].map(|j| rois[(j, 0, r)].as_f64());
        let [dx, dy, dw, dh] = [0, 1, 2, 3].map(|j| {
            deltas[(4 * class + j, 0, r)].as_f64() * desc.std_factor[j] + desc.means_factor[j]
        });
        let cx = x + 0.5 * w + dx * w;
        let cy = y + 0.5 * h + dy * h;
        let w = w * dw.exp();
        let h = h * dh.exp();
        proposals.push(Proposal {
            bbox: [cx - 0.5 * w, cy - 0.5 * h, w, h],
            score,
            class,
        });
    }
    proposals.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let mut kept: Vec<Proposal> = Vec::with_capacity(desc.nb_proposals);
    for proposal in proposals {
        if kept.len() == desc.nb_proposals {
            break;
        }
        if desc.nms
            && kept
                .iter()
                .any(|k| iou(&k.bbox, &proposal.bbox) > desc.iou_threshold)
        {
            continue;
        }
        kept.push(proposal);
    }
    outputs.fill(T::zero());
    for (p, proposal) in kept.iter().enumerate() {
        for (j, x) in proposal.bbox.iter().enumerate() {
            outputs[(j, 0, p)] = T::from_f64(*x);
        }
        if desc.keep_class {
            outputs[(4, 0, p)] = T::from_usize(proposal.class);
        }
    }
}

/// Region proposal cell.
///
/// Takes three inputs, in order: ROIs `[R, 1, 4, batch]`, class scores
/// `[R, 1, classes, batch]` and box deltas `[R, 1, 4 * classes, batch]`. For each ROI the best
/// class is selected, its deltas are applied, and the `nb_proposals` best boxes are written to
/// outputs `[nb_proposals, 1, 4 or 5, batch]`, zero filled if there are fewer.
///
/// The cell has no parameters and does not propagate gradients.
#[derive(Debug)]
pub struct ProposalCell<T: Scalar> {
    base: CellBase<T>,
    desc: ProposalDesc,
    kernel: Arc<dyn ProposalKernel<T>>,
}

impl<T: Scalar> ProposalCell<T> {
    /// Creates a cell running `kernel` on `target`.
    pub fn new(
        name: impl Into<String>,
        desc: ProposalDesc,
        target: Target,
        kernel: Arc<dyn ProposalKernel<T>>,
    ) -> Self {
        let base = CellBase::new(name, CellKind::Proposal, desc.nb_outputs(), target);
        Self { base, desc, kernel }
    }
    /// The description.
    pub fn desc(&self) -> &ProposalDesc {
        &self.desc
    }
}

impl<T: Scalar> Cell<T> for ProposalCell<T> {
    fn base(&self) -> &CellBase<T> {
        &self.base
    }
    fn base_mut(&mut self) -> &mut CellBase<T> {
        &mut self.base
    }
    fn compute_output_dims(&self) -> Result<Vec<usize>> {
        let name = self.base.name();
        if self.desc.nb_proposals == 0 {
            return Err(Error::invalid_configuration(
                name,
                "the number of proposals must be positive",
            ));
        }
        let inputs = self.base.inputs();
        if inputs.len() > 3 {
            return Err(Error::dimension_mismatch(
                name,
                "expected 3 inputs: rois, scores and deltas",
            ));
        }
        let dims: Vec<[usize; 4]> = inputs.iter().map(|e| e.dims4()).collect();
        let [rois, scores, deltas] = <[[usize; 4]; 3]>::try_from(dims).map_err(|_| {
            Error::invalid_configuration(name, "expected 3 inputs: rois, scores and deltas")
        })?;
        if rois[1] != 1 || rois[2] != 4 {
            return Err(Error::dimension_mismatch(
                name,
                format!("rois must be [R, 1, 4, batch], found {rois:?}"),
            ));
        }
        if scores[0] != rois[0] || scores[1] != 1 {
            return Err(Error::dimension_mismatch(
                name,
                format!("scores must be [{}, 1, classes, batch], found {scores:?}", rois[0]),
            ));
        }
        if deltas[0] != rois[0] || deltas[1] != 1 || deltas[2] != 4 * scores[2] {
            return Err(Error::dimension_mismatch(
                name,
                format!(
                    "deltas must be [{}, 1, {}, batch], found {deltas:?}",
                    rois[0],
                    4 * scores[2]
                ),
            ));
        }
        Ok(vec![
            self.desc.nb_proposals,
            1,
            self.desc.nb_outputs(),
            self.base.batch_size(),
        ])
    }
    fn initialize(&mut self) -> Result<()> {
        self.base.begin_initialize()?;
        let dims = self.compute_output_dims()?;
        self.base.resize_outputs(dims)?;
        self.base.finish_initialize();
        Ok(())
    }
    fn propagate(&mut self, _inference: bool) -> Result<()> {
        self.base.begin_propagate()?;
        let target = self.base.target().clone();
        {
            let mut groups = Vec::with_capacity(3);
            for entry in self.base.inputs().iter() {
                let dims = entry.tensor().read().dims4();
                let mut input = entry.tensor().write();
                groups.push(group_view4(dims, entry.channels(), target.read(&mut input)?)?.to_owned());
            }
            let [rois, scores, deltas] = <[Array4<T>; 3]>::try_from(groups)
                .map_err(|_| self.base.invalid_state("propagate"))?;
            let mut outputs = self.base.outputs().write();
            let output_dims = outputs.dims().to_vec();
            let outputs = array_view4_mut(&output_dims, target.discard(&mut outputs)?)?;
            self.kernel
                .forward(&self.desc, rois.view(), scores.view(), deltas.view(), outputs);
        }
        self.base.finish_propagate()
    }
    fn back_propagate(&mut self) -> Result<()> {
        self.base.check_state("back propagate", &[CellState::Ready])
    }
    fn update(&mut self) -> Result<()> {
        Ok(())
    }
    fn check_gradient(&mut self, _epsilon: f64, _max_error: f64) -> Result<GradientReport> {
        Ok(GradientReport::new(self.base.name()))
    }
}
