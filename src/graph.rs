/*!
Networks of cells.

A [`DeepNet`] owns [`Source`]s and cells in the order they were added, which must be a
topological order: a cell can only consume the outputs of sources and of cells added before
it. Propagation visits the cells in that order and back propagation in reverse.

Free parameters are persisted per cell as `<name>.syn` in a directory.
*/
use crate::{
    cell::{source::Source, Cell, Producer},
    error::{Error, Result},
    registry::{Backend, CellContext, CellDesc, CellRegistry},
    scalar::Scalar,
    tensor::Tensor,
};
use std::{ops::Range, path::Path};

/// A network of cells.
#[derive(Debug, Default)]
pub struct DeepNet<T: Scalar> {
    sources: Vec<Source<T>>,
    cells: Vec<Box<dyn Cell<T>>>,
    connections: Vec<(String, String)>,
}

impl<T: Scalar> DeepNet<T> {
    /// An empty network.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            cells: Vec::new(),
            connections: Vec::new(),
        }
    }
    fn check_name(&self, name: &str) -> Result<()> {
        let taken = self.sources.iter().any(|s| s.name() == name)
            || self.cells.iter().any(|c| c.name() == name);
        if taken {
            return Err(Error::invalid_configuration(
                name,
                "the name is already used in the network",
            ));
        }
        Ok(())
    }
    /// Adds a source.
    ///
    /// **Errors**
    /// - [`Error::InvalidConfiguration`] if the name is taken.
    pub fn add_source(&mut self, source: Source<T>) -> Result<()> {
        self.check_name(source.name())?;
        self.sources.push(source);
        Ok(())
    }
    /// Adds a cell after the cells already added.
    ///
    /// **Errors**
    /// - [`Error::InvalidConfiguration`] if the name is taken.
    pub fn add_cell(&mut self, cell: Box<dyn Cell<T>>) -> Result<()> {
        self.check_name(cell.name())?;
        self.cells.push(cell);
        Ok(())
    }
    /// Creates a cell with `registry` and adds it.
    ///
    /// **Errors**
    /// - The cell can not be created, see [`CellRegistry::create()`].
    /// - See [`.add_cell()`](Self::add_cell).
    pub fn create_cell(
        &mut self,
        registry: &CellRegistry,
        backend: Backend,
        name: &str,
        desc: &CellDesc,
        context: &CellContext,
    ) -> Result<()> {
        self.check_name(name)?;
        let cell = registry.create_cell::<T>(backend, name, desc, context)?;
        self.add_cell(cell)
    }
    /// The sources.
    pub fn sources(&self) -> &[Source<T>] {
        &self.sources
    }
    /// The cells, in propagation order.
    pub fn cells(&self) -> impl Iterator<Item = &dyn Cell<T>> {
        self.cells.iter().map(|cell| cell.as_ref())
    }
    /// The source named `name`.
    ///
    /// **Errors**
    /// - [`Error::CellNotFound`] if there is no such source.
    pub fn source(&self, name: &str) -> Result<&Source<T>> {
        self.sources
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| Error::CellNotFound(name.to_string()))
    }
    fn position(&self, name: &str) -> Result<usize> {
        self.cells
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| Error::CellNotFound(name.to_string()))
    }
    /// The cell named `name`.
    ///
    /// **Errors**
    /// - [`Error::CellNotFound`] if there is no such cell.
    pub fn cell(&self, name: &str) -> Result<&dyn Cell<T>> {
        let index = self.position(name)?;
        Ok(self.cells[index].as_ref())
    }
    /// The cell named `name`, mutably.
    ///
    /// **Errors**
    /// - [`Error::CellNotFound`] if there is no such cell.
    pub fn cell_mut(&mut self, name: &str) -> Result<&mut dyn Cell<T>> {
        let index = self.position(name)?;
        Ok(self.cells[index].as_mut())
    }
    /// Adds `channels` of the outputs of `producer`, a source or a cell, as an input of
    /// `consumer`.
    ///
    /// **Errors**
    /// - [`Error::CellNotFound`] if either is missing.
    /// - [`Error::InvalidConfiguration`] if `producer` is a cell added after `consumer`.
    /// - See [`Cell::add_input()`].
    pub fn connect(
        &mut self,
        producer: &str,
        consumer: &str,
        channels: Option<Range<usize>>,
    ) -> Result<()> {
        let index = self.position(consumer)?;
        if let Some(source) = self.sources.iter().find(|s| s.name() == producer) {
            self.cells[index].add_input(source, channels)?;
        } else {
            let producer_index = self.position(producer)?;
            if producer_index >= index {
                return Err(Error::invalid_configuration(
                    consumer,
                    format!("producer {producer:?} must be added before its consumers"),
                ));
            }
            let (before, after) = self.cells.split_at_mut(index);
            after[0].add_input(before[producer_index].producer(), channels)?;
        }
        self.connections
            .push((producer.to_string(), consumer.to_string()));
        Ok(())
    }
    fn check_exists(&self, name: &str) -> Result<()> {
        if self.sources.iter().any(|s| s.name() == name) {
            return Ok(());
        }
        self.position(name).map(|_| ())
    }
    /// The producers connected to `name`, in connection order.
    ///
    /// **Errors**
    /// - [`Error::CellNotFound`] if there is no such source or cell.
    pub fn parents(&self, name: &str) -> Result<Vec<&str>> {
        self.check_exists(name)?;
        Ok(self
            .connections
            .iter()
            .filter(|(_, consumer)| consumer == name)
            .map(|(producer, _)| producer.as_str())
            .collect())
    }
    /// The consumers connected to `name`, in connection order.
    ///
    /// **Errors**
    /// - [`Error::CellNotFound`] if there is no such source or cell.
    pub fn children(&self, name: &str) -> Result<Vec<&str>> {
        self.check_exists(name)?;
        Ok(self
            .connections
            .iter()
            .filter(|(producer, _)| producer == name)
            .map(|(_, consumer)| consumer.as_str())
            .collect())
    }
    /// Initializes every cell.
    ///
    /// **Errors**
    /// - A cell fails to initialize.
    pub fn initialize(&mut self) -> Result<()> {
        for cell in self.cells.iter_mut() {
            cell.initialize()?;
        }
        tracing::info!(
            sources = self.sources.len(),
            cells = self.cells.len(),
            "initialized network"
        );
        Ok(())
    }
    /// Propagates every cell.
    ///
    /// Invalidates the gradients of the sources.
    ///
    /// **Errors**
    /// - A cell fails to propagate.
    pub fn propagate(&mut self, inference: bool) -> Result<()> {
        for source in self.sources.iter() {
            source.clear_gradient();
        }
        for cell in self.cells.iter_mut() {
            cell.propagate(inference)?;
        }
        Ok(())
    }
    /// Back propagates every cell in reverse order.
    ///
    /// **Errors**
    /// - A cell fails to back propagate.
    pub fn back_propagate(&mut self) -> Result<()> {
        for cell in self.cells.iter_mut().rev() {
            cell.back_propagate()?;
        }
        Ok(())
    }
    /// Updates the parameters of every cell.
    ///
    /// **Errors**
    /// - A cell fails to update.
    pub fn update(&mut self) -> Result<()> {
        for cell in self.cells.iter_mut() {
            cell.update()?;
        }
        Ok(())
    }
    /// Writes the gradient of the outputs of the cell `name`, ie from a loss.
    ///
    /// **Errors**
    /// - [`Error::CellNotFound`] if there is no such cell.
    /// - [`Error::ShapeMismatch`] if the dims do not match the outputs.
    pub fn set_output_gradient(&self, name: &str, gradient: &Tensor<T>) -> Result<()> {
        let cell = self.cell(name)?;
        let mut diff = cell.diff_inputs().write();
        if diff.dims() != gradient.dims() {
            return Err(Error::shape_mismatch(
                name,
                "output gradient",
                diff.dims(),
                gradient.dims(),
            ));
        }
        diff.host_discard()
            .as_mut_slice()
            .copy_from_slice(gradient.as_slice());
        diff.set_valid();
        Ok(())
    }
    /// A copy of the outputs of the cell `name`.
    ///
    /// **Errors**
    /// - [`Error::CellNotFound`] if there is no such cell.
    pub fn output(&self, name: &str) -> Result<Tensor<T>> {
        Ok(self.cell(name)?.outputs().write().host().clone())
    }
    /// Saves the free parameters of each cell to `<dir>/<name>.syn`.
    ///
    /// Cells without parameters write an empty file.
    ///
    /// **Errors**
    /// - A file can not be written.
    pub fn save_free_parameters(&self, dir: &Path) -> Result<()> {
        for cell in self.cells.iter() {
            cell.save_free_parameters(&dir.join(format!("{}.syn", cell.name())))?;
        }
        Ok(())
    }
    /// Loads the free parameters of each cell from `<dir>/<name>.syn`.
    ///
    /// Missing files are skipped if `ignore_not_exists`.
    ///
    /// **Errors**
    /// - A file can not be read or is corrupt.
    pub fn load_free_parameters(&mut self, dir: &Path, ignore_not_exists: bool) -> Result<()> {
        for cell in self.cells.iter_mut() {
            let path = dir.join(format!("{}.syn", cell.name()));
            cell.load_free_parameters(&path, ignore_not_exists)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{fc::FcDesc, pool::{PoolDesc, Pooling}};

    fn pool_fc_net() -> Result<DeepNet<f32>> {
        let registry = CellRegistry::with_defaults();
        let context = CellContext::default();
        let mut net = DeepNet::new();
        net.add_source(Source::new("input", [4, 4, 2, 3]).with_gradient())?;
        let pool = CellDesc::Pool(PoolDesc::new(2, Pooling::Average, [2, 2]).with_stride([2, 2]));
        net.create_cell(&registry, Backend::Host, "pool", &pool, &context)?;
        net.create_cell(&registry, Backend::Host, "fc", &CellDesc::Fc(FcDesc::new(5)), &context)?;
        net.connect("input", "pool", None)?;
        net.connect("pool", "fc", None)?;
        Ok(net)
    }

    #[test]
    fn net_forward_backward() -> Result<()> {
        let mut net = pool_fc_net()?;
        net.initialize()?;
        net.source("input")?.set(&Tensor::from_elem([4, 4, 2, 3], 1.))?;
        net.propagate(false)?;
        assert_eq!(net.output("fc")?.dims(), &[1, 1, 5, 3]);
        net.set_output_gradient("fc", &Tensor::from_elem([1, 1, 5, 3], 1.))?;
        net.back_propagate()?;
        assert!(net.source("input")?.gradient().is_some());
        net.update()?;
        net.propagate(true)?;
        assert!(net.source("input")?.gradient().is_none());
        Ok(())
    }

    #[test]
    fn net_parents_and_children() -> Result<()> {
        let net = pool_fc_net()?;
        assert_eq!(net.parents("pool")?, ["input"]);
        assert_eq!(net.parents("fc")?, ["pool"]);
        assert!(net.parents("input")?.is_empty());
        assert_eq!(net.children("input")?, ["pool"]);
        assert!(net.children("fc")?.is_empty());
        assert!(matches!(net.children("conv"), Err(Error::CellNotFound(_))));
        Ok(())
    }

    #[test]
    fn net_errors() -> Result<()> {
        let mut net = pool_fc_net()?;
        assert!(matches!(net.cell("conv"), Err(Error::CellNotFound(_))));
        assert!(matches!(
            net.connect("fc", "pool", None),
            Err(Error::InvalidConfiguration { .. })
        ));
        assert!(matches!(
            net.add_source(Source::new("fc", [1, 1, 1, 1])),
            Err(Error::InvalidConfiguration { .. })
        ));
        assert!(matches!(
            net.set_output_gradient("fc", &Tensor::zeros([2])),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn net_parameter_files() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let mut net = pool_fc_net()?;
        net.initialize()?;
        net.cell_mut("fc")?.set_weight(2, 3, &Tensor::from_elem([1], 0.25))?;
        net.save_free_parameters(dir.path())?;
        assert!(dir.path().join("fc.syn").exists());
        let pool = std::fs::metadata(dir.path().join("pool.syn")).map_err(|e| Error::io("pool.syn", e))?;
        assert_eq!(pool.len(), 0);
        let mut other = pool_fc_net()?;
        other.initialize()?;
        other.load_free_parameters(dir.path(), false)?;
        assert_eq!(other.cell("fc")?.get_weight(2, 3)?.as_slice(), &[0.25]);
        let empty = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        other.load_free_parameters(empty.path(), true)?;
        assert!(matches!(
            other.load_free_parameters(empty.path(), false),
            Err(Error::Io { .. })
        ));
        Ok(())
    }
}
