use super::join::Join;
use super::latency::{LatencyEstimator, ModuleProfile};
use super::partition::ParameterPartition;
use super::selection::SelectionMode;
use super::zoph::{ZophCandidate, ZophCell, ZophCellConfig};
use crate::autograd::{Context, ParameterStore, VarId};
use crate::graph::{Engine, Graph, NodeId, Operation, PhysicalOp};
use crate::io::ModuleBundle;
use crate::module::{scoped, Activation, BatchNorm, Collapse, Conv, ConvParams, GlobalAvgPool};
use crate::tensorshape::TensorShape;
use crate::{NasError, NasFloat};
use log::{debug, info};
use ndarray::ArrayD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchNetConfig {
    pub name: String,
    /// `(channels, height, width)` of one sample.
    pub input_shape: (usize, usize, usize),
    pub n_classes: usize,
    pub stem_channels: usize,
    pub cell_depth: Vec<usize>,
    pub cell_channels: Vec<usize>,
    pub reducing: Vec<bool>,
    /// Shared architecture weights per cell and block.
    pub join_parameters: Vec<Vec<Option<String>>>,
    pub candidates: Vec<ZophCandidate>,
    pub mode: SelectionMode,
}

impl Default for SearchNetConfig {
    fn default() -> Self {
        Self {
            name: "zoph".to_string(),
            input_shape: (3, 32, 32),
            n_classes: 10,
            stem_channels: 128,
            cell_depth: vec![7; 3],
            cell_channels: vec![128, 256, 512],
            reducing: vec![false, true, true],
            join_parameters: vec![],
            candidates: ZophCandidate::ALL.to_vec(),
            mode: SelectionMode::Sample,
        }
    }
}

impl SearchNetConfig {
    /// # Errors
    pub fn validate(&self) -> Result<(), NasError> {
        let n_cells = self.cell_depth.len();
        if n_cells == 0 || self.cell_channels.len() != n_cells || self.reducing.len() != n_cells {
            return Err(NasError::configuration(format!(
                "{} cell depths, {} cell widths and {} reduction flags",
                n_cells,
                self.cell_channels.len(),
                self.reducing.len()
            )));
        }
        if self.join_parameters.len() > n_cells {
            return Err(NasError::configuration(format!(
                "join parameters for {} cells, the network has {}",
                self.join_parameters.len(),
                n_cells
            )));
        }
        if self.candidates.is_empty() {
            return Err(NasError::configuration("no candidate operations"));
        }
        if self.n_classes == 0 || self.stem_channels == 0 {
            return Err(NasError::configuration(format!(
                "{} classes with {} stem channels",
                self.n_classes, self.stem_channels
            )));
        }
        Ok(())
    }
}

/// Stem, a chain of [`ZophCell`]s and a classification head, all in one graph. Cell
/// `i` reads the outputs of the two nodes before it (the stem convolutions for the
/// first cell).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchNet {
    config: SearchNetConfig,
    graph: Graph,
    input: NodeId,
    output: NodeId,
    cells: Vec<ZophCell>,
    joins: Vec<NodeId>,
}

impl SearchNet {
    /// # Errors
    /// Invalid configuration or cell shapes that cannot be wired together.
    pub fn new(config: SearchNetConfig) -> Result<Self, NasError> {
        config.validate()?;
        let name = config.name.as_str();
        let (c, h, w) = config.input_shape;
        let mut graph = Graph::default();
        let input = graph.add_input(scoped(name, "input"), TensorShape::nchw(c, h, w))?;

        let stem = config.stem_channels;
        let stem_1 = Self::conv_bn_relu(
            &mut graph,
            name,
            ["stem_conv_1", "stem_bn", "stem_relu"],
            ConvParams::new(c, stem, (7, 7)).with_pad((3, 3)).with_bias(true),
            input,
        )?;
        let stem_2 = Self::conv_bn_relu(
            &mut graph,
            name,
            ["stem_conv_2", "stem2_bn", "stem2_relu"],
            ConvParams::new(stem, stem, (3, 3)).with_pad((1, 1)).with_bias(true),
            stem_1,
        )?;

        let mut previous = [stem_1, stem_2];
        let mut cells = Vec::with_capacity(config.cell_depth.len());
        for (i, ((&depth, &channels), &reducing)) in config
            .cell_depth
            .iter()
            .zip(&config.cell_channels)
            .zip(&config.reducing)
            .enumerate()
        {
            let cell_config = ZophCellConfig {
                channels,
                n_modules: depth,
                reducing,
                candidates: config.candidates.clone(),
                join_parameters: config.join_parameters.get(i).cloned().unwrap_or_default(),
                mode: config.mode,
            };
            let cell = ZophCell::build(
                &mut graph,
                &scoped(name, &format!("cell_{}", i)),
                &previous,
                &cell_config,
            )?;
            previous = [previous[1], cell.output()];
            cells.push(cell);
        }

        let last = previous[1];
        let features = graph.get_node(last)?.shape().channels()?;
        let head = Self::conv_bn_relu(
            &mut graph,
            name,
            ["output_conv_1", "output_bn", "output_relu"],
            ConvParams::new(features, config.n_classes, (1, 1)).with_bias(true),
            last,
        )?;
        let gap_name = scoped(name, "global_average_pool");
        let gap = graph.append(gap_name.clone(), GlobalAvgPool::new(gap_name), &[head])?;
        let reshape_name = scoped(name, "output_reshape");
        let output = graph.append(reshape_name.clone(), Collapse::new(reshape_name), &[gap])?;

        let joins = cells
            .iter()
            .flat_map(|cell| cell.blocks().iter().map(|b| b.join()))
            .collect::<Vec<_>>();
        info!(
            "{}: {} cells, {} nodes, {} joins",
            name,
            cells.len(),
            graph.len(),
            joins.len()
        );
        Ok(Self {
            config,
            graph,
            input,
            output,
            cells,
            joins,
        })
    }

    /// A network fixed to the most probable architecture, optionally initialised from
    /// `params`.
    ///
    /// # Errors
    pub fn train_net(
        mut config: SearchNetConfig,
        store: &mut ParameterStore,
        params: Option<BTreeMap<String, ArrayD<NasFloat>>>,
    ) -> Result<Self, NasError> {
        config.mode = SelectionMode::Max;
        let mut net = Self::new(config)?;
        if let Some(params) = params {
            store.load(params)?;
        }
        net.initialize(store)?;
        net.compress(store)?;
        Ok(net)
    }

    fn conv_bn_relu(
        graph: &mut Graph,
        scope: &str,
        [conv, bn, relu]: [&str; 3],
        params: ConvParams,
        parent: NodeId,
    ) -> Result<NodeId, NasError> {
        let (conv, bn, relu) = (scoped(scope, conv), scoped(scope, bn), scoped(scope, relu));
        let channels = params.out_channels;
        let id = graph.append(conv.clone(), Conv::new(conv, params)?, &[parent])?;
        let id = graph.append(bn.clone(), BatchNorm::new(bn, channels), &[id])?;
        graph.append(relu.clone(), Activation::relu(relu), &[id])
    }

    pub const fn config(&self) -> &SearchNetConfig {
        &self.config
    }

    pub const fn graph(&self) -> &Graph {
        &self.graph
    }

    pub const fn input(&self) -> NodeId {
        self.input
    }

    pub const fn output(&self) -> NodeId {
        self.output
    }

    pub fn cells(&self) -> &[ZophCell] {
        &self.cells
    }

    pub const fn mode(&self) -> SelectionMode {
        self.config.mode
    }

    fn join(&self, id: NodeId) -> Result<&Join, NasError> {
        match self.graph.get_node(id)?.operation() {
            PhysicalOp::Join(join) => Ok(join),
            _ => Err(NasError::invalid_state(format!("node {} is not a join", id))),
        }
    }

    fn join_mut(&mut self, id: NodeId) -> Result<&mut Join, NasError> {
        match self.graph.node_mut(id).map(|n| n.operation_mut()) {
            Some(PhysicalOp::Join(join)) => Ok(join),
            _ => Err(NasError::invalid_state(format!("node {} is not a join", id))),
        }
    }

    /// Creates every parameter the graph can reach, so that the partition and the
    /// optimizers see the whole search space before the first forward pass.
    ///
    /// # Errors
    pub fn initialize(&self, store: &mut ParameterStore) -> Result<(), NasError> {
        for (_, node) in self.graph.iter() {
            for spec in node.operation().parameter_specs() {
                store.get_or_create(&spec)?;
            }
        }
        Ok(())
    }

    /// Logits `(N, n_classes)` of the batch `input`.
    ///
    /// # Errors
    /// Input of the wrong shape, or a discrete join without a selection.
    pub fn forward(&self, ctx: &mut Context, input: VarId) -> Result<VarId, NasError> {
        let fed = TensorShape::new(ctx.value(input).shape().iter().map(|&d| Some(d)).collect());
        let expected = self.graph.get_node(self.input)?.shape();
        if !fed.is_compatible_with(expected) {
            return Err(NasError::shape_mismatch(format!(
                "{} fed with {}, expected {}",
                self.config.name, fed, expected
            )));
        }
        let outputs = Engine::new(&self.graph).run(
            &[self.output],
            &[(self.input, input)],
            |op, parents| {
                let ids = parents.iter().map(|&&v| v).collect::<Vec<_>>();
                op.forward(ctx, &ids)
            },
        )?;
        outputs
            .into_iter()
            .next()
            .map(|(_, v)| v)
            .ok_or_else(|| NasError::invalid_state("network produced no output"))
    }

    /// The joins, in construction order.
    pub fn arch_modules(&self) -> Vec<(NodeId, &Join)> {
        self.joins
            .iter()
            .filter_map(|&id| match self.graph.node(id).map(|n| n.operation()) {
                Some(PhysicalOp::Join(join)) => Some((id, join)),
                _ => None,
            })
            .collect()
    }

    /// Every node but the input and the joins. With `active_only`, only the nodes the
    /// current selection evaluates.
    ///
    /// # Errors
    /// With `active_only`, a discrete join without a selection.
    pub fn net_modules(&self, active_only: bool) -> Result<Vec<NodeId>, NasError> {
        let candidates = if active_only {
            Engine::new(&self.graph).required_nodes(&[self.output], &[self.input])?
        } else {
            self.graph.node_ids().collect()
        };
        Ok(candidates
            .into_iter()
            .filter(|&id| {
                self.graph.node(id).map_or(false, |n| {
                    !matches!(n.operation(), PhysicalOp::Input(_) | PhysicalOp::Join(_))
                })
            })
            .collect())
    }

    /// Keys of every parameter in the graph, deduplicated.
    pub fn parameter_keys(&self) -> Vec<String> {
        self.graph
            .iter()
            .flat_map(|(_, n)| n.operation().parameter_keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn parameter_partition(&self) -> ParameterPartition {
        ParameterPartition::from_keys(&self.parameter_keys())
    }

    pub fn net_parameters(&self) -> Vec<String> {
        self.parameter_partition().network
    }

    pub fn arch_parameters(&self) -> Vec<String> {
        self.parameter_partition().architecture
    }

    /// Switches every join. Leaving a discrete mode makes every network weight
    /// trainable again.
    pub fn set_mode(&mut self, mode: SelectionMode, store: &mut ParameterStore) {
        for id in self.joins.clone() {
            if let Ok(join) = self.join_mut(id) {
                join.set_mode(mode);
            }
        }
        self.config.mode = mode;
        if !mode.is_discrete() {
            for key in self.net_parameters() {
                store.set_need_grad(&key, true);
            }
        }
        debug!("{}: selection mode {}", self.config.name, mode);
    }

    fn freeze_unselected(
        &self,
        id: NodeId,
        selected: usize,
        store: &mut ParameterStore,
    ) -> Result<(), NasError> {
        let node = self.graph.get_node(id)?;
        for (i, &parent) in node.inputs().iter().enumerate() {
            for key in self.graph.get_node(parent)?.operation().parameter_keys() {
                store.set_need_grad(&key, i == selected);
            }
        }
        Ok(())
    }

    /// Re-selects the active parent of every join and freezes the candidates that were
    /// not chosen.
    ///
    /// # Errors
    /// In `full` mode.
    pub fn update_active_indices<R: Rng>(
        &mut self,
        store: &mut ParameterStore,
        rng: &mut R,
    ) -> Result<(), NasError> {
        for id in self.joins.clone() {
            let selected = self.join_mut(id)?.update_active_index(store, rng)?;
            self.freeze_unselected(id, selected, store)?;
        }
        Ok(())
    }

    /// # Errors
    /// If a join has no selection.
    pub fn inject_architecture_gradients(
        &self,
        store: &mut ParameterStore,
        scale: NasFloat,
    ) -> Result<(), NasError> {
        for &id in &self.joins {
            self.join(id)?.inject_architecture_gradient(store, scale)?;
        }
        Ok(())
    }

    /// Fixes every join to its most probable parent. Returns the join names with the
    /// chosen parent index.
    ///
    /// # Errors
    pub fn compress(&mut self, store: &mut ParameterStore) -> Result<Vec<(String, usize)>, NasError> {
        let mut chosen = Vec::with_capacity(self.joins.len());
        for id in self.joins.clone() {
            let join = self.join_mut(id)?;
            let (index, _) = join.selection(store)?;
            join.set_mode(SelectionMode::Max);
            join.set_active_index(index);
            chosen.push((join.name().to_string(), index));
            self.freeze_unselected(id, index, store)?;
        }
        self.config.mode = SelectionMode::Max;
        info!("{}: compressed {} joins", self.config.name, chosen.len());
        Ok(chosen)
    }

    /// Estimated latency of the network modules, in total and per module name.
    ///
    /// # Errors
    pub fn latency<E: LatencyEstimator>(
        &self,
        estimator: &E,
        active_only: bool,
    ) -> Result<(NasFloat, BTreeMap<String, NasFloat>), NasError> {
        let mut per_module = BTreeMap::new();
        for id in self.net_modules(active_only)? {
            let profile = ModuleProfile::from_node(&self.graph, id)?;
            let latency = estimator.predict(&profile)?;
            per_module.insert(profile.name, latency);
        }
        Ok((per_module.values().sum(), per_module))
    }

    /// The most probable parent of every join, followed by the modules the current
    /// selection evaluates.
    ///
    /// # Errors
    pub fn summary(&self, store: &mut ParameterStore) -> Result<String, NasError> {
        let mut out = String::new();
        for (id, join) in self.arch_modules() {
            let (index, p) = join.selection(store)?;
            let parent = self
                .graph
                .get_node(id)?
                .inputs()
                .get(index)
                .copied()
                .ok_or_else(|| NasError::invalid_state(format!("{} has no parent {}", join.name(), index)))?;
            let parent = self.graph.get_node(parent)?;
            writeln!(
                out,
                "{}: {} ({}) p={:.3}",
                join.name(),
                parent.name(),
                parent.operation().kind(),
                p
            )
            .map_err(|e| NasError::invalid_state(e.to_string()))?;
        }
        out.push_str("Instantiated modules are:\n");
        let active = self.net_modules(self.config.mode.is_discrete())?;
        for id in active {
            let node = self.graph.get_node(id)?;
            writeln!(out, "{} {}", node.name(), node.shape())
                .map_err(|e| NasError::invalid_state(e.to_string()))?;
        }
        Ok(out)
    }

    /// Writes one [`ModuleBundle`] per network module under `dir`, at batch size 1.
    /// Nested module names become nested directories.
    ///
    /// # Errors
    pub fn save_module_bundles<P: AsRef<Path>>(
        &self,
        dir: P,
        store: &mut ParameterStore,
        active_only: bool,
    ) -> Result<Vec<PathBuf>, NasError> {
        let mut written = vec![];
        for id in self.net_modules(active_only)? {
            let node = self.graph.get_node(id)?;
            let shapes = self
                .graph
                .input_shapes(id)?
                .iter()
                .map(|s| s.with_batch(1))
                .collect();
            let bundle = ModuleBundle::export(node.operation(), shapes, store)?;
            let path = dir.as_ref().join(format!("{}.json", node.name()));
            bundle.save(&path)?;
            written.push(path);
        }
        info!("saved {} module bundles to {}", written.len(), dir.as_ref().display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::MacsEstimator;
    use more_asserts::assert_lt;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn tiny(mode: SelectionMode) -> SearchNetConfig {
        SearchNetConfig {
            name: "net".to_string(),
            input_shape: (3, 8, 8),
            n_classes: 3,
            stem_channels: 4,
            cell_depth: vec![1, 2],
            cell_channels: vec![4, 6],
            reducing: vec![false, true],
            candidates: vec![
                ZophCandidate::SepConv3x3,
                ZophCandidate::MaxPool3x3,
                ZophCandidate::Identity,
                ZophCandidate::Zero,
            ],
            mode,
            ..SearchNetConfig::default()
        }
    }

    #[test]
    fn test_layout() {
        let net = SearchNet::new(tiny(SelectionMode::Full)).unwrap();
        assert_eq!(net.cells().len(), 2);
        assert_eq!(net.arch_modules().len(), 3);
        assert_eq!(net.arch_parameters().len(), 3);
        assert_eq!(
            net.graph().get_node(net.output()).unwrap().shape(),
            &TensorShape::new(vec![None, Some(3)])
        );
        let cell_1 = &net.cells()[1];
        assert_eq!(cell_1.inputs().len(), 2);
        assert!(net.graph().find("net/cell_1/reduce_pool_0").is_ok());
        let keys = net.parameter_keys();
        let part = net.parameter_partition();
        assert_eq!(part.network.len() + part.architecture.len(), keys.len());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = tiny(SelectionMode::Full);
        config.reducing.pop();
        assert!(matches!(SearchNet::new(config), Err(NasError::Configuration { .. })));
        let mut config = tiny(SelectionMode::Full);
        config.candidates.clear();
        assert!(SearchNet::new(config).is_err());
    }

    #[test]
    fn test_full_forward() {
        let net = SearchNet::new(tiny(SelectionMode::Full)).unwrap();
        let mut store = ParameterStore::new(0);
        let mut ctx = Context::new(&mut store, true, 0);
        let x = ctx.input(crate::test_util::ramp_input(&[2, 3, 8, 8]));
        let y = net.forward(&mut ctx, x).unwrap();
        assert_eq!(ctx.value(y).shape(), &[2, 3]);
        let bad = ctx.input(crate::test_util::ramp_input(&[2, 1, 8, 8]));
        assert!(matches!(
            net.forward(&mut ctx, bad),
            Err(NasError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_sampled_selection_freezes_candidates() {
        let mut net = SearchNet::new(tiny(SelectionMode::Sample)).unwrap();
        let mut store = ParameterStore::new(0);
        net.initialize(&mut store).unwrap();
        assert!(net.net_modules(true).is_err());

        let mut rng = Pcg64::seed_from_u64(3);
        net.update_active_indices(&mut store, &mut rng).unwrap();
        for (id, join) in net.arch_modules() {
            let selected = join.state().active_index().unwrap();
            let parent = net.graph().get_node(id).unwrap().inputs()[0];
            let keys = net.graph().get_node(parent).unwrap().operation().parameter_keys();
            let w = keys.iter().find(|k| k.ends_with("/W")).unwrap();
            assert_eq!(store.get(w).unwrap().need_grad, selected == 0);
        }

        let active = net.net_modules(true).unwrap();
        let all = net.net_modules(false).unwrap();
        assert_lt!(active.len(), all.len());

        let mut ctx = Context::new(&mut store, true, 0);
        let x = ctx.input(crate::test_util::ramp_input(&[1, 3, 8, 8]));
        let y = net.forward(&mut ctx, x).unwrap();
        assert_eq!(ctx.value(y).shape(), &[1, 3]);

        net.inject_architecture_gradients(&mut store, 1.).unwrap();
        let key = &net.arch_parameters()[0];
        assert!(store.get(key).unwrap().grad.iter().any(|&g| g != 0.));

        net.set_mode(SelectionMode::Full, &mut store);
        assert!(net.net_parameters().iter().all(|k| store
            .get(k)
            .map_or(true, |p| p.need_grad || p.kind != crate::autograd::ParameterKind::Weight)));
    }

    #[test]
    fn test_compress_selects_argmax() {
        let mut net = SearchNet::new(tiny(SelectionMode::Sample)).unwrap();
        let mut store = ParameterStore::new(0);
        net.initialize(&mut store).unwrap();
        store.get_mut("net/cell_0/zoph_block_0/join/alpha").unwrap().data[[2]] = 3.;
        let chosen = net.compress(&mut store).unwrap();
        assert_eq!(chosen[0], ("net/cell_0/zoph_block_0/join".to_string(), 2));
        assert_eq!(net.mode(), SelectionMode::Max);
        let modules = net.net_modules(true).unwrap();
        let sep = net.graph().find("net/cell_0/zoph_block_0/candidate_0").unwrap();
        assert!(!modules.contains(&sep));

        let summary = net.summary(&mut store).unwrap();
        assert!(summary.starts_with("net/cell_0/zoph_block_0/join: net/cell_0/zoph_block_0/candidate_2 (Identity)"));
        assert!(summary.contains("Instantiated modules are:"));
        assert!(!summary.contains("net/cell_0/zoph_block_0/candidate_0 "));
    }

    #[test]
    fn test_latency_of_active_path_is_lower() {
        let mut net = SearchNet::new(tiny(SelectionMode::Max)).unwrap();
        let mut store = ParameterStore::new(0);
        net.initialize(&mut store).unwrap();
        let estimator = MacsEstimator {
            overhead: 1e-3,
            ..MacsEstimator::default()
        };
        net.compress(&mut store).unwrap();
        let (active, per_module) = net.latency(&estimator, true).unwrap();
        let (all, _) = net.latency(&estimator, false).unwrap();
        assert_lt!(active, all);
        assert!(per_module.contains_key("net/stem_conv_1"));
    }

    #[test]
    fn test_shared_join_parameters() {
        let mut config = tiny(SelectionMode::Full);
        config.join_parameters = vec![
            vec![],
            vec![
                Some("net/cell_0/zoph_block_0/join/alpha".to_string()),
                Some("net/cell_0/zoph_block_0/join/alpha".to_string()),
            ],
        ];
        let net = SearchNet::new(config).unwrap();
        assert_eq!(net.arch_parameters(), vec!["net/cell_0/zoph_block_0/join/alpha".to_string()]);
    }
}
