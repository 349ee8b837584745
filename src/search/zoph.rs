//! Search cells of the Zoph et al. space: blocks choose one candidate operation
//! through a [`Join`], cells stack blocks over a growing list of inputs.
use super::join::Join;
use super::selection::SelectionMode;
use crate::autograd::Pool2dConfig;
use crate::graph::{Graph, NodeId, Operation, PhysicalOp};
use crate::module::{
    scoped, Activation, AvgPool, BatchNorm, Conv, ConvParams, Identity, MaxPool, Merging, SepConv,
    Sequential, Zero,
};
use crate::tensorshape::TensorShape;
use crate::NasError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZophCandidate {
    SepConv3x3,
    SepConv5x5,
    DilSepConv3x3,
    DilSepConv5x5,
    MaxPool3x3,
    AveragePool3x3,
    Identity,
    Zero,
}

impl ZophCandidate {
    pub const ALL: [Self; 8] = [
        Self::SepConv3x3,
        Self::SepConv5x5,
        Self::DilSepConv3x3,
        Self::DilSepConv5x5,
        Self::MaxPool3x3,
        Self::AveragePool3x3,
        Self::Identity,
        Self::Zero,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SepConv3x3 => "SepConv3x3",
            Self::SepConv5x5 => "SepConv5x5",
            Self::DilSepConv3x3 => "DilSepConv3x3",
            Self::DilSepConv5x5 => "DilSepConv5x5",
            Self::MaxPool3x3 => "MaxPool3x3",
            Self::AveragePool3x3 => "AveragePool3x3",
            Self::Identity => "Identity",
            Self::Zero => "Zero",
        }
    }

    /// Kernel and dilation of the separable convolution candidates.
    const fn sep_conv(self) -> Option<((usize, usize), (usize, usize))> {
        match self {
            Self::SepConv3x3 => Some(((3, 3), (1, 1))),
            Self::SepConv5x5 => Some(((5, 5), (1, 1))),
            Self::DilSepConv3x3 => Some(((3, 3), (2, 2))),
            Self::DilSepConv5x5 => Some(((5, 5), (2, 2))),
            _ => None,
        }
    }

    /// Builds the candidate as a shape-preserving operation on `channels` channels.
    ///
    /// # Errors
    pub fn build(self, name: &str, channels: usize) -> Result<PhysicalOp, NasError> {
        let pool = Pool2dConfig::new((3, 3), (1, 1), (1, 1));
        let head: Vec<PhysicalOp> = match self {
            Self::Identity => return Ok(Identity::new(name).into()),
            Self::Zero => return Ok(Zero::new(name, (1, 1)).into()),
            Self::MaxPool3x3 => vec![MaxPool::new(scoped(name, "pool"), pool).into()],
            Self::AveragePool3x3 => vec![AvgPool::new(scoped(name, "pool"), pool).into()],
            sep => {
                let (kernel, dilation) = sep.sep_conv().ok_or_else(|| {
                    NasError::invalid_state(format!("{} is not a separable convolution", sep))
                })?;
                vec![
                    SepConv::new(scoped(name, "SepConv_1"), channels, channels, kernel, dilation)?
                        .into(),
                    SepConv::new(scoped(name, "SepConv_2"), channels, channels, kernel, dilation)?
                        .into(),
                ]
            }
        };
        let mut body = Sequential::new(name, self.as_str(), head);
        body.push(BatchNorm::new(scoped(name, "bn"), channels));
        body.push(Activation::relu(scoped(name, "relu")));
        Ok(body.into())
    }
}

impl fmt::Display for ZophCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZophCandidate {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| NasError::configuration(format!("unknown candidate {}", s)))
    }
}

fn conv_bn_relu(
    graph: &mut Graph,
    conv_name: &str,
    bn_name: &str,
    params: ConvParams,
    parent: NodeId,
) -> Result<NodeId, NasError> {
    let out_channels = params.out_channels;
    let conv = graph.append(conv_name, Conv::new(conv_name, params)?, &[parent])?;
    let bn = graph.append(bn_name, BatchNorm::new(bn_name, out_channels), &[conv])?;
    let relu = scoped(conv_name, "relu");
    graph.append(relu.clone(), Activation::relu(relu), &[bn])
}

/// Node handles of one block inside the graph it was built into.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZophBlock {
    name: String,
    input: NodeId,
    candidates: Vec<NodeId>,
    join: NodeId,
}

impl ZophBlock {
    /// Appends concat(parents) -> 1x1 conv -> BN -> ReLU, one node per candidate fed by
    /// the ReLU, and a [`Join`] over the candidates.
    ///
    /// Candidates read the normalized projection, not the raw `input_conv` output, so
    /// `input_conv_bn` and its ReLU lie on every active path.
    ///
    /// # Errors
    /// No parents or candidates, or parents that cannot be concatenated.
    pub fn build(
        graph: &mut Graph,
        name: &str,
        parents: &[NodeId],
        candidates: &[ZophCandidate],
        channels: usize,
        mode: SelectionMode,
        join_parameters: Option<String>,
    ) -> Result<Self, NasError> {
        if parents.is_empty() || candidates.is_empty() {
            return Err(NasError::configuration(format!(
                "{} needs parents and candidates, got {} and {}",
                name,
                parents.len(),
                candidates.len()
            )));
        }
        let concat_name = scoped(name, "input_con");
        let concat = graph.append(concat_name.clone(), Merging::concat(concat_name), parents)?;
        let in_channels = graph.get_node(concat)?.shape().channels()?;
        let input = conv_bn_relu(
            graph,
            &scoped(name, "input_conv"),
            &scoped(name, "input_conv_bn"),
            ConvParams::new(in_channels, channels, (1, 1)).with_bias(true),
            concat,
        )?;

        let candidate_ids = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let candidate_name = scoped(name, &format!("candidate_{}", i));
                let op = c.build(&candidate_name, channels)?;
                graph.append(candidate_name, op, &[input])
            })
            .collect::<Result<Vec<_>, _>>()?;

        let join = Join::new(name, candidate_ids.len(), mode, join_parameters);
        let join = graph.append(join.name().to_string(), join, &candidate_ids)?;
        Ok(Self {
            name: name.to_string(),
            input,
            candidates: candidate_ids,
            join,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ReLU every candidate reads.
    pub const fn input(&self) -> NodeId {
        self.input
    }

    pub fn candidates(&self) -> &[NodeId] {
        &self.candidates
    }

    pub const fn join(&self) -> NodeId {
        self.join
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZophCellConfig {
    pub channels: usize,
    pub n_modules: usize,
    pub reducing: bool,
    pub candidates: Vec<ZophCandidate>,
    /// Shared architecture weights per block. Missing entries get weights of their own.
    pub join_parameters: Vec<Option<String>>,
    pub mode: SelectionMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZophCell {
    name: String,
    inputs: Vec<NodeId>,
    blocks: Vec<ZophBlock>,
    output: NodeId,
}

impl ZophCell {
    /// Projects every parent to `channels` channels, pools them to the smallest spatial
    /// extent (and halves it when reducing), then stacks the blocks. Block `i` reads the
    /// projected inputs and the outputs of blocks `0..i`; the output concatenates all of
    /// them.
    ///
    /// # Errors
    /// [`NasError::ShapeMismatch`] when a parent's extent is not an integer multiple of
    /// the smallest one.
    pub fn build(
        graph: &mut Graph,
        name: &str,
        parents: &[NodeId],
        config: &ZophCellConfig,
    ) -> Result<Self, NasError> {
        if parents.is_empty() {
            return Err(NasError::configuration(format!("{} has no parents", name)));
        }
        let shapes = parents
            .iter()
            .map(|&p| graph.get_node(p).map(|n| n.shape().clone()))
            .collect::<Result<Vec<TensorShape>, _>>()?;
        let extents = shapes
            .iter()
            .map(TensorShape::spatial)
            .collect::<Result<Vec<_>, _>>()?;
        let min_h = extents.iter().map(|e| e.0).min().unwrap_or(0);
        let min_w = extents.iter().map(|e| e.1).min().unwrap_or(0);
        let ratios = extents
            .iter()
            .map(|&(h, w)| {
                if min_h == 0 || min_w == 0 || h % min_h != 0 || w % min_w != 0 {
                    Err(NasError::shape_mismatch(format!(
                        "{}: cannot pool {}x{} down to {}x{}",
                        name, h, w, min_h, min_w
                    )))
                } else {
                    Ok((h / min_h, w / min_w))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut cell_modules = Vec::with_capacity(parents.len() + config.n_modules);
        for (i, ((&parent, shape), ratio)) in parents.iter().zip(&shapes).zip(ratios).enumerate() {
            let mut node = conv_bn_relu(
                graph,
                &scoped(name, &format!("input_conv_{}", i)),
                &scoped(name, &format!("input_bn_{}", i)),
                ConvParams::new(shape.channels()?, config.channels, (1, 1)),
                parent,
            )?;
            if ratio != (1, 1) {
                let pool_name = scoped(name, &format!("shape_adapt_pool_{}", i));
                let pool = MaxPool::new(pool_name.clone(), Pool2dConfig::new(ratio, ratio, (0, 0)));
                node = graph.append(pool_name, pool, &[node])?;
            }
            if config.reducing {
                let pool_name = scoped(name, &format!("reduce_pool_{}", i));
                let pool = MaxPool::new(pool_name.clone(), Pool2dConfig::new((2, 2), (2, 2), (0, 0)));
                node = graph.append(pool_name, pool, &[node])?;
            }
            cell_modules.push(node);
        }
        let inputs = cell_modules.clone();

        let mut blocks = Vec::with_capacity(config.n_modules);
        for i in 0..config.n_modules {
            let visible = (i + 2).min(cell_modules.len());
            let block = ZophBlock::build(
                graph,
                &scoped(name, &format!("zoph_block_{}", i)),
                &cell_modules[..visible],
                &config.candidates,
                config.channels,
                config.mode,
                config.join_parameters.get(i).cloned().flatten(),
            )?;
            cell_modules.push(block.join());
            blocks.push(block);
        }

        let concat_name = scoped(name, "output_concat");
        let output = graph.append(concat_name.clone(), Merging::concat(concat_name), &cell_modules)?;
        debug!(
            "{}: {} blocks over {} inputs, output {}",
            name,
            blocks.len(),
            inputs.len(),
            graph.get_node(output)?.shape()
        );
        Ok(Self {
            name: name.to_string(),
            inputs,
            blocks,
            output,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parents after projection and pooling.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn blocks(&self) -> &[ZophBlock] {
        &self.blocks
    }

    pub const fn output(&self) -> NodeId {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{Context, ParameterStore};
    use crate::graph::Engine;
    use ndarray::{ArrayD, IxDyn};

    fn cell_config(reducing: bool, mode: SelectionMode) -> ZophCellConfig {
        ZophCellConfig {
            channels: 4,
            n_modules: 2,
            reducing,
            candidates: ZophCandidate::ALL.to_vec(),
            join_parameters: vec![],
            mode,
        }
    }

    #[test]
    fn test_candidates_preserve_shape() {
        let input = TensorShape::nchw(3, 8, 8);
        for c in ZophCandidate::ALL {
            let op = c.build("cand", 3).unwrap();
            assert_eq!(op.output_shape(&[input.clone()]).unwrap(), input, "{}", c);
            assert_eq!(op.kind(), c.as_str());
        }
        assert_eq!("DilSepConv5x5".parse::<ZophCandidate>().unwrap(), ZophCandidate::DilSepConv5x5);
        assert!("SepConv7x7".parse::<ZophCandidate>().is_err());
    }

    #[test]
    fn test_block_layout() {
        let mut graph = Graph::default();
        let x = graph.add_input("x", TensorShape::nchw(3, 4, 4)).unwrap();
        let y = graph.add_input("y", TensorShape::nchw(5, 4, 4)).unwrap();
        let block = ZophBlock::build(
            &mut graph,
            "b",
            &[x, y],
            &ZophCandidate::ALL,
            6,
            SelectionMode::Full,
            None,
        )
        .unwrap();
        assert_eq!(block.candidates().len(), 8);
        assert_eq!(graph.get_node(block.join()).unwrap().name(), "b/join");
        assert_eq!(graph.get_node(block.join()).unwrap().shape(), &TensorShape::nchw(6, 4, 4));
        assert_eq!(
            graph.input_shapes(graph.find("b/input_conv").unwrap()).unwrap(),
            vec![TensorShape::nchw(8, 4, 4)]
        );
        assert_eq!(graph.get_node(block.input()).unwrap().name(), "b/input_conv/relu");
        for &c in block.candidates() {
            assert_eq!(graph.get_node(c).unwrap().inputs(), &[block.input()]);
        }
    }

    #[test]
    fn test_shared_join_parameters() {
        let mut graph = Graph::default();
        let x = graph.add_input("x", TensorShape::nchw(2, 4, 4)).unwrap();
        let block = ZophBlock::build(
            &mut graph,
            "b",
            &[x],
            &[ZophCandidate::Identity, ZophCandidate::Zero],
            2,
            SelectionMode::Full,
            Some("shared/join/alpha".to_string()),
        )
        .unwrap();
        let keys = graph.get_node(block.join()).unwrap().operation().parameter_keys();
        assert_eq!(keys, vec!["shared/join/alpha".to_string()]);
    }

    #[test]
    fn test_reducing_cell_shapes() {
        let mut graph = Graph::default();
        let a = graph.add_input("a", TensorShape::nchw(3, 8, 8)).unwrap();
        let b = graph.add_input("b", TensorShape::nchw(5, 4, 4)).unwrap();
        let cell = ZophCell::build(&mut graph, "cell", &[a, b], &cell_config(true, SelectionMode::Full))
            .unwrap();
        assert!(graph.find("cell/shape_adapt_pool_0").is_ok());
        assert!(graph.find("cell/shape_adapt_pool_1").is_err());
        assert!(graph.find("cell/reduce_pool_1").is_ok());
        // 2 inputs plus 2 blocks, 4 channels each
        assert_eq!(
            graph.get_node(cell.output()).unwrap().shape(),
            &TensorShape::nchw(16, 2, 2)
        );
        let second = &cell.blocks()[1];
        let concat = graph.find("cell/zoph_block_1/input_con").unwrap();
        assert_eq!(graph.get_node(concat).unwrap().inputs().len(), 3);
        assert_eq!(graph.get_node(concat).unwrap().inputs()[2], cell.blocks()[0].join());
        assert_eq!(second.name(), "cell/zoph_block_1");
    }

    #[test]
    fn test_non_integer_ratio_fails() {
        let mut graph = Graph::default();
        let a = graph.add_input("a", TensorShape::nchw(3, 6, 6)).unwrap();
        let b = graph.add_input("b", TensorShape::nchw(3, 4, 4)).unwrap();
        assert!(matches!(
            ZophCell::build(&mut graph, "cell", &[a, b], &cell_config(false, SelectionMode::Full)),
            Err(NasError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_cell_forward() {
        let mut graph = Graph::default();
        let a = graph.add_input("a", TensorShape::nchw(2, 4, 4)).unwrap();
        let b = graph.add_input("b", TensorShape::nchw(2, 4, 4)).unwrap();
        let cell = ZophCell::build(&mut graph, "cell", &[a, b], &cell_config(false, SelectionMode::Full))
            .unwrap();
        let mut store = ParameterStore::new(0);
        let mut ctx = Context::new(&mut store, true, 0);
        let va = ctx.input(crate::test_util::ramp_input(&[2, 2, 4, 4]));
        let vb = ctx.input(ArrayD::ones(IxDyn(&[2, 2, 4, 4])));
        let out = Engine::new(&graph)
            .run(&[cell.output()], &[(a, va), (b, vb)], |op, parents| {
                let ids: Vec<_> = parents.iter().map(|&&v| v).collect();
                op.forward(&mut ctx, &ids)
            })
            .unwrap();
        assert_eq!(ctx.value(out[0].1).shape(), &[2, 16, 4, 4]);
        assert!(store.contains("cell/zoph_block_1/join/alpha"));
        assert!(store.contains("cell/zoph_block_0/candidate_3/SepConv_2/pw/W"));
    }
}
