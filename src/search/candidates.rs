//! Registry of the mobile block candidates and genotype decoding.
use crate::graph::PhysicalOp;
use crate::module::{Identity, MBConvLayer, MBConvLayerConfig, ResidualBlock};
use crate::NasError;
use log::debug;
use serde::{Deserialize, Serialize};

pub const SKIP_CONNECT: &str = "skip_connect";

/// Kernel size and expansion ratio used for `skip_connect` picks in a decoded genotype.
const SKIP_PLACEHOLDER: (usize, usize) = (3, 4);

/// Upper bound on the depth of a stage.
const MAX_DEPTH: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CandidateSpec {
    pub name: &'static str,
    pub kernel_size: Option<usize>,
    pub expand_ratio: Option<usize>,
}

const fn candidate(name: &'static str, kernel_size: usize, expand_ratio: usize) -> CandidateSpec {
    CandidateSpec {
        name,
        kernel_size: Some(kernel_size),
        expand_ratio: Some(expand_ratio),
    }
}

pub static CANDIDATES: [CandidateSpec; 10] = [
    candidate("XP3 3x3", 3, 3),
    candidate("XP3 5x5", 5, 3),
    candidate("XP3 7x7", 7, 3),
    candidate("XP4 3x3", 3, 4),
    candidate("XP4 5x5", 5, 4),
    candidate("XP4 7x7", 7, 4),
    candidate("XP6 3x3", 3, 6),
    candidate("XP6 5x5", 5, 6),
    candidate("XP6 7x7", 7, 6),
    CandidateSpec {
        name: SKIP_CONNECT,
        kernel_size: None,
        expand_ratio: None,
    },
];

/// # Errors
/// Names not in [`CANDIDATES`].
pub fn lookup(name: &str) -> Result<&'static CandidateSpec, NasError> {
    CANDIDATES
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| NasError::configuration(format!("unknown candidate {}", name)))
}

impl CandidateSpec {
    pub fn is_skip(&self) -> bool {
        self.name == SKIP_CONNECT
    }

    /// Residual mobile block for this candidate. `skip_connect` becomes an identity,
    /// which needs matching channels and unit stride.
    ///
    /// # Errors
    pub fn build(
        &self,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
    ) -> Result<PhysicalOp, NasError> {
        match (self.kernel_size, self.expand_ratio) {
            (Some(k), Some(e)) => {
                let conv = MBConvLayer::new(
                    format!("{}/conv", name),
                    MBConvLayerConfig {
                        in_channels,
                        out_channels,
                        kernel: (k, k),
                        stride: (stride, stride),
                        expand_ratio: e,
                        ..MBConvLayerConfig::default()
                    },
                )?;
                let shortcut = stride == 1 && in_channels == out_channels;
                Ok(ResidualBlock::new(name, Some(conv.into()), shortcut).into())
            }
            _ if stride == 1 && in_channels == out_channels => Ok(Identity::new(name).into()),
            _ => Err(NasError::configuration(format!(
                "{} cannot map {} channels to {} with stride {}",
                self.name, in_channels, out_channels, stride
            ))),
        }
    }
}

/// Kernel sizes and expansion ratios of `candidates`, each list de-duplicated in
/// first-seen order. `skip_connect` contributes `None` to both.
///
/// # Errors
pub fn candidates_to_subnet_lists(
    candidates: &[&str],
) -> Result<(Vec<Option<usize>>, Vec<Option<usize>>), NasError> {
    let mut kernels = vec![];
    let mut expands = vec![];
    for name in candidates {
        let spec = lookup(name)?;
        if !kernels.contains(&spec.kernel_size) {
            kernels.push(spec.kernel_size);
        }
        if !expands.contains(&spec.expand_ratio) {
            expands.push(spec.expand_ratio);
        }
    }
    Ok((kernels, expands))
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetList {
    pub kernel_sizes: Vec<usize>,
    pub expand_ratios: Vec<usize>,
    pub depths: Vec<usize>,
}

/// Decodes a genotype (one index per searchable layer into `candidates` followed by
/// an implicit `skip_connect`) into per-layer kernel sizes and expansion ratios and the
/// depth of every stage. A `skip_connect` closes the running stage and a stage is
/// closed after [`MAX_DEPTH`] layers.
///
/// # Errors
/// Unknown candidate names, out of range indices, or a stage of depth one or less.
pub fn genotype_to_subnet_list(
    candidates: &[&str],
    genotype: &[usize],
) -> Result<SubnetList, NasError> {
    let mut extended = candidates
        .iter()
        .map(|name| lookup(name))
        .collect::<Result<Vec<_>, _>>()?;
    extended.push(lookup(SKIP_CONNECT)?);

    let picks = genotype
        .iter()
        .map(|&i| {
            extended.get(i).copied().ok_or_else(|| {
                NasError::configuration(format!(
                    "genotype index {} is out of range for {} candidates",
                    i,
                    extended.len()
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut subnet = SubnetList::default();
    for spec in &picks {
        let (k, e) = match (spec.kernel_size, spec.expand_ratio) {
            (Some(k), Some(e)) => (k, e),
            _ => SKIP_PLACEHOLDER,
        };
        subnet.kernel_sizes.push(k);
        subnet.expand_ratios.push(e);
    }

    let flush = |depths: &mut Vec<usize>, d: usize| {
        if d <= 1 {
            Err(NasError::configuration(format!(
                "genotype {:?} yields a stage of depth {}",
                genotype, d
            )))
        } else {
            depths.push(d);
            Ok(())
        }
    };
    let mut d = 0;
    for spec in &picks {
        if spec.is_skip() {
            if d > 0 {
                flush(&mut subnet.depths, d)?;
                d = 0;
            }
        } else {
            if d == MAX_DEPTH {
                flush(&mut subnet.depths, d)?;
                d = 0;
            }
            d += 1;
        }
    }
    if d > 0 {
        flush(&mut subnet.depths, d)?;
    }
    debug!("decoded genotype {:?} into depths {:?}", genotype, subnet.depths);
    Ok(subnet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Operation;
    use crate::tensorshape::TensorShape;

    #[test]
    fn test_genotype_decoding() {
        let candidates = ["XP3 3x3", "XP3 5x5"];
        let subnet = genotype_to_subnet_list(&candidates, &[0, 0, 0, 2, 1, 1, 1, 1, 2]).unwrap();
        assert_eq!(subnet.kernel_sizes, vec![3, 3, 3, 3, 5, 5, 5, 5, 3]);
        assert_eq!(subnet.expand_ratios, vec![3, 3, 3, 4, 3, 3, 3, 3, 4]);
        assert_eq!(subnet.depths, vec![3, 4]);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_stage_is_capped() {
        let subnet = genotype_to_subnet_list(&["XP6 7x7"], &[0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(subnet.depths, vec![4, 2]);
    }

    #[test]
    fn test_short_stage_is_rejected() {
        assert!(matches!(
            genotype_to_subnet_list(&["XP3 3x3"], &[0, 0, 1, 0]),
            Err(NasError::Configuration { .. })
        ));
    }

    #[test]
    fn test_trailing_single_layer_is_rejected() {
        for genotype in [&[0, 0, 0, 0, 0][..], &[0, 0, 0, 0, 0, 1]] {
            assert!(matches!(
                genotype_to_subnet_list(&["XP3 3x3"], genotype),
                Err(NasError::Configuration { .. })
            ));
        }
    }

    #[test]
    fn test_every_layer_lands_in_a_stage() {
        let genotype = [1, 0, 0, 1, 1, 0, 0, 0, 0, 0, 0];
        let subnet = genotype_to_subnet_list(&["XP3 3x3"], &genotype).unwrap();
        assert_eq!(subnet.depths, vec![2, 4, 2]);
        let layers = genotype.iter().filter(|&&g| g == 0).count();
        assert_eq!(subnet.depths.iter().sum::<usize>(), layers);
    }

    #[test]
    fn test_bad_genotype() {
        assert!(genotype_to_subnet_list(&["XP3 3x3"], &[0, 5]).is_err());
        assert!(genotype_to_subnet_list(&["XP9 3x3"], &[0]).is_err());
    }

    #[test]
    fn test_candidate_lists() {
        let (kernels, expands) =
            candidates_to_subnet_lists(&["XP6 5x5", "XP3 5x5", "XP3 3x3", SKIP_CONNECT]).unwrap();
        assert_eq!(kernels, vec![Some(5), Some(3), None]);
        assert_eq!(expands, vec![Some(6), Some(3), None]);
    }

    #[test]
    fn test_build_candidates() {
        let block = lookup("XP4 3x3").unwrap().build("b", 8, 8, 1).unwrap();
        assert_eq!(
            block.output_shape(&[TensorShape::nchw(8, 4, 4)]).unwrap(),
            TensorShape::nchw(8, 4, 4)
        );
        let skip = lookup(SKIP_CONNECT).unwrap();
        assert_eq!(skip.build("s", 8, 8, 1).unwrap().kind(), "Identity");
        assert!(skip.build("s", 8, 16, 2).is_err());
    }
}
