//! Split of the parameter store into network weights and architecture weights.
use crate::autograd::ParameterStore;
use serde::{Deserialize, Serialize};

/// Scope segment that marks architecture parameters.
pub const ARCHITECTURE_MARKER: &str = "join";

/// Whether `key` has a scope segment equal to [`ARCHITECTURE_MARKER`].
pub fn is_architecture_key(key: &str) -> bool {
    key.split('/').any(|segment| segment == ARCHITECTURE_MARKER)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterPartition {
    pub network: Vec<String>,
    pub architecture: Vec<String>,
}

impl ParameterPartition {
    pub fn from_keys<'a, I: IntoIterator<Item = &'a String>>(keys: I) -> Self {
        let (architecture, network) = keys
            .into_iter()
            .cloned()
            .partition(|k| is_architecture_key(k));
        Self {
            network,
            architecture,
        }
    }

    pub fn from_store(store: &ParameterStore) -> Self {
        Self::from_keys(store.keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_must_be_a_segment() {
        assert!(is_architecture_key("cell_0/block_1/join/alpha"));
        assert!(is_architecture_key("join/alpha"));
        assert!(!is_architecture_key("cell_0/joiner/W"));
        assert!(!is_architecture_key("adjoint/W"));
    }

    #[test]
    fn test_partition_is_total_and_disjoint() {
        let keys: Vec<String> = ["a/W", "a/join/alpha", "b/bn/mean", "b/join/alpha"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let part = ParameterPartition::from_keys(&keys);
        assert_eq!(part.architecture, vec!["a/join/alpha", "b/join/alpha"]);
        assert_eq!(part.network, vec!["a/W", "b/bn/mean"]);
        assert_eq!(part.network.len() + part.architecture.len(), keys.len());
    }
}
