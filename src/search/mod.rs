//! Search spaces: candidate selection, search cells and the search network.
pub mod candidates;
mod join;
pub mod latency;
mod mixed_op;
mod partition;
mod search_net;
pub mod selection;
mod zoph;

pub use candidates::{
    candidates_to_subnet_lists, genotype_to_subnet_list, CandidateSpec, SubnetList, CANDIDATES,
};
pub use join::Join;
pub use latency::{LatencyEstimator, MacsEstimator, ModuleProfile};
pub use mixed_op::MixedOp;
pub use partition::{is_architecture_key, ParameterPartition, ARCHITECTURE_MARKER};
pub use search_net::{SearchNet, SearchNetConfig};
pub use selection::{compute_policy_gradient, SelectionMode, SelectionState};
pub use zoph::{ZophBlock, ZophCandidate, ZophCell, ZophCellConfig};
