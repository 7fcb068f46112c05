//! Cluster topology model: slot hashing, `CLUSTER NODES` parsing and node probing.

pub mod nodes;
pub mod probe;
pub mod slot;

pub use nodes::{
    AcceptAllVerifier, ClusterNode, ClusterTopology, NodeRole, NodeVerifier, Replicaset,
    TopologyError,
};
pub use slot::{key_slot, SlotMap, SlotRange};
