//! Client side of the cluster: the agent embedded in non-voting processes

pub mod agent;

pub use agent::ClusterClient;
