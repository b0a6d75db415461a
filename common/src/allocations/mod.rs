// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

pub mod monitor;

use alloy_primitives::Address;
use serde::Deserialize;

/// Allocation lifecycle states as reported by the network subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AllocationStatus {
    Null,
    Active,
    Closed,
    Finalized,
    Claimed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphDeployment {
    /// IPFS hash of the deployment manifest (`Qm…`).
    pub ipfs_hash: String,
}

/// A staked commitment by an indexer to serve one subgraph deployment for a
/// bounded epoch window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: Address,
    pub indexer: Address,
    pub subgraph_deployment: SubgraphDeployment,
    pub status: AllocationStatus,
    pub created_at_epoch: u64,
    pub closed_at_epoch: Option<u64>,
}
