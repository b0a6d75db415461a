// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// What an indexing rule's identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Deployment,
    Subgraph,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionBasis {
    Rules,
    Never,
    Always,
    Offchain,
}

/// A per-deployment indexing rule. Every tunable is optional so that a
/// deployment-scoped rule can be merged over the indexer's global rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingRule {
    pub identifier: String,
    pub identifier_type: Option<IdentifierKind>,
    pub allocation_amount: Option<String>,
    pub allocation_lifetime: Option<u64>,
    pub auto_renewal: Option<bool>,
    pub parallel_allocations: Option<u32>,
    pub max_allocation_percentage: Option<f64>,
    pub min_signal: Option<String>,
    pub max_signal: Option<String>,
    pub min_stake: Option<String>,
    pub min_average_query_fees: Option<String>,
    pub custom: Option<String>,
    pub decision_basis: Option<DecisionBasis>,
    pub require_supported: Option<bool>,
    pub safety: Option<bool>,
    pub protocol_network: Option<String>,
}

impl IndexingRule {
    /// Merges a deployment-scoped rule over the global rule: any setting the
    /// local rule leaves unset falls back to the global one. The identifier
    /// always stays local.
    pub fn merge(local: Self, global: &Self) -> Self {
        macro_rules! pick {
            ($field:ident) => {
                local.$field.or_else(|| global.$field.clone())
            };
        }
        Self {
            identifier: local.identifier.clone(),
            identifier_type: local.identifier_type.or(global.identifier_type),
            allocation_amount: pick!(allocation_amount),
            allocation_lifetime: local.allocation_lifetime.or(global.allocation_lifetime),
            auto_renewal: local.auto_renewal.or(global.auto_renewal),
            parallel_allocations: local.parallel_allocations.or(global.parallel_allocations),
            max_allocation_percentage: local
                .max_allocation_percentage
                .or(global.max_allocation_percentage),
            min_signal: pick!(min_signal),
            max_signal: pick!(max_signal),
            min_stake: pick!(min_stake),
            min_average_query_fees: pick!(min_average_query_fees),
            custom: pick!(custom),
            decision_basis: local.decision_basis.or(global.decision_basis),
            require_supported: local.require_supported.or(global.require_supported),
            safety: local.safety.or(global.safety),
            protocol_network: pick!(protocol_network),
        }
    }
}

/// A proof-of-indexing dispute record, stored for operator review. Data shape
/// only; filing and resolution happen elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoiDispute {
    pub allocation_id: String,
    pub subgraph_deployment_id: String,
    pub allocation_indexer: String,
    pub allocation_amount: String,
    pub allocation_proof: String,
    pub closed_epoch: u64,
    pub closed_epoch_start_block_hash: String,
    pub closed_epoch_start_block_number: u64,
    pub closed_epoch_reference_proof: Option<String>,
    pub previous_epoch_start_block_hash: String,
    pub previous_epoch_start_block_number: u64,
    pub previous_epoch_reference_proof: Option<String>,
    pub status: String,
    pub protocol_network: String,
}
