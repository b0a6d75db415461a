// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{hex, Address};
use anyhow::{anyhow, ensure};
use eventuals::Eventual;
use serde::Deserialize;
use serde_json::json;

use crate::sequential_timer::{sequential_timer_map, TimerHandle};
use crate::subgraph_client::SubgraphClient;

use super::{Allocation, AllocationStatus, SubgraphDeployment};

const PAGE_SIZE: u64 = 1000;

const CURRENT_EPOCH_QUERY: &str = r#"
    query {
        graphNetwork(id: 1) {
            currentEpoch
        }
    }
"#;

const ACTIVE_ALLOCATIONS_QUERY: &str = r#"
    query ($indexer: String!, $lastId: String!, $first: Int!) {
        allocations(
            where: { indexer: $indexer, status: Active, id_gt: $lastId }
            orderBy: id
            orderDirection: asc
            first: $first
        ) {
            id
            indexer { id }
            subgraphDeployment { ipfsHash }
            createdAtEpoch
            closedAtEpoch
        }
    }
"#;

const RECENTLY_CLOSED_ALLOCATIONS_QUERY: &str = r#"
    query ($indexer: String!, $lastId: String!, $first: Int!, $minClosedAtEpoch: Int!) {
        allocations(
            where: {
                indexer: $indexer
                status: Closed
                closedAtEpoch_gte: $minClosedAtEpoch
                id_gt: $lastId
            }
            orderBy: id
            orderDirection: asc
            first: $first
        ) {
            id
            indexer { id }
            subgraphDeployment { ipfsHash }
            createdAtEpoch
            closedAtEpoch
        }
    }
"#;

#[derive(Deserialize)]
struct GraphNetworkData {
    #[serde(rename = "graphNetwork")]
    graph_network: Option<CurrentEpoch>,
}

#[derive(Deserialize)]
struct CurrentEpoch {
    #[serde(rename = "currentEpoch")]
    current_epoch: u64,
}

#[derive(Deserialize)]
struct AllocationsData {
    allocations: Vec<RawAllocation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAllocation {
    id: String,
    indexer: RawIndexer,
    subgraph_deployment: RawDeployment,
    created_at_epoch: u64,
    closed_at_epoch: Option<u64>,
}

#[derive(Deserialize)]
struct RawIndexer {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDeployment {
    ipfs_hash: String,
}

impl RawAllocation {
    fn into_allocation(self, status: AllocationStatus) -> anyhow::Result<Allocation> {
        Ok(Allocation {
            id: Address::from_str(&self.id)
                .map_err(|e| anyhow!("invalid allocation id `{}`: {e}", self.id))?,
            indexer: Address::from_str(&self.indexer.id)
                .map_err(|e| anyhow!("invalid indexer address `{}`: {e}", self.indexer.id))?,
            subgraph_deployment: SubgraphDeployment {
                ipfs_hash: self.subgraph_deployment.ipfs_hash,
            },
            status,
            created_at_epoch: self.created_at_epoch,
            closed_at_epoch: self.closed_at_epoch,
        })
    }
}

/// An always up-to-date list of the indexer's eligible allocations: the
/// active ones plus those closed within the last epoch. Each refresh pages
/// through the network subgraph; a failed or empty refresh keeps the previous
/// value, so the observable never surfaces an empty set.
pub fn eligible_allocations(
    network_subgraph: &'static SubgraphClient,
    indexer_address: Address,
    interval: Duration,
) -> (TimerHandle, Eventual<Vec<Allocation>>) {
    sequential_timer_map("allocation-monitor", interval, move || async move {
        let current_epoch = current_epoch(network_subgraph).await?;
        let indexer = format!("0x{}", hex::encode(indexer_address));

        let mut allocations = page_allocations(
            network_subgraph,
            ACTIVE_ALLOCATIONS_QUERY,
            json!({ "indexer": indexer }),
            AllocationStatus::Active,
        )
        .await?;
        allocations.extend(
            page_allocations(
                network_subgraph,
                RECENTLY_CLOSED_ALLOCATIONS_QUERY,
                json!({
                    "indexer": indexer,
                    "minClosedAtEpoch": current_epoch.saturating_sub(1),
                }),
                AllocationStatus::Closed,
            )
            .await?,
        );

        ensure!(
            !allocations.is_empty(),
            "indexer {indexer} has no active or recently closed allocations"
        );
        Ok(allocations)
    })
}

async fn current_epoch(network_subgraph: &SubgraphClient) -> anyhow::Result<u64> {
    let data: GraphNetworkData = network_subgraph
        .query(CURRENT_EPOCH_QUERY, json!({}))
        .await?;
    data.graph_network
        .map(|n| n.current_epoch)
        .ok_or_else(|| anyhow!("network subgraph has no graphNetwork entity"))
}

async fn page_allocations(
    network_subgraph: &SubgraphClient,
    query: &str,
    base_variables: serde_json::Value,
    status: AllocationStatus,
) -> anyhow::Result<Vec<Allocation>> {
    let mut allocations = Vec::new();
    let mut last_id = String::new();
    loop {
        let mut variables = base_variables.clone();
        variables["lastId"] = json!(last_id);
        variables["first"] = json!(PAGE_SIZE);

        let page: AllocationsData = network_subgraph.query(query, variables).await?;
        if page.allocations.is_empty() {
            break;
        }
        last_id = page
            .allocations
            .last()
            .map(|a| a.id.clone())
            .unwrap_or_default();
        for raw in page.allocations {
            allocations.push(raw.into_allocation(status)?);
        }
    }
    Ok(allocations)
}

#[cfg(test)]
mod tests {
    use url::Url;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn allocation_json(
        id: &str,
        created_at_epoch: u64,
        closed_at_epoch: Option<u64>,
    ) -> serde_json::Value {
        json!({
            "id": id,
            "indexer": { "id": "0xf4ef8d0b0b6c04be5ba5f5d0d5e0f0a79b9c37b1" },
            "subgraphDeployment": { "ipfsHash": "QmWmyoMoctfbAaiEs2G46gpeUmhqFRDW6KWo64y5r581Vz" },
            "createdAtEpoch": created_at_epoch,
            "closedAtEpoch": closed_at_epoch,
        })
    }

    async fn mock_network_subgraph() -> (&'static SubgraphClient, MockServer) {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_string_contains("currentEpoch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "graphNetwork": { "currentEpoch": 100 } }
            })))
            .mount(&server)
            .await;

        // First page carries the single allocation; the cursor query after it
        // comes back empty, which terminates paging.
        Mock::given(method("POST"))
            .and(body_string_contains("status: Active"))
            .and(body_string_contains("\"lastId\":\"\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "allocations": [
                    allocation_json("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", 99, None)
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("status: Active"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "allocations": [] }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(body_string_contains("status: Closed"))
            .and(body_string_contains("\"lastId\":\"\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "allocations": [
                    allocation_json("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", 95, Some(99))
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("status: Closed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "allocations": [] }
            })))
            .mount(&server)
            .await;

        let client = Box::leak(Box::new(SubgraphClient::new(
            reqwest::Client::new(),
            Url::parse(&server.uri()).unwrap(),
        )));
        (client, server)
    }

    #[test_log::test(tokio::test)]
    async fn merges_active_and_recently_closed_allocations() {
        let (client, _server) = mock_network_subgraph().await;
        let indexer = Address::from_str("0xf4ef8d0b0b6c04be5ba5f5d0d5e0f0a79b9c37b1").unwrap();

        let (_handle, allocations) = eligible_allocations(client, indexer, Duration::from_secs(60));

        let allocations = allocations.value().await.unwrap();
        assert_eq!(allocations.len(), 2);

        let active = &allocations[0];
        assert_eq!(
            active.id,
            Address::from_str("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap()
        );
        assert_eq!(active.status, AllocationStatus::Active);
        assert_eq!(active.created_at_epoch, 99);
        assert_eq!(active.closed_at_epoch, None);

        let closed = &allocations[1];
        assert_eq!(closed.status, AllocationStatus::Closed);
        assert_eq!(closed.closed_at_epoch, Some(99));
    }
}
