// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum SubgraphClientError {
    #[error("failed to query subgraph: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("subgraph returned errors: {0}")]
    Query(String),
    #[error("subgraph returned no data")]
    NoData,
    #[error("failed to decode subgraph response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct GraphqlResponse {
    data: Option<Value>,
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

/// Minimal GraphQL-over-HTTP client for subgraph queries.
pub struct SubgraphClient {
    http_client: reqwest::Client,
    query_url: Url,
}

impl SubgraphClient {
    pub fn new(http_client: reqwest::Client, query_url: Url) -> Self {
        Self {
            http_client,
            query_url,
        }
    }

    /// Sends `query` with `variables` and decodes the `data` payload into `T`.
    pub async fn query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, SubgraphClientError> {
        let response: GraphqlResponse = self
            .http_client
            .post(self.query_url.clone())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(errors) = response.errors {
            if !errors.is_empty() {
                let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
                return Err(SubgraphClientError::Query(messages.join("; ")));
            }
        }

        let data = response.data.ok_or(SubgraphClientError::NoData)?;
        Ok(serde_json::from_value(data)?)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[derive(Deserialize)]
    struct Network {
        #[serde(rename = "graphNetwork")]
        graph_network: Epoch,
    }

    #[derive(Deserialize)]
    struct Epoch {
        #[serde(rename = "currentEpoch")]
        current_epoch: u64,
    }

    #[tokio::test]
    async fn decodes_the_data_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/subgraph"))
            .and(body_string_contains("currentEpoch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "graphNetwork": { "currentEpoch": 123 } }
            })))
            .mount(&server)
            .await;

        let client = SubgraphClient::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/subgraph", server.uri())).unwrap(),
        );
        let network: Network = client
            .query("query { graphNetwork(id: 1) { currentEpoch } }", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(network.graph_network.current_epoch, 123);
    }

    #[tokio::test]
    async fn surfaces_graphql_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errors": [{ "message": "indexer not found" }]
            })))
            .mount(&server)
            .await;

        let client = SubgraphClient::new(reqwest::Client::new(), Url::parse(&server.uri()).unwrap());
        let result: Result<Network, _> = client.query("query { broken }", serde_json::json!({})).await;
        assert!(matches!(result, Err(SubgraphClientError::Query(message)) if message.contains("indexer not found")));
    }
}
