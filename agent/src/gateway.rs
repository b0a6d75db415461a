// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{hex, Address};
use bigdecimal::BigDecimal;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request to {endpoint} failed with status {status}: {body}")]
    RequestFailed {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
    #[error("gateway voucher for allocation {0} carries neither `fees` nor `amount`")]
    MalformedResponse(String),
    #[error("partial vouchers span allocations {0} and {1}")]
    HeterogeneousPartialBatch(Address, Address),
    #[error("invalid gateway base URL: {0}")]
    BaseUrl(url::ParseError),
    #[error("gateway returned an invalid voucher field: {0}")]
    InvalidVoucher(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// A counterparty-signed aggregation of one allocation's receipts, as the
/// gateway returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayVoucher {
    pub allocation: Address,
    pub fees: BigDecimal,
    pub signature: Vec<u8>,
}

/// An aggregation over a sub-range of an allocation's receipts; a list of
/// these merges into the final voucher. Fees and signature stay opaque so
/// they round-trip to the gateway byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialVoucher {
    pub allocation: Address,
    pub fees: String,
    pub signature: String,
    pub receipt_id_min: u64,
    pub receipt_id_max: u64,
}

#[derive(Deserialize)]
struct RawVoucher {
    allocation: String,
    signature: String,
    fees: Option<String>,
    amount: Option<String>,
}

/// HTTP client for the gateway's receipt-exchange endpoints.
pub struct GatewayClient {
    http: reqwest::Client,
    collect_receipts_url: Url,
    partial_voucher_url: Url,
    voucher_url: Url,
}

impl GatewayClient {
    /// Builds the three endpoint URLs from the base URL's scheme and host;
    /// any path or query on the base URL is discarded.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let mut base = Url::parse(base_url).map_err(GatewayError::BaseUrl)?;
        base.set_path("");
        base.set_query(None);
        base.set_fragment(None);

        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            collect_receipts_url: base.join("collect-receipts").map_err(GatewayError::BaseUrl)?,
            partial_voucher_url: base.join("partial-voucher").map_err(GatewayError::BaseUrl)?,
            voucher_url: base.join("voucher").map_err(GatewayError::BaseUrl)?,
        })
    }

    /// Exchanges one encoded receipt batch for a full voucher.
    pub async fn collect_receipts(&self, encoded: Vec<u8>) -> Result<GatewayVoucher, GatewayError> {
        let raw = self
            .post_binary(&self.collect_receipts_url, "collect-receipts", encoded)
            .await?;
        voucher_from_raw(raw)
    }

    /// Exchanges one encoded receipt batch for a partial voucher covering
    /// only that batch's receipt-id range.
    pub async fn collect_partial_voucher(
        &self,
        encoded: Vec<u8>,
    ) -> Result<PartialVoucher, GatewayError> {
        self.post_binary(&self.partial_voucher_url, "partial-voucher", encoded)
            .await
    }

    /// Merges partial vouchers for one allocation into the final voucher.
    pub async fn exchange_partial_vouchers(
        &self,
        allocation: Address,
        partial_vouchers: &[PartialVoucher],
    ) -> Result<GatewayVoucher, GatewayError> {
        for partial in partial_vouchers {
            if partial.allocation != allocation {
                return Err(GatewayError::HeterogeneousPartialBatch(
                    allocation,
                    partial.allocation,
                ));
            }
        }

        let response = self
            .http
            .post(self.voucher_url.clone())
            .json(&json!({
                "allocation": allocation,
                "partialVouchers": partial_vouchers,
            }))
            .send()
            .await?;
        let raw = decode_response(response, "voucher").await?;
        voucher_from_raw(raw)
    }

    async fn post_binary<T: DeserializeOwned>(
        &self,
        url: &Url,
        endpoint: &'static str,
        encoded: Vec<u8>,
    ) -> Result<T, GatewayError> {
        let response = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(encoded)
            .send()
            .await?;
        decode_response(response, endpoint).await
    }
}

async fn decode_response<T: DeserializeOwned>(
    response: reqwest::Response,
    endpoint: &'static str,
) -> Result<T, GatewayError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::RequestFailed {
            endpoint,
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}

fn voucher_from_raw(raw: RawVoucher) -> Result<GatewayVoucher, GatewayError> {
    let fees = raw
        .fees
        .or(raw.amount)
        .ok_or_else(|| GatewayError::MalformedResponse(raw.allocation.clone()))?;
    Ok(GatewayVoucher {
        allocation: Address::from_str(&raw.allocation)
            .map_err(|e| GatewayError::InvalidVoucher(format!("allocation: {e}")))?,
        fees: BigDecimal::from_str(&fees)
            .map_err(|e| GatewayError::InvalidVoucher(format!("fees: {e}")))?,
        signature: hex::decode(&raw.signature)
            .map_err(|e| GatewayError::InvalidVoucher(format!("signature: {e}")))?,
    })
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const ALLOCATION: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn allocation() -> Address {
        Address::from_str(ALLOCATION).unwrap()
    }

    fn client(server: &MockServer) -> GatewayClient {
        // Path and query on the base URL must be discarded on construction.
        let base = format!("{}/ignored/path?stale=1", server.uri());
        GatewayClient::new(&base, Duration::from_secs(5)).unwrap()
    }

    fn partial(fees: &str, id_min: u64, id_max: u64) -> PartialVoucher {
        PartialVoucher {
            allocation: allocation(),
            fees: fees.to_string(),
            signature: format!("0x{}", "11".repeat(65)),
            receipt_id_min: id_min,
            receipt_id_max: id_max,
        }
    }

    #[tokio::test]
    async fn collect_receipts_returns_the_voucher() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .and(header("content-type", "application/octet-stream"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": ALLOCATION,
                "fees": "600",
                "signature": format!("0x{}", "22".repeat(65)),
            })))
            .mount(&server)
            .await;

        let voucher = client(&server).collect_receipts(vec![0u8; 356]).await.unwrap();
        assert_eq!(voucher.allocation, allocation());
        assert_eq!(voucher.fees, BigDecimal::from(600u32));
        assert_eq!(voucher.signature.len(), 65);
    }

    #[tokio::test]
    async fn an_amount_field_stands_in_for_fees() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": ALLOCATION,
                "amount": "1234",
                "signature": format!("0x{}", "22".repeat(65)),
            })))
            .mount(&server)
            .await;

        let voucher = client(&server).collect_receipts(vec![]).await.unwrap();
        assert_eq!(voucher.fees, BigDecimal::from(1234u32));
    }

    #[tokio::test]
    async fn a_voucher_without_fees_or_amount_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": ALLOCATION,
                "signature": format!("0x{}", "22".repeat(65)),
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            client(&server).collect_receipts(vec![]).await,
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn a_gateway_failure_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(503).set_body_string("draining"))
            .mount(&server)
            .await;

        match client(&server).collect_receipts(vec![]).await {
            Err(GatewayError::RequestFailed { status, body, .. }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "draining");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_vouchers_parse_their_id_range() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/partial-voucher"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": ALLOCATION,
                "fees": "100",
                "signature": format!("0x{}", "33".repeat(65)),
                "receiptIdMin": 1,
                "receiptIdMax": 25_000,
            })))
            .mount(&server)
            .await;

        let partial = client(&server)
            .collect_partial_voucher(vec![])
            .await
            .unwrap();
        assert_eq!(partial.receipt_id_min, 1);
        assert_eq!(partial.receipt_id_max, 25_000);
    }

    #[tokio::test]
    async fn merging_posts_the_partial_vouchers_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/voucher"))
            .and(header("content-type", "application/json"))
            .and(body_string_contains("partialVouchers"))
            .and(body_string_contains("receiptIdMin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": ALLOCATION,
                "fees": "300",
                "signature": format!("0x{}", "44".repeat(65)),
            })))
            .mount(&server)
            .await;

        let voucher = client(&server)
            .exchange_partial_vouchers(
                allocation(),
                &[partial("100", 1, 25_000), partial("200", 25_001, 30_000)],
            )
            .await
            .unwrap();
        assert_eq!(voucher.fees, BigDecimal::from(300u32));
    }

    #[tokio::test]
    async fn mixed_allocation_partials_are_rejected_before_posting() {
        let server = MockServer::start().await;
        let mut foreign = partial("100", 1, 10);
        foreign.allocation = Address::from([0xbb; 20]);

        assert!(matches!(
            client(&server)
                .exchange_partial_vouchers(allocation(), &[partial("1", 1, 2), foreign])
                .await,
            Err(GatewayError::HeterogeneousPartialBatch(_, _))
        ));
        // No requests must have reached the gateway.
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
