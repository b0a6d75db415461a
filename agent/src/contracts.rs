// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bigdecimal::num_bigint::{Sign, ToBigInt};
use bigdecimal::BigDecimal;
use ethers::abi::parse_abi;
use ethers::contract::Contract;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::LocalWallet;
use ethers_core::types::{Bytes, TransactionReceipt, U256};

use crate::ravs::SignedRav;

/// A voucher in the form `redeemMany` expects.
#[derive(Debug, Clone)]
pub struct OnchainVoucher {
    pub allocation_id: Address,
    pub amount: U256,
    pub signature: Vec<u8>,
}

/// Outcome of a redemption submission. `Paused` and `Unauthorized` are
/// contract-state rejections that clear on their own; anything else that goes
/// wrong surfaces as an error.
#[derive(Debug)]
pub enum TxOutcome {
    Confirmed(Box<TransactionReceipt>),
    Paused,
    Unauthorized,
}

/// The slice of the allocation exchange contract the core consumes.
#[async_trait]
pub trait AllocationExchange: Send + Sync {
    async fn allocations_redeemed(&self, allocation: Address) -> anyhow::Result<bool>;
    async fn redeem_many(&self, vouchers: &[OnchainVoucher]) -> anyhow::Result<TxOutcome>;
}

/// The slice of the escrow contract the core consumes.
#[async_trait]
pub trait Escrow: Send + Sync {
    async fn redeem(
        &self,
        signed_rav: &SignedRav,
        allocation_id_proof: &[u8],
    ) -> anyhow::Result<TxOutcome>;
}

pub fn u256_from_bigdecimal(value: &BigDecimal) -> anyhow::Result<U256> {
    let int = value
        .to_bigint()
        .filter(|_| value.is_integer())
        .ok_or_else(|| anyhow!("amount {value} is not an integer"))?;
    let (sign, bytes) = int.to_bytes_be();
    if sign == Sign::Minus {
        return Err(anyhow!("amount {value} is negative"));
    }
    if bytes.len() > 32 {
        return Err(anyhow!("amount {value} does not fit a uint256"));
    }
    Ok(U256::from_big_endian(&bytes))
}

fn classify_rejection(message: &str) -> Option<TxOutcome> {
    let message = message.to_lowercase();
    if message.contains("paused") {
        Some(TxOutcome::Paused)
    } else if message.contains("unauthorized") || message.contains("not authorized") {
        Some(TxOutcome::Unauthorized)
    } else {
        None
    }
}

fn to_ethers(address: Address) -> ethers_core::types::Address {
    ethers_core::types::Address::from_slice(address.as_slice())
}

type RpcClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Thin RPC-backed facade over the two redemption contracts. Submissions
/// estimate first so contract-state rejections classify without spending
/// gas, then send and await the receipt under the configured timeout.
pub struct ContractFacade {
    exchange: Contract<RpcClient>,
    escrow: Contract<RpcClient>,
    timeout: Duration,
}

impl ContractFacade {
    pub async fn connect(
        rpc_url: &str,
        operator: LocalWallet,
        exchange_address: Address,
        escrow_address: Address,
        timeout: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let provider = Provider::<Http>::try_from(rpc_url).context("invalid chain RPC URL")?;
        let client = Arc::new(
            SignerMiddleware::new_with_provider_chain(provider, operator)
                .await
                .context("failed to connect the chain RPC client")?,
        );

        let exchange_abi = parse_abi(&[
            "function allocationsRedeemed(address allocationID) view returns (bool)",
            "function redeemMany((address,uint256,bytes)[] vouchers)",
        ])
        .context("invalid allocation exchange ABI")?;
        let escrow_abi = parse_abi(&[
            "function redeem(((address,uint64,uint128),bytes) signedRAV, bytes allocationIDProof)",
        ])
        .context("invalid escrow ABI")?;

        Ok(Arc::new(Self {
            exchange: Contract::new(to_ethers(exchange_address), exchange_abi, client.clone()),
            escrow: Contract::new(to_ethers(escrow_address), escrow_abi, client),
            timeout,
        }))
    }

    async fn submit(
        &self,
        call: ethers::contract::ContractCall<RpcClient, ()>,
    ) -> anyhow::Result<TxOutcome> {
        if let Err(e) = call.estimate_gas().await {
            if let Some(rejection) = classify_rejection(&e.to_string()) {
                return Ok(rejection);
            }
            return Err(e.into());
        }
        let pending = call.send().await?;
        let receipt = tokio::time::timeout(self.timeout, pending)
            .await
            .context("transaction confirmation timed out")??
            .ok_or_else(|| anyhow!("transaction was dropped from the mempool"))?;
        Ok(TxOutcome::Confirmed(Box::new(receipt)))
    }
}

#[async_trait]
impl AllocationExchange for ContractFacade {
    async fn allocations_redeemed(&self, allocation: Address) -> anyhow::Result<bool> {
        Ok(self
            .exchange
            .method::<_, bool>("allocationsRedeemed", to_ethers(allocation))?
            .call()
            .await?)
    }

    async fn redeem_many(&self, vouchers: &[OnchainVoucher]) -> anyhow::Result<TxOutcome> {
        let vouchers: Vec<(ethers_core::types::Address, U256, Bytes)> = vouchers
            .iter()
            .map(|v| {
                (
                    to_ethers(v.allocation_id),
                    v.amount,
                    Bytes::from(v.signature.clone()),
                )
            })
            .collect();
        let call = self.exchange.method::<_, ()>("redeemMany", vouchers)?;
        self.submit(call).await
    }
}

#[async_trait]
impl Escrow for ContractFacade {
    async fn redeem(
        &self,
        signed_rav: &SignedRav,
        allocation_id_proof: &[u8],
    ) -> anyhow::Result<TxOutcome> {
        let rav = (
            to_ethers(signed_rav.message.allocation_id),
            signed_rav.message.timestamp_ns,
            signed_rav.message.value_aggregate,
        );
        let signed = (rav, Bytes::from(signed_rav.signature.to_vec()));
        let call = self
            .escrow
            .method::<_, ()>("redeem", (signed, Bytes::from(allocation_id_proof.to_vec())))?;
        self.submit(call).await
    }
}
