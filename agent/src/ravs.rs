// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{hex, Address};
use bigdecimal::BigDecimal;
use ethers_core::types::Signature;
use eventuals::Eventual;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, error, info};

use settlement_common::prelude::{sequential_timer, Allocation, TimerHandle};

use crate::contracts::{Escrow, TxOutcome};
use crate::database::serializable_retry;
use crate::keys::{allocation_id_proof, recover_allocation_signer, KeyringError};
use crate::metrics;

/// A receipt aggregate voucher as the sender's aggregator signs it. The JSON
/// field names follow the aggregator's wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rav {
    pub allocation_id: Address,
    pub timestamp_ns: u64,
    pub value_aggregate: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedRav {
    pub message: Rav,
    pub signature: Signature,
}

/// A `scalar_tap_ravs` row. Only rows marked final are redeemable; a
/// non-final RAV can still be superseded by a later aggregation.
#[derive(Debug, Clone)]
pub struct RavRow {
    pub allocation_id: Address,
    pub sender_address: Address,
    pub signed_rav: SignedRav,
    pub is_final: bool,
}

#[derive(Debug, Error)]
pub enum RavError {
    #[error("no eligible allocation matches RAV allocation {0}")]
    AllocationNotFoundForRav(Address),
    #[error(transparent)]
    Keyring(#[from] KeyringError),
}

/// Periodically scans finalized RAVs and redeems each one individually
/// against the escrow contract, with a freshly recovered allocation signer
/// and allocation-id proof per RAV.
pub struct RavRedeemer {
    pgpool: PgPool,
    escrow: Arc<dyn Escrow>,
    allocations: Eventual<Vec<Allocation>>,
    mnemonic: String,
    indexer_address: Address,
    protocol_network: String,
    redemption_threshold: BigDecimal,
}

impl RavRedeemer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pgpool: PgPool,
        escrow: Arc<dyn Escrow>,
        allocations: Eventual<Vec<Allocation>>,
        mnemonic: String,
        indexer_address: Address,
        protocol_network: String,
        redemption_threshold: BigDecimal,
    ) -> Arc<Self> {
        Arc::new(Self {
            pgpool,
            escrow,
            allocations,
            mnemonic,
            indexer_address,
            protocol_network,
            redemption_threshold,
        })
    }

    pub fn start(self: &Arc<Self>, interval: Duration) -> TimerHandle {
        let this = self.clone();
        sequential_timer("rav-redemption", interval, move || {
            let this = this.clone();
            async move { this.redeem_final_ravs().await }
        })
    }

    /// One redemption tick. Each RAV is an independent submission and an
    /// independent transaction; a failure is counted and the scan continues.
    pub async fn redeem_final_ravs(&self) -> anyhow::Result<()> {
        for row in self.final_ravs().await? {
            let value = BigDecimal::from(row.signed_rav.message.value_aggregate);
            if value < self.redemption_threshold {
                debug!(
                    allocation = %row.allocation_id,
                    sender = %row.sender_address,
                    %value,
                    "RAV value is below the redemption threshold"
                );
                continue;
            }
            if let Err(e) = self.redeem_rav(&row).await {
                metrics::FAILED_VOUCHER_REDEEMS
                    .with_label_values(&[&self.protocol_network])
                    .inc();
                error!(
                    allocation = %row.allocation_id,
                    sender = %row.sender_address,
                    error = %e,
                    "Failed to redeem RAV"
                );
            }
        }
        Ok(())
    }

    async fn redeem_rav(&self, row: &RavRow) -> anyhow::Result<()> {
        match self.submit_rav(row).await? {
            TxOutcome::Confirmed(_) => {
                self.finalize_rav_redemption(row).await?;
                metrics::SUCCESS_VOUCHER_REDEEMS
                    .with_label_values(&[&self.protocol_network])
                    .inc();
                info!(
                    allocation = %row.allocation_id,
                    sender = %row.sender_address,
                    value = row.signed_rav.message.value_aggregate,
                    "Redeemed RAV"
                );
            }
            TxOutcome::Paused | TxOutcome::Unauthorized => {
                metrics::INVALID_VOUCHER_REDEEMS
                    .with_label_values(&[&self.protocol_network])
                    .inc();
                info!(
                    allocation = %row.allocation_id,
                    "RAV redemption rejected by contract state; will retry once it clears"
                );
            }
        }
        Ok(())
    }

    /// Derives the allocation signer and proof, then submits the redemption.
    /// No local state changes until the submission confirms.
    async fn submit_rav(&self, row: &RavRow) -> anyhow::Result<TxOutcome> {
        let allocations = self.allocations.value_immediate().unwrap_or_default();
        let allocation = allocations
            .iter()
            .find(|a| a.id == row.allocation_id)
            .ok_or(RavError::AllocationNotFoundForRav(row.allocation_id))?;

        let signer = recover_allocation_signer(&self.mnemonic, allocation).map_err(RavError::from)?;
        let proof =
            allocation_id_proof(&signer, self.indexer_address, allocation.id).map_err(RavError::from)?;

        self.escrow.redeem(&row.signed_rav, &proof.to_vec()).await
    }

    async fn final_ravs(&self) -> sqlx::Result<Vec<RavRow>> {
        let rows = sqlx::query(
            "SELECT allocation_id, sender_address, rav, final FROM scalar_tap_ravs WHERE final = true",
        )
        .fetch_all(&self.pgpool)
        .await?;

        let mut ravs = Vec::with_capacity(rows.len());
        for row in rows {
            let allocation_id: String = row.try_get("allocation_id")?;
            let sender_address: String = row.try_get("sender_address")?;
            let rav: serde_json::Value = row.try_get("rav")?;
            let signed_rav: SignedRav = match serde_json::from_value(rav) {
                Ok(signed_rav) => signed_rav,
                Err(e) => {
                    error!(allocation_id = %allocation_id, error = %e, "Skipping undecodable RAV row");
                    continue;
                }
            };
            ravs.push(RavRow {
                allocation_id: Address::from_str(&allocation_id)
                    .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?,
                sender_address: Address::from_str(&sender_address)
                    .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?,
                signed_rav,
                is_final: row.try_get("final")?,
            });
        }
        Ok(ravs)
    }

    /// Accounts the redeemed value and drops the RAV row, atomically.
    async fn finalize_rav_redemption(&self, row: &RavRow) -> sqlx::Result<()> {
        let allocation = hex::encode(row.allocation_id);
        let sender = hex::encode(row.sender_address);
        let value = BigDecimal::from(row.signed_rav.message.value_aggregate);
        let network = self.protocol_network.clone();

        serializable_retry(&self.pgpool, move |conn| {
            let allocation = allocation.clone();
            let sender = sender.clone();
            let value = value.clone();
            let network = network.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO allocation_summaries (allocation, protocol_network, collected_fees, withdrawn_fees)
                    VALUES ($1, $2, 0, $3)
                    ON CONFLICT (allocation, protocol_network)
                    DO UPDATE SET withdrawn_fees = allocation_summaries.withdrawn_fees + EXCLUDED.withdrawn_fees
                    "#,
                )
                .bind(&allocation)
                .bind(&network)
                .bind(&value)
                .execute(&mut *conn)
                .await?;

                sqlx::query(
                    "DELETE FROM scalar_tap_ravs WHERE allocation_id = $1 AND sender_address = $2",
                )
                .bind(&allocation)
                .bind(&sender)
                .execute(&mut *conn)
                .await?;
                Ok(())
            }
            .boxed()
        })
        .await
    }
}
