// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{hex, Address};
use bigdecimal::BigDecimal;
use futures_util::FutureExt;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{error, info};

use settlement_common::prelude::{sequential_timer, TimerHandle};

use crate::contracts::{u256_from_bigdecimal, AllocationExchange, OnchainVoucher, TxOutcome};
use crate::database::serializable_retry;
use crate::metrics;

/// A gateway-signed voucher held locally until it is redeemed on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voucher {
    pub allocation: Address,
    pub amount: BigDecimal,
    pub signature: Vec<u8>,
    pub protocol_network: String,
}

#[derive(Debug, Error)]
pub enum VoucherError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("voucher row carries an invalid allocation: {0}")]
    InvalidAllocation(String),
}

/// How one redemption tick handles the pending vouchers: which ones go into
/// the `redeemMany` batch, how many were below the per-voucher threshold, and
/// whether the batch value clears the submission gate.
#[derive(Debug)]
pub struct BatchPlan {
    pub batch: Vec<Voucher>,
    pub below_threshold: usize,
    pub total: BigDecimal,
    pub submit: bool,
}

pub fn plan_batch(
    mut vouchers: Vec<Voucher>,
    redemption_threshold: &BigDecimal,
    batch_threshold: &BigDecimal,
    max_batch_size: usize,
) -> BatchPlan {
    vouchers.sort_by(|a, b| b.amount.cmp(&a.amount));

    let (eligible, below): (Vec<_>, Vec<_>) = vouchers
        .into_iter()
        .partition(|v| &v.amount >= redemption_threshold);

    let mut batch = eligible;
    batch.truncate(max_batch_size);

    let total = batch
        .iter()
        .fold(BigDecimal::from(0u32), |acc, v| acc + &v.amount);
    let submit = !batch.is_empty() && &total > batch_threshold;

    BatchPlan {
        batch,
        below_threshold: below.len(),
        total,
        submit,
    }
}

/// Periodically batches pending vouchers by descending amount and redeems
/// them through the allocation exchange's `redeemMany`.
pub struct VoucherRedeemer {
    pgpool: PgPool,
    exchange: Arc<dyn AllocationExchange>,
    protocol_network: String,
    redemption_threshold: BigDecimal,
    batch_threshold: BigDecimal,
    max_batch_size: usize,
}

impl VoucherRedeemer {
    pub fn new(
        pgpool: PgPool,
        exchange: Arc<dyn AllocationExchange>,
        protocol_network: String,
        redemption_threshold: BigDecimal,
        batch_threshold: BigDecimal,
        max_batch_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            pgpool,
            exchange,
            protocol_network,
            redemption_threshold,
            batch_threshold,
            max_batch_size,
        })
    }

    pub fn start(self: &Arc<Self>, interval: Duration) -> TimerHandle {
        let this = self.clone();
        sequential_timer("voucher-redemption", interval, move || {
            let this = this.clone();
            async move { this.redeem_pending_vouchers().await }
        })
    }

    /// One redemption tick.
    pub async fn redeem_pending_vouchers(&self) -> anyhow::Result<()> {
        let _timer = metrics::VOUCHERS_REDEEM_DURATION
            .with_label_values(&[&self.protocol_network])
            .start_timer();

        let vouchers = self.pending_vouchers().await?;
        if vouchers.is_empty() {
            return Ok(());
        }

        // Drop vouchers whose allocation was already redeemed, e.g. by a
        // previous life of this process whose confirmation never landed.
        let mut pending = Vec::with_capacity(vouchers.len());
        for voucher in vouchers {
            if self.exchange.allocations_redeemed(voucher.allocation).await? {
                info!(
                    allocation = %voucher.allocation,
                    "Allocation was redeemed elsewhere; deleting the local voucher"
                );
                self.delete_vouchers(&[voucher.allocation]).await?;
                continue;
            }
            pending.push(voucher);
        }

        let plan = plan_batch(
            pending,
            &self.redemption_threshold,
            &self.batch_threshold,
            self.max_batch_size,
        );
        if plan.below_threshold > 0 {
            info!(
                count = plan.below_threshold,
                threshold = %self.redemption_threshold,
                "Vouchers below the redemption threshold are left pending"
            );
        }
        if plan.batch.is_empty() {
            return Ok(());
        }
        if !plan.submit {
            info!(
                batch_value = %plan.total,
                batch_threshold = %self.batch_threshold,
                "Batch value does not clear the batch threshold yet"
            );
            return Ok(());
        }

        self.submit_batch(plan.batch).await
    }

    async fn submit_batch(&self, batch: Vec<Voucher>) -> anyhow::Result<()> {
        metrics::VOUCHERS_BATCH_REDEEM_SIZE
            .with_label_values(&[&self.protocol_network])
            .set(batch.len() as i64);

        let onchain: Vec<OnchainVoucher> = batch
            .iter()
            .map(|v| {
                Ok(OnchainVoucher {
                    allocation_id: v.allocation,
                    amount: u256_from_bigdecimal(&v.amount)?,
                    signature: v.signature.clone(),
                })
            })
            .collect::<anyhow::Result<_>>()?;

        match self.exchange.redeem_many(&onchain).await {
            Ok(TxOutcome::Confirmed(_)) => {
                self.finalize_redemption(&batch).await?;
                metrics::SUCCESS_VOUCHER_REDEEMS
                    .with_label_values(&[&self.protocol_network])
                    .inc();
                info!(vouchers = batch.len(), "Redeemed voucher batch");
            }
            Ok(TxOutcome::Paused | TxOutcome::Unauthorized) => {
                metrics::INVALID_VOUCHER_REDEEMS
                    .with_label_values(&[&self.protocol_network])
                    .inc();
                info!("Voucher redemption rejected by contract state; will retry once it clears");
            }
            Err(e) => {
                metrics::FAILED_VOUCHER_REDEEMS
                    .with_label_values(&[&self.protocol_network])
                    .inc();
                error!(error = %e, "Voucher redemption failed to submit");
            }
        }
        Ok(())
    }

    async fn pending_vouchers(&self) -> Result<Vec<Voucher>, VoucherError> {
        let rows = sqlx::query(
            r#"
            SELECT allocation, amount, signature, protocol_network
            FROM vouchers
            WHERE protocol_network = $1
            ORDER BY amount DESC
            LIMIT $2
            "#,
        )
        .bind(&self.protocol_network)
        .bind(self.max_batch_size as i64)
        .fetch_all(&self.pgpool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let allocation: String = row.try_get("allocation")?;
                Ok(Voucher {
                    allocation: Address::from_str(&allocation)
                        .map_err(|_| VoucherError::InvalidAllocation(allocation))?,
                    amount: row.try_get("amount")?,
                    signature: row.try_get("signature")?,
                    protocol_network: row.try_get("protocol_network")?,
                })
            })
            .collect()
    }

    async fn delete_vouchers(&self, allocations: &[Address]) -> sqlx::Result<()> {
        let allocations: Vec<String> = allocations.iter().map(hex::encode).collect();
        sqlx::query("DELETE FROM vouchers WHERE allocation = ANY($1) AND protocol_network = $2")
            .bind(&allocations)
            .bind(&self.protocol_network)
            .execute(&self.pgpool)
            .await?;
        Ok(())
    }

    /// Moves the batch value into `withdrawn_fees` and drops the redeemed
    /// vouchers, atomically.
    async fn finalize_redemption(&self, batch: &[Voucher]) -> sqlx::Result<()> {
        let batch = batch.to_vec();
        let network = self.protocol_network.clone();
        serializable_retry(&self.pgpool, move |conn| {
            let batch = batch.clone();
            let network = network.clone();
            async move {
                for voucher in &batch {
                    sqlx::query(
                        r#"
                        INSERT INTO allocation_summaries (allocation, protocol_network, collected_fees, withdrawn_fees)
                        VALUES ($1, $2, 0, $3)
                        ON CONFLICT (allocation, protocol_network)
                        DO UPDATE SET withdrawn_fees = allocation_summaries.withdrawn_fees + EXCLUDED.withdrawn_fees
                        "#,
                    )
                    .bind(hex::encode(voucher.allocation))
                    .bind(&network)
                    .bind(&voucher.amount)
                    .execute(&mut *conn)
                    .await?;
                }

                let allocations: Vec<String> =
                    batch.iter().map(|v| hex::encode(v.allocation)).collect();
                sqlx::query(
                    "DELETE FROM vouchers WHERE allocation = ANY($1) AND protocol_network = $2",
                )
                .bind(&allocations)
                .bind(&network)
                .execute(&mut *conn)
                .await?;
                Ok(())
            }
            .boxed()
        })
        .await
    }
}
