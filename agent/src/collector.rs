// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::{hex, Address};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use settlement_common::prelude::{sequential_timer, TimerHandle};

use crate::database::serializable_retry;
use crate::gateway::{GatewayClient, GatewayVoucher};
use crate::metrics;
use crate::receipts::{encode_receipt_batch, AllocationReceipt, RECEIPTS_PER_VOUCHER_CALL};

/// One closed allocation's receipts, frozen until `timeout_ms` passes.
#[derive(Debug, Clone)]
pub struct AllocationReceiptsBatch {
    pub receipts: Vec<AllocationReceipt>,
    pub timeout_ms: i64,
}

// Heap ordering is by unlock time alone.
impl PartialEq for AllocationReceiptsBatch {
    fn eq(&self, other: &Self) -> bool {
        self.timeout_ms == other.timeout_ms
    }
}
impl Eq for AllocationReceiptsBatch {}
impl PartialOrd for AllocationReceiptsBatch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for AllocationReceiptsBatch {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timeout_ms.cmp(&other.timeout_ms)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as i64
}

/// Pops every batch whose unlock time has passed, earliest first. Draining
/// before any batch is processed keeps a failed batch's immediate re-push
/// from being observed within the same tick.
fn drain_due(
    heap: &mut BinaryHeap<Reverse<AllocationReceiptsBatch>>,
    now_ms: i64,
) -> Vec<AllocationReceiptsBatch> {
    let mut due = Vec::new();
    while let Some(Reverse(batch)) = heap.peek() {
        if batch.timeout_ms > now_ms {
            break;
        }
        due.push(heap.pop().expect("peeked batch must pop").0);
    }
    due
}

/// The capability the agent's allocation-action pipeline drives: remember
/// allocations ahead of their close, and kick off fee collection once one
/// closes. Receipt families with other exchange protocols implement the same
/// two operations.
#[async_trait]
pub trait ReceiptCollection: Send + Sync {
    async fn remember_allocations(&self, action_id: u64, allocations: &[Address]) -> bool;
    async fn collect_receipts(&self, action_id: u64, allocation: Address) -> anyhow::Result<bool>;
}

#[async_trait]
impl ReceiptCollection for ReceiptCollector {
    async fn remember_allocations(&self, action_id: u64, allocations: &[Address]) -> bool {
        ReceiptCollector::remember_allocations(self, action_id, allocations).await
    }

    async fn collect_receipts(&self, action_id: u64, allocation: Address) -> anyhow::Result<bool> {
        ReceiptCollector::collect_receipts(self, action_id, allocation).await
    }
}

/// Schedules voucher exchange for the receipts of closed allocations: every
/// batch waits out the collection delay (so the last inflight receipts land
/// in the store first), then is exchanged with the gateway at most once.
pub struct ReceiptCollector {
    pgpool: PgPool,
    gateway: GatewayClient,
    protocol_network: String,
    collect_delay: Duration,
    batches: Mutex<BinaryHeap<Reverse<AllocationReceiptsBatch>>>,
}

impl ReceiptCollector {
    pub fn new(
        pgpool: PgPool,
        gateway: GatewayClient,
        protocol_network: String,
        collect_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pgpool,
            gateway,
            protocol_network,
            collect_delay,
            batches: Mutex::new(BinaryHeap::new()),
        })
    }

    pub fn start(self: &Arc<Self>, interval: Duration) -> TimerHandle {
        let this = self.clone();
        sequential_timer("receipt-collection", interval, move || {
            let this = this.clone();
            async move { this.collect_pending().await }
        })
    }

    /// Ensures a summary row exists for each allocation, in one transaction.
    /// Idempotent. Reports failure instead of raising.
    pub async fn remember_allocations(&self, action_id: u64, allocations: &[Address]) -> bool {
        let result: sqlx::Result<()> = async {
            let mut tx = self.pgpool.begin().await?;
            for allocation in allocations {
                sqlx::query(
                    r#"
                    INSERT INTO allocation_summaries (allocation, protocol_network, collected_fees, withdrawn_fees)
                    VALUES ($1, $2, 0, 0)
                    ON CONFLICT (allocation, protocol_network) DO NOTHING
                    "#,
                )
                .bind(hex::encode(allocation))
                .bind(&self.protocol_network)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(
                    code = "IE056",
                    action_id,
                    error = %e,
                    "Failed to remember allocations for collecting receipts later"
                );
                false
            }
        }
    }

    /// Latches the allocation's close time and freezes its receipt snapshot
    /// into a delayed batch. Returns `false` when there is nothing to collect
    /// (no receipts, or the allocation was latched earlier).
    pub async fn collect_receipts(
        &self,
        action_id: u64,
        allocation: Address,
    ) -> anyhow::Result<bool> {
        let receipts = match self.close_and_snapshot(allocation).await {
            Ok(receipts) => receipts,
            Err(e) => {
                error!(
                    code = "IE053",
                    action_id,
                    allocation = %allocation,
                    error = %e,
                    "Failed to queue receipts for collection"
                );
                return Err(e).context("failed to queue receipts for collection");
            }
        };

        let Some(receipts) = receipts else {
            return Ok(false);
        };
        if receipts.is_empty() {
            info!(action_id, allocation = %allocation, "No receipts to collect");
            return Ok(false);
        }

        let batch = AllocationReceiptsBatch {
            receipts,
            timeout_ms: now_ms() + self.collect_delay.as_millis() as i64,
        };
        info!(
            action_id,
            allocation = %allocation,
            receipts = batch.receipts.len(),
            "Queued receipts for collection after the delay"
        );
        self.batches.lock().await.push(Reverse(batch));
        Ok(true)
    }

    /// One transaction: set `closed_at` (once) and snapshot the receipts
    /// ordered by id. `None` means another call already latched this
    /// allocation.
    async fn close_and_snapshot(
        &self,
        allocation: Address,
    ) -> sqlx::Result<Option<Vec<AllocationReceipt>>> {
        let allocation_hex = hex::encode(allocation);
        let network = self.protocol_network.clone();

        serializable_retry(&self.pgpool, move |conn| {
            let allocation_hex = allocation_hex.clone();
            let network = network.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO allocation_summaries (allocation, protocol_network, collected_fees, withdrawn_fees)
                    VALUES ($1, $2, 0, 0)
                    ON CONFLICT (allocation, protocol_network) DO NOTHING
                    "#,
                )
                .bind(&allocation_hex)
                .bind(&network)
                .execute(&mut *conn)
                .await?;

                let latched = sqlx::query(
                    r#"
                    UPDATE allocation_summaries SET closed_at = now()
                    WHERE allocation = $1 AND protocol_network = $2 AND closed_at IS NULL
                    "#,
                )
                .bind(&allocation_hex)
                .bind(&network)
                .execute(&mut *conn)
                .await?;
                if latched.rows_affected() == 0 {
                    return Ok(None);
                }

                let receipts = sqlx::query(
                    r#"
                    SELECT id, allocation, fees, signature, protocol_network
                    FROM allocation_receipts
                    WHERE allocation = $1 AND protocol_network = $2
                    ORDER BY id
                    "#,
                )
                .bind(&allocation_hex)
                .bind(&network)
                .fetch_all(&mut *conn)
                .await?
                .into_iter()
                .map(receipt_from_row)
                .collect::<sqlx::Result<Vec<_>>>()?;

                Ok(Some(receipts))
            }
            .boxed()
        })
        .await
    }

    /// Restart recovery: rebuild the heap from closed allocations whose
    /// receipts are still in the store, with the original unlock times.
    pub async fn queue_pending_receipts_from_database(&self) -> anyhow::Result<()> {
        let summaries = sqlx::query(
            r#"
            SELECT allocation, closed_at FROM allocation_summaries
            WHERE closed_at IS NOT NULL AND protocol_network = $1
            "#,
        )
        .bind(&self.protocol_network)
        .fetch_all(&self.pgpool)
        .await?;
        if summaries.is_empty() {
            return Ok(());
        }

        let mut closed_at_by_allocation = HashMap::new();
        for row in &summaries {
            let allocation: String = row.try_get("allocation")?;
            let closed_at: DateTime<Utc> = row.try_get("closed_at")?;
            closed_at_by_allocation.insert(allocation, closed_at);
        }

        let allocations: Vec<String> = closed_at_by_allocation.keys().cloned().collect();
        let rows = sqlx::query(
            r#"
            SELECT id, allocation, fees, signature, protocol_network
            FROM allocation_receipts
            WHERE allocation = ANY($1) AND protocol_network = $2
            ORDER BY id
            "#,
        )
        .bind(&allocations)
        .bind(&self.protocol_network)
        .fetch_all(&self.pgpool)
        .await?;

        let mut groups: HashMap<String, Vec<AllocationReceipt>> = HashMap::new();
        for row in rows {
            let allocation: String = row.try_get("allocation")?;
            groups
                .entry(allocation)
                .or_default()
                .push(receipt_from_row(row)?);
        }

        let mut heap = self.batches.lock().await;
        let mut queued = 0;
        for (allocation, receipts) in groups {
            if receipts.is_empty() {
                continue;
            }
            let closed_at = closed_at_by_allocation[&allocation];
            heap.push(Reverse(AllocationReceiptsBatch {
                receipts,
                timeout_ms: closed_at.timestamp_millis() + self.collect_delay.as_millis() as i64,
            }));
            queued += 1;
        }
        info!(batches = queued, "Recovered pending receipt batches from the database");
        Ok(())
    }

    /// One scheduler tick: exchange every batch whose delay has passed. A
    /// failed batch goes back on the heap with an immediate unlock, so it
    /// retries on the next tick without waiting for a restart.
    async fn collect_pending(&self) -> anyhow::Result<()> {
        let due = drain_due(&mut *self.batches.lock().await, now_ms());

        for batch in due {
            let network = self.protocol_network.clone();
            metrics::RECEIPTS_TO_COLLECT
                .with_label_values(&[&network])
                .set(batch.receipts.len() as i64);
            let timer = metrics::RECEIPTS_COLLECT_DURATION
                .with_label_values(&[&network])
                .start_timer();

            match self.exchange_batch(&batch).await {
                Ok(voucher) => {
                    metrics::VOUCHERS.with_label_values(&[&network]).inc();
                    metrics::VOUCHER_COLLECTED_FEES
                        .with_label_values(&[&network, &hex::encode(voucher.allocation)])
                        .set(voucher.fees.to_string().parse().unwrap_or(f64::NAN));
                    info!(
                        allocation = %voucher.allocation,
                        fees = %voucher.fees,
                        receipts = batch.receipts.len(),
                        "Exchanged receipts for a voucher"
                    );
                }
                Err(e) => {
                    metrics::FAILED_RECEIPTS
                        .with_label_values(&[&network])
                        .inc_by(batch.receipts.len() as u64);
                    warn!(
                        receipts = batch.receipts.len(),
                        error = %e,
                        "Failed to exchange a receipt batch; it will retry on the next tick"
                    );
                    self.batches.lock().await.push(Reverse(AllocationReceiptsBatch {
                        receipts: batch.receipts,
                        timeout_ms: now_ms(),
                    }));
                }
            }
            timer.observe_duration();
            metrics::RECEIPTS_TO_COLLECT
                .with_label_values(&[&network])
                .set(0);
        }
        Ok(())
    }

    async fn exchange_batch(&self, batch: &AllocationReceiptsBatch) -> anyhow::Result<GatewayVoucher> {
        let allocation = batch.receipts[0].allocation;
        let voucher = self
            .obtain_receipts_voucher(allocation, &batch.receipts)
            .await?;
        self.finalize_exchange(&batch.receipts, &voucher).await?;
        Ok(voucher)
    }

    /// Small batches exchange in one call; anything past the per-call cap
    /// goes through partial vouchers and a final merge.
    pub async fn obtain_receipts_voucher(
        &self,
        allocation: Address,
        receipts: &[AllocationReceipt],
    ) -> anyhow::Result<GatewayVoucher> {
        if receipts.len() <= RECEIPTS_PER_VOUCHER_CALL {
            let encoded = encode_receipt_batch(allocation, receipts)?;
            return Ok(self.gateway.collect_receipts(encoded).await?);
        }

        let mut partial_vouchers = Vec::with_capacity(
            receipts.len().div_ceil(RECEIPTS_PER_VOUCHER_CALL),
        );
        for chunk in receipts.chunks(RECEIPTS_PER_VOUCHER_CALL) {
            let encoded = encode_receipt_batch(allocation, chunk)?;
            partial_vouchers.push(self.gateway.collect_partial_voucher(encoded).await?);
            metrics::PARTIAL_VOUCHERS_TO_EXCHANGE
                .with_label_values(&[&self.protocol_network])
                .set(partial_vouchers.len() as i64);
        }

        let voucher = self
            .gateway
            .exchange_partial_vouchers(allocation, &partial_vouchers)
            .await?;
        metrics::PARTIAL_VOUCHERS_TO_EXCHANGE
            .with_label_values(&[&self.protocol_network])
            .set(0);
        Ok(voucher)
    }

    /// One transaction: dispose of the exchanged receipts, account the
    /// collected fees, and store the voucher (idempotently). An abort leaves
    /// the receipts in the store for the retry.
    async fn finalize_exchange(
        &self,
        receipts: &[AllocationReceipt],
        voucher: &GatewayVoucher,
    ) -> sqlx::Result<()> {
        let ids: Vec<i64> = receipts.iter().map(|r| r.id as i64).collect();
        let voucher = voucher.clone();
        let network = self.protocol_network.clone();

        serializable_retry(&self.pgpool, move |conn| {
            let ids = ids.clone();
            let voucher = voucher.clone();
            let network = network.clone();
            async move {
                sqlx::query(
                    "DELETE FROM allocation_receipts WHERE id = ANY($1) AND protocol_network = $2",
                )
                .bind(&ids)
                .bind(&network)
                .execute(&mut *conn)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO allocation_summaries (allocation, protocol_network, collected_fees, withdrawn_fees)
                    VALUES ($1, $2, $3, 0)
                    ON CONFLICT (allocation, protocol_network)
                    DO UPDATE SET collected_fees = allocation_summaries.collected_fees + EXCLUDED.collected_fees
                    "#,
                )
                .bind(hex::encode(voucher.allocation))
                .bind(&network)
                .bind(&voucher.fees)
                .execute(&mut *conn)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO vouchers (allocation, amount, signature, protocol_network)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (allocation, protocol_network) DO NOTHING
                    "#,
                )
                .bind(hex::encode(voucher.allocation))
                .bind(&voucher.fees)
                .bind(&voucher.signature)
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

fn receipt_from_row(row: sqlx::postgres::PgRow) -> sqlx::Result<AllocationReceipt> {
    let id: i64 = row.try_get("id")?;
    let allocation: String = row.try_get("allocation")?;
    Ok(AllocationReceipt {
        id: id as u64,
        allocation: Address::from_str(&allocation)
            .map_err(|e| sqlx::Error::Decode(e.to_string().into()))?,
        fees: row.try_get("fees")?,
        signature: row.try_get("signature")?,
        protocol_network: row.try_get("protocol_network")?,
    })
}

#[cfg(test)]
mod tests {
    use bigdecimal::BigDecimal;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const NETWORK: &str = "eip155:1";
    const ALLOCATION: [u8; 20] = [0xaa; 20];

    fn receipt(id: u64, fees: u32) -> AllocationReceipt {
        AllocationReceipt {
            id,
            allocation: Address::from(ALLOCATION),
            fees: BigDecimal::from(fees),
            signature: vec![id as u8; 65],
            protocol_network: NETWORK.to_string(),
        }
    }

    fn batch(timeout_ms: i64) -> AllocationReceiptsBatch {
        AllocationReceiptsBatch {
            receipts: vec![receipt(timeout_ms as u64, 1)],
            timeout_ms,
        }
    }

    fn collector(server_uri: &str) -> Arc<ReceiptCollector> {
        ReceiptCollector::new(
            PgPool::connect_lazy("postgresql://postgres@127.0.0.1/unused").unwrap(),
            GatewayClient::new(server_uri, Duration::from_secs(5)).unwrap(),
            NETWORK.to_string(),
            Duration::from_millis(1_200_000),
        )
    }

    #[test]
    fn the_heap_releases_batches_in_unlock_order() {
        let mut heap = BinaryHeap::new();
        for timeout in [500, 100, 900, 300, 700] {
            heap.push(Reverse(batch(timeout)));
        }

        let due = drain_due(&mut heap, 600);
        let order: Vec<i64> = due.iter().map(|b| b.timeout_ms).collect();
        assert_eq!(order, vec![100, 300, 500]);

        // Batches past `now` stay queued.
        assert_eq!(heap.len(), 2);
        let rest = drain_due(&mut heap, i64::MAX);
        let order: Vec<i64> = rest.iter().map(|b| b.timeout_ms).collect();
        assert_eq!(order, vec![700, 900]);
    }

    #[test]
    fn nothing_is_due_before_its_unlock_time() {
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(batch(1000)));
        assert!(drain_due(&mut heap, 999).is_empty());
        assert_eq!(drain_due(&mut heap, 1000).len(), 1);
    }

    #[tokio::test]
    async fn a_small_batch_exchanges_in_a_single_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": format!("0x{}", hex::encode(ALLOCATION)),
                "fees": "600",
                "signature": format!("0x{}", "11".repeat(65)),
            })))
            .mount(&server)
            .await;

        let collector = collector(&server.uri());
        let receipts = vec![receipt(1, 100), receipt(2, 200), receipt(3, 300)];
        let voucher = collector
            .obtain_receipts_voucher(Address::from(ALLOCATION), &receipts)
            .await
            .unwrap();

        assert_eq!(voucher.fees, BigDecimal::from(600u32));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        // 20-byte allocation id + 3 receipts at 112 bytes each.
        assert_eq!(requests[0].body.len(), 356);
    }

    #[tokio::test]
    async fn a_large_batch_goes_through_partial_vouchers() {
        let server = MockServer::start().await;
        let allocation_hex = format!("0x{}", hex::encode(ALLOCATION));
        Mock::given(method("POST"))
            .and(path("/partial-voucher"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": allocation_hex,
                "fees": "25000",
                "signature": format!("0x{}", "22".repeat(65)),
                "receiptIdMin": 1,
                "receiptIdMax": 25_000,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/voucher"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": allocation_hex,
                "fees": "30000",
                "signature": format!("0x{}", "33".repeat(65)),
            })))
            .mount(&server)
            .await;

        let collector = collector(&server.uri());
        let receipts: Vec<_> = (1..=30_000u64).map(|id| receipt(id, 1)).collect();
        let voucher = collector
            .obtain_receipts_voucher(Address::from(ALLOCATION), &receipts)
            .await
            .unwrap();
        assert_eq!(voucher.fees, BigDecimal::from(30_000u32));

        let requests = server.received_requests().await.unwrap();
        let partial_posts: Vec<_> = requests
            .iter()
            .filter(|r| r.url.path() == "/partial-voucher")
            .collect();
        let merge_posts: Vec<_> = requests
            .iter()
            .filter(|r| r.url.path() == "/voucher")
            .collect();
        assert_eq!(partial_posts.len(), 2);
        assert_eq!(merge_posts.len(), 1);

        // 25_000 receipts, then the 5_000 remainder.
        assert_eq!(partial_posts[0].body.len(), 20 + 112 * 25_000);
        assert_eq!(partial_posts[1].body.len(), 20 + 112 * 5_000);
    }

    #[ignore]
    #[sqlx::test(migrations = "../migrations")]
    async fn closing_an_allocation_latches_it_once(pool: PgPool) {
        let allocation = Address::from(ALLOCATION);
        for r in [receipt(1, 100), receipt(2, 200)] {
            sqlx::query(
                r#"
                INSERT INTO allocation_receipts (id, allocation, fees, signature, protocol_network)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(r.id as i64)
            .bind(hex::encode(r.allocation))
            .bind(&r.fees)
            .bind(&r.signature)
            .bind(&r.protocol_network)
            .execute(&pool)
            .await
            .unwrap();
        }

        let server = MockServer::start().await;
        let collector = ReceiptCollector::new(
            pool.clone(),
            GatewayClient::new(&server.uri(), Duration::from_secs(5)).unwrap(),
            NETWORK.to_string(),
            Duration::from_millis(1_200_000),
        );

        assert!(collector.collect_receipts(1, allocation).await.unwrap());
        // The second call sees the latched close and queues nothing.
        assert!(!collector.collect_receipts(2, allocation).await.unwrap());
        assert_eq!(collector.batches.lock().await.len(), 1);
    }

    #[ignore]
    #[sqlx::test(migrations = "../migrations")]
    async fn restart_recovery_rebuilds_the_heap_with_original_unlock_times(pool: PgPool) {
        let delay_ms: i64 = 1_200_000;
        for (seed, closed_seconds_ago) in [(0xaau8, 3600i64), (0xbbu8, 60)] {
            let allocation = hex::encode(Address::from([seed; 20]));
            sqlx::query(
                r#"
                INSERT INTO allocation_summaries (allocation, protocol_network, closed_at, collected_fees, withdrawn_fees)
                VALUES ($1, $2, now() - make_interval(secs => $3), 0, 0)
                "#,
            )
            .bind(&allocation)
            .bind(NETWORK)
            .bind(closed_seconds_ago as f64)
            .execute(&pool)
            .await
            .unwrap();

            for id in 0..5u64 {
                sqlx::query(
                    r#"
                    INSERT INTO allocation_receipts (id, allocation, fees, signature, protocol_network)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind((seed as i64) * 100 + id as i64)
                .bind(&allocation)
                .bind(BigDecimal::from(1u32))
                .bind(vec![0u8; 65])
                .bind(NETWORK)
                .execute(&pool)
                .await
                .unwrap();
            }
        }

        let server = MockServer::start().await;
        let collector = ReceiptCollector::new(
            pool.clone(),
            GatewayClient::new(&server.uri(), Duration::from_secs(5)).unwrap(),
            NETWORK.to_string(),
            Duration::from_millis(delay_ms as u64),
        );
        collector.queue_pending_receipts_from_database().await.unwrap();

        let mut heap = collector.batches.lock().await;
        assert_eq!(heap.len(), 2);

        // The allocation closed longest ago unlocks first, at closed_at + delay.
        let first = heap.pop().unwrap().0;
        let second = heap.pop().unwrap().0;
        assert!(first.timeout_ms < second.timeout_ms);
        assert_eq!(first.receipts.len(), 5);
        assert!(first.timeout_ms <= now_ms() - 3600 * 1000 + delay_ms + 5000);
    }

    #[ignore]
    #[sqlx::test(migrations = "../migrations")]
    async fn a_successful_exchange_disposes_receipts_and_stores_one_voucher(pool: PgPool) {
        let allocation = Address::from(ALLOCATION);
        let receipts = vec![receipt(1, 100), receipt(2, 200), receipt(3, 300)];
        for r in &receipts {
            sqlx::query(
                r#"
                INSERT INTO allocation_receipts (id, allocation, fees, signature, protocol_network)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(r.id as i64)
            .bind(hex::encode(r.allocation))
            .bind(&r.fees)
            .bind(&r.signature)
            .bind(&r.protocol_network)
            .execute(&pool)
            .await
            .unwrap();
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": format!("0x{}", hex::encode(ALLOCATION)),
                "fees": "600",
                "signature": format!("0x{}", "11".repeat(65)),
            })))
            .mount(&server)
            .await;

        let collector = ReceiptCollector::new(
            pool.clone(),
            GatewayClient::new(&server.uri(), Duration::from_secs(5)).unwrap(),
            NETWORK.to_string(),
            Duration::from_millis(0),
        );
        let batch = AllocationReceiptsBatch {
            receipts,
            timeout_ms: now_ms(),
        };
        collector.exchange_batch(&batch).await.unwrap();

        let receipts_left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM allocation_receipts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(receipts_left, 0);

        let amount: BigDecimal =
            sqlx::query_scalar("SELECT amount FROM vouchers WHERE allocation = $1")
                .bind(hex::encode(allocation))
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(amount, BigDecimal::from(600u32));

        let collected: BigDecimal = sqlx::query_scalar(
            "SELECT collected_fees FROM allocation_summaries WHERE allocation = $1",
        )
        .bind(hex::encode(allocation))
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(collected, BigDecimal::from(600u32));
    }

    #[ignore]
    #[sqlx::test(migrations = "../migrations")]
    async fn an_existing_voucher_is_kept_rather_than_overwritten(pool: PgPool) {
        let allocation = Address::from(ALLOCATION);
        sqlx::query(
            r#"
            INSERT INTO vouchers (allocation, amount, signature, protocol_network)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(hex::encode(allocation))
        .bind(BigDecimal::from(999u32))
        .bind(vec![0u8; 65])
        .bind(NETWORK)
        .execute(&pool)
        .await
        .unwrap();

        let server = MockServer::start().await;
        let collector = ReceiptCollector::new(
            pool.clone(),
            GatewayClient::new(&server.uri(), Duration::from_secs(5)).unwrap(),
            NETWORK.to_string(),
            Duration::from_millis(0),
        );
        let voucher = GatewayVoucher {
            allocation,
            fees: BigDecimal::from(600u32),
            signature: vec![1u8; 65],
        };
        collector
            .finalize_exchange(&[receipt(1, 600)], &voucher)
            .await
            .unwrap();

        let amount: BigDecimal =
            sqlx::query_scalar("SELECT amount FROM vouchers WHERE allocation = $1")
                .bind(hex::encode(allocation))
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(amount, BigDecimal::from(999u32));
    }
}
