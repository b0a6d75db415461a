// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use bigdecimal::BigDecimal;
use sqlx::{PgPool, Row};
use thiserror::Error;

/// Lifecycle of a DIPS receipt: it stays pending until its collection
/// transaction is submitted, and a failed submission keeps it around with a
/// bumped retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DipsReceiptStatus {
    Pending,
    Submitted,
    Failed,
}

impl DipsReceiptStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DipsReceiptStatus::Pending => "PENDING",
            DipsReceiptStatus::Submitted => "SUBMITTED",
            DipsReceiptStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for DipsReceiptStatus {
    type Err = DipsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DipsReceiptStatus::Pending),
            "SUBMITTED" => Ok(DipsReceiptStatus::Submitted),
            "FAILED" => Ok(DipsReceiptStatus::Failed),
            other => Err(DipsError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum DipsError {
    #[error("unknown DIPS receipt status `{0}`")]
    UnknownStatus(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A fee receipt under an indexing agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DipsReceipt {
    pub id: i64,
    pub agreement_id: String,
    pub amount: BigDecimal,
    pub status: DipsReceiptStatus,
    pub transaction_hash: Option<String>,
    pub retry_count: i32,
}

fn receipt_from_row(row: sqlx::postgres::PgRow) -> Result<DipsReceipt, DipsError> {
    let status: String = row.try_get("status")?;
    Ok(DipsReceipt {
        id: row.try_get("id")?,
        agreement_id: row.try_get("agreement_id")?,
        amount: row.try_get("amount")?,
        status: status.parse()?,
        transaction_hash: row.try_get("transaction_hash")?,
        retry_count: row.try_get("retry_count")?,
    })
}

pub async fn insert_receipt(
    pool: &PgPool,
    agreement_id: &str,
    amount: &BigDecimal,
) -> Result<i64, DipsError> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO dips_receipts (agreement_id, amount, status, retry_count)
        VALUES ($1, $2, 'PENDING', 0)
        RETURNING id
        "#,
    )
    .bind(agreement_id)
    .bind(amount)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn pending_receipts(pool: &PgPool) -> Result<Vec<DipsReceipt>, DipsError> {
    sqlx::query(
        r#"
        SELECT id, agreement_id, amount, status, transaction_hash, retry_count
        FROM dips_receipts
        WHERE status = 'PENDING'
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(receipt_from_row)
    .collect()
}

pub async fn mark_submitted(
    pool: &PgPool,
    id: i64,
    transaction_hash: &str,
) -> Result<(), DipsError> {
    sqlx::query(
        "UPDATE dips_receipts SET status = 'SUBMITTED', transaction_hash = $2 WHERE id = $1",
    )
    .bind(id)
    .bind(transaction_hash)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &PgPool, id: i64) -> Result<(), DipsError> {
    sqlx::query(
        "UPDATE dips_receipts SET status = 'FAILED', retry_count = retry_count + 1 WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}
