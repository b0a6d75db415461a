// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use alloy_primitives::{hex, Address};
use bigdecimal::num_bigint::{Sign, ToBigInt};
use bigdecimal::BigDecimal;
use ethers_core::types::Signature;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

/// Upper bound on receipts per gateway call; larger batches go through the
/// partial-voucher flow.
pub const RECEIPTS_PER_VOUCHER_CALL: usize = 25_000;

const FEE_BYTES: usize = 33;
const ID_BYTES: usize = 16;
const SIGNATURE_BYTES: usize = 65;
const RECORD_BYTES: usize = FEE_BYTES + ID_BYTES + SIGNATURE_BYTES;

/// A gateway-signed micropayment receipt for one allocation, as stored in
/// `allocation_receipts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationReceipt {
    pub id: u64,
    pub allocation: Address,
    pub fees: BigDecimal,
    pub signature: Vec<u8>,
    pub protocol_network: String,
}

/// A receipt in the successor format, signed over EIP-712 typed data by a
/// sender's authorized signer. The core stores and forwards it opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapReceipt {
    pub allocation_id: Address,
    pub timestamp_ns: u64,
    pub nonce: u64,
    pub value: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTapReceipt {
    pub message: TapReceipt,
    pub signature: Signature,
}

/// The two receipt families the intake accepts.
#[derive(Debug, Clone)]
pub enum ReceiptEnvelope {
    Legacy {
        id: u64,
        allocation: Address,
        fees: BigDecimal,
        signature: Vec<u8>,
    },
    Tap {
        sender_address: Address,
        signed_receipt: SignedTapReceipt,
    },
}

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("receipt signature must be {SIGNATURE_BYTES} bytes, got {0}")]
    InvalidSignature(usize),
    #[error("receipt fee must be a non-negative integer, got {0}")]
    InvalidFee(BigDecimal),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("failed to serialize receipt: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn validate_legacy(fees: &BigDecimal, signature: &[u8]) -> Result<(), ReceiptError> {
    if signature.len() != SIGNATURE_BYTES {
        return Err(ReceiptError::InvalidSignature(signature.len()));
    }
    if !fees.is_integer() || fees.sign() == Sign::Minus {
        return Err(ReceiptError::InvalidFee(fees.clone()));
    }
    Ok(())
}

impl ReceiptEnvelope {
    /// Validates the receipt's shape and stores it. A schema violation is
    /// surfaced to the caller and the receipt is never queued.
    pub async fn store(self, pool: &PgPool, protocol_network: &str) -> Result<(), ReceiptError> {
        match self {
            ReceiptEnvelope::Legacy {
                id,
                allocation,
                fees,
                signature,
            } => {
                validate_legacy(&fees, &signature)?;
                sqlx::query(
                    r#"
                    INSERT INTO allocation_receipts (id, allocation, fees, signature, protocol_network)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(id as i64)
                .bind(hex::encode(allocation))
                .bind(&fees)
                .bind(&signature)
                .bind(protocol_network)
                .execute(pool)
                .await?;
            }
            ReceiptEnvelope::Tap {
                sender_address,
                signed_receipt,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO scalar_tap_receipts (allocation_id, sender_address, timestamp_ns, value, receipt)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(hex::encode(signed_receipt.message.allocation_id))
                .bind(hex::encode(sender_address))
                .bind(BigDecimal::from(signed_receipt.message.timestamp_ns))
                .bind(BigDecimal::from(signed_receipt.message.value))
                .bind(serde_json::to_value(&signed_receipt)?)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("receipt batch is empty")]
    EmptyBatch,
    #[error("receipt batch of {0} exceeds {RECEIPTS_PER_VOUCHER_CALL} receipts")]
    BatchTooLarge(usize),
    #[error("receipt {id} belongs to allocation {allocation}, not the batch allocation")]
    MixedAllocations { id: u64, allocation: Address },
    #[error("receipt {id} fee does not fit in {FEE_BYTES} bytes")]
    FeeTooLarge { id: u64 },
    #[error("receipt {id} fee is not a non-negative integer")]
    InvalidFee { id: u64 },
    #[error("receipt {id} signature must be {SIGNATURE_BYTES} bytes")]
    InvalidSignature { id: u64 },
}

/// Packs a batch of receipts for one allocation into the gateway's wire
/// layout: the 20-byte allocation id followed by one 112-byte record per
/// receipt, `[33-byte big-endian fee][16-byte id][65-byte signature]`.
pub fn encode_receipt_batch(
    allocation: Address,
    receipts: &[AllocationReceipt],
) -> Result<Vec<u8>, EncodeError> {
    if receipts.is_empty() {
        return Err(EncodeError::EmptyBatch);
    }
    if receipts.len() > RECEIPTS_PER_VOUCHER_CALL {
        return Err(EncodeError::BatchTooLarge(receipts.len()));
    }

    let mut buffer = Vec::with_capacity(20 + RECORD_BYTES * receipts.len());
    buffer.extend_from_slice(allocation.as_slice());

    for receipt in receipts {
        if receipt.allocation != allocation {
            return Err(EncodeError::MixedAllocations {
                id: receipt.id,
                allocation: receipt.allocation,
            });
        }

        let fee = receipt
            .fees
            .is_integer()
            .then(|| receipt.fees.to_bigint())
            .flatten()
            .ok_or(EncodeError::InvalidFee { id: receipt.id })?;
        let (sign, fee_bytes) = fee.to_bytes_be();
        if sign == Sign::Minus {
            return Err(EncodeError::InvalidFee { id: receipt.id });
        }
        if fee_bytes.len() > FEE_BYTES {
            return Err(EncodeError::FeeTooLarge { id: receipt.id });
        }
        let mut fee_slot = [0u8; FEE_BYTES];
        fee_slot[FEE_BYTES - fee_bytes.len()..].copy_from_slice(&fee_bytes);
        buffer.extend_from_slice(&fee_slot);

        buffer.extend_from_slice(&(receipt.id as u128).to_be_bytes());

        if receipt.signature.len() != SIGNATURE_BYTES {
            return Err(EncodeError::InvalidSignature { id: receipt.id });
        }
        buffer.extend_from_slice(&receipt.signature);
    }

    Ok(buffer)
}
