// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;

use alloy_primitives::Address;
use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer};
use ethers_core::types::{Signature, H256};
use ethers_core::utils::keccak256;
use settlement_common::prelude::Allocation;
use thiserror::Error;

/// Caps the number of parallel allocations per (epoch, deployment) pair and
/// keeps brute-force signer recovery cheap.
const MAX_ALLOCATION_INDEX: u32 = 100;

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("all {MAX_ALLOCATION_INDEX} allocation indices are taken for this epoch and deployment")]
    ExhaustedAllocationIndex,
    #[error("no derivation index recovers the signer of allocation {0}")]
    AllocationSignerNotFound(Address),
    #[error("key derivation failed: {0}")]
    Wallet(String),
}

fn wallet_address(wallet: &LocalWallet) -> Address {
    Address::from_slice(wallet.address().as_bytes())
}

/// Derives the allocation wallet at `m / epoch / b_0 / … / b_{n-1} / index`,
/// where `b_i` are the bytes of the deployment IPFS hash.
pub fn derive_allocation_wallet(
    mnemonic: &str,
    epoch: u64,
    deployment_ipfs_hash: &str,
    index: u32,
) -> Result<LocalWallet, KeyringError> {
    let mut path = format!("m/{epoch}");
    for byte in deployment_ipfs_hash.as_bytes() {
        path.push('/');
        path.push_str(&byte.to_string());
    }
    path.push('/');
    path.push_str(&index.to_string());

    MnemonicBuilder::<English>::default()
        .phrase(mnemonic)
        .derivation_path(&path)
        .map_err(|e| KeyringError::Wallet(e.to_string()))?
        .build()
        .map_err(|e| KeyringError::Wallet(e.to_string()))
}

/// Picks the first derivation index whose address is not already allocated
/// and returns the new allocation id with its signing wallet.
pub fn unique_allocation(
    mnemonic: &str,
    epoch: u64,
    deployment_ipfs_hash: &str,
    existing_ids: &HashSet<Address>,
) -> Result<(Address, LocalWallet), KeyringError> {
    for index in 0..MAX_ALLOCATION_INDEX {
        let wallet = derive_allocation_wallet(mnemonic, epoch, deployment_ipfs_hash, index)?;
        let id = wallet_address(&wallet);
        if !existing_ids.contains(&id) {
            return Ok((id, wallet));
        }
    }
    Err(KeyringError::ExhaustedAllocationIndex)
}

/// Recovers the signing wallet of an existing allocation. Allocations can be
/// created across an epoch boundary, so both the recorded epoch and the one
/// before it are scanned.
pub fn recover_allocation_signer(
    mnemonic: &str,
    allocation: &Allocation,
) -> Result<LocalWallet, KeyringError> {
    let epochs = [
        allocation.created_at_epoch,
        allocation.created_at_epoch.saturating_sub(1),
    ];
    for epoch in epochs {
        for index in 0..MAX_ALLOCATION_INDEX {
            let wallet = derive_allocation_wallet(
                mnemonic,
                epoch,
                &allocation.subgraph_deployment.ipfs_hash,
                index,
            )?;
            if wallet_address(&wallet) == allocation.id {
                return Ok(wallet);
            }
        }
    }
    Err(KeyringError::AllocationSignerNotFound(allocation.id))
}

/// Signs `keccak256(indexer ‖ allocation_id)` with the allocation wallet.
/// The digest is signed as an opaque 32-byte hash; the exchange contract
/// verifies against the raw digest, not a personal-sign envelope.
pub fn allocation_id_proof(
    signer: &LocalWallet,
    indexer: Address,
    allocation_id: Address,
) -> Result<Signature, KeyringError> {
    let mut packed = [0u8; 40];
    packed[..20].copy_from_slice(indexer.as_slice());
    packed[20..].copy_from_slice(allocation_id.as_slice());
    signer
        .sign_hash(H256(keccak256(packed)))
        .map_err(|e| KeyringError::Wallet(e.to_string()))
}
