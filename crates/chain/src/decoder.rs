use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use ledgerwatch_core::AppError;
use thiserror::Error;

use crate::abi::IERC20;

/// Zero address constant for mint/burn detection.
pub const ZERO_ADDRESS: Address = Address::ZERO;

/// Canonical text form of an address as stored in the ledger (`0x` + lowercase hex).
pub fn format_address(address: &Address) -> String {
    format!("{address:#x}")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Transfer log has {found} topics, expected 3")]
    TopicCount { found: usize },

    #[error("log is missing {0}")]
    MissingField(&'static str),

    #[error("ABI decode failed: {0}")]
    Abi(String),
}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        AppError::Decode(err.to_string())
    }
}

/// A decoded ERC-20 `Transfer(address,address,uint256)` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub token_address: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub log_index: u64,
    pub block_timestamp: Option<u64>,
}

impl TransferEvent {
    pub fn is_mint(&self) -> bool {
        self.from == ZERO_ADDRESS
    }

    pub fn is_burn(&self) -> bool {
        self.to == ZERO_ADDRESS
    }
}

/// Decode a log as an ERC-20 Transfer.
///
/// Returns `Ok(None)` for logs of any other event. A log carrying the Transfer
/// signature but the wrong shape (ERC-721 transfers index the token id as a
/// fourth topic) is a decode error.
pub fn decode_transfer(log: &Log) -> Result<Option<TransferEvent>, DecodeError> {
    let topics = log.topics();
    if topics.first() != Some(&IERC20::Transfer::SIGNATURE_HASH) {
        return Ok(None);
    }
    if topics.len() != 3 {
        return Err(DecodeError::TopicCount {
            found: topics.len(),
        });
    }

    let block_number = log
        .block_number
        .ok_or(DecodeError::MissingField("block_number"))?;
    let transaction_hash = log
        .transaction_hash
        .ok_or(DecodeError::MissingField("transaction_hash"))?;

    let decoded = log
        .log_decode::<IERC20::Transfer>()
        .map_err(|e| DecodeError::Abi(e.to_string()))?;
    let d = decoded.inner.data;

    Ok(Some(TransferEvent {
        token_address: log.address(),
        from: d.from,
        to: d.to,
        value: d.value,
        transaction_hash,
        block_number,
        log_index: log.log_index.unwrap_or_default(),
        block_timestamp: log.block_timestamp,
    }))
}
