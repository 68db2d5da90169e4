//! Scripted [`ChainSource`] and fixtures for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use alloy::consensus::TxType;
use alloy::primitives::{Address, B256, Bytes, LogData, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use ledgerwatch_chain::{
    BlockHeader, ChainBlock, ChainReceipt, ChainSource, ChainTransaction, IERC20, LogQuery,
};
use ledgerwatch_core::AppError;

#[derive(Default)]
struct MockState {
    head: BlockHeader,
    blocks: HashMap<u64, ChainBlock>,
    receipts: HashMap<B256, ChainReceipt>,
    logs: Vec<Log>,
    balances: HashMap<Address, U256>,
    code: HashMap<Address, Bytes>,
}

/// In-memory chain. Blocks, receipts and logs are scripted by the test;
/// unknown balances read as zero and unknown code as empty.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
    failures: AtomicUsize,
    code_lookups: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, number: u64, timestamp: u64) {
        self.with_state(|s| s.head = BlockHeader { number, timestamp });
    }

    /// Add a block with its receipts and raise the head to it if needed.
    pub fn push_block(&self, block: ChainBlock, receipts: Vec<ChainReceipt>) {
        self.with_state(|s| {
            if block.number >= s.head.number {
                s.head = BlockHeader {
                    number: block.number,
                    timestamp: block.timestamp,
                };
            }
            for receipt in receipts {
                s.receipts.insert(receipt.transaction_hash, receipt);
            }
            s.blocks.insert(block.number, block);
        });
    }

    pub fn add_log(&self, log: Log) {
        self.with_state(|s| s.logs.push(log));
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.with_state(|s| {
            s.balances.insert(address, balance);
        });
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.with_state(|s| {
            s.code.insert(address, code);
        });
    }

    /// Fail the next `n` calls of any kind.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn code_lookups(&self) -> usize {
        self.code_lookups.load(Ordering::SeqCst)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn check(&self) -> Result<(), AppError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AppError::Rpc("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn current_header(&self) -> Result<BlockHeader, AppError> {
        self.check()?;
        Ok(self.with_state(|s| s.head))
    }

    async fn block_by_number(&self, number: u64) -> Result<ChainBlock, AppError> {
        self.check()?;
        self.with_state(|s| s.blocks.get(&number).cloned())
            .ok_or_else(|| AppError::Rpc(format!("block {number} not found")))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<ChainReceipt, AppError> {
        self.check()?;
        self.with_state(|s| s.receipts.get(&hash).cloned())
            .ok_or_else(|| AppError::Rpc(format!("receipt {hash} not found")))
    }

    async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<Log>, AppError> {
        self.check()?;
        Ok(self.with_state(|s| {
            s.logs
                .iter()
                .filter(|log| {
                    let block = log.block_number.unwrap_or_default();
                    block >= query.from_block
                        && block <= query.to_block
                        && query.address.is_none_or(|a| a == log.address())
                        && (query.topics.is_empty()
                            || log.topics().first().is_some_and(|t| query.topics.contains(t)))
                })
                .cloned()
                .collect()
        }))
    }

    async fn balance_at(&self, address: Address) -> Result<U256, AppError> {
        self.check()?;
        Ok(self.with_state(|s| s.balances.get(&address).copied().unwrap_or_default()))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, AppError> {
        self.check()?;
        self.code_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.with_state(|s| s.code.get(&address).cloned().unwrap_or_default()))
    }
}

/// Hash whose every byte is `n`.
pub fn hash(n: u8) -> B256 {
    B256::repeat_byte(n)
}

/// Plain ETH transfer with a fee-market type and no declared gas price.
pub fn eth_transfer(hash: B256, from: Address, to: Address, value: U256) -> ChainTransaction {
    ChainTransaction {
        hash,
        tx_type: TxType::Eip1559,
        from,
        to: Some(to),
        value,
        gas_price: None,
    }
}

pub fn receipt(hash: B256, block_number: u64, success: bool, logs: Vec<Log>) -> ChainReceipt {
    ChainReceipt {
        transaction_hash: hash,
        block_number: Some(block_number),
        success,
        gas_used: 21_000,
        effective_gas_price: 1_000_000_000,
        logs,
    }
}

/// An ERC-20 `Transfer` log as a node would return it.
pub fn transfer_log(
    token: Address,
    from: Address,
    to: Address,
    value: U256,
    tx_hash: B256,
    block_number: u64,
    log_index: u64,
) -> Log {
    let topics = vec![
        IERC20::Transfer::SIGNATURE_HASH,
        from.into_word(),
        to.into_word(),
    ];
    let data = Bytes::from(value.to_be_bytes::<32>().to_vec());
    Log {
        inner: alloy::primitives::Log {
            address: token,
            data: LogData::new_unchecked(topics, data),
        },
        block_number: Some(block_number),
        transaction_hash: Some(tx_hash),
        log_index: Some(log_index),
        ..Default::default()
    }
}

/// One ether in wei.
pub fn ether(n: u64) -> U256 {
    U256::from(n) * U256::from(1_000_000_000_000_000_000u64)
}
